//! mini-virt - Fixed-topology ARM64 virtual machine composer
//!
//! # Purpose
//! Assembles the `mini-virt` board: a set of identical CPUs, one RAM region,
//! a GICv3 interrupt controller and a PL011 console, wired into a single
//! physical address space and interrupt topology, then hands the machine to
//! the guest boot sequence.
//!
//! # Integration Points
//! - Depends on: an image loader and a device-tree loader supplied by the
//!   host (see [`ImageLoader`] and [`DtbLoader`]), a character backend for
//!   the console (see [`CharBackend`])
//! - Provides to: the orchestration layer (`virt-compose`), via the static
//!   machine-type table in [`registry`]
//!
//! # Architecture
//! Construction is two-phase:
//! 1. [`MachineClass::begin_construction`] creates CPUs, installs RAM, wires
//!    the GIC and the console, records [`BootInfo`] and loads the guest
//!    image. The result is a [`PendingMachine`].
//! 2. [`PendingMachine::finalize`] places the device tree exactly once and
//!    yields a ready [`Machine`].
//!
//! Every failure during either phase is fatal for the machine: nothing
//! partially built is handed back to the caller.
//!
//! # Testing Strategy
//! - Unit tests: region table, affinity function, redistributor capacity,
//!   per-CPU wiring, RAM backing, boot state machine
//! - Integration tests: end-to-end bring-up with recording loaders

mod address_space;
mod boot;
mod cpu;
mod gic;
mod machine;
mod memmap;
mod ram;
mod uart;

pub mod registry;

pub use address_space::{MapFlags, Mapping, SystemMemory};
pub use boot::{
    align_up, boot_address_space, default_dtb_region, AddressSpaceKind, BootInfo, BootOrchestrator, BootState, DirectEntry,
    DtbLoader, DtbPlacement, DtbRequest, ImageLoader, PsciConduit, DTB_ALIGN,
};
pub use cpu::{
    mp_affinity, CpuArchId, CpuModel, CpuSet, Vcpu, VcpuState, ARM_AFF1_SHIFT,
    GICV3_TARGETLIST_BITS,
};
pub use gic::{
    create_gic, redistributor_region_count, GicConfig, GicRevision, Gicv3, IrqSource,
    ARCH_TIMER_NS_EL1_IRQ, GICV3_DIST_SIZE, GICV3_REDIST_SIZE, GIC_INTERNAL, GIC_MAXIRQ,
};
pub use machine::{
    BootCollaborators, BringUpEvent, Board, Machine, MachineOptions, MachineView, PendingMachine,
};
pub use memmap::{IrqMap, MemMapEntry, MemoryMap, Region, GIB, KIB, MIB, NUM_IRQS};
pub use ram::{install_ram, GuestRam, HostMemory, PAGE_SIZE};
pub use registry::{find_machine_type, machine_types, MachineClass};
pub use uart::{create_uart, BufferBackend, CharBackend, NullBackend, Pl011, Pl011Config, StdioBackend};

use thiserror::Error;

/// Error types for machine construction and boot
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("Unknown region: {name}")]
    UnknownRegion { name: String },

    #[error("Invalid CPU topology: requested {requested} CPUs (maximum {max})")]
    InvalidTopology { requested: u32, max: u32 },

    #[error("CPU topology changed after first computation (cached {cached}, requested {requested})")]
    TopologyChanged { cached: usize, requested: u32 },

    #[error("Unknown CPU model: {0}")]
    UnknownCpuModel(String),

    #[error("Invalid RAM size {requested:#x} (region capacity {capacity:#x})")]
    InvalidRamSize { requested: u64, capacity: u64 },

    #[error("Cannot obtain {size:#x} bytes of guest RAM: {reason}")]
    AllocationFailure { size: u64, reason: String },

    #[error("Failed to realize {device}: {reason}")]
    DeviceRealization { device: &'static str, reason: String },

    #[error("Mapping {name} [{base:#x}, +{size:#x}) overlaps {existing}")]
    MappingConflict {
        name: String,
        base: u64,
        size: u64,
        existing: String,
    },

    #[error("Guest access at {addr:#x} (+{len:#x}) is not backed by RAM")]
    UnmappedAccess { addr: u64, len: u64 },

    #[error("Guest image load failed: {0}")]
    ImageLoad(String),

    #[error("Device tree placement failed: {reason}")]
    DeviceTreePlacement { reason: String },

    #[error("Character backend error: {0}")]
    Chardev(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, MachineError>;

impl MachineError {
    pub(crate) fn realize(device: &'static str, reason: impl Into<String>) -> Self {
        MachineError::DeviceRealization {
            device,
            reason: reason.into(),
        }
    }
}
