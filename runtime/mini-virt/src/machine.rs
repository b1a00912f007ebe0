//! Top-level machine: construction order and the two-phase bring-up
//!
//! `begin_construction` runs the synchronous part of bring-up in a fixed
//! order (CPUs, RAM, interrupt controller, console, boot info, image load)
//! and returns a [`PendingMachine`]. The owner calls
//! [`PendingMachine::finalize`] once everything else in the environment is
//! ready; that places the device tree and yields a [`Machine`].

use crate::address_space::SystemMemory;
use crate::boot::{BootInfo, BootOrchestrator, BootState, DirectEntry, DtbLoader, DtbPlacement, ImageLoader};
use crate::cpu::{CpuArchId, CpuModel, CpuSet, Vcpu};
use crate::gic::{create_gic, Gicv3};
use crate::memmap::{IrqMap, MemMapEntry, MemoryMap, Region, NUM_IRQS};
use crate::ram::{install_ram, HostMemory, PAGE_SIZE};
use crate::registry::MachineClass;
use crate::uart::{create_uart, CharBackend, NullBackend, Pl011};
use crate::{MachineError, Result};
use serde::Deserialize;

/// User-selectable machine options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineOptions {
    /// Number of CPUs to create
    pub cpus: u32,

    /// CPU model; the machine type's default when unset
    pub cpu_type: Option<CpuModel>,

    /// Guest RAM in bytes; the whole RAM region when unset
    pub ram_size: Option<u64>,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            cpus: 1,
            cpu_type: None,
            ram_size: None,
        }
    }
}

/// One completed bring-up step, in the order it happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpEvent {
    CpusRealized { count: u32 },
    RamInstalled { base: u64, size: u64 },
    InterruptControllerWired { num_cpu: u32, num_irq: u32 },
    ConsoleWired { base: u64, line: u32 },
    BootInfoRecorded,
    KernelLoaded { entry: u64 },
    DeviceTreePlaced { addr: u64, size: usize },
}

/// Host-side collaborators consumed by construction
pub struct BootCollaborators {
    pub image_loader: Box<dyn ImageLoader>,
    pub chardev: Box<dyn CharBackend>,
    pub host_memory: HostMemory,
}

impl BootCollaborators {
    pub fn new(image_loader: Box<dyn ImageLoader>, chardev: Box<dyn CharBackend>) -> Self {
        Self {
            image_loader,
            chardev,
            host_memory: HostMemory::default(),
        }
    }

    pub fn with_host_memory(mut self, host_memory: HostMemory) -> Self {
        self.host_memory = host_memory;
        self
    }
}

impl Default for BootCollaborators {
    fn default() -> Self {
        Self::new(Box::new(DirectEntry), Box::new(NullBackend))
    }
}

/// The wired hardware of one machine
#[derive(Debug)]
pub struct Board {
    memmap: MemoryMap,
    irqmap: IrqMap,
    memory: SystemMemory,
    cpus: CpuSet,
    gic: Gicv3,
    uart: Pl011,
}

impl Board {
    pub(crate) fn new(
        memmap: MemoryMap,
        irqmap: IrqMap,
        memory: SystemMemory,
        cpus: CpuSet,
        gic: Gicv3,
        uart: Pl011,
    ) -> Self {
        Self {
            memmap,
            irqmap,
            memory,
            cpus,
            gic,
            uart,
        }
    }

    pub fn memmap(&self) -> &MemoryMap {
        &self.memmap
    }

    pub fn irqmap(&self) -> &IrqMap {
        &self.irqmap
    }

    pub fn memory(&self) -> &SystemMemory {
        &self.memory
    }

    pub fn cpus(&self) -> &[Vcpu] {
        self.cpus.cpus()
    }

    pub fn cpu_set(&self) -> &CpuSet {
        &self.cpus
    }

    pub fn gic(&self) -> &Gicv3 {
        &self.gic
    }

    pub fn uart(&self) -> &Pl011 {
        &self.uart
    }

    /// Read-only view of the topology
    pub fn view(&self) -> MachineView<'_> {
        MachineView {
            memmap: &self.memmap,
            irqmap: &self.irqmap,
            cpus: self.cpus.cpus(),
            gic: &self.gic,
            uart: &self.uart,
        }
    }

    pub(crate) fn split_for_boot(&mut self) -> (MachineView<'_>, &mut SystemMemory) {
        let view = MachineView {
            memmap: &self.memmap,
            irqmap: &self.irqmap,
            cpus: self.cpus.cpus(),
            gic: &self.gic,
            uart: &self.uart,
        };
        (view, &mut self.memory)
    }

    pub(crate) fn split_for_load(&mut self) -> (&mut [Vcpu], &mut SystemMemory) {
        (self.cpus.cpus_mut(), &mut self.memory)
    }
}

/// Borrowed view of a board, handed to device-tree loaders
#[derive(Debug, Clone, Copy)]
pub struct MachineView<'a> {
    pub memmap: &'a MemoryMap,
    pub irqmap: &'a IrqMap,
    pub cpus: &'a [Vcpu],
    pub gic: &'a Gicv3,
    pub uart: &'a Pl011,
}

/// A constructed machine whose device tree is not placed yet
#[derive(Debug)]
pub struct PendingMachine {
    class: &'static MachineClass,
    board: Board,
    boot: BootOrchestrator,
    events: Vec<BringUpEvent>,
}

impl PendingMachine {
    pub fn class(&self) -> &'static MachineClass {
        self.class
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn boot_info(&self) -> &BootInfo {
        self.boot.info()
    }

    pub fn events(&self) -> &[BringUpEvent] {
        &self.events
    }

    /// Place the device tree and complete bring-up
    ///
    /// Consumes the pending machine, so placement cannot run twice.
    pub fn finalize(mut self, dtb_loader: &mut dyn DtbLoader) -> Result<Machine> {
        let (view, memory) = self.board.split_for_boot();
        let placement = self.boot.finalize(dtb_loader, view, memory)?;
        self.events.push(BringUpEvent::DeviceTreePlaced {
            addr: placement.addr,
            size: placement.size,
        });
        log::info!("{}: ready", self.class.name);

        Ok(Machine {
            class: self.class,
            board: self.board,
            boot: self.boot,
            events: self.events,
            dtb: placement,
        })
    }
}

/// A machine that has completed bring-up
#[derive(Debug)]
pub struct Machine {
    class: &'static MachineClass,
    board: Board,
    boot: BootOrchestrator,
    events: Vec<BringUpEvent>,
    dtb: DtbPlacement,
}

impl Machine {
    pub fn class(&self) -> &'static MachineClass {
        self.class
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn boot_info(&self) -> &BootInfo {
        self.boot.info()
    }

    pub fn boot_state(&self) -> BootState {
        self.boot.state()
    }

    pub fn dtb(&self) -> DtbPlacement {
        self.dtb
    }

    pub fn events(&self) -> &[BringUpEvent] {
        &self.events
    }

    /// Console, for guest output
    pub fn uart_mut(&mut self) -> &mut Pl011 {
        &mut self.board.uart
    }

    /// Identities of the machine's possible CPUs (cached since construction)
    pub fn possible_cpu_arch_ids(&mut self) -> Result<&[CpuArchId]> {
        let count = self.board.cpus.arch_ids().len() as u32;
        (self.class.possible_cpu_arch_ids)(&mut self.board.cpus, count, self.class.max_cpus)
    }
}

/// Bring-up sequence of the mini-virt board
pub(crate) fn mini_virt_init(
    class: &'static MachineClass,
    options: MachineOptions,
    collaborators: BootCollaborators,
) -> Result<PendingMachine> {
    let memmap = (class.memmap)();
    let irqmap = (class.irqmap)();
    let BootCollaborators {
        mut image_loader,
        chardev,
        host_memory,
    } = collaborators;

    let ram_region = memmap.get(Region::Mem)?;
    let ram_size = options.ram_size.unwrap_or(ram_region.size);
    if ram_size == 0 || ram_size > ram_region.size || ram_size % PAGE_SIZE != 0 {
        return Err(MachineError::InvalidRamSize {
            requested: ram_size,
            capacity: ram_region.size,
        });
    }

    let mut events = Vec::new();

    let mut cpus = CpuSet::new(options.cpu_type.unwrap_or(class.default_cpu_type));
    cpus.build(options.cpus, class.max_cpus)?;
    events.push(BringUpEvent::CpusRealized { count: options.cpus });

    let mut memory = SystemMemory::new();
    let ram = MemMapEntry::new(ram_region.base, ram_size);
    install_ram(&mut memory, ram, &host_memory)?;
    events.push(BringUpEvent::RamInstalled {
        base: ram.base,
        size: ram.size,
    });

    let mut gic = create_gic(
        cpus.cpus_mut(),
        NUM_IRQS,
        memmap.get(Region::GicDist)?,
        memmap.get(Region::GicRedist)?,
        &mut memory,
    )?;
    events.push(BringUpEvent::InterruptControllerWired {
        num_cpu: gic.config().num_cpu,
        num_irq: gic.config().num_irq,
    });

    let uart_region = memmap.get(Region::Uart)?;
    let uart_line = irqmap.line(Region::Uart)?;
    let uart = create_uart(&mut gic, uart_region, uart_line, chardev, &mut memory)?;
    events.push(BringUpEvent::ConsoleWired {
        base: uart_region.base,
        line: uart_line,
    });

    let mut boot = BootOrchestrator::begin(ram.base, ram_size, options.cpus);
    events.push(BringUpEvent::BootInfoRecorded);

    let entry = boot.load_kernel(image_loader.as_mut(), cpus.cpus_mut(), &mut memory)?;
    events.push(BringUpEvent::KernelLoaded { entry });

    Ok(PendingMachine {
        class,
        board: Board::new(memmap, irqmap, memory, cpus, gic, uart),
        boot,
        events,
    })
}
