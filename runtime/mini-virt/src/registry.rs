//! Machine-type registry
//!
//! A static table of machine types, each described by a capability struct.
//! Hosts select a type by name and construct it through
//! [`MachineClass::begin_construction`].

use crate::cpu::{CpuArchId, CpuModel, CpuSet};
use crate::machine::{mini_virt_init, BootCollaborators, MachineOptions, PendingMachine};
use crate::memmap::{IrqMap, MemoryMap};
use crate::Result;
use core::fmt;

/// Capabilities and constructor of one machine type
pub struct MachineClass {
    pub name: &'static str,
    pub desc: &'static str,
    pub max_cpus: u32,
    pub default_cpu_type: CpuModel,

    /// Address map every instance uses
    pub memmap: fn() -> MemoryMap,

    /// Device interrupt lines every instance uses
    pub irqmap: fn() -> IrqMap,

    /// Possible-CPU identities for a CPU set of the given size, bounded by
    /// the given maximum
    pub possible_cpu_arch_ids: fn(&mut CpuSet, u32, u32) -> Result<&[CpuArchId]>,

    init: fn(&'static MachineClass, MachineOptions, BootCollaborators) -> Result<PendingMachine>,
}

impl MachineClass {
    /// Run the synchronous part of bring-up
    ///
    /// # Errors
    /// Any construction failure; no partially built machine is returned.
    pub fn begin_construction(
        &'static self,
        options: MachineOptions,
        collaborators: BootCollaborators,
    ) -> Result<PendingMachine> {
        log::info!("Constructing {} ({} CPUs)", self.name, options.cpus);
        (self.init)(self, options, collaborators)
    }
}

impl fmt::Debug for MachineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineClass")
            .field("name", &self.name)
            .field("desc", &self.desc)
            .field("max_cpus", &self.max_cpus)
            .field("default_cpu_type", &self.default_cpu_type)
            .finish_non_exhaustive()
    }
}

static MACHINE_TYPES: [MachineClass; 1] = [MachineClass {
    name: "mini-virt",
    desc: "mini-virt ARM Machine",
    max_cpus: 512,
    default_cpu_type: CpuModel::CortexA57,
    memmap: MemoryMap::mini_virt,
    irqmap: IrqMap::mini_virt,
    possible_cpu_arch_ids: CpuSet::possible_cpu_arch_ids,
    init: mini_virt_init,
}];

/// Every registered machine type
pub fn machine_types() -> &'static [MachineClass] {
    &MACHINE_TYPES
}

pub fn find_machine_type(name: &str) -> Option<&'static MachineClass> {
    MACHINE_TYPES.iter().find(|class| class.name == name)
}
