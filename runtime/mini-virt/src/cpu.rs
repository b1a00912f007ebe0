//! CPU Set Builder - CPU identities and vCPU creation
//!
//! Each CPU gets a stable index (creation order, never reused) and an MPIDR
//! affinity value derived from that index. The identity list is computed once
//! per machine and cached; the topology may not change afterwards.

use crate::{MachineError, Result};
use core::fmt;
use core::str::FromStr;
use serde::Deserialize;

/// Affinity-0 values addressable by one GICv3 target list
pub const GICV3_TARGETLIST_BITS: u32 = 16;

/// Bit position of affinity level 1 in MPIDR
pub const ARM_AFF1_SHIFT: u32 = 8;

/// MPIDR affinity for CPU `index` in clusters of `cluster_size`
///
/// Aff0 holds the position inside the cluster, Aff1 the cluster number.
pub fn mp_affinity(index: u32, cluster_size: u32) -> u64 {
    let aff1 = u64::from(index / cluster_size);
    let aff0 = u64::from(index % cluster_size);
    (aff1 << ARM_AFF1_SHIFT) | aff0
}

/// Supported CPU models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum CpuModel {
    CortexA53,
    CortexA57,
    CortexA72,
    Max,
}

impl CpuModel {
    pub const ALL: [CpuModel; 4] = [
        CpuModel::CortexA53,
        CpuModel::CortexA57,
        CpuModel::CortexA72,
        CpuModel::Max,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            CpuModel::CortexA53 => "cortex-a53",
            CpuModel::CortexA57 => "cortex-a57",
            CpuModel::CortexA72 => "cortex-a72",
            CpuModel::Max => "max",
        }
    }

    /// Fully qualified type name, e.g. `cortex-a57-arm-cpu`
    pub fn type_name(self) -> String {
        format!("{}-arm-cpu", self.name())
    }

    /// Device-tree `compatible` string
    pub const fn compatible(self) -> &'static str {
        match self {
            CpuModel::CortexA53 => "arm,cortex-a53",
            CpuModel::CortexA57 => "arm,cortex-a57",
            CpuModel::CortexA72 => "arm,cortex-a72",
            CpuModel::Max => "arm,arm-v8",
        }
    }
}

impl fmt::Display for CpuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CpuModel {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.strip_suffix("-arm-cpu").unwrap_or(s);
        Self::ALL
            .into_iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| MachineError::UnknownCpuModel(s.into()))
    }
}

impl TryFrom<String> for CpuModel {
    type Error = MachineError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Identity of one possible CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuArchId {
    /// Creation index (0..N-1)
    pub index: u32,

    /// MPIDR affinity value
    pub arch_id: u64,

    /// CPU model
    pub cpu_type: CpuModel,
}

/// vCPU lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    /// Created and configured, not yet schedulable
    Realized,
    /// Handed to the scheduler
    Runnable,
}

/// A simulated CPU core
///
/// The core itself is opaque; this handle carries what the board needs to
/// know about it: identity, interrupt wiring and boot entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vcpu {
    id: CpuArchId,
    state: VcpuState,
    pc: u64,
    timer_out: Option<u32>,
    irq_in: Option<u32>,
}

impl Vcpu {
    fn realize(id: CpuArchId) -> Self {
        Self {
            id,
            state: VcpuState::Realized,
            pc: 0,
            timer_out: None,
            irq_in: None,
        }
    }

    fn activate(&mut self) {
        self.state = VcpuState::Runnable;
    }

    pub fn index(&self) -> u32 {
        self.id.index
    }

    pub fn mp_affinity(&self) -> u64 {
        self.id.arch_id
    }

    pub fn model(&self) -> CpuModel {
        self.id.cpu_type
    }

    pub fn arch_id(&self) -> &CpuArchId {
        &self.id
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    /// Initial program counter
    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    /// Controller input driven by this CPU's non-secure EL1 timer
    pub fn timer_line(&self) -> Option<u32> {
        self.timer_out
    }

    /// Controller output driving this CPU's IRQ input
    pub fn irq_input(&self) -> Option<u32> {
        self.irq_in
    }

    pub(crate) fn connect_timer(&mut self, line: u32) -> Result<()> {
        if let Some(existing) = self.timer_out {
            return Err(MachineError::realize(
                "cpu",
                format!("cpu{} timer already drives line {existing}", self.index()),
            ));
        }
        self.timer_out = Some(line);
        Ok(())
    }

    pub(crate) fn connect_irq_input(&mut self, output: u32) -> Result<()> {
        if let Some(existing) = self.irq_in {
            return Err(MachineError::realize(
                "cpu",
                format!("cpu{} IRQ input already driven by output {existing}", self.index()),
            ));
        }
        self.irq_in = Some(output);
        Ok(())
    }
}

/// The machine's CPUs and their cached identities
#[derive(Debug)]
pub struct CpuSet {
    cpu_type: CpuModel,
    possible: Option<Vec<CpuArchId>>,
    cpus: Vec<Vcpu>,
}

impl CpuSet {
    pub fn new(cpu_type: CpuModel) -> Self {
        Self {
            cpu_type,
            possible: None,
            cpus: Vec::new(),
        }
    }

    pub fn cpu_type(&self) -> CpuModel {
        self.cpu_type
    }

    /// Identities of `count` possible CPUs, computed on first use
    ///
    /// # Errors
    /// - `InvalidTopology` if `count` is zero or exceeds `max`; nothing is
    ///   cached
    /// - `TopologyChanged` if a list of a different length was computed
    ///   earlier
    pub fn possible_cpu_arch_ids(&mut self, count: u32, max: u32) -> Result<&[CpuArchId]> {
        if count == 0 || count > max {
            return Err(MachineError::InvalidTopology { requested: count, max });
        }

        let cpu_type = self.cpu_type;
        let ids = self.possible.get_or_insert_with(|| {
            (0..count)
                .map(|index| CpuArchId {
                    index,
                    arch_id: mp_affinity(index, GICV3_TARGETLIST_BITS),
                    cpu_type,
                })
                .collect()
        });

        if ids.len() != count as usize {
            return Err(MachineError::TopologyChanged {
                cached: ids.len(),
                requested: count,
            });
        }
        Ok(ids.as_slice())
    }

    /// Create and activate `requested` CPUs
    ///
    /// Calling this again with the same count returns the cached identities
    /// without creating anything.
    ///
    /// # Errors
    /// - `InvalidTopology` if `requested` is zero or exceeds `max`; no CPU is
    ///   created
    /// - `TopologyChanged` if a different count was built before
    pub fn build(&mut self, requested: u32, max: u32) -> Result<&[CpuArchId]> {
        self.possible_cpu_arch_ids(requested, max)?;

        if self.cpus.is_empty() {
            for id in self.possible.iter().flatten() {
                let mut cpu = Vcpu::realize(*id);
                cpu.activate();
                log::debug!(
                    "cpu{}: {} mpidr={:#x}",
                    cpu.index(),
                    cpu.model(),
                    cpu.mp_affinity()
                );
                self.cpus.push(cpu);
            }
            log::info!("CPUs: {} x {}", self.cpus.len(), self.cpu_type);
        }

        Ok(self.arch_ids())
    }

    pub fn arch_ids(&self) -> &[CpuArchId] {
        self.possible.as_deref().unwrap_or(&[])
    }

    pub fn cpus(&self) -> &[Vcpu] {
        &self.cpus
    }

    pub fn cpus_mut(&mut self) -> &mut [Vcpu] {
        &mut self.cpus
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }
}
