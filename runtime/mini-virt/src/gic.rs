//! Interrupt Controller Composer - GICv3 sizing, mapping and per-CPU wiring
//!
//! The GICv3 model is opaque. What this module owns is its configuration and
//! its connections:
//!
//! ## Input lines
//! Inputs `0..num_irq - 32` are the shared peripheral interrupts (SPIs,
//! interrupt IDs 32 and up). After them come 32 private lines per CPU:
//! CPU `n`'s private interrupt ID `p` is input `(num_irq - 32) + n * 32 + p`.
//!
//! ## Outputs
//! Output `n` is the arbitrated IRQ signal for CPU `n`.
//!
//! ## Redistributors
//! Every CPU needs a 128 KiB redistributor frame inside the single reserved
//! redistributor region. Only `region size / 128 KiB` frames fit.

use crate::address_space::{MapFlags, SystemMemory};
use crate::cpu::Vcpu;
use crate::memmap::{MemMapEntry, NUM_IRQS};
use crate::ram::PAGE_SIZE;
use crate::{MachineError, Result};
use static_assertions::{const_assert, const_assert_eq};

/// Private (SGI + PPI) interrupt lines per CPU
pub const GIC_INTERNAL: u32 = 32;

/// Highest interrupt ID count a GIC distributor can describe
pub const GIC_MAXIRQ: u32 = 1020;

/// Distributor register frame size
pub const GICV3_DIST_SIZE: u64 = 0x1_0000;

/// Per-CPU redistributor footprint (RD_base + SGI_base frames)
pub const GICV3_REDIST_SIZE: u64 = 0x2_0000;

/// Interrupt ID of the non-secure EL1 physical timer
pub const ARCH_TIMER_NS_EL1_IRQ: u32 = 30;

const_assert_eq!(GIC_INTERNAL, 32);
const_assert!(NUM_IRQS % 32 == 0);
const_assert!(NUM_IRQS + GIC_INTERNAL <= GIC_MAXIRQ);
const_assert!(GICV3_REDIST_SIZE % PAGE_SIZE == 0);
const_assert!(ARCH_TIMER_NS_EL1_IRQ < GIC_INTERNAL);

/// Architecture revision of the interrupt controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GicRevision {
    V3,
    V4,
}

impl GicRevision {
    pub const fn number(self) -> u32 {
        match self {
            GicRevision::V3 => 3,
            GicRevision::V4 => 4,
        }
    }
}

/// Number of CPUs that get a redistributor frame in a region of
/// `redist_region_size` bytes
pub fn redistributor_region_count(cpu_count: u32, redist_region_size: u64) -> u32 {
    let capacity = redist_region_size / GICV3_REDIST_SIZE;
    u64::from(cpu_count).min(capacity) as u32
}

/// GICv3 configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GicConfig {
    pub revision: GicRevision,

    /// Number of CPU interfaces
    pub num_cpu: u32,

    /// Total interrupt lines, private lines included
    pub num_irq: u32,

    /// CPUs served by the (single) redistributor region
    pub redist_region_count: u32,
}

impl GicConfig {
    /// Size a GICv3 for `num_cpu` CPUs, `irq_budget` shared lines and the
    /// given redistributor region
    ///
    /// # Errors
    /// Returns `DeviceRealization` if the line count does not fit in 32 bits.
    pub fn for_topology(num_cpu: u32, irq_budget: u32, redist: &MemMapEntry) -> Result<Self> {
        let num_irq = irq_budget.checked_add(GIC_INTERNAL).ok_or_else(|| {
            MachineError::realize("gicv3", format!("irq budget {irq_budget} out of range"))
        })?;
        Ok(Self {
            revision: GicRevision::V3,
            num_cpu,
            num_irq,
            redist_region_count: redistributor_region_count(num_cpu, redist.size),
        })
    }

    /// Number of shared (SPI) input lines
    pub fn num_spis(&self) -> u32 {
        self.num_irq.saturating_sub(GIC_INTERNAL)
    }

    /// Total input lines: SPIs plus every CPU's private block, or `None`
    /// if that overflows
    pub fn num_inputs(&self) -> Option<u32> {
        self.num_cpu
            .checked_mul(GIC_INTERNAL)?
            .checked_add(self.num_spis())
    }

    fn validate(&self) -> Result<()> {
        if self.num_cpu == 0 {
            return Err(MachineError::realize("gicv3", "num-cpu must be at least 1"));
        }
        if self.num_irq <= GIC_INTERNAL || self.num_irq > GIC_MAXIRQ || self.num_irq % 32 != 0 {
            return Err(MachineError::realize(
                "gicv3",
                format!(
                    "num-irq {} must be a multiple of 32 in ({GIC_INTERNAL}, {GIC_MAXIRQ}]",
                    self.num_irq
                ),
            ));
        }
        if self.num_inputs().is_none() {
            return Err(MachineError::realize(
                "gicv3",
                format!("{} CPUs overflow the input line count", self.num_cpu),
            ));
        }
        if self.redist_region_count < self.num_cpu {
            return Err(MachineError::realize(
                "gicv3",
                format!(
                    "redistributor capacity ({}) is less than number of vCPUs ({})",
                    self.redist_region_count, self.num_cpu
                ),
            ));
        }
        if self.redist_region_count > self.num_cpu {
            return Err(MachineError::realize(
                "gicv3",
                format!(
                    "redist-region-count {} exceeds num-cpu {}",
                    self.redist_region_count, self.num_cpu
                ),
            ));
        }
        Ok(())
    }
}

/// What drives a controller input line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSource {
    /// A CPU's architectural timer
    CpuTimer { cpu: u32 },
    /// A platform device
    Device { name: &'static str },
}

/// Realized GICv3 and its connections
#[derive(Debug)]
pub struct Gicv3 {
    config: GicConfig,
    dist: Option<MemMapEntry>,
    redist: Option<MemMapEntry>,
    inputs: Vec<Option<IrqSource>>,
    cpu_outputs: Vec<Option<u32>>,
}

impl Gicv3 {
    /// Instantiate a controller from `config`
    ///
    /// # Errors
    /// Returns `DeviceRealization` if the configuration is inconsistent.
    pub fn realize(config: GicConfig) -> Result<Self> {
        config.validate()?;
        let num_inputs = config
            .num_inputs()
            .ok_or_else(|| MachineError::realize("gicv3", "input line count overflows"))?;

        Ok(Self {
            inputs: vec![None; num_inputs as usize],
            cpu_outputs: vec![None; config.num_cpu as usize],
            dist: None,
            redist: None,
            config,
        })
    }

    pub fn config(&self) -> &GicConfig {
        &self.config
    }

    /// Map the distributor at `dist.base` and the redistributor frames at
    /// `redist.base`
    pub fn map(&mut self, sysmem: &mut SystemMemory, dist: MemMapEntry, redist: MemMapEntry) -> Result<()> {
        if dist.size < GICV3_DIST_SIZE {
            return Err(MachineError::realize(
                "gicv3",
                format!("distributor region {dist} smaller than {GICV3_DIST_SIZE:#x}"),
            ));
        }

        let frames = MemMapEntry::new(
            redist.base,
            u64::from(self.config.redist_region_count) * GICV3_REDIST_SIZE,
        );
        if frames.size > redist.size {
            return Err(MachineError::realize(
                "gicv3",
                format!("{} redistributor frames do not fit in {redist}", self.config.redist_region_count),
            ));
        }

        let dist = MemMapEntry::new(dist.base, GICV3_DIST_SIZE);
        sysmem.map("gic-dist", dist, MapFlags::MMIO)?;
        sysmem.map("gic-redist", frames, MapFlags::MMIO)?;
        self.dist = Some(dist);
        self.redist = Some(frames);
        Ok(())
    }

    /// Mapped distributor frame
    pub fn dist(&self) -> Option<MemMapEntry> {
        self.dist
    }

    /// Mapped redistributor frames
    pub fn redist(&self) -> Option<MemMapEntry> {
        self.redist
    }

    /// Input line for shared interrupt `spi`
    pub fn spi_line(&self, spi: u32) -> Result<u32> {
        if spi >= self.config.num_spis() {
            return Err(MachineError::realize(
                "gicv3",
                format!("SPI {spi} outside the {} configured lines", self.config.num_spis()),
            ));
        }
        Ok(spi)
    }

    /// Input line for private interrupt ID `intid` of CPU `cpu`
    pub fn ppi_line(&self, cpu: u32, intid: u32) -> Result<u32> {
        if cpu >= self.config.num_cpu || intid >= GIC_INTERNAL {
            return Err(MachineError::realize(
                "gicv3",
                format!("no private line {intid} for cpu{cpu}"),
            ));
        }
        Ok(self.config.num_spis() + cpu * GIC_INTERNAL + intid)
    }

    /// Attach `source` to input `line`; each line has exactly one driver
    pub fn connect_input(&mut self, line: u32, source: IrqSource) -> Result<()> {
        let slot = self
            .inputs
            .get_mut(line as usize)
            .ok_or_else(|| MachineError::realize("gicv3", format!("input line {line} does not exist")))?;

        if let Some(existing) = slot {
            return Err(MachineError::realize(
                "gicv3",
                format!("input line {line} already driven by {existing:?}"),
            ));
        }
        *slot = Some(source);
        Ok(())
    }

    /// Route output `cpu.index()` to the CPU's IRQ input
    pub fn connect_cpu_output(&mut self, cpu: &mut Vcpu) -> Result<()> {
        let index = cpu.index();
        let slot = self
            .cpu_outputs
            .get_mut(index as usize)
            .ok_or_else(|| MachineError::realize("gicv3", format!("no output for cpu{index}")))?;

        if slot.is_some() {
            return Err(MachineError::realize(
                "gicv3",
                format!("output {index} already connected"),
            ));
        }
        cpu.connect_irq_input(index)?;
        *slot = Some(index);
        Ok(())
    }

    pub fn input_source(&self, line: u32) -> Option<IrqSource> {
        self.inputs.get(line as usize).copied().flatten()
    }

    /// CPU whose IRQ input is driven by output `output`
    pub fn cpu_output(&self, output: u32) -> Option<u32> {
        self.cpu_outputs.get(output as usize).copied().flatten()
    }

    /// Every driven input line with its source
    pub fn connected_inputs(&self) -> impl Iterator<Item = (u32, IrqSource)> + '_ {
        self.inputs
            .iter()
            .enumerate()
            .filter_map(|(line, src)| src.map(|s| (line as u32, s)))
    }
}

/// Create the machine's interrupt controller and wire every CPU to it
///
/// For CPU `n` (in index order) the non-secure EL1 timer drives private
/// input `irq_budget + n * 32 + 30`, and controller output `n` drives the
/// CPU's IRQ input.
///
/// # Errors
/// Returns `DeviceRealization` or `MappingConflict`; either is fatal for the
/// machine.
pub fn create_gic(
    cpus: &mut [Vcpu],
    irq_budget: u32,
    dist: MemMapEntry,
    redist: MemMapEntry,
    sysmem: &mut SystemMemory,
) -> Result<Gicv3> {
    let num_cpu = u32::try_from(cpus.len())
        .map_err(|_| MachineError::realize("gicv3", "CPU count does not fit in 32 bits"))?;
    let config = GicConfig::for_topology(num_cpu, irq_budget, &redist)?;
    log::debug!(
        "GICv{}: {} CPUs, {} lines, {} redistributor frames",
        config.revision.number(),
        config.num_cpu,
        config.num_irq,
        config.redist_region_count
    );

    let mut gic = Gicv3::realize(config)?;
    gic.map(sysmem, dist, redist)?;

    for cpu in cpus.iter_mut() {
        let line = gic.ppi_line(cpu.index(), ARCH_TIMER_NS_EL1_IRQ)?;
        gic.connect_input(line, IrqSource::CpuTimer { cpu: cpu.index() })?;
        cpu.connect_timer(line)?;
        gic.connect_cpu_output(cpu)?;
        log::debug!("cpu{}: timer -> line {}, output {} -> IRQ", cpu.index(), line, cpu.index());
    }

    log::info!(
        "GIC: dist {:#x}, redist {:#x}, {} lines",
        dist.base,
        redist.base,
        gic.config().num_irq
    );
    Ok(gic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{CpuModel, CpuSet};
    use crate::memmap::{MemoryMap, Region};

    fn cpus(count: u32) -> CpuSet {
        let mut set = CpuSet::new(CpuModel::CortexA57);
        set.build(count, 512).unwrap();
        set
    }

    #[test]
    fn test_redistributor_region_count() {
        assert_eq!(redistributor_region_count(1, 0x00F6_0000), 1);
        assert_eq!(redistributor_region_count(4, 0x00F6_0000), 4);
        assert_eq!(redistributor_region_count(1000, 0x00F6_0000), 123);
        assert_eq!(redistributor_region_count(123, 0x00F6_0000), 123);
        assert_eq!(redistributor_region_count(8, 0x2_0000 * 2), 2);
    }

    #[test]
    fn test_config_for_topology() {
        let redist = MemMapEntry::new(0x080A_0000, 0x00F6_0000);
        let config = GicConfig::for_topology(4, NUM_IRQS, &redist).unwrap();

        assert_eq!(config.revision.number(), 3);
        assert_eq!(config.num_cpu, 4);
        assert_eq!(config.num_irq, 288);
        assert_eq!(config.redist_region_count, 4);
        assert_eq!(config.num_spis(), 256);
        assert_eq!(config.num_inputs(), Some(256 + 4 * 32));
    }

    #[test]
    fn test_irq_budget_out_of_range() {
        let redist = MemMapEntry::new(0x080A_0000, 0x00F6_0000);
        assert!(matches!(
            GicConfig::for_topology(1, u32::MAX - 10, &redist),
            Err(MachineError::DeviceRealization { device: "gicv3", .. })
        ));

        let map = MemoryMap::mini_virt();
        let mut set = cpus(2);
        let mut sysmem = SystemMemory::new();
        let result = create_gic(
            set.cpus_mut(),
            u32::MAX - 10,
            map.get(Region::GicDist).unwrap(),
            map.get(Region::GicRedist).unwrap(),
            &mut sysmem,
        );
        assert!(matches!(result, Err(MachineError::DeviceRealization { device: "gicv3", .. })));
        assert!(sysmem.mappings().is_empty());
        assert!(set.cpus().iter().all(|cpu| cpu.timer_line().is_none()));

        // Budgets that fit but are not a whole number of 32-line groups
        assert!(matches!(
            create_gic(
                set.cpus_mut(),
                100,
                map.get(Region::GicDist).unwrap(),
                map.get(Region::GicRedist).unwrap(),
                &mut sysmem,
            ),
            Err(MachineError::DeviceRealization { device: "gicv3", .. })
        ));
    }

    #[test]
    fn test_input_count_overflow_rejected() {
        let config = GicConfig {
            revision: GicRevision::V3,
            num_cpu: u32::MAX / 16,
            num_irq: 288,
            redist_region_count: u32::MAX / 16,
        };
        assert!(config.num_inputs().is_none());
        assert!(matches!(
            Gicv3::realize(config),
            Err(MachineError::DeviceRealization { device: "gicv3", .. })
        ));
    }

    #[test]
    fn test_realize_rejects_bad_config() {
        let good = GicConfig {
            revision: GicRevision::V3,
            num_cpu: 2,
            num_irq: 288,
            redist_region_count: 2,
        };
        assert!(Gicv3::realize(good.clone()).is_ok());

        let no_cpus = GicConfig { num_cpu: 0, ..good.clone() };
        assert!(Gicv3::realize(no_cpus).is_err());

        let odd_lines = GicConfig { num_irq: 100, ..good.clone() };
        assert!(Gicv3::realize(odd_lines).is_err());

        let too_many_lines = GicConfig { num_irq: 1024, ..good.clone() };
        assert!(Gicv3::realize(too_many_lines).is_err());

        let short_redist = GicConfig { redist_region_count: 1, ..good };
        assert!(matches!(
            Gicv3::realize(short_redist),
            Err(MachineError::DeviceRealization { device: "gicv3", .. })
        ));
    }

    #[test]
    fn test_line_numbering() {
        let redist = MemMapEntry::new(0x080A_0000, 0x00F6_0000);
        let gic = Gicv3::realize(GicConfig::for_topology(4, NUM_IRQS, &redist).unwrap()).unwrap();

        assert_eq!(gic.spi_line(1).unwrap(), 1);
        assert!(gic.spi_line(256).is_err());
        assert_eq!(gic.ppi_line(0, ARCH_TIMER_NS_EL1_IRQ).unwrap(), 286);
        assert_eq!(gic.ppi_line(3, ARCH_TIMER_NS_EL1_IRQ).unwrap(), 256 + 3 * 32 + 30);
        assert!(gic.ppi_line(4, 0).is_err());
        assert!(gic.ppi_line(0, 32).is_err());
    }

    #[test]
    fn test_every_cpu_wired() {
        let map = MemoryMap::mini_virt();
        let mut set = cpus(8);
        let mut sysmem = SystemMemory::new();

        let gic = create_gic(
            set.cpus_mut(),
            NUM_IRQS,
            map.get(Region::GicDist).unwrap(),
            map.get(Region::GicRedist).unwrap(),
            &mut sysmem,
        )
        .unwrap();

        for cpu in set.cpus() {
            let line = cpu.timer_line().expect("timer connected");
            assert_eq!(line, NUM_IRQS + cpu.index() * GIC_INTERNAL + ARCH_TIMER_NS_EL1_IRQ);
            assert_eq!(gic.input_source(line), Some(IrqSource::CpuTimer { cpu: cpu.index() }));
            assert_eq!(cpu.irq_input(), Some(cpu.index()));
            assert_eq!(gic.cpu_output(cpu.index()), Some(cpu.index()));
        }

        // Exactly one timer connection per CPU
        let timer_lines = gic
            .connected_inputs()
            .filter(|(_, src)| matches!(src, IrqSource::CpuTimer { .. }))
            .count();
        assert_eq!(timer_lines, 8);
    }

    #[test]
    fn test_gic_mapping() {
        let map = MemoryMap::mini_virt();
        let mut set = cpus(2);
        let mut sysmem = SystemMemory::new();

        let gic = create_gic(
            set.cpus_mut(),
            NUM_IRQS,
            map.get(Region::GicDist).unwrap(),
            map.get(Region::GicRedist).unwrap(),
            &mut sysmem,
        )
        .unwrap();

        assert_eq!(gic.dist(), Some(MemMapEntry::new(0x0800_0000, GICV3_DIST_SIZE)));
        assert_eq!(gic.redist(), Some(MemMapEntry::new(0x080A_0000, 2 * GICV3_REDIST_SIZE)));
        assert!(sysmem.mapping("gic-dist").is_some());
        assert_eq!(sysmem.mapping("gic-redist").unwrap().range.size, 2 * GICV3_REDIST_SIZE);
    }

    #[test]
    fn test_redistributor_capacity_exceeded() {
        let map = MemoryMap::mini_virt();
        let mut set = cpus(124);
        let mut sysmem = SystemMemory::new();

        let result = create_gic(
            set.cpus_mut(),
            NUM_IRQS,
            map.get(Region::GicDist).unwrap(),
            map.get(Region::GicRedist).unwrap(),
            &mut sysmem,
        );
        assert!(matches!(result, Err(MachineError::DeviceRealization { .. })));
        assert!(sysmem.mappings().is_empty());
    }

    #[test]
    fn test_input_has_single_driver() {
        let redist = MemMapEntry::new(0x080A_0000, 0x00F6_0000);
        let mut gic = Gicv3::realize(GicConfig::for_topology(1, NUM_IRQS, &redist).unwrap()).unwrap();

        gic.connect_input(1, IrqSource::Device { name: "pl011" }).unwrap();
        assert!(gic.connect_input(1, IrqSource::Device { name: "other" }).is_err());
        assert!(gic.connect_input(10_000, IrqSource::Device { name: "other" }).is_err());
    }
}
