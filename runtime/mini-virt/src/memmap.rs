//! Address Map Registry - named physical regions and device interrupt lines
//!
//! The mini-virt board has one fixed layout. It is expressed as values
//! ([`MemoryMap`], [`IrqMap`]) rather than process-wide tables so that several
//! machines can coexist, e.g. in tests.
//!
//! ```text
//! 0x0800_0000  gic-dist     64 KiB
//! 0x080A_0000  gic-redist   15.375 MiB (123 redistributor frames)
//! 0x0900_0000  uart          4 KiB
//! 0x1_0000_0000 ram          4 GiB
//! ```

use crate::gic::GIC_INTERNAL;
use crate::{MachineError, Result};
use core::fmt;
use std::collections::BTreeMap;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Number of shared (device) interrupt lines the GIC is configured with
pub const NUM_IRQS: u32 = 256;

/// Physical address range `[base, base + size)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemMapEntry {
    pub base: u64,
    pub size: u64,
}

impl MemMapEntry {
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// One past the last address of the range, clamped to `u64::MAX`
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn overlaps(&self, other: &MemMapEntry) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

impl fmt::Display for MemMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#011x}, {:#011x})", self.base, self.end())
    }
}

/// Named regions of the mini-virt address map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    Mem,
    Uart,
    GicDist,
    GicRedist,
}

impl Region {
    pub const ALL: [Region; 4] = [Region::Mem, Region::Uart, Region::GicDist, Region::GicRedist];

    pub const fn name(self) -> &'static str {
        match self {
            Region::Mem => "ram",
            Region::Uart => "uart",
            Region::GicDist => "gic-dist",
            Region::GicRedist => "gic-redist",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.name() == name)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const MINI_VIRT_MEMMAP: [(Region, MemMapEntry); 4] = [
    (Region::Mem, MemMapEntry::new(4 * GIB, 4 * GIB)),
    (Region::Uart, MemMapEntry::new(0x0900_0000, 0x0000_1000)),
    (Region::GicDist, MemMapEntry::new(0x0800_0000, 0x0001_0000)),
    (Region::GicRedist, MemMapEntry::new(0x080A_0000, 0x00F6_0000)),
];

const MINI_VIRT_IRQMAP: [(Region, u32); 1] = [(Region::Uart, 1)];

/// Immutable table of named physical regions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    regions: BTreeMap<Region, MemMapEntry>,
}

impl MemoryMap {
    /// The mini-virt board layout
    pub fn mini_virt() -> Self {
        Self {
            regions: MINI_VIRT_MEMMAP.into_iter().collect(),
        }
    }

    /// Build a map from explicit entries
    ///
    /// # Errors
    /// Returns `MappingConflict` if a region is listed twice, is empty, or
    /// overlaps another region.
    pub fn new(entries: impl IntoIterator<Item = (Region, MemMapEntry)>) -> Result<Self> {
        let mut regions = BTreeMap::new();
        for (region, entry) in entries {
            if entry.size == 0 || entry.base.checked_add(entry.size).is_none() {
                return Err(MachineError::MappingConflict {
                    name: region.name().into(),
                    base: entry.base,
                    size: entry.size,
                    existing: "the address space bounds".into(),
                });
            }
            if regions.insert(region, entry).is_some() {
                return Err(MachineError::MappingConflict {
                    name: region.name().into(),
                    base: entry.base,
                    size: entry.size,
                    existing: format!("an earlier definition of {region}"),
                });
            }
        }

        let map = Self { regions };
        map.check_disjoint()?;
        Ok(map)
    }

    /// Look up a region descriptor
    pub fn get(&self, region: Region) -> Result<MemMapEntry> {
        self.regions
            .get(&region)
            .copied()
            .ok_or_else(|| MachineError::UnknownRegion {
                name: region.name().into(),
            })
    }

    /// Look up a region descriptor by name
    pub fn lookup(&self, name: &str) -> Result<MemMapEntry> {
        Region::from_name(name)
            .ok_or_else(|| MachineError::UnknownRegion { name: name.into() })
            .and_then(|region| self.get(region))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Region, MemMapEntry)> + '_ {
        self.regions.iter().map(|(r, e)| (*r, *e))
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Verify that no two regions share an address
    pub fn check_disjoint(&self) -> Result<()> {
        let entries: Vec<_> = self.iter().collect();
        for (i, (region, entry)) in entries.iter().enumerate() {
            if let Some((other, _)) = entries[i + 1..].iter().find(|(_, e)| e.overlaps(entry)) {
                return Err(MachineError::MappingConflict {
                    name: region.name().into(),
                    base: entry.base,
                    size: entry.size,
                    existing: other.name().into(),
                });
            }
        }
        Ok(())
    }
}

/// Device interrupt lines, as shared-interrupt (SPI) numbers
///
/// SPI `n` is interrupt ID `n + 32`; IDs 0-31 are the per-CPU private lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrqMap {
    lines: BTreeMap<Region, u32>,
}

impl IrqMap {
    pub fn mini_virt() -> Self {
        Self {
            lines: MINI_VIRT_IRQMAP.into_iter().collect(),
        }
    }

    /// Build a line map, checking every line is unique and inside `budget`
    pub fn new(entries: impl IntoIterator<Item = (Region, u32)>, budget: u32) -> Result<Self> {
        let mut lines: BTreeMap<Region, u32> = BTreeMap::new();
        for (region, line) in entries {
            if line >= budget {
                return Err(MachineError::realize(
                    "irq-map",
                    format!("{region} line {line} outside the {budget}-line budget"),
                ));
            }
            if let Some((owner, _)) = lines.iter().find(|(_, l)| **l == line) {
                return Err(MachineError::realize(
                    "irq-map",
                    format!("{region} line {line} already assigned to {owner}"),
                ));
            }
            if lines.insert(region, line).is_some() {
                return Err(MachineError::realize(
                    "irq-map",
                    format!("{region} assigned twice"),
                ));
            }
        }
        Ok(Self { lines })
    }

    /// Shared line number driven by `region`
    pub fn line(&self, region: Region) -> Result<u32> {
        self.lines
            .get(&region)
            .copied()
            .ok_or_else(|| MachineError::UnknownRegion {
                name: region.name().into(),
            })
    }

    /// Architectural interrupt ID for `region` (always >= 32)
    pub fn intid(&self, region: Region) -> Result<u32> {
        self.line(region).map(|line| line + GIC_INTERNAL)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Region, u32)> + '_ {
        self.lines.iter().map(|(r, l)| (*r, *l))
    }
}
