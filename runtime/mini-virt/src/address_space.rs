//! System Memory - the global physical address space
//!
//! Every device and the RAM region are mapped here. Mappings never overlap;
//! a conflicting map request fails instead of shadowing an earlier device.
//! Guest-physical reads and writes that land in RAM are forwarded to the RAM
//! backing store, which is how the image and device-tree loaders place data.

use crate::memmap::MemMapEntry;
use crate::ram::GuestRam;
use crate::{MachineError, Result};
use bitflags::bitflags;

bitflags! {
    /// Access attributes of a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Device memory: accesses have side effects and are never cached
        const DEVICE = 1 << 3;

        const RAM = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
        const MMIO = Self::READ.bits() | Self::WRITE.bits() | Self::DEVICE.bits();
    }
}

/// A region installed in the address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub name: &'static str,
    pub range: MemMapEntry,
    pub flags: MapFlags,
}

/// The machine's global address space
#[derive(Debug, Default)]
pub struct SystemMemory {
    mappings: Vec<Mapping>,
    ram: Option<GuestRam>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a region at `range.base`
    ///
    /// # Errors
    /// Returns `MappingConflict` if the range is empty, wraps the address
    /// space, or overlaps an existing mapping.
    pub fn map(&mut self, name: &'static str, range: MemMapEntry, flags: MapFlags) -> Result<()> {
        if range.size == 0 || range.base.checked_add(range.size).is_none() {
            return Err(MachineError::MappingConflict {
                name: name.into(),
                base: range.base,
                size: range.size,
                existing: "the address space bounds".into(),
            });
        }

        if let Some(existing) = self.mappings.iter().find(|m| m.range.overlaps(&range)) {
            return Err(MachineError::MappingConflict {
                name: name.into(),
                base: range.base,
                size: range.size,
                existing: existing.name.into(),
            });
        }

        log::debug!("map {:<12} {} {:?}", name, range, flags);
        self.mappings.push(Mapping { name, range, flags });
        self.mappings.sort_by_key(|m| m.range.base);
        Ok(())
    }

    /// Map a RAM region and take ownership of its backing store
    pub(crate) fn attach_ram(&mut self, ram: GuestRam) -> Result<()> {
        if self.ram.is_some() {
            return Err(MachineError::MappingConflict {
                name: "ram".into(),
                base: ram.range().base,
                size: ram.range().size,
                existing: "ram".into(),
            });
        }
        self.map("ram", ram.range(), MapFlags::RAM)?;
        self.ram = Some(ram);
        Ok(())
    }

    /// All mappings, ordered by base address
    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn mapping(&self, name: &str) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.name == name)
    }

    /// Mapping containing `addr`, if any
    pub fn resolve(&self, addr: u64) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.range.contains(addr))
    }

    pub fn ram(&self) -> Option<&GuestRam> {
        self.ram.as_ref()
    }

    /// Write guest-physical memory
    ///
    /// # Errors
    /// Returns `UnmappedAccess` unless the whole range lies in RAM.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        match self.ram.as_mut() {
            Some(ram) => ram.write(addr, data),
            None => Err(MachineError::UnmappedAccess {
                addr,
                len: data.len() as u64,
            }),
        }
    }

    /// Read guest-physical memory
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        match self.ram.as_ref() {
            Some(ram) => ram.read(addr, buf),
            None => Err(MachineError::UnmappedAccess {
                addr,
                len: buf.len() as u64,
            }),
        }
    }
}
