//! RAM Region - guest memory backing and installation
//!
//! Guest RAM is reserved up front against the host budget but populated one
//! page at a time on first write, so a 4 GiB guest does not cost 4 GiB of
//! host memory until the guest actually touches it. Pages never written read
//! back as zero.

use crate::address_space::SystemMemory;
use crate::memmap::MemMapEntry;
use crate::{MachineError, Result};
use static_assertions::const_assert;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Backing page size (4KB)
pub const PAGE_SIZE: u64 = 4096;

const_assert!(PAGE_SIZE.is_power_of_two());

/// Host memory budget available for guest RAM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostMemory {
    limit: u64,
}

impl HostMemory {
    pub const fn new(limit: u64) -> Self {
        Self { limit }
    }

    pub const fn unlimited() -> Self {
        Self { limit: u64::MAX }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn reserve(&self, size: u64) -> Result<()> {
        if size > self.limit {
            return Err(MachineError::AllocationFailure {
                size,
                reason: format!("host memory budget is {:#x} bytes", self.limit),
            });
        }
        Ok(())
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Memory-backed region of guest-physical address space
#[derive(Debug)]
pub struct GuestRam {
    range: MemMapEntry,
    pages: BTreeMap<u64, Box<[u8]>>,
}

impl GuestRam {
    /// Reserve backing memory for `range`
    ///
    /// # Errors
    /// Returns `AllocationFailure` if the range is empty, not page-aligned,
    /// wraps past the top of the address space, or is larger than the host
    /// budget.
    pub fn allocate(range: MemMapEntry, host: &HostMemory) -> Result<Self> {
        if range.size == 0 {
            return Err(MachineError::AllocationFailure {
                size: 0,
                reason: "empty RAM region".into(),
            });
        }
        if range.base.checked_add(range.size).is_none() {
            return Err(MachineError::AllocationFailure {
                size: range.size,
                reason: format!("{:#x} bytes at {:#x} wrap the address space", range.size, range.base),
            });
        }
        if range.base % PAGE_SIZE != 0 || range.size % PAGE_SIZE != 0 {
            return Err(MachineError::AllocationFailure {
                size: range.size,
                reason: format!("{range} is not {PAGE_SIZE}-byte aligned"),
            });
        }
        host.reserve(range.size)?;

        Ok(Self {
            range,
            pages: BTreeMap::new(),
        })
    }

    pub fn range(&self) -> MemMapEntry {
        self.range
    }

    /// Bytes of host memory currently committed to this region
    pub fn populated_bytes(&self) -> u64 {
        self.pages.len() as u64 * PAGE_SIZE
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let mut offset = self.offset_of(addr, data.len() as u64)?;
        let mut remaining = data;

        while !remaining.is_empty() {
            let in_page = (offset % PAGE_SIZE) as usize;
            let chunk = remaining.len().min(PAGE_SIZE as usize - in_page);
            let page = self.page_mut(offset / PAGE_SIZE)?;
            page[in_page..in_page + chunk].copy_from_slice(&remaining[..chunk]);
            remaining = &remaining[chunk..];
            offset += chunk as u64;
        }
        Ok(())
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let mut offset = self.offset_of(addr, buf.len() as u64)?;
        let mut filled = 0;

        while filled < buf.len() {
            let in_page = (offset % PAGE_SIZE) as usize;
            let chunk = (buf.len() - filled).min(PAGE_SIZE as usize - in_page);
            let dest = &mut buf[filled..filled + chunk];
            match self.pages.get(&(offset / PAGE_SIZE)) {
                Some(page) => dest.copy_from_slice(&page[in_page..in_page + chunk]),
                None => dest.fill(0),
            }
            filled += chunk;
            offset += chunk as u64;
        }
        Ok(())
    }

    fn offset_of(&self, addr: u64, len: u64) -> Result<u64> {
        let end = addr.checked_add(len);
        match end {
            Some(end) if addr >= self.range.base && end <= self.range.end() => {
                Ok(addr - self.range.base)
            }
            _ => Err(MachineError::UnmappedAccess { addr, len }),
        }
    }

    fn page_mut(&mut self, index: u64) -> Result<&mut [u8]> {
        let page = match self.pages.entry(index) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut frame = Vec::new();
                frame
                    .try_reserve_exact(PAGE_SIZE as usize)
                    .map_err(|e| MachineError::AllocationFailure {
                        size: PAGE_SIZE,
                        reason: e.to_string(),
                    })?;
                frame.resize(PAGE_SIZE as usize, 0);
                log::trace!(
                    "populate RAM page {:#x}",
                    self.range.base + index * PAGE_SIZE
                );
                entry.insert(frame.into_boxed_slice())
            }
        };
        Ok(&mut page[..])
    }
}

/// Allocate RAM for `range` and map it into `sysmem`
///
/// # Errors
/// Returns `AllocationFailure` if backing memory cannot be obtained; the
/// machine cannot exist without RAM.
pub fn install_ram(sysmem: &mut SystemMemory, range: MemMapEntry, host: &HostMemory) -> Result<()> {
    let ram = GuestRam::allocate(range, host)?;
    sysmem.attach_ram(ram)?;
    log::info!("RAM: {} MiB at {:#x}", range.size >> 20, range.base);
    Ok(())
}
