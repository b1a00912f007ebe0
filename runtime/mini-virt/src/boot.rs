//! Boot Orchestrator - boot parameters, image load and device-tree placement
//!
//! # Lifecycle
//! ```text
//! begin() ──► Initializing ──load_kernel()──► Initializing ──finalize()──► Ready
//! ```
//! `finalize` runs once, after every other component exists, because the
//! device tree describes all of them. It is never re-entered.

use crate::address_space::SystemMemory;
use crate::cpu::Vcpu;
use crate::machine::MachineView;
use crate::memmap::MIB;
use crate::{MachineError, Result};

/// Firmware call convention used to start secondary CPUs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PsciConduit {
    #[default]
    Disabled,
    Hvc,
    Smc,
}

impl PsciConduit {
    /// Device-tree `method` property value
    pub const fn method(self) -> Option<&'static str> {
        match self {
            PsciConduit::Disabled => None,
            PsciConduit::Hvc => Some("hvc"),
            PsciConduit::Smc => Some("smc"),
        }
    }
}

/// Parameters shared between the board and the guest loaders
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootInfo {
    pub ram_size: u64,

    /// Guest-physical address images are loaded relative to (RAM base)
    pub loader_start: u64,

    /// Device-tree placement is left to `finalize` rather than the image loader
    pub skip_dtb_autoload: bool,

    pub psci_conduit: PsciConduit,

    /// Boot the first CPU in the secure address space
    pub secure_boot: bool,

    pub nb_cpus: u32,

    /// Entry point chosen by the image loader
    pub entry: Option<u64>,

    /// Device-tree window chosen by the image loader, if any
    pub dtb_start: Option<u64>,
    pub dtb_limit: Option<u64>,
}

/// Address space the first CPU starts in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceKind {
    NonSecure,
    Secure,
}

pub fn boot_address_space(info: &BootInfo) -> AddressSpaceKind {
    if info.secure_boot {
        AddressSpaceKind::Secure
    } else {
        AddressSpaceKind::NonSecure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Initializing,
    Ready,
}

/// Places a guest image in RAM and sets initial CPU state
pub trait ImageLoader {
    fn load_kernel(
        &mut self,
        info: &mut BootInfo,
        cpus: &mut [Vcpu],
        memory: &mut SystemMemory,
    ) -> Result<()>;
}

/// Loader that writes nothing and starts every CPU at `loader_start`
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectEntry;

impl ImageLoader for DirectEntry {
    fn load_kernel(
        &mut self,
        info: &mut BootInfo,
        cpus: &mut [Vcpu],
        _memory: &mut SystemMemory,
    ) -> Result<()> {
        for cpu in cpus.iter_mut() {
            cpu.set_pc(info.loader_start);
        }
        info.entry = Some(info.loader_start);
        Ok(())
    }
}

/// Everything a device-tree loader gets to see
#[derive(Debug)]
pub struct DtbRequest<'a> {
    /// Where the blob goes
    pub addr: u64,

    /// First address the blob may not touch
    pub limit: u64,

    pub info: &'a BootInfo,
    pub address_space: AddressSpaceKind,
    pub machine: MachineView<'a>,
}

impl DtbRequest<'_> {
    /// Bytes available for the blob
    pub fn capacity(&self) -> u64 {
        self.limit.saturating_sub(self.addr)
    }
}

/// Writes a device-tree blob into guest memory
pub trait DtbLoader {
    /// Returns the number of bytes written
    fn load_dtb(&mut self, request: DtbRequest<'_>, memory: &mut SystemMemory) -> Result<usize>;
}

/// Where the device tree ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtbPlacement {
    pub addr: u64,
    pub size: usize,
}

pub const DTB_ALIGN: u64 = 2 * MIB;
const DTB_MAX_OFFSET: u64 = 128 * MIB;

pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value.saturating_add(align - 1) & !(align - 1)
}

/// Device-tree window used when the image loader does not pick one: the
/// first 2 MiB boundary past `min(ram_size / 2, 128 MiB)` into RAM, up to
/// the end of RAM
pub fn default_dtb_region(info: &BootInfo) -> (u64, u64) {
    let offset = (info.ram_size / 2).min(DTB_MAX_OFFSET);
    (
        align_up(info.loader_start.saturating_add(offset), DTB_ALIGN),
        info.loader_start.saturating_add(info.ram_size),
    )
}

/// Boot state machine for one machine instance
#[derive(Debug)]
pub struct BootOrchestrator {
    info: BootInfo,
    state: BootState,
    placement: Option<DtbPlacement>,
    // Each handoff runs at most once, even when it fails
    kernel_attempted: bool,
    dtb_attempted: bool,
}

impl BootOrchestrator {
    /// Record the boot parameters for a machine whose RAM starts at
    /// `loader_start`
    pub fn begin(loader_start: u64, ram_size: u64, nb_cpus: u32) -> Self {
        let info = BootInfo {
            ram_size,
            loader_start,
            skip_dtb_autoload: true,
            psci_conduit: PsciConduit::Smc,
            nb_cpus,
            ..BootInfo::default()
        };
        log::info!(
            "Boot: loader_start {:#x}, {} MiB, {} CPUs, PSCI {:?}",
            info.loader_start,
            info.ram_size >> 20,
            info.nb_cpus,
            info.psci_conduit
        );

        Self {
            info,
            state: BootState::Initializing,
            placement: None,
            kernel_attempted: false,
            dtb_attempted: false,
        }
    }

    pub fn info(&self) -> &BootInfo {
        &self.info
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn placement(&self) -> Option<DtbPlacement> {
        self.placement
    }

    /// Hand off to the image loader
    ///
    /// If the loader does not record an entry point, `loader_start` is used.
    /// The loader is invoked at most once; a second call fails with
    /// `ImageLoad` whether or not the first succeeded.
    pub fn load_kernel(
        &mut self,
        loader: &mut dyn ImageLoader,
        cpus: &mut [Vcpu],
        memory: &mut SystemMemory,
    ) -> Result<u64> {
        if self.state != BootState::Initializing {
            return Err(MachineError::ImageLoad("machine already booted".into()));
        }
        if self.kernel_attempted {
            return Err(MachineError::ImageLoad("kernel image already handed off".into()));
        }
        self.kernel_attempted = true;

        loader.load_kernel(&mut self.info, cpus, memory)?;
        let entry = *self.info.entry.get_or_insert(self.info.loader_start);
        log::info!("Kernel entry {:#x}", entry);
        Ok(entry)
    }

    /// Window `[addr, limit)` the device tree will be placed in
    ///
    /// Uses the image loader's choice if it made one, otherwise
    /// [`default_dtb_region`].
    pub fn dtb_region(&self) -> (u64, u64) {
        let (default_start, ram_end) = default_dtb_region(&self.info);
        (
            self.info.dtb_start.unwrap_or(default_start),
            self.info.dtb_limit.unwrap_or(ram_end),
        )
    }

    /// Place the device tree and enter `Ready`
    ///
    /// # Errors
    /// Returns `DeviceTreePlacement` if placement was already attempted, the
    /// machine has no CPU, or the loader reports zero bytes or overruns the
    /// window. Loader errors are propagated unchanged. A failed placement is
    /// not retried: later calls are refused.
    pub fn finalize(
        &mut self,
        loader: &mut dyn DtbLoader,
        machine: MachineView<'_>,
        memory: &mut SystemMemory,
    ) -> Result<DtbPlacement> {
        if self.state == BootState::Ready {
            return Err(MachineError::DeviceTreePlacement {
                reason: "device tree already placed".into(),
            });
        }
        if self.dtb_attempted {
            return Err(MachineError::DeviceTreePlacement {
                reason: "device tree placement already failed".into(),
            });
        }
        if machine.cpus.is_empty() {
            return Err(MachineError::DeviceTreePlacement {
                reason: "machine has no boot CPU".into(),
            });
        }

        let address_space = boot_address_space(&self.info);
        let (addr, limit) = self.dtb_region();
        if addr >= limit {
            return Err(MachineError::DeviceTreePlacement {
                reason: format!("empty window [{addr:#x}, {limit:#x})"),
            });
        }

        self.dtb_attempted = true;
        let size = loader.load_dtb(
            DtbRequest {
                addr,
                limit,
                info: &self.info,
                address_space,
                machine,
            },
            memory,
        )?;

        if size == 0 {
            return Err(MachineError::DeviceTreePlacement {
                reason: "loader wrote no bytes".into(),
            });
        }
        if addr.saturating_add(size as u64) > limit {
            return Err(MachineError::DeviceTreePlacement {
                reason: format!("{size} bytes at {addr:#x} overrun limit {limit:#x}"),
            });
        }

        let placement = DtbPlacement { addr, size };
        self.placement = Some(placement);
        self.state = BootState::Ready;
        log::info!("DTB: {} bytes at {:#x} ({:?})", size, addr, address_space);
        Ok(placement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{CpuModel, CpuSet};
    use crate::gic::create_gic;
    use crate::machine::Board;
    use crate::memmap::{IrqMap, MemoryMap, Region, GIB, NUM_IRQS};
    use crate::ram::{install_ram, HostMemory};
    use crate::uart::{create_uart, NullBackend};

    fn board(count: u32) -> Board {
        let memmap = MemoryMap::mini_virt();
        let irqmap = IrqMap::mini_virt();
        let mut memory = SystemMemory::new();
        let mut cpus = CpuSet::new(CpuModel::CortexA57);
        cpus.build(count, 512).unwrap();
        install_ram(&mut memory, memmap.get(Region::Mem).unwrap(), &HostMemory::unlimited()).unwrap();
        let mut gic = create_gic(
            cpus.cpus_mut(),
            NUM_IRQS,
            memmap.get(Region::GicDist).unwrap(),
            memmap.get(Region::GicRedist).unwrap(),
            &mut memory,
        )
        .unwrap();
        let uart = create_uart(
            &mut gic,
            memmap.get(Region::Uart).unwrap(),
            1,
            Box::new(NullBackend),
            &mut memory,
        )
        .unwrap();
        Board::new(memmap, irqmap, memory, cpus, gic, uart)
    }

    /// Writes `payload` at the requested address and counts calls
    struct BlobLoader {
        payload: Vec<u8>,
        calls: usize,
        seen: Option<(u64, u64, AddressSpaceKind)>,
    }

    impl BlobLoader {
        fn new(payload: &[u8]) -> Self {
            Self {
                payload: payload.to_vec(),
                calls: 0,
                seen: None,
            }
        }
    }

    impl DtbLoader for BlobLoader {
        fn load_dtb(&mut self, request: DtbRequest<'_>, memory: &mut SystemMemory) -> Result<usize> {
            self.calls += 1;
            self.seen = Some((request.addr, request.limit, request.address_space));
            memory.write(request.addr, &self.payload)?;
            Ok(self.payload.len())
        }
    }

    #[test]
    fn test_begin_records_boot_info() {
        let boot = BootOrchestrator::begin(4 * GIB, 4 * GIB, 4);
        let info = boot.info();

        assert_eq!(info.loader_start, 4 * GIB);
        assert_eq!(info.ram_size, 4 * GIB);
        assert_eq!(info.nb_cpus, 4);
        assert!(info.skip_dtb_autoload);
        assert_eq!(info.psci_conduit, PsciConduit::Smc);
        assert_eq!(info.psci_conduit.method(), Some("smc"));
        assert_eq!(boot.state(), BootState::Initializing);
        assert!(boot.placement().is_none());
    }

    #[test]
    fn test_direct_entry_sets_pcs() {
        let mut board = board(3);
        let mut boot = BootOrchestrator::begin(4 * GIB, 4 * GIB, 3);
        let (cpus, memory) = board.split_for_load();

        let entry = boot.load_kernel(&mut DirectEntry, cpus, memory).unwrap();
        assert_eq!(entry, 4 * GIB);
        for cpu in board.cpus() {
            assert_eq!(cpu.pc(), 4 * GIB);
        }
    }

    /// Counts handoffs and always fails
    struct FailingImage {
        calls: usize,
    }

    impl ImageLoader for FailingImage {
        fn load_kernel(&mut self, _: &mut BootInfo, _: &mut [Vcpu], _: &mut SystemMemory) -> Result<()> {
            self.calls += 1;
            Err(MachineError::ImageLoad("bad image".into()))
        }
    }

    #[test]
    fn test_kernel_handed_off_once() {
        let mut board = board(1);
        let mut boot = BootOrchestrator::begin(4 * GIB, 4 * GIB, 1);

        let (cpus, memory) = board.split_for_load();
        boot.load_kernel(&mut DirectEntry, cpus, memory).unwrap();
        let (cpus, memory) = board.split_for_load();
        assert!(matches!(
            boot.load_kernel(&mut DirectEntry, cpus, memory),
            Err(MachineError::ImageLoad(_))
        ));

        // A failed handoff is not retried either
        let mut boot = BootOrchestrator::begin(4 * GIB, 4 * GIB, 1);
        let mut failing = FailingImage { calls: 0 };
        let (cpus, memory) = board.split_for_load();
        assert!(boot.load_kernel(&mut failing, cpus, memory).is_err());
        let (cpus, memory) = board.split_for_load();
        assert!(boot.load_kernel(&mut failing, cpus, memory).is_err());
        assert_eq!(failing.calls, 1);
        assert!(boot.info().entry.is_none());
    }

    #[test]
    fn test_dtb_fallback_region() {
        let boot = BootOrchestrator::begin(4 * GIB, 4 * GIB, 1);
        assert_eq!(boot.dtb_region(), (4 * GIB + 128 * MIB, 8 * GIB));

        // Small RAM: half of it, rounded up to 2 MiB
        let boot = BootOrchestrator::begin(0x4000_0000, 6 * MIB, 1);
        assert_eq!(boot.dtb_region(), (0x4000_0000 + 4 * MIB, 0x4000_0000 + 6 * MIB));
    }

    #[test]
    fn test_finalize_places_once() {
        let mut board = board(2);
        let mut boot = BootOrchestrator::begin(4 * GIB, 4 * GIB, 2);
        let mut loader = BlobLoader::new(&[0xd0, 0x0d, 0xfe, 0xed]);

        let (view, memory) = board.split_for_boot();
        let placement = boot.finalize(&mut loader, view, memory).unwrap();
        assert_eq!(placement, DtbPlacement { addr: 4 * GIB + 128 * MIB, size: 4 });
        assert_eq!(boot.state(), BootState::Ready);
        assert_eq!(loader.seen, Some((4 * GIB + 128 * MIB, 8 * GIB, AddressSpaceKind::NonSecure)));

        let mut buf = [0u8; 4];
        board.memory().read(placement.addr, &mut buf).unwrap();
        assert_eq!(buf, [0xd0, 0x0d, 0xfe, 0xed]);

        let (view, memory) = board.split_for_boot();
        let again = boot.finalize(&mut loader, view, memory);
        assert!(matches!(again, Err(MachineError::DeviceTreePlacement { .. })));
        assert_eq!(loader.calls, 1);
    }

    #[test]
    fn test_zero_byte_dtb_is_fatal() {
        let mut board = board(1);
        let mut boot = BootOrchestrator::begin(4 * GIB, 4 * GIB, 1);
        let mut loader = BlobLoader::new(&[]);

        let (view, memory) = board.split_for_boot();
        let result = boot.finalize(&mut loader, view, memory);
        assert!(matches!(result, Err(MachineError::DeviceTreePlacement { .. })));
        assert_eq!(boot.state(), BootState::Initializing);

        // No second attempt, even with a loader that would succeed
        let mut good = BlobLoader::new(&[0xd0, 0x0d, 0xfe, 0xed]);
        let (view, memory) = board.split_for_boot();
        let again = boot.finalize(&mut good, view, memory);
        assert!(matches!(again, Err(MachineError::DeviceTreePlacement { .. })));
        assert_eq!(loader.calls, 1);
        assert_eq!(good.calls, 0);
        assert!(boot.placement().is_none());
    }

    #[test]
    fn test_dtb_overrun_is_fatal() {
        let mut board = board(1);
        let mut boot = BootOrchestrator::begin(4 * GIB, 4 * GIB, 1);
        boot.info.dtb_start = Some(4 * GIB);
        boot.info.dtb_limit = Some(4 * GIB + 2);
        let mut loader = BlobLoader::new(&[1, 2, 3, 4]);

        let (view, memory) = board.split_for_boot();
        let result = boot.finalize(&mut loader, view, memory);
        assert!(matches!(result, Err(MachineError::DeviceTreePlacement { .. })));
    }

    #[test]
    fn test_secure_boot_address_space() {
        let mut info = BootInfo::default();
        assert_eq!(boot_address_space(&info), AddressSpaceKind::NonSecure);
        info.secure_boot = true;
        assert_eq!(boot_address_space(&info), AddressSpaceKind::Secure);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, DTB_ALIGN), 0);
        assert_eq!(align_up(1, DTB_ALIGN), DTB_ALIGN);
        assert_eq!(align_up(DTB_ALIGN, DTB_ALIGN), DTB_ALIGN);
    }
}
