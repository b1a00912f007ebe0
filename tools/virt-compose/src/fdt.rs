//! Flattened Device Tree (FDT) generation
//!
//! Builds a version 17 blob describing a constructed mini-virt machine and
//! writes it into guest RAM.
//!
//! Blob layout:
//! ```text
//! +-----------------+  0
//! | header (40B)    |
//! +-----------------+  40
//! | mem_rsvmap      |  one empty terminator entry
//! +-----------------+  56
//! | structure block |
//! +-----------------+
//! | strings block   |
//! +-----------------+
//! ```

use mini_virt::{
    DtbLoader, DtbRequest, MachineError, MachineView, MemMapEntry, Region, SystemMemory,
    ARCH_TIMER_NS_EL1_IRQ,
};
use std::collections::HashMap;
use thiserror::Error;

pub const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_BEGIN_NODE: u32 = 0x0000_0001;
const FDT_END_NODE: u32 = 0x0000_0002;
const FDT_PROP: u32 = 0x0000_0003;
const FDT_END: u32 = 0x0000_0009;

const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;
const FDT_HEADER_SIZE: usize = 40;
const FDT_RSVMAP_SIZE: usize = 16;

// Interrupt specifier cells (GIC binding)
const GIC_FDT_IRQ_TYPE_SPI: u32 = 0;
const GIC_FDT_IRQ_TYPE_PPI: u32 = 1;
const GIC_FDT_IRQ_FLAGS_LEVEL_HI: u32 = 4;

// Private interrupt IDs of the architected timers
const ARCH_TIMER_S_EL1_IRQ: u32 = 29;
const ARCH_TIMER_VIRT_IRQ: u32 = 27;
const ARCH_TIMER_NS_EL2_IRQ: u32 = 26;

const GIC_PHANDLE: u32 = 0x8001;
const CLOCK_PHANDLE: u32 = 0x8000;

/// FDT construction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FdtError {
    #[error("Node or property name contains NUL: {0:?}")]
    InvalidName(String),

    #[error("end_node without a matching begin_node")]
    UnbalancedEnd,

    #[error("{0} node(s) still open at finish")]
    UnclosedNodes(usize),

    #[error("Property {0} outside of any node")]
    PropertyOutsideNode(String),

    #[error("Blob too large: {0} bytes")]
    TooLarge(usize),
}

/// Incremental FDT builder
#[derive(Debug, Default)]
pub struct FdtWriter {
    structure: Vec<u8>,
    strings: Vec<u8>,
    string_offsets: HashMap<String, u32>,
    depth: usize,
}

impl FdtWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_u32(&mut self, value: u32) {
        self.structure.extend_from_slice(&value.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn check_name(name: &str) -> Result<(), FdtError> {
        if name.contains('\0') {
            return Err(FdtError::InvalidName(name.into()));
        }
        Ok(())
    }

    fn string_offset(&mut self, name: &str) -> Result<u32, FdtError> {
        if let Some(&offset) = self.string_offsets.get(name) {
            return Ok(offset);
        }
        let offset = u32::try_from(self.strings.len()).map_err(|_| FdtError::TooLarge(self.strings.len()))?;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        self.string_offsets.insert(name.to_string(), offset);
        Ok(offset)
    }

    /// Open a node; the root node has the empty name
    pub fn begin_node(&mut self, name: &str) -> Result<(), FdtError> {
        Self::check_name(name)?;
        self.push_u32(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
        self.depth += 1;
        Ok(())
    }

    pub fn end_node(&mut self) -> Result<(), FdtError> {
        if self.depth == 0 {
            return Err(FdtError::UnbalancedEnd);
        }
        self.push_u32(FDT_END_NODE);
        self.depth -= 1;
        Ok(())
    }

    pub fn property(&mut self, name: &str, value: &[u8]) -> Result<(), FdtError> {
        Self::check_name(name)?;
        if self.depth == 0 {
            return Err(FdtError::PropertyOutsideNode(name.into()));
        }
        let len = u32::try_from(value.len()).map_err(|_| FdtError::TooLarge(value.len()))?;
        let nameoff = self.string_offset(name)?;

        self.push_u32(FDT_PROP);
        self.push_u32(len);
        self.push_u32(nameoff);
        self.structure.extend_from_slice(value);
        self.pad();
        Ok(())
    }

    pub fn property_null(&mut self, name: &str) -> Result<(), FdtError> {
        self.property(name, &[])
    }

    pub fn property_u32(&mut self, name: &str, value: u32) -> Result<(), FdtError> {
        self.property(name, &value.to_be_bytes())
    }

    pub fn property_cells(&mut self, name: &str, cells: &[u32]) -> Result<(), FdtError> {
        let bytes: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.property(name, &bytes)
    }

    pub fn property_string(&mut self, name: &str, value: &str) -> Result<(), FdtError> {
        self.property_strings(name, &[value])
    }

    pub fn property_strings(&mut self, name: &str, values: &[&str]) -> Result<(), FdtError> {
        let mut bytes = Vec::new();
        for value in values {
            bytes.extend_from_slice(value.as_bytes());
            bytes.push(0);
        }
        self.property(name, &bytes)
    }

    /// `reg`-style pair of two-cell address and two-cell size
    pub fn property_reg64(&mut self, name: &str, base: u64, size: u64) -> Result<(), FdtError> {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&base.to_be_bytes());
        bytes.extend_from_slice(&size.to_be_bytes());
        self.property(name, &bytes)
    }

    /// Assemble the blob
    pub fn finish(mut self, boot_cpuid_phys: u32) -> Result<Vec<u8>, FdtError> {
        if self.depth != 0 {
            return Err(FdtError::UnclosedNodes(self.depth));
        }
        self.push_u32(FDT_END);

        let off_mem_rsvmap = FDT_HEADER_SIZE;
        let off_dt_struct = off_mem_rsvmap + FDT_RSVMAP_SIZE;
        let off_dt_strings = off_dt_struct + self.structure.len();
        let totalsize = off_dt_strings + self.strings.len();
        let as_u32 = |v: usize| u32::try_from(v).map_err(|_| FdtError::TooLarge(totalsize));

        let mut blob = Vec::with_capacity(totalsize);
        for field in [
            FDT_MAGIC,
            as_u32(totalsize)?,
            as_u32(off_dt_struct)?,
            as_u32(off_dt_strings)?,
            as_u32(off_mem_rsvmap)?,
            FDT_VERSION,
            FDT_LAST_COMP_VERSION,
            boot_cpuid_phys,
            as_u32(self.strings.len())?,
            as_u32(self.structure.len())?,
        ] {
            blob.extend_from_slice(&field.to_be_bytes());
        }
        blob.extend_from_slice(&[0u8; FDT_RSVMAP_SIZE]);
        blob.extend_from_slice(&self.structure);
        blob.extend_from_slice(&self.strings);
        Ok(blob)
    }
}

fn irq_cells(kind: u32, number: u32) -> [u32; 3] {
    [kind, number, GIC_FDT_IRQ_FLAGS_LEVEL_HI]
}

/// Addresses the tree describes, resolved from the constructed machine
struct Layout {
    ram: MemMapEntry,
    dist: MemMapEntry,
    redist: MemMapEntry,
    uart: MemMapEntry,
    uart_line: u32,
}

impl Layout {
    fn resolve(request: &DtbRequest<'_>) -> Result<Self, MachineError> {
        let machine = &request.machine;
        let missing = |what: &str| MachineError::DeviceTreePlacement {
            reason: format!("{what} is not mapped"),
        };

        let uart_base = machine.uart.base().ok_or_else(|| missing("pl011"))?;
        Ok(Self {
            ram: MemMapEntry::new(request.info.loader_start, request.info.ram_size),
            dist: machine.gic.dist().ok_or_else(|| missing("GIC distributor"))?,
            redist: machine.gic.redist().ok_or_else(|| missing("GIC redistributor"))?,
            uart: MemMapEntry::new(uart_base, machine.memmap.get(Region::Uart)?.size),
            uart_line: machine.uart.irq_line().ok_or_else(|| missing("pl011 interrupt"))?,
        })
    }
}

/// Describe the machine in `request` as a device tree
pub fn build_device_tree(request: &DtbRequest<'_>) -> Result<Vec<u8>, MachineError> {
    let layout = Layout::resolve(request)?;
    build(&request.machine, &layout, request.info.psci_conduit.method()).map_err(|e| {
        MachineError::DeviceTreePlacement {
            reason: e.to_string(),
        }
    })
}

fn build(machine: &MachineView<'_>, layout: &Layout, psci_method: Option<&str>) -> Result<Vec<u8>, FdtError> {
    let mut fdt = FdtWriter::new();

    fdt.begin_node("")?;
    fdt.property_string("model", "mini-virt ARM Machine")?;
    fdt.property_string("compatible", "linux,dummy-virt")?;
    fdt.property_u32("#address-cells", 2)?;
    fdt.property_u32("#size-cells", 2)?;
    fdt.property_u32("interrupt-parent", GIC_PHANDLE)?;

    let uart_node = format!("pl011@{:x}", layout.uart.base);
    fdt.begin_node("chosen")?;
    fdt.property_string("stdout-path", &format!("/{uart_node}"))?;
    fdt.end_node()?;

    fdt.begin_node(&format!("memory@{:x}", layout.ram.base))?;
    fdt.property_string("device_type", "memory")?;
    fdt.property_reg64("reg", layout.ram.base, layout.ram.size)?;
    fdt.end_node()?;

    fdt.begin_node("cpus")?;
    fdt.property_u32("#address-cells", 1)?;
    fdt.property_u32("#size-cells", 0)?;
    for cpu in machine.cpus {
        fdt.begin_node(&format!("cpu@{:x}", cpu.mp_affinity()))?;
        fdt.property_string("device_type", "cpu")?;
        fdt.property_string("compatible", cpu.model().compatible())?;
        fdt.property_u32("reg", cpu.mp_affinity() as u32)?;
        if psci_method.is_some() {
            fdt.property_string("enable-method", "psci")?;
        }
        fdt.end_node()?;
    }
    fdt.end_node()?;

    if let Some(method) = psci_method {
        fdt.begin_node("psci")?;
        fdt.property_strings("compatible", &["arm,psci-1.0", "arm,psci-0.2", "arm,psci"])?;
        fdt.property_string("method", method)?;
        fdt.property_u32("cpu_suspend", 0xc400_0001)?;
        fdt.property_u32("cpu_off", 0x8400_0002)?;
        fdt.property_u32("cpu_on", 0xc400_0003)?;
        fdt.property_u32("migrate", 0xc400_0005)?;
        fdt.end_node()?;
    }

    fdt.begin_node("timer")?;
    fdt.property_strings("compatible", &["arm,armv8-timer", "arm,armv7-timer"])?;
    let mut timer_irqs = Vec::with_capacity(12);
    for intid in [
        ARCH_TIMER_S_EL1_IRQ,
        ARCH_TIMER_NS_EL1_IRQ,
        ARCH_TIMER_VIRT_IRQ,
        ARCH_TIMER_NS_EL2_IRQ,
    ] {
        // PPI numbers count from interrupt ID 16
        timer_irqs.extend(irq_cells(GIC_FDT_IRQ_TYPE_PPI, intid - 16));
    }
    fdt.property_cells("interrupts", &timer_irqs)?;
    fdt.property_null("always-on")?;
    fdt.end_node()?;

    fdt.begin_node(&format!("intc@{:x}", layout.dist.base))?;
    fdt.property_string("compatible", "arm,gic-v3")?;
    fdt.property_u32("#interrupt-cells", 3)?;
    fdt.property_u32("#address-cells", 2)?;
    fdt.property_u32("#size-cells", 2)?;
    fdt.property_null("interrupt-controller")?;
    fdt.property_u32("#redistributor-regions", 1)?;
    let mut reg = Vec::with_capacity(32);
    for region in [layout.dist, layout.redist] {
        reg.extend_from_slice(&region.base.to_be_bytes());
        reg.extend_from_slice(&region.size.to_be_bytes());
    }
    fdt.property("reg", &reg)?;
    fdt.property_u32("phandle", GIC_PHANDLE)?;
    fdt.end_node()?;

    fdt.begin_node("apb-pclk")?;
    fdt.property_string("compatible", "fixed-clock")?;
    fdt.property_u32("#clock-cells", 0)?;
    fdt.property_u32("clock-frequency", 24_000_000)?;
    fdt.property_string("clock-output-names", "clk24mhz")?;
    fdt.property_u32("phandle", CLOCK_PHANDLE)?;
    fdt.end_node()?;

    fdt.begin_node(&uart_node)?;
    fdt.property_strings("compatible", &["arm,pl011", "arm,primecell"])?;
    fdt.property_reg64("reg", layout.uart.base, layout.uart.size)?;
    fdt.property_cells("interrupts", &irq_cells(GIC_FDT_IRQ_TYPE_SPI, layout.uart_line))?;
    fdt.property_cells("clocks", &[CLOCK_PHANDLE, CLOCK_PHANDLE])?;
    fdt.property_strings("clock-names", &["uartclk", "apb_pclk"])?;
    fdt.end_node()?;

    fdt.end_node()?;

    let boot_cpu = machine.cpus.first().map_or(0, |c| c.mp_affinity() as u32);
    fdt.finish(boot_cpu)
}

/// Device-tree loader that builds the blob from the machine itself
///
/// Keeps a copy of the last blob it wrote so the caller can dump it.
#[derive(Debug, Default)]
pub struct FdtLoader {
    blob: Option<Vec<u8>>,
}

impl FdtLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob(&self) -> Option<&[u8]> {
        self.blob.as_deref()
    }
}

impl DtbLoader for FdtLoader {
    fn load_dtb(&mut self, request: DtbRequest<'_>, memory: &mut SystemMemory) -> mini_virt::Result<usize> {
        let blob = build_device_tree(&request)?;
        if blob.len() as u64 > request.capacity() {
            return Err(MachineError::DeviceTreePlacement {
                reason: format!(
                    "{} byte device tree does not fit in {:#x} bytes",
                    blob.len(),
                    request.capacity()
                ),
            });
        }

        memory.write(request.addr, &blob)?;
        log::debug!("FDT: {} bytes, {} CPUs", blob.len(), request.machine.cpus.len());
        let size = blob.len();
        self.blob = Some(blob);
        Ok(size)
    }
}
