//! Console Composer - PL011 UART creation and wiring
//!
//! The PL011 model itself is opaque. The board instantiates one, binds it to
//! a host character backend, maps its register window and drives one shared
//! interrupt line of the GIC with it.

use crate::address_space::{MapFlags, SystemMemory};
use crate::gic::{Gicv3, IrqSource};
use crate::memmap::MemMapEntry;
use crate::{MachineError, Result};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Host-side character stream a console writes to
pub trait CharBackend: Send {
    /// Backend name, for diagnostics
    fn name(&self) -> &str;

    /// Write all of `data` to the host
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Backend that discards all output
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl CharBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    #[inline(always)]
    fn write(&mut self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Backend forwarding to the host's standard output
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioBackend;

impl CharBackend for StdioBackend {
    fn name(&self) -> &str {
        "stdio"
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(data)?;
        out.flush()
    }
}

/// Backend capturing output in a shared buffer
///
/// Clones share the same buffer, so one clone can be handed to the machine
/// while another inspects what the guest printed.
#[derive(Debug, Default, Clone)]
pub struct BufferBackend {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl BufferBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far
    pub fn contents(&self) -> Vec<u8> {
        match self.buffer.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl CharBackend for BufferBackend {
    fn name(&self) -> &str {
        "buffer"
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut buf = self
            .buffer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "console buffer poisoned"))?;
        buf.extend_from_slice(data);
        Ok(())
    }
}

/// PL011 configuration
pub struct Pl011Config {
    /// Host stream bound to the transmit side
    pub chardev: Box<dyn CharBackend>,
}

/// A realized PL011 UART
pub struct Pl011 {
    chardev: Box<dyn CharBackend>,
    base: Option<u64>,
    irq_line: Option<u32>,
}

impl Pl011 {
    /// Register window size
    pub const MMIO_SIZE: u64 = 0x1000;

    pub fn realize(config: Pl011Config) -> Self {
        Self {
            chardev: config.chardev,
            base: None,
            irq_line: None,
        }
    }

    /// Map the register window at `region.base`
    pub fn map(&mut self, sysmem: &mut SystemMemory, region: MemMapEntry) -> Result<()> {
        if region.size < Self::MMIO_SIZE {
            return Err(MachineError::realize(
                "pl011",
                format!("region {region} smaller than {:#x}", Self::MMIO_SIZE),
            ));
        }
        sysmem.map("uart", MemMapEntry::new(region.base, Self::MMIO_SIZE), MapFlags::MMIO)?;
        self.base = Some(region.base);
        Ok(())
    }

    /// Drive shared line `spi` of `gic`
    pub fn connect_irq(&mut self, gic: &mut Gicv3, spi: u32) -> Result<()> {
        let line = gic.spi_line(spi)?;
        gic.connect_input(line, IrqSource::Device { name: "pl011" })?;
        self.irq_line = Some(line);
        Ok(())
    }

    /// Emit guest output on the bound backend
    pub fn transmit(&mut self, data: &[u8]) -> Result<()> {
        self.chardev.write(data)?;
        Ok(())
    }

    /// Base of the mapped register window
    pub fn base(&self) -> Option<u64> {
        self.base
    }

    /// Shared line the UART drives
    pub fn irq_line(&self) -> Option<u32> {
        self.irq_line
    }

    pub fn backend_name(&self) -> &str {
        self.chardev.name()
    }
}

impl core::fmt::Debug for Pl011 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pl011")
            .field("chardev", &self.chardev.name())
            .field("base", &self.base)
            .field("irq_line", &self.irq_line)
            .finish()
    }
}

/// Create the board console at `region`, raising shared line `spi`
///
/// # Errors
/// Any failure is fatal for the machine.
pub fn create_uart(
    gic: &mut Gicv3,
    region: MemMapEntry,
    spi: u32,
    chardev: Box<dyn CharBackend>,
    sysmem: &mut SystemMemory,
) -> Result<Pl011> {
    let mut uart = Pl011::realize(Pl011Config { chardev });
    uart.map(sysmem, region)?;
    uart.connect_irq(gic, spi)?;

    log::info!(
        "UART: pl011 at {:#x}, SPI {} (backend {})",
        region.base,
        spi,
        uart.backend_name()
    );
    Ok(uart)
}
