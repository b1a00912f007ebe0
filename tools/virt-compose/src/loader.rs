//! Flat kernel image loader
//!
//! Copies a raw binary to the start of RAM and points every CPU at it.
//! Secondary CPUs are held by firmware until started through PSCI, so
//! they share the entry point.

use anyhow::Context;
use mini_virt::{
    align_up, default_dtb_region, BootInfo, ImageLoader, MachineError, SystemMemory, Vcpu,
    DTB_ALIGN,
};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct FlatImageLoader {
    image: Vec<u8>,
}

impl FlatImageLoader {
    pub fn new(image: Vec<u8>) -> Self {
        Self { image }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let image = fs::read(path).with_context(|| format!("Failed to read kernel image {}", path.display()))?;
        log::info!("Kernel image: {} ({} bytes)", path.display(), image.len());
        Ok(Self::new(image))
    }
}

impl ImageLoader for FlatImageLoader {
    fn load_kernel(
        &mut self,
        info: &mut BootInfo,
        cpus: &mut [Vcpu],
        memory: &mut SystemMemory,
    ) -> mini_virt::Result<()> {
        if self.image.is_empty() {
            return Err(MachineError::ImageLoad("kernel image is empty".into()));
        }
        if self.image.len() as u64 > info.ram_size {
            return Err(MachineError::ImageLoad(format!(
                "{} byte image does not fit in {} MiB of RAM",
                self.image.len(),
                info.ram_size >> 20
            )));
        }

        memory.write(info.loader_start, &self.image)?;
        for cpu in cpus.iter_mut() {
            cpu.set_pc(info.loader_start);
        }
        info.entry = Some(info.loader_start);

        // Keep the device tree clear of the image
        let image_end = info.loader_start + self.image.len() as u64;
        let (dtb_start, dtb_limit) = default_dtb_region(info);
        if image_end > dtb_start {
            let moved = align_up(image_end, DTB_ALIGN);
            if moved >= dtb_limit {
                return Err(MachineError::ImageLoad(
                    "no room left in RAM for the device tree".into(),
                ));
            }
            log::debug!("Image overlaps default DTB window, moving DTB to {:#x}", moved);
            info.dtb_start = Some(moved);
        }
        Ok(())
    }
}
