//! virt-compose - host tool for mini-virt machines
//!
//! Commands:
//! - `virt-compose list` - Show registered machine types
//! - `virt-compose topology` - Construct a machine and print its topology
//! - `virt-compose boot --kernel <image>` - Construct, load and finalize

mod config;
mod fdt;
mod loader;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use mini_virt::{
    find_machine_type, machine_types, BootCollaborators, Board, CharBackend, CpuModel, IrqSource,
    MachineClass, NullBackend, StdioBackend,
};
use std::fs;
use std::path::PathBuf;

use crate::config::{parse_size, ConfigFile, Overrides};
use crate::fdt::FdtLoader;
use crate::loader::FlatImageLoader;

#[derive(Parser)]
#[command(name = "virt-compose")]
#[command(version)]
#[command(about = "Compose and boot mini-virt ARM machines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered machine types
    List,

    /// Construct a machine and print its address map, IRQ wiring and CPUs
    Topology {
        #[command(flatten)]
        machine: MachineArgs,
    },

    /// Construct a machine, load a flat kernel image and place the device tree
    Boot {
        #[command(flatten)]
        machine: MachineArgs,

        /// Raw kernel image, loaded at the start of RAM
        #[arg(short, long)]
        kernel: PathBuf,

        /// Write the generated device tree blob to this file
        #[arg(long)]
        dtb_out: Option<PathBuf>,

        /// Where console output goes
        #[arg(long, value_enum, default_value_t = ConsoleKind::Stdio)]
        console: ConsoleKind,
    },
}

/// Machine selection shared by every constructing command
#[derive(Args)]
struct MachineArgs {
    /// Machine configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Machine type
    #[arg(short, long)]
    machine: Option<String>,

    /// Number of CPUs
    #[arg(long)]
    cpus: Option<u32>,

    /// CPU model (e.g. cortex-a57)
    #[arg(long)]
    cpu_type: Option<CpuModel>,

    /// Guest RAM size (e.g. 512M, 4G, 0x40000000)
    #[arg(long, value_parser = parse_size)]
    ram_size: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ConsoleKind {
    Stdio,
    Null,
}

impl ConsoleKind {
    fn backend(self) -> Box<dyn CharBackend> {
        match self {
            ConsoleKind::Stdio => Box::new(StdioBackend),
            ConsoleKind::Null => Box::new(NullBackend),
        }
    }
}

impl MachineArgs {
    fn resolve(self) -> Result<(&'static MachineClass, ConfigFile)> {
        let config = ConfigFile::resolve(
            self.config.as_deref(),
            Overrides {
                machine: self.machine,
                cpus: self.cpus,
                cpu_type: self.cpu_type,
                ram_size: self.ram_size,
            },
        )?;

        let class = find_machine_type(&config.machine).with_context(|| {
            format!(
                "Unknown machine type '{}' (try 'virt-compose list')",
                config.machine
            )
        })?;
        Ok((class, config))
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => {
            list_machines();
        }

        Commands::Topology { machine } => {
            show_topology(machine)?;
        }

        Commands::Boot {
            machine,
            kernel,
            dtb_out,
            console,
        } => {
            boot(machine, kernel, dtb_out, console)?;
        }
    }

    Ok(())
}

fn list_machines() {
    println!("{}", "Supported machines:".bold());
    for class in machine_types() {
        println!(
            "  {:<12} {} (max {} CPUs, default CPU {})",
            class.name.green(),
            class.desc,
            class.max_cpus,
            class.default_cpu_type.type_name()
        );
    }
}

fn show_topology(args: MachineArgs) -> Result<()> {
    let (class, config) = args.resolve()?;
    let pending = class
        .begin_construction(config.options, BootCollaborators::default())
        .with_context(|| format!("Failed to construct {}", class.name))?;

    print_board(class, pending.board());
    Ok(())
}

fn boot(
    args: MachineArgs,
    kernel: PathBuf,
    dtb_out: Option<PathBuf>,
    console: ConsoleKind,
) -> Result<()> {
    let (class, config) = args.resolve()?;
    let image_loader = FlatImageLoader::from_file(&kernel)?;

    println!("{} Booting {}...", "🚀".green(), class.name.bold());
    let collaborators = BootCollaborators::new(Box::new(image_loader), console.backend());
    let pending = class
        .begin_construction(config.options, collaborators)
        .with_context(|| format!("Failed to construct {}", class.name))?;

    let mut dtb_loader = FdtLoader::new();
    let machine = pending
        .finalize(&mut dtb_loader)
        .context("Failed to place the device tree")?;

    print_board(class, machine.board());

    let info = machine.boot_info();
    let dtb = machine.dtb();
    println!("\n{}", "Boot:".bold());
    println!("  entry        {:#x}", info.entry.unwrap_or(info.loader_start));
    println!("  dtb          {:#x} ({} bytes)", dtb.addr, dtb.size);
    println!(
        "  psci         {}",
        info.psci_conduit.method().unwrap_or("disabled")
    );

    if let Some(path) = dtb_out {
        let blob = dtb_loader
            .blob()
            .context("Device tree loader produced no blob")?;
        fs::write(&path, blob)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("{} Device tree written to {}", "✅".green(), path.display());
    }

    println!("{} {} ready", "✅".green(), class.name);
    Ok(())
}

fn print_board(class: &MachineClass, board: &Board) {
    println!("{} {}", class.name.bold().green(), class.desc.italic());

    println!("\n{}", "Address map:".bold());
    for mapping in board.memory().mappings() {
        println!(
            "  {:<12} {:#014x} - {:#014x}  {:?}",
            mapping.name,
            mapping.range.base,
            mapping.range.end(),
            mapping.flags
        );
    }

    let gic = board.gic().config();
    println!("\n{}", "Interrupts:".bold());
    println!(
        "  GICv{}: {} lines, {} CPU interfaces, {} redistributor frames",
        gic.revision.number(),
        gic.num_irq,
        gic.num_cpu,
        gic.redist_region_count
    );
    for (line, source) in board.gic().connected_inputs() {
        match source {
            IrqSource::Device { name } => {
                println!("  input {:<4} <- {} (SPI {}, INTID {})", line, name, line, line + 32)
            }
            IrqSource::CpuTimer { cpu } => println!("  input {:<4} <- cpu{} timer", line, cpu),
        }
    }

    println!("\n{}", "CPUs:".bold());
    for cpu in board.cpus() {
        println!(
            "  cpu{:<4} {:<12} mpidr {:#07x}  irq <- output {}",
            cpu.index(),
            cpu.model().name(),
            cpu.mp_affinity(),
            cpu.irq_input()
                .map_or_else(|| "-".to_string(), |o| o.to_string())
        );
    }
}
