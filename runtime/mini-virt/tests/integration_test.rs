//! Integration tests for mini-virt bring-up
//!
//! These tests drive the public API the way a host does:
//! - Look the machine type up in the registry
//! - Construct with recording loaders
//! - Finalize and inspect the resulting topology

use mini_virt::*;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

/// Shared bring-up journal, so loaders can observe what happened before them
type Journal = Rc<RefCell<Vec<&'static str>>>;

/// Image loader that writes a tiny image at the RAM base
struct RecordingImageLoader {
    journal: Journal,
}

impl ImageLoader for RecordingImageLoader {
    fn load_kernel(
        &mut self,
        info: &mut BootInfo,
        cpus: &mut [Vcpu],
        memory: &mut SystemMemory,
    ) -> Result<()> {
        self.journal.borrow_mut().push("kernel");
        memory.write(info.loader_start, &[0x00, 0x00, 0x00, 0x14])?;
        for cpu in cpus.iter_mut() {
            cpu.set_pc(info.loader_start);
        }
        info.entry = Some(info.loader_start);
        Ok(())
    }
}

/// Device-tree loader that checks the machine it is shown
struct RecordingDtbLoader {
    journal: Journal,
    calls: usize,
    cpus_seen: usize,
}

impl DtbLoader for RecordingDtbLoader {
    fn load_dtb(&mut self, request: DtbRequest<'_>, memory: &mut SystemMemory) -> Result<usize> {
        self.journal.borrow_mut().push("dtb");
        self.calls += 1;
        self.cpus_seen = request.machine.cpus.len();

        // Everything the tree describes must already exist
        assert!(request.machine.uart.base().is_some());
        assert!(request.machine.gic.dist().is_some());
        assert!(memory.mapping("ram").is_some());

        let blob = [0xd0, 0x0d, 0xfe, 0xed, 0, 0, 0, 0x28];
        memory.write(request.addr, &blob)?;
        Ok(blob.len())
    }
}

fn mini_virt() -> &'static MachineClass {
    find_machine_type("mini-virt").expect("mini-virt registered")
}

fn collaborators(journal: &Journal) -> BootCollaborators {
    BootCollaborators::new(
        Box::new(RecordingImageLoader {
            journal: journal.clone(),
        }),
        Box::new(NullBackend),
    )
}

fn options(cpus: u32) -> MachineOptions {
    MachineOptions {
        cpus,
        ..MachineOptions::default()
    }
}

/// Four CPUs, 288 controller lines, console at 0x09000000 on line 1,
/// 4 GiB of RAM at 4 GiB, and a placed device tree
#[test]
fn test_end_to_end_bring_up() {
    let journal = Journal::default();
    let pending = mini_virt()
        .begin_construction(options(4), collaborators(&journal))
        .expect("construction");

    let mut dtb = RecordingDtbLoader {
        journal: journal.clone(),
        calls: 0,
        cpus_seen: 0,
    };
    let mut machine = pending.finalize(&mut dtb).expect("finalize");

    // CPUs
    let ids = machine.possible_cpu_arch_ids().unwrap().to_vec();
    assert_eq!(ids.len(), 4);
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(id.index, i as u32);
        assert_eq!(id.arch_id, mp_affinity(i as u32, GICV3_TARGETLIST_BITS));
        assert_eq!(id.cpu_type, CpuModel::CortexA57);
    }

    // Interrupt controller
    let board = machine.board();
    let gic = board.gic().config();
    assert_eq!(gic.num_cpu, 4);
    assert_eq!(gic.num_irq, 288);
    assert_eq!(gic.redist_region_count, 4);

    // Console
    assert_eq!(board.uart().base(), Some(0x0900_0000));
    assert_eq!(board.uart().irq_line(), Some(1));

    // RAM
    let ram = board.memory().mapping("ram").unwrap();
    assert_eq!(ram.range, MemMapEntry::new(4 * GIB, 4 * GIB));

    // Boot
    let info = machine.boot_info();
    assert_eq!(info.loader_start, 4 * GIB);
    assert!(info.skip_dtb_autoload);
    assert_eq!(info.psci_conduit, PsciConduit::Smc);
    for cpu in machine.board().cpus() {
        assert_eq!(cpu.pc(), 4 * GIB);
    }
    assert_eq!(machine.boot_state(), BootState::Ready);
    assert!(machine.dtb().size > 0);
    assert_eq!(dtb.calls, 1);
    assert_eq!(dtb.cpus_seen, 4);
    assert_eq!(*journal.borrow(), vec!["kernel", "dtb"]);
}

#[test]
fn test_cpu_counts_up_to_max() {
    for count in [1, 2, 16, 17, 64, 123] {
        let pending = mini_virt()
            .begin_construction(options(count), BootCollaborators::default())
            .unwrap();

        let cpus = pending.board().cpus();
        assert_eq!(cpus.len(), count as usize);
        let affinities: HashSet<u64> = cpus.iter().map(|c| c.mp_affinity()).collect();
        assert_eq!(affinities.len(), count as usize);
        for (i, cpu) in cpus.iter().enumerate() {
            assert_eq!(cpu.index(), i as u32);
        }
    }
}

#[test]
fn test_too_many_cpus_rejected() {
    let result = mini_virt().begin_construction(options(513), BootCollaborators::default());
    assert!(matches!(
        result,
        Err(MachineError::InvalidTopology { requested: 513, max: 512 })
    ));
}

#[test]
fn test_redistributor_capacity_is_fatal() {
    // 124 CPUs fit the CPU limit but not the single redistributor region
    let result = mini_virt().begin_construction(options(124), BootCollaborators::default());
    assert!(matches!(
        result,
        Err(MachineError::DeviceRealization { device: "gicv3", .. })
    ));
    assert_eq!(redistributor_region_count(1000, 0x00F6_0000), 123);
    assert_eq!(redistributor_region_count(1, 0x00F6_0000), 1);
}

#[test]
fn test_every_cpu_connected() {
    let pending = mini_virt()
        .begin_construction(options(8), BootCollaborators::default())
        .unwrap();
    let board = pending.board();

    for cpu in board.cpus() {
        let line = cpu.timer_line().expect("timer wired");
        assert_eq!(line, NUM_IRQS + cpu.index() * GIC_INTERNAL + ARCH_TIMER_NS_EL1_IRQ);
        assert_eq!(
            board.gic().input_source(line),
            Some(IrqSource::CpuTimer { cpu: cpu.index() })
        );
        assert_eq!(cpu.irq_input(), Some(cpu.index()));
    }
}

#[test]
fn test_console_line_independent_of_cpu_count() {
    for count in [1, 4, 100] {
        let pending = mini_virt()
            .begin_construction(options(count), BootCollaborators::default())
            .unwrap();
        let board = pending.board();
        assert_eq!(board.uart().base(), Some(0x0900_0000));
        assert_eq!(board.uart().irq_line(), Some(1));
        assert_eq!(
            board.gic().input_source(1),
            Some(IrqSource::Device { name: "pl011" })
        );
    }
}

#[test]
fn test_installed_regions_disjoint() {
    let pending = mini_virt()
        .begin_construction(options(2), BootCollaborators::default())
        .unwrap();
    let mappings = pending.board().memory().mappings();
    assert_eq!(mappings.len(), 4);

    for (i, a) in mappings.iter().enumerate() {
        for b in &mappings[i + 1..] {
            assert!(!a.range.overlaps(&b.range), "{} overlaps {}", a.name, b.name);
        }
    }
}

#[test]
fn test_dtb_placed_after_everything_else() {
    let journal = Journal::default();
    let pending = mini_virt()
        .begin_construction(options(2), collaborators(&journal))
        .unwrap();

    // Nothing placed during construction
    assert!(!pending
        .events()
        .iter()
        .any(|e| matches!(e, BringUpEvent::DeviceTreePlaced { .. })));

    let mut dtb = RecordingDtbLoader {
        journal: journal.clone(),
        calls: 0,
        cpus_seen: 0,
    };
    let machine = pending.finalize(&mut dtb).unwrap();

    let order: Vec<_> = machine
        .events()
        .iter()
        .map(|e| match e {
            BringUpEvent::CpusRealized { .. } => "cpus",
            BringUpEvent::RamInstalled { .. } => "ram",
            BringUpEvent::InterruptControllerWired { .. } => "gic",
            BringUpEvent::ConsoleWired { .. } => "uart",
            BringUpEvent::BootInfoRecorded => "bootinfo",
            BringUpEvent::KernelLoaded { .. } => "kernel",
            BringUpEvent::DeviceTreePlaced { .. } => "dtb",
        })
        .collect();
    assert_eq!(order, vec!["cpus", "ram", "gic", "uart", "bootinfo", "kernel", "dtb"]);
    assert_eq!(dtb.calls, 1);
}

#[test]
fn test_guest_memory_holds_loaded_data() {
    let journal = Journal::default();
    let pending = mini_virt()
        .begin_construction(options(1), collaborators(&journal))
        .unwrap();
    let mut dtb = RecordingDtbLoader {
        journal,
        calls: 0,
        cpus_seen: 0,
    };
    let machine = pending.finalize(&mut dtb).unwrap();
    let memory = machine.board().memory();

    let mut image = [0u8; 4];
    memory.read(4 * GIB, &mut image).unwrap();
    assert_eq!(image, [0x00, 0x00, 0x00, 0x14]);

    let mut magic = [0u8; 4];
    memory.read(machine.dtb().addr, &mut magic).unwrap();
    assert_eq!(magic, [0xd0, 0x0d, 0xfe, 0xed]);

    // Only the two touched pages are backed
    assert_eq!(memory.ram().unwrap().populated_bytes(), 2 * PAGE_SIZE);
}

#[test]
fn test_independent_machines() {
    let a = mini_virt()
        .begin_construction(options(1), BootCollaborators::default())
        .unwrap();
    let b = mini_virt()
        .begin_construction(options(3), BootCollaborators::default())
        .unwrap();

    assert_eq!(a.board().cpus().len(), 1);
    assert_eq!(b.board().cpus().len(), 3);
    assert_eq!(a.board().memmap(), b.board().memmap());
}

#[test]
fn test_unknown_cpu_model() {
    let result = "cortex-m4".parse::<CpuModel>();
    assert!(matches!(result, Err(MachineError::UnknownCpuModel(ref s)) if s == "cortex-m4"));
}
