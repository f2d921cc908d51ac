use std::collections::HashMap;
use std::sync::Arc;

use gpucr::protocol::BoSlot;
use gpucr::transfer::DeviceTable;
use gpucr::{
    AllocFlags, BoRecord, CheckpointPlugin, Direction, GpuCrConfig, GpuCrError, GpuId,
    TransferConfig, TransferEngine, WorkerStats,
};

use super::emulator::{ImageStore, Machine, contents, dump, standard_workload};

/// Buckets as the driver would return them from a dump, optionally with
/// dma-buf exports.
fn export_slots(machine: &Machine, dmabufs: bool) -> Vec<BoSlot> {
    let mut s = machine.state();
    let mut slots = Vec::new();
    for i in 0..s.bos.len() {
        let bo = s.bos[i].clone();
        let mut slot = BoSlot::new(BoRecord {
            addr: bo.addr,
            size: bo.size,
            offset: bo.offset,
            gpu_id: bo.gpu_id,
            alloc_flags: bo.flags.bits(),
            rawdata: None,
            private: Vec::new(),
        });
        if dmabufs && bo.flags.is_device_backed() {
            slot.dmabuf_fd = 500 + i as i32;
            s.dmabufs.insert(slot.dmabuf_fd, i);
        }
        slots.push(slot);
    }
    slots
}

fn device_table(machine: &Machine) -> DeviceTable {
    let topology = machine.topology("local");
    let mut devices = DeviceTable::new();
    for node in topology.gpus() {
        devices.insert(node.gpu_id, machine.render(node));
    }
    devices
}

fn run_dump(
    machine: &Arc<Machine>,
    config: &TransferConfig,
    slots: &mut [BoSlot],
) -> gpucr::Result<Vec<WorkerStats>> {
    let images = ImageStore::default();
    let host = machine.host(&images);
    let devices = device_table(machine);
    TransferEngine::new(config, &host, 1).run(Direction::Dump, slots, &devices)
}

fn by_gpu(stats: Vec<WorkerStats>) -> HashMap<GpuId, WorkerStats> {
    stats.into_iter().map(|s| (s.gpu_id, s)).collect()
}

fn assert_captured(machine: &Machine, slots: &[BoSlot]) {
    let s = machine.state();
    for slot in slots {
        let live = s.bo_at(slot.record.addr).unwrap();
        if live.flags.is_device_backed() {
            assert_eq!(
                slot.record.rawdata.as_deref(),
                Some(live.contents.as_slice()),
                "bo 0x{:x}",
                slot.record.addr
            );
        } else {
            assert!(slot.record.rawdata.is_none());
        }
    }
}

#[test]
fn test_cpu_paths_by_buffer_kind() {
    let machine = Machine::new(&[0x1111, 0x2222]);
    standard_workload(&machine, 1, None);
    let mut slots = export_slots(&machine, true);
    let config = TransferConfig {
        hardware_copy: false,
        ..Default::default()
    };

    let stats = by_gpu(run_dump(&machine, &config, &mut slots).unwrap());
    assert_eq!(stats.len(), 2);
    for gpu in [0x1111, 0x2222] {
        let s = stats[&gpu];
        assert_eq!(s.buffers, 4);
        assert_eq!(s.hardware, 0);
        assert_eq!(s.mapped, 1, "public VRAM goes through a mapping");
        assert_eq!(s.indirect, 2, "private VRAM and GTT go through process memory");
    }
    assert_captured(&machine, &slots);
}

#[test]
fn test_hardware_path_preferred() {
    let machine = Machine::new(&[0x1111]);
    standard_workload(&machine, 1, None);
    let mut slots = export_slots(&machine, true);

    let stats = run_dump(&machine, &TransferConfig::default(), &mut slots).unwrap();
    assert_eq!(stats[0].hardware, 3);
    assert_eq!(stats[0].mapped + stats[0].indirect, 0);
    assert_captured(&machine, &slots);
}

#[test]
fn test_no_export_skips_hardware_path() {
    let machine = Machine::new(&[0x1111]);
    standard_workload(&machine, 1, None);
    let mut slots = export_slots(&machine, false);

    let stats = run_dump(&machine, &TransferConfig::default(), &mut slots).unwrap();
    assert_eq!(stats[0].hardware, 0);
    assert_eq!(stats[0].mapped + stats[0].indirect, 3);
}

#[test]
fn test_hardware_failure_falls_back() {
    let machine = Machine::new(&[0x1111]);
    standard_workload(&machine, 1, None);
    machine.state().hw_fail = true;
    let mut slots = export_slots(&machine, true);

    let stats = run_dump(&machine, &TransferConfig::default(), &mut slots).unwrap();
    assert_eq!(stats[0].hardware, 0);
    assert_eq!(stats[0].mapped, 1);
    assert_eq!(stats[0].indirect, 2);
    assert_captured(&machine, &slots);
}

#[test]
fn test_workers_only_touch_their_gpu() {
    let machine = Machine::new(&[0x1111, 0x2222, 0x3333]);
    standard_workload(&machine, 1, None);
    {
        let mut s = machine.state();
        for i in 0..24u64 {
            let gpu = [0x1111, 0x2222, 0x3333][i as usize % 3];
            let flags = if i % 2 == 0 { AllocFlags::GTT } else { AllocFlags::VRAM };
            s.add_bo(0x7e00_0000_0000 + i * 0x10_0000, 4096 * (i + 1), gpu, flags, 0x80 + i as u8);
        }
    }
    let mut slots = export_slots(&machine, true);
    // Half the buffers take the hardware path, half fall back.
    for slot in slots.iter_mut().step_by(2) {
        slot.dmabuf_fd = -1;
    }

    let stats = by_gpu(run_dump(&machine, &TransferConfig::default(), &mut slots).unwrap());
    assert_eq!(stats.len(), 3);
    assert!(stats.values().all(|s| s.buffers == 12));

    let s = machine.state();
    assert!(!s.touches.is_empty());
    for (thread, gpu) in &s.touches {
        assert_eq!(thread, &format!("gpucr-xfer-{gpu:04x}"));
    }
}

#[test]
fn test_failed_worker_does_not_stop_siblings() {
    let machine = Machine::new(&[0x1111, 0x2222]);
    standard_workload(&machine, 1, None);
    let mut slots = export_slots(&machine, false);
    let bad = slots
        .iter_mut()
        .find(|s| s.gpu_id() == 0x2222 && s.record.flags().contains(AllocFlags::PUBLIC))
        .unwrap();
    bad.record.offset = 0xdead_0000;

    let err = run_dump(&machine, &TransferConfig::default(), &mut slots).unwrap_err();
    match err {
        GpuCrError::WorkersFailed { gpus } => assert_eq!(gpus, vec![0x2222]),
        other => panic!("unexpected error {other}"),
    }
    let healthy: Vec<&BoSlot> = slots
        .iter()
        .filter(|s| s.gpu_id() == 0x1111 && s.record.flags().is_device_backed())
        .collect();
    assert_eq!(healthy.len(), 3);
    assert!(healthy.iter().all(|s| s.record.rawdata.is_some()));
}

#[test]
fn test_unknown_gpu_rejected_before_any_worker() {
    let machine = Machine::new(&[0x1111]);
    standard_workload(&machine, 1, None);
    let mut slots = export_slots(&machine, true);
    slots[0].record.gpu_id = 0x9999;

    let err = run_dump(&machine, &TransferConfig::default(), &mut slots).unwrap_err();
    assert!(matches!(err, GpuCrError::UnmappedGpu { gpu_id: 0x9999 }), "{err}");
    assert!(machine.state().touches.is_empty());
}

#[test]
fn test_restore_without_contents_fails() {
    let machine = Machine::new(&[0x1111]);
    let mut slots = vec![BoSlot::new(BoRecord {
        addr: 0x7000_0000,
        size: 4096,
        gpu_id: 0x1111,
        alloc_flags: AllocFlags::VRAM.bits(),
        ..Default::default()
    })];
    let images = ImageStore::default();
    let host = machine.host(&images);
    let devices = device_table(&machine);

    let err = TransferEngine::new(&TransferConfig::default(), &host, 1)
        .run(Direction::Restore, &mut slots, &devices)
        .unwrap_err();
    assert!(matches!(err, GpuCrError::WorkersFailed { .. }), "{err}");
}

#[test]
fn test_empty_slot_set_spawns_nothing() {
    let machine = Machine::new(&[0x1111]);
    let stats = run_dump(&machine, &TransferConfig::default(), &mut []).unwrap();
    assert!(stats.is_empty());
}

/// Same image bytes and same restored contents whichever path moves them.
#[test]
fn test_fallback_equivalence_end_to_end() {
    let configure = |hw_engine: bool, hw_fail: bool| {
        let machine = Machine::new(&[0x1111, 0x2222]);
        standard_workload(&machine, 5, None);
        let mut s = machine.state();
        s.hw_engine = hw_engine;
        s.hw_fail = hw_fail;
        drop(s);
        machine
    };

    let reference = configure(true, false);
    let reference_image = dump(&reference, &ImageStore::default(), 1);
    for (hw_engine, hw_fail) in [(true, true), (false, false)] {
        let machine = configure(hw_engine, hw_fail);
        let image = dump(&machine, &ImageStore::default(), 1);
        assert_eq!(image.bos, reference_image.bos);
    }

    for (hw_engine, hw_fail) in [(true, false), (true, true), (false, false)] {
        let images = ImageStore::default();
        dump(&reference, &images, 1);
        let target: Arc<Machine> = configure(hw_engine, hw_fail);
        {
            let mut s = target.state();
            s.bos.clear();
            s.devices.clear();
            s.queues.clear();
            s.events.clear();
        }
        target
            .checkpointer(&images, GpuCrConfig::default())
            .restore(1)
            .unwrap();
        assert_eq!(contents(&target), contents(&reference));
    }
}
