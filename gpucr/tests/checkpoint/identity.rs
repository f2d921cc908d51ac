//! Gpu ids in the image are always user ids; ids handed to the restore
//! driver are always local ones.

use gpucr::{CheckpointPlugin, GpuCrConfig, GpuId};

use super::emulator::{EmuHandle, ImageStore, Machine, dump, standard_workload};

const CHECKPOINT_GPUS: [GpuId; 2] = [0x1111, 0x2222];
const USER_IDS: [GpuId; 2] = [0xaaaa, 0xbbbb];
const RESTORE_GPUS: [GpuId; 2] = [0x3333, 0x4444];

#[test]
fn test_image_carries_only_user_ids() {
    let machine = Machine::new(&CHECKPOINT_GPUS);
    standard_workload(&machine, 10, Some(&USER_IDS));
    let image = dump(&machine, &ImageStore::default(), 1);

    let gpus: Vec<GpuId> = image.devices.iter().filter(|d| d.is_gpu()).map(|d| d.gpu_id).collect();
    assert_eq!(gpus, USER_IDS);
    assert!(image.bos.iter().all(|b| USER_IDS.contains(&b.gpu_id)));
    assert!(image.queues.iter().all(|q| USER_IDS.contains(&q.gpu_id)));

    let mem = image.events.iter().find(|e| e.is_memory_exception()).unwrap();
    assert_eq!(mem.mem_exc_gpu_id, USER_IDS[0]);
    let signal = image.events.iter().find(|e| !e.is_memory_exception()).unwrap();
    assert_eq!(signal.mem_exc_gpu_id, 0);
}

#[test]
fn test_restore_translates_every_class_to_local_ids() {
    let images = ImageStore::default();
    let source = Machine::new(&CHECKPOINT_GPUS);
    standard_workload(&source, 10, Some(&USER_IDS));
    dump(&source, &images, 1);

    let target = Machine::new(&RESTORE_GPUS);
    let mut cp = target.checkpointer(&images, GpuCrConfig::default());
    let handle = cp.restore(1).unwrap();
    assert_eq!(handle, EmuHandle::Kfd);

    let map = cp.session().restore_map();
    assert_eq!(map.dest(USER_IDS[0]), Some(RESTORE_GPUS[0]));
    assert_eq!(map.dest(USER_IDS[1]), Some(RESTORE_GPUS[1]));

    let s = target.state();
    let pairs: Vec<(GpuId, GpuId)> = s
        .devices
        .iter()
        .map(|d| (d.user_gpu_id, d.actual_gpu_id))
        .collect();
    assert_eq!(pairs, vec![(0xaaaa, 0x3333), (0xbbbb, 0x4444)]);
    assert!(s.devices.iter().all(|d| d.drm_fd >= 1128));

    assert!(s.bos.iter().all(|b| RESTORE_GPUS.contains(&b.gpu_id)));
    assert_eq!(s.queues.len(), 2);
    assert!(s.queues.iter().all(|q| RESTORE_GPUS.contains(&q.gpu_id)));

    let mem = s.events.iter().find(|e| e.is_memory_exception()).unwrap();
    assert_eq!(mem.mem_exc_gpu_id, RESTORE_GPUS[0]);
}

#[test]
fn test_buffers_follow_their_gpu() {
    let images = ImageStore::default();
    let source = Machine::new(&CHECKPOINT_GPUS);
    standard_workload(&source, 10, Some(&USER_IDS));
    let before: Vec<(u64, GpuId)> = source.state().bos.iter().map(|b| (b.addr, b.gpu_id)).collect();
    dump(&source, &images, 1);

    let target = Machine::new(&RESTORE_GPUS);
    target
        .checkpointer(&images, GpuCrConfig::default())
        .restore(1)
        .unwrap();

    let s = target.state();
    for (addr, old_gpu) in before {
        let idx = CHECKPOINT_GPUS.iter().position(|g| *g == old_gpu).unwrap();
        assert_eq!(s.bo_at(addr).unwrap().gpu_id, RESTORE_GPUS[idx], "bo 0x{addr:x}");
    }
}

#[test]
fn test_dump_of_restored_process_keeps_user_ids() {
    let images = ImageStore::default();
    let source = Machine::new(&CHECKPOINT_GPUS);
    standard_workload(&source, 10, Some(&USER_IDS));
    let first = dump(&source, &images, 1);

    let target = Machine::new(&RESTORE_GPUS);
    target
        .checkpointer(&images, GpuCrConfig::default())
        .restore(1)
        .unwrap();
    target.state().pid = 10;

    let again = ImageStore::default();
    let second = dump(&target, &again, 1);
    let ids = |img: &gpucr::KfdImage| -> Vec<GpuId> { img.bos.iter().map(|b| b.gpu_id).collect() };
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(first.queues, second.queues);
}
