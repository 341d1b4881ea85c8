use super::*;
use anyhow::Result;
use faaslet::snapshot::{DataType, MergeOp, MergeRegion, SnapshotData};
use faaslet::{app_snapshot_key, Error};
use std::thread;

#[test]
fn restore_brings_back_snapshot() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());

    let ptr = module.memory().grow(1)?;
    write_guest(&module, ptr, &[0xAA]);
    let key = module.snapshot()?;
    assert!(key.starts_with("u_f_"));
    assert!(h.registry.exists(&key));

    write_guest(&module, ptr, &[0xBB]);
    module.restore(&key)?;
    assert_eq!(read_guest(&module, ptr, 1), [0xAA]);
    Ok(())
}

#[test]
fn restore_matches_snapshot_size_and_bytes() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    write_guest(&module, 10, b"snapshot me");
    let key = module.snapshot()?;
    let snap = h.registry.get(&key)?;
    let size = snap.size();
    assert_eq!(size, module.memory().current_brk() as usize);

    // Grow past the snapshot, then scribble over it.
    module.memory().grow(3 * WASM_PAGE_SIZE)?;
    write_guest(&module, 10, b"overwritten");
    module.restore(&key)?;
    assert_eq!(module.memory().current_brk() as usize, size);
    let live = unsafe { module.memory().live_bytes() }.to_vec();
    assert_eq!(live, snap.to_vec());
    Ok(())
}

#[test]
fn restore_grows_smaller_memory() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let brk = module.memory().current_brk() as usize;
    let mut image = vec![0u8; brk + 2 * WASM_PAGE_SIZE];
    image[brk + 5] = 42;
    h.registry
        .register("bigger", SnapshotData::from_bytes(&image, TEST_MAX_MEMORY)?);

    module.restore("bigger")?;
    assert_eq!(module.memory().current_brk() as usize, image.len());
    assert_eq!(read_guest(&module, (brk + 5) as u32, 1), [42]);
    Ok(())
}

#[test]
fn restore_keeps_stack_guards() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let key = module.snapshot()?;
    module.restore(&key)?;

    let top = module.thread_stacks()[0];
    let host = module.guest_to_host(top + 16) as usize;
    assert!(is_read_only(host, faaslet::pages::GUARD_REGION_SIZE));
    Ok(())
}

#[test]
fn restore_errors() -> Result<()> {
    let h = Harness::new();
    let unbound = h.module(TestBackend::noop());
    assert!(matches!(unbound.restore("anything"), Err(Error::NotBound)));
    assert!(matches!(unbound.snapshot(), Err(Error::NotBound)));

    let module = h.bound_module(TestBackend::noop());
    match module.restore("missing") {
        Err(Error::SnapshotNotFound(key)) => assert_eq!(key, "missing"),
        other => panic!("unexpected result {other:?}"),
    }
    Ok(())
}

#[test]
fn app_snapshot_created_once() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let mut msg = Message::new("u", "f");
    msg.app_id = 77;

    let keys: Vec<String> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| module.get_or_create_app_snapshot(&msg, true)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    })
    .into_iter()
    .collect::<faaslet::Result<_>>()?;

    assert_eq!(keys.len(), 4);
    assert!(keys.iter().all(|k| k == "u_f_77"));
    assert_eq!(h.registry.len(), 1);
    Ok(())
}

#[test]
fn app_snapshot_update_matches_memory() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let mut msg = Message::new("u", "f");
    msg.app_id = faaslet::generate_gid();

    let key = module.get_or_create_app_snapshot(&msg, true)?;
    write_guest(&module, 3, b"changed");
    write_guest(&module, 2 * WASM_PAGE_SIZE as u32 + 17, &[1, 2, 3]);
    module.memory().grow(WASM_PAGE_SIZE)?;
    let brk = module.memory().current_brk();
    write_guest(&module, brk - 4, &[9, 9, 9, 9]);

    assert_eq!(module.get_or_create_app_snapshot(&msg, true)?, key);
    let snap = h.registry.get(&key)?;
    let live = unsafe { module.memory().live_bytes() }.to_vec();
    assert_eq!(snap.to_vec(), live);
    Ok(())
}

#[test]
fn app_snapshot_without_update_is_left_alone() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let mut msg = Message::new("u", "f");
    msg.app_id = faaslet::generate_gid();

    let key = module.get_or_create_app_snapshot(&msg, false)?;
    write_guest(&module, 0, b"new");
    module.get_or_create_app_snapshot(&msg, false)?;
    assert_eq!(&h.registry.get(&key)?.to_vec()[..3], &[0, 0, 0]);
    Ok(())
}

#[test]
fn app_snapshot_key_needs_app_id() {
    let msg = Message::new("u", "f");
    assert!(matches!(app_snapshot_key(&msg), Err(Error::MissingAppId(_))));
}

#[test]
fn delete_app_snapshot_broadcasts() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let mut msg = Message::new("u", "f");

    // No app id, nothing to delete.
    module.delete_app_snapshot(&msg)?;

    msg.app_id = faaslet::generate_gid();
    // Unknown snapshot, nothing to delete either.
    module.delete_app_snapshot(&msg)?;
    assert!(h.scheduler.deleted.lock().unwrap().is_empty());

    let key = module.get_or_create_app_snapshot(&msg, false)?;
    module.delete_app_snapshot(&msg)?;
    assert!(!h.registry.exists(&key));
    assert_eq!(*h.scheduler.deleted.lock().unwrap(), [key]);
    Ok(())
}

#[test]
fn arithmetic_merge_combines_threads() -> Result<()> {
    let mut memory = vec![0u8; WASM_PAGE_SIZE];
    memory[0..4].copy_from_slice(&10i32.to_le_bytes());
    memory[8..16].copy_from_slice(&2.5f64.to_le_bytes());
    let snap = SnapshotData::from_bytes(&memory, TEST_MAX_MEMORY)?;
    snap.add_merge_region(MergeRegion::new(0, 4, DataType::Int, MergeOp::Sum))?;
    snap.add_merge_region(MergeRegion::new(8, 8, DataType::Double, MergeOp::Max))?;

    // Two threads starting from the same image.
    let mut a = memory.clone();
    a[0..4].copy_from_slice(&15i32.to_le_bytes());
    a[8..16].copy_from_slice(&4.0f64.to_le_bytes());
    let mut b = memory.clone();
    b[0..4].copy_from_slice(&13i32.to_le_bytes());
    b[8..16].copy_from_slice(&3.0f64.to_le_bytes());

    snap.queue_diffs(snap.diff_with_memory(&a));
    snap.queue_diffs(snap.diff_with_memory(&b));
    snap.write_queued_diffs()?;

    let merged = snap.to_vec();
    assert_eq!(i32::from_le_bytes(merged[0..4].try_into()?), 18);
    assert_eq!(f64::from_le_bytes(merged[8..16].try_into()?), 4.0);
    Ok(())
}

#[test]
fn invalid_merge_regions() -> Result<()> {
    let snap = SnapshotData::new(WASM_PAGE_SIZE, 2 * WASM_PAGE_SIZE)?;
    for region in [
        MergeRegion::new(0, 0, DataType::Raw, MergeOp::Ignore),
        MergeRegion::new(0, 4, DataType::Raw, MergeOp::Sum),
        MergeRegion::new(0, 6, DataType::Int, MergeOp::Sum),
        MergeRegion::new(2 * WASM_PAGE_SIZE as u32 - 4, 8, DataType::Long, MergeOp::Min),
    ] {
        assert!(matches!(
            snap.add_merge_region(region),
            Err(Error::InvalidMergeRegion { .. })
        ));
    }
    assert!(snap.merge_regions().is_empty());
    Ok(())
}

#[test]
fn reset_restores_and_clears_stdout() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let key = module.snapshot()?;

    write_guest(&module, 0, b"dirty");
    module.stdout().capture_line(c"noise")?;
    module.reset(&Message::new("u", "f"), &key)?;

    assert_eq!(read_guest(&module, 0, 5), [0; 5]);
    assert!(module.stdout().is_empty());
    Ok(())
}

#[test]
fn reset_without_key_keeps_memory() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    write_guest(&module, 0, b"kept");
    module.reset(&Message::new("u", "f"), "")?;
    assert_eq!(read_guest(&module, 0, 4), b"kept");
    Ok(())
}
