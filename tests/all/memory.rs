use super::*;
use anyhow::Result;
use faaslet::pages::{round_up_page, GUARD_REGION_SIZE};
use faaslet::Error;
use std::io::Write;
use std::os::fd::AsFd;

#[test]
fn grow_rounds_to_pages() -> Result<()> {
    let memory = LinearMemory::with_maximum(TEST_MAX_MEMORY)?;
    for n in [1, WASM_PAGE_SIZE, WASM_PAGE_SIZE + 1, 3 * WASM_PAGE_SIZE - 7] {
        let before = memory.current_brk();
        let old = memory.grow(n)?;
        assert_eq!(old, before);
        assert_eq!(memory.current_brk() as usize, before as usize + round_up_page(n));
        assert!(memory.size_bytes() >= memory.current_brk() as usize);
    }
    Ok(())
}

#[test]
fn shrink_keeps_size() -> Result<()> {
    let memory = LinearMemory::with_maximum(TEST_MAX_MEMORY)?;
    memory.grow(5 * WASM_PAGE_SIZE)?;
    let size = memory.size_bytes();

    memory.shrink(2 * WASM_PAGE_SIZE as u32)?;
    assert_eq!(memory.current_brk() as usize, 3 * WASM_PAGE_SIZE);
    assert_eq!(memory.size_bytes(), size);

    // Growing back into the decommitted tail sees zeros.
    memory.grow(WASM_PAGE_SIZE)?;
    let live = unsafe { memory.live_bytes() };
    assert!(live[3 * WASM_PAGE_SIZE..].iter().all(|b| *b == 0));
    Ok(())
}

#[test]
fn out_of_memory() -> Result<()> {
    let memory = LinearMemory::with_maximum(2 * WASM_PAGE_SIZE)?;
    memory.grow(WASM_PAGE_SIZE)?;
    match memory.grow(2 * WASM_PAGE_SIZE) {
        Err(Error::OutOfMemory { requested, brk, max }) => {
            assert_eq!(requested, 2 * WASM_PAGE_SIZE);
            assert_eq!(brk as usize, WASM_PAGE_SIZE);
            assert_eq!(max, 2 * WASM_PAGE_SIZE);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(memory.current_brk() as usize, WASM_PAGE_SIZE);
    Ok(())
}

#[test]
fn mmap_grows_anonymous_memory() -> Result<()> {
    let memory = LinearMemory::with_maximum(TEST_MAX_MEMORY)?;
    memory.grow(WASM_PAGE_SIZE)?;
    let ptr = memory.mmap(100)?;
    assert_eq!(ptr as usize, WASM_PAGE_SIZE);
    assert_eq!(memory.current_brk() as usize, 2 * WASM_PAGE_SIZE);
    Ok(())
}

#[test]
fn mmap_file_maps_contents() -> Result<()> {
    let mut file = tempfile::tempfile()?;
    file.write_all(b"state of the world")?;
    file.set_len(WASM_PAGE_SIZE as u64)?;

    let memory = LinearMemory::with_maximum(TEST_MAX_MEMORY)?;
    memory.grow(WASM_PAGE_SIZE)?;
    let ptr = memory.mmap_file(file.as_fd(), 18)?;
    assert_eq!(ptr as usize, WASM_PAGE_SIZE);

    let live = unsafe { memory.live_bytes() };
    assert_eq!(&live[ptr as usize..][..18], b"state of the world");
    Ok(())
}

#[test]
fn unmap_at_break() -> Result<()> {
    let memory = LinearMemory::with_maximum(TEST_MAX_MEMORY)?;
    let ptr = memory.mmap(3 * WASM_PAGE_SIZE)?;
    memory.unmap(ptr + 2 * WASM_PAGE_SIZE as u32, WASM_PAGE_SIZE as u32)?;
    assert_eq!(memory.current_brk() as usize, 2 * WASM_PAGE_SIZE);

    // Unmapping in the middle leaves the break alone.
    memory.unmap(ptr, WASM_PAGE_SIZE as u32)?;
    assert_eq!(memory.current_brk() as usize, 2 * WASM_PAGE_SIZE);
    Ok(())
}

#[test]
fn guard_regions_are_read_only_but_readable() -> Result<()> {
    let memory = LinearMemory::with_maximum(TEST_MAX_MEMORY)?;
    let base = memory.grow(GUARD_REGION_SIZE + WASM_PAGE_SIZE)?;
    let end = memory.create_guard_region(base)?;
    assert_eq!(end as usize, base as usize + GUARD_REGION_SIZE);

    let host = memory.guest_to_host(base) as usize;
    assert!(is_read_only(host, GUARD_REGION_SIZE));
    assert!(!is_read_only(host + GUARD_REGION_SIZE, WASM_PAGE_SIZE));

    let live = unsafe { memory.live_bytes() };
    assert!(live[..GUARD_REGION_SIZE].iter().all(|b| *b == 0));
    Ok(())
}

#[test]
fn guest_to_host_is_offset_from_base() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let base = module.memory().base();
    assert_eq!(module.guest_to_host(0), base);
    assert_eq!(module.guest_to_host(1234), base.wrapping_add(1234));
    Ok(())
}
