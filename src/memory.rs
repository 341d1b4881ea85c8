//! Guest linear memory: the contract every backend's memory implements and
//! the mmap-backed implementation used by native backends.

use crate::error::{Error, Result};
use crate::mmap::Mmap;
use crate::pages::{
    is_page_aligned, round_up_page, GUARD_REGION_SIZE, MAX_WASM_MEMORY_BYTES, WASM_PAGE_SIZE,
};
use rustix::fd::BorrowedFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Operations the core needs on a guest's linear memory.
///
/// Offsets and pointers are 32-bit guest addresses. The program break
/// (`current_brk`) is always a multiple of the Wasm page size; it only moves
/// up under [`GuestMemory::grow`] and only moves down under
/// [`GuestMemory::shrink`].
pub trait GuestMemory: Send + Sync {
    /// Extends the live region by `n_bytes` rounded up to a Wasm page and
    /// returns the previous break.
    fn grow(&self, n_bytes: usize) -> Result<u32>;

    /// Moves the break down by `n_bytes`. The mapping stays in place but the
    /// tail is decommitted.
    fn shrink(&self, n_bytes: u32) -> Result<()>;

    /// Anonymous mapping inside guest memory.
    fn mmap(&self, n_bytes: usize) -> Result<u32> {
        self.grow(n_bytes)
    }

    /// Maps `length` bytes of `fd` into freshly grown guest memory.
    fn mmap_file(&self, fd: BorrowedFd<'_>, length: usize) -> Result<u32>;

    /// Releases `[offset, offset + n_bytes)`. `offset` must be page aligned.
    fn unmap(&self, offset: u32, n_bytes: u32) -> Result<()>;

    /// Host address of guest pointer `ptr`. Only meaningful for
    /// `ptr < size_bytes()`.
    fn guest_to_host(&self, ptr: u32) -> *mut u8 {
        self.base().wrapping_add(ptr as usize)
    }

    /// Host address of guest offset zero.
    fn base(&self) -> *mut u8;

    /// Bytes currently mapped for the guest. Never less than the break.
    fn size_bytes(&self) -> usize;

    /// Offset one past the last live byte.
    fn current_brk(&self) -> u32;

    /// Largest size the memory can grow to.
    fn max_bytes(&self) -> usize;

    /// Makes `GUARD_REGION_SIZE` bytes at `offset` read-only and returns the
    /// offset just past the region.
    fn create_guard_region(&self, offset: u32) -> Result<u32>;

    /// The live region `[0, current_brk)` as a byte slice.
    ///
    /// # Safety
    ///
    /// Guest code or other threads may be writing to this memory; callers
    /// must only use the slice while the guest is quiescent.
    unsafe fn live_bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.base(), self.current_brk() as usize)
    }
}

/// Linear memory backed by one up-front reservation of host address space.
///
/// The reservation covers the maximum size. Growing commits more of it,
/// shrinking decommits the tail again. The committed size never shrinks, so
/// `size_bytes()` is the high-water mark of the break.
#[derive(Debug)]
pub struct LinearMemory {
    mmap: Mmap,

    // Offset one past the last live byte.
    brk: AtomicU32,

    // Bytes made readable and writable so far. Also serialises growth.
    accessible: Mutex<usize>,

    maximum: usize,
}

impl LinearMemory {
    /// Creates an empty linear memory with the largest 32-bit maximum.
    pub fn new() -> Result<Self> {
        Self::with_maximum(MAX_WASM_MEMORY_BYTES)
    }

    /// Creates an empty linear memory that can grow to `maximum` bytes.
    pub fn with_maximum(maximum: usize) -> Result<Self> {
        let maximum = round_up_page(maximum.min(MAX_WASM_MEMORY_BYTES));
        log::trace!("reserving linear memory of {maximum:#x} bytes");
        Ok(Self {
            mmap: Mmap::reserve(maximum)?,
            brk: AtomicU32::new(0),
            accessible: Mutex::new(0),
            maximum,
        })
    }

    /// Decommits `[start, start + len)` so that it reads back as zero.
    fn reset_range(&self, start: usize, len: usize) -> Result<()> {
        // SAFETY: the range lies within the committed region and the guest
        // has given it up.
        unsafe { self.mmap.decommit(start, len) }
    }
}

impl GuestMemory for LinearMemory {
    fn grow(&self, n_bytes: usize) -> Result<u32> {
        let requested = round_up_page(n_bytes);
        let mut accessible = self.accessible.lock().unwrap();

        let old_brk = self.brk.load(Ordering::Acquire);
        let new_brk = (old_brk as usize)
            .checked_add(requested)
            .filter(|new| *new <= self.maximum)
            .ok_or(Error::OutOfMemory {
                requested,
                brk: old_brk,
                max: self.maximum,
            })?;

        if new_brk > *accessible {
            // SAFETY: the newly committed range has never been handed out.
            unsafe { self.mmap.make_accessible(*accessible, new_brk - *accessible)? };
            *accessible = new_brk;
        }

        // `new_brk` is bounded by `maximum`, which fits in a u32.
        self.brk.store(new_brk as u32, Ordering::Release);
        log::trace!("grew guest memory {old_brk:#x} -> {new_brk:#x}");
        Ok(old_brk)
    }

    fn shrink(&self, n_bytes: u32) -> Result<()> {
        let _accessible = self.accessible.lock().unwrap();
        let old_brk = self.brk.load(Ordering::Acquire);
        if n_bytes > old_brk {
            return Err(Error::InvalidShrink {
                requested: n_bytes,
                brk: old_brk,
            });
        }

        let new_brk = round_up_page((old_brk - n_bytes) as usize);
        self.reset_range(new_brk, old_brk as usize - new_brk)?;
        self.brk.store(new_brk as u32, Ordering::Release);
        log::trace!("shrank guest memory {old_brk:#x} -> {new_brk:#x}");
        Ok(())
    }

    fn mmap_file(&self, fd: BorrowedFd<'_>, length: usize) -> Result<u32> {
        let ptr = self.grow(length)?;
        // SAFETY: the region was just grown for this mapping alone.
        unsafe {
            self.mmap
                .map_file(ptr as usize, round_up_page(length), fd, 0)?;
        }
        Ok(ptr)
    }

    fn unmap(&self, offset: u32, n_bytes: u32) -> Result<()> {
        if !is_page_aligned(offset as usize) {
            return Err(Error::UnalignedUnmap(offset));
        }
        let len = round_up_page(n_bytes as usize);
        let brk = self.current_brk() as usize;
        if offset as usize + len == brk {
            return self.shrink(len as u32);
        }
        if offset as usize + len > brk {
            log::warn!("ignoring unmap of {len:#x} bytes at {offset:#x} past break {brk:#x}");
            return Ok(());
        }
        self.reset_range(offset as usize, len)
    }

    fn base(&self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    fn size_bytes(&self) -> usize {
        *self.accessible.lock().unwrap()
    }

    fn current_brk(&self) -> u32 {
        self.brk.load(Ordering::Acquire)
    }

    fn max_bytes(&self) -> usize {
        self.maximum
    }

    fn create_guard_region(&self, offset: u32) -> Result<u32> {
        let start = offset as usize;
        debug_assert_eq!(start % WASM_PAGE_SIZE, 0);
        // SAFETY: guard regions are never written through by the host.
        unsafe { self.mmap.make_readonly(start, GUARD_REGION_SIZE) }.map_err(|e| {
            Error::GuardFailed {
                offset,
                source: e.into(),
            }
        })?;
        log::trace!("created guard region at {offset:#x}");
        Ok(offset + GUARD_REGION_SIZE as u32)
    }
}
