//! Low-level abstraction over a reserved range of host address space that
//! backs a guest's linear memory.

use crate::error::{Error, Result};
use rustix::fd::BorrowedFd;
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};
use std::ffi::c_void;
use std::ptr;

/// A page-aligned reservation of host address space.
///
/// The whole range starts out inaccessible; callers commit parts of it with
/// [`Mmap::make_accessible`] and may later replace parts with zero pages or
/// file-backed pages.
#[derive(Debug)]
pub struct Mmap {
    // Note that this is stored as a `usize` instead of a `*const` or `*mut`
    // pointer to allow this structure to be natively `Send` and `Sync` without
    // `unsafe impl`. This type is sendable across threads and shareable since
    // the coordination all happens at the OS layer.
    ptr: usize,
    len: usize,
}

impl Mmap {
    /// Reserves `len` bytes of inaccessible address space. `len` must be a
    /// multiple of the host page size.
    pub fn reserve(len: usize) -> Result<Self> {
        assert_eq!(len % host_page_size(), 0);
        if len == 0 {
            // Rust's slices require non-null pointers, even when empty. `Vec`
            // contains code to create a non-null dangling pointer value when
            // constructed empty, so we reuse that here.
            let empty = Vec::<u8>::new();
            return Ok(Self {
                ptr: empty.as_ptr() as usize,
                len: 0,
            });
        }

        let ptr = unsafe {
            // Reserved space is never accessed until committed, so it must not
            // be charged against the overcommit budget up front.
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                len,
                ProtFlags::empty(),
                MapFlags::PRIVATE | MapFlags::NORESERVE,
            )
            .map_err(|e| Error::mmap(format!("mmap failed to reserve {len:#x} bytes"), e))?
        };

        Ok(Self {
            ptr: ptr as usize,
            len,
        })
    }

    /// Base address of the reservation.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    /// Length of the reservation in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    fn range_ptr(&self, start: usize, len: usize) -> *mut c_void {
        let page_size = host_page_size();
        assert_eq!(start % page_size, 0, "start {start:#x} is not page aligned");
        assert_eq!(len % page_size, 0, "length {len:#x} is not page aligned");
        assert!(
            start.checked_add(len).map_or(false, |end| end <= self.len),
            "range {start:#x}+{len:#x} outside mapping of {:#x} bytes",
            self.len
        );
        (self.ptr + start) as *mut c_void
    }

    /// Makes `[start, start + len)` readable and writable.
    ///
    /// # Safety
    ///
    /// The range must not currently be in use as a read-only guard that other
    /// code relies upon.
    pub unsafe fn make_accessible(&self, start: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let ptr = self.range_ptr(start, len);
        rustix::mm::mprotect(ptr, len, MprotectFlags::READ | MprotectFlags::WRITE).map_err(|e| {
            Error::mmap(format!("mprotect failed to commit {len:#x} bytes at {start:#x}"), e)
        })
    }

    /// Makes `[start, start + len)` read-only.
    ///
    /// # Safety
    ///
    /// No live references may write into the range afterwards.
    pub unsafe fn make_readonly(&self, start: usize, len: usize) -> rustix::io::Result<()> {
        if len == 0 {
            return Ok(());
        }
        let ptr = self.range_ptr(start, len);
        rustix::mm::mprotect(ptr, len, MprotectFlags::READ)
    }

    /// Replaces `[start, start + len)` with fresh zero pages that are readable
    /// and writable, dropping whatever backed the range before.
    ///
    /// # Safety
    ///
    /// There must not be any other references to the range.
    pub unsafe fn decommit(&self, start: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let ptr = self.range_ptr(start, len);
        let res = rustix::mm::mmap_anonymous(
            ptr,
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE | MapFlags::FIXED,
        )
        .map_err(|e| Error::mmap(format!("mmap failed to reset {len:#x} bytes at {start:#x}"), e))?;
        assert_eq!(res, ptr);
        Ok(())
    }

    /// Maps `len` bytes of `fd`, starting at file offset `offset`, copy-on-write
    /// over `[start, start + len)`.
    ///
    /// # Safety
    ///
    /// There must not be any other references to the range.
    pub unsafe fn map_file(
        &self,
        start: usize,
        len: usize,
        fd: BorrowedFd<'_>,
        offset: u64,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let ptr = self.range_ptr(start, len);
        map_file_fixed(ptr.cast(), len, fd, offset)
    }

    /// Maps the first `len` bytes of `fd` shared and writable, so that writes
    /// through the mapping land in the file.
    pub fn map_shared(fd: BorrowedFd<'_>, len: usize) -> Result<Self> {
        assert_eq!(len % host_page_size(), 0);
        if len == 0 {
            return Self::reserve(0);
        }
        let ptr = unsafe {
            rustix::mm::mmap(
                ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
            .map_err(|e| Error::mmap(format!("mmap failed to share {len:#x} file bytes"), e))?
        };
        Ok(Self {
            ptr: ptr as usize,
            len,
        })
    }
}

/// Maps `len` bytes of `fd` copy-on-write at the fixed address `addr`,
/// replacing whatever was mapped there.
///
/// # Safety
///
/// `[addr, addr + len)` must be page aligned, owned by the caller and not
/// referenced by anything else.
pub unsafe fn map_file_fixed(
    addr: *mut u8,
    len: usize,
    fd: BorrowedFd<'_>,
    offset: u64,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let ptr = addr.cast::<c_void>();
    let res = rustix::mm::mmap(
        ptr,
        len,
        ProtFlags::READ | ProtFlags::WRITE,
        MapFlags::PRIVATE | MapFlags::FIXED,
        fd,
        offset,
    )
    .map_err(|e| Error::mmap(format!("mmap failed to map {len:#x} file bytes at {addr:p}"), e))?;
    assert_eq!(res, ptr);
    Ok(())
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        unsafe {
            rustix::mm::munmap(self.ptr as *mut c_void, self.len).expect("munmap failed");
        }
    }
}

/// The host's page size.
pub fn host_page_size() -> usize {
    rustix::param::page_size()
}
