//! Snapshots of guest memory.
//!
//! A [`SnapshotData`] holds a byte image of a guest's linear memory in an
//! anonymous memory file. Restoring maps that file copy-on-write over the
//! guest's memory, so a restore costs a single `mmap` no matter how large the
//! image is.
//!
//! Snapshots are also the point where threads of one application meet:
//! each thread diffs its memory against the shared snapshot and queues the
//! diffs, which are later written back in one go. [`MergeRegion`]s decide how
//! diffs over a range combine with what is already there, e.g. summing
//! counters or ignoring the per-thread stacks entirely.

pub mod registry;

use crate::error::{Error, Result};
use crate::mmap::{self, Mmap};
use crate::pages::{round_up_page, HOST_PAGE_SIZE};
use rustix::fd::AsFd;
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::ops::Range;
use std::sync::{Mutex, RwLock};

/// How the bytes of a merge region are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Opaque bytes.
    Raw,
    /// Little-endian `i32`s.
    Int,
    /// Little-endian `i64`s.
    Long,
    /// Little-endian `f32`s.
    Float,
    /// Little-endian `f64`s.
    Double,
}

impl DataType {
    /// Size of one element, `None` for raw bytes.
    pub fn element_size(self) -> Option<usize> {
        match self {
            DataType::Raw => None,
            DataType::Int | DataType::Float => Some(4),
            DataType::Long | DataType::Double => Some(8),
        }
    }
}

/// How a diff combines with the snapshot bytes it lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOp {
    /// Replace the bytes.
    Overwrite,
    /// Add the change made by the writer.
    Sum,
    /// Subtract the amount the writer decreased the value by.
    Subtract,
    /// Keep the larger value.
    Max,
    /// Keep the smaller value.
    Min,
    /// Never merge changes to the range.
    Ignore,
}

impl MergeOp {
    fn is_arithmetic(self) -> bool {
        matches!(
            self,
            MergeOp::Sum | MergeOp::Subtract | MergeOp::Max | MergeOp::Min
        )
    }
}

/// A merge policy for `[offset, offset + length)` of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRegion {
    /// Start of the region.
    pub offset: u32,
    /// Length of the region in bytes.
    pub length: usize,
    /// Element type of the region.
    pub data_type: DataType,
    /// How changes to the region are merged.
    pub operation: MergeOp,
}

impl MergeRegion {
    /// Creates a merge region.
    pub fn new(offset: u32, length: usize, data_type: DataType, operation: MergeOp) -> Self {
        Self {
            offset,
            length,
            data_type,
            operation,
        }
    }

    fn range(&self) -> Range<usize> {
        self.offset as usize..self.offset as usize + self.length
    }

    fn validate(&self, max_size: usize) -> Result<()> {
        let reason = if self.length == 0 {
            "region is empty"
        } else if self.offset as usize + self.length > max_size {
            "region extends past the snapshot's maximum size"
        } else if self.operation.is_arithmetic() && self.data_type == DataType::Raw {
            "arithmetic merges need a typed region"
        } else if self
            .data_type
            .element_size()
            .is_some_and(|size| self.length % size != 0)
        {
            "length is not a multiple of the element size"
        } else {
            return Ok(());
        };
        Err(Error::InvalidMergeRegion {
            offset: self.offset,
            reason,
        })
    }
}

/// A pending change to a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDiff {
    /// Where the change starts.
    pub offset: u32,
    /// Replacement bytes, or per-element operands for arithmetic merges.
    pub data: Vec<u8>,
    /// Element type of `data`.
    pub data_type: DataType,
    /// How `data` combines with the snapshot.
    pub operation: MergeOp,
}

impl SnapshotDiff {
    /// A diff that replaces bytes at `offset` with `data`.
    pub fn overwrite(offset: u32, data: Vec<u8>) -> Self {
        Self {
            offset,
            data,
            data_type: DataType::Raw,
            operation: MergeOp::Overwrite,
        }
    }
}

/// A byte image of guest memory plus its pending diffs and merge regions.
#[derive(Debug)]
pub struct SnapshotData {
    file: File,

    // Shared writable view of the whole file.
    mapping: Mmap,

    // Bytes of the image in use. Also guards writes through `mapping`.
    size: RwLock<usize>,

    queued: Mutex<Vec<SnapshotDiff>>,
    merge_regions: Mutex<BTreeMap<u32, MergeRegion>>,
}

impl SnapshotData {
    /// Creates a zeroed snapshot of `size` bytes that may later grow up to
    /// `max_size` bytes.
    pub fn new(size: usize, max_size: usize) -> Result<Self> {
        let size = round_up_page(size);
        let max_size = round_up_page(max_size.max(size));

        let memfd = memfd::MemfdOptions::new()
            .create("snapshot")
            .map_err(|e| Error::mmap("failed to create snapshot memfd", memfd_io_error(e)))?;
        let file = memfd.into_file();
        file.set_len(max_size as u64).map_err(|e| {
            Error::mmap(format!("failed to size snapshot file to {max_size:#x} bytes"), e)
        })?;
        let mapping = Mmap::map_shared(file.as_fd(), max_size)?;

        log::trace!("created snapshot of {size:#x} bytes (max {max_size:#x})");
        Ok(Self {
            file,
            mapping,
            size: RwLock::new(size),
            queued: Mutex::new(Vec::new()),
            merge_regions: Mutex::new(BTreeMap::new()),
        })
    }

    /// Creates a snapshot holding a copy of `bytes`, padded with zeros to a
    /// whole Wasm page.
    pub fn from_bytes(bytes: &[u8], max_size: usize) -> Result<Self> {
        let snapshot = Self::new(bytes.len(), max_size)?;
        // SAFETY: nothing else can see the fresh mapping yet.
        unsafe { snapshot.bytes_mut(bytes.len()) }.copy_from_slice(bytes);
        Ok(snapshot)
    }

    /// Current size of the image.
    pub fn size(&self) -> usize {
        *self.size.read().unwrap()
    }

    /// Largest size the image can grow to through diffs.
    pub fn max_size(&self) -> usize {
        self.mapping.len()
    }

    unsafe fn bytes(&self, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.mapping.as_mut_ptr(), len)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.mapping.as_mut_ptr(), len)
    }

    /// Calls `f` with the current image.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let size = self.size.read().unwrap();
        // SAFETY: writers hold the write lock.
        f(unsafe { self.bytes(*size) })
    }

    /// Copy of the current image.
    pub fn to_vec(&self) -> Vec<u8> {
        self.with_bytes(|bytes| bytes.to_vec())
    }

    /// Queues diffs to be written by [`SnapshotData::write_queued_diffs`].
    pub fn queue_diffs(&self, diffs: impl IntoIterator<Item = SnapshotDiff>) {
        let mut queued = self.queued.lock().unwrap();
        let before = queued.len();
        queued.extend(diffs);
        log::trace!("queued {} snapshot diffs", queued.len() - before);
    }

    /// Number of diffs waiting to be written.
    pub fn queued_len(&self) -> usize {
        self.queued.lock().unwrap().len()
    }

    /// Applies every queued diff to the image, in queue order, and returns
    /// how many were written. Diffs past the current size grow the image.
    pub fn write_queued_diffs(&self) -> Result<usize> {
        let diffs = std::mem::take(&mut *self.queued.lock().unwrap());
        if diffs.is_empty() {
            return Ok(0);
        }

        let max = self.max_size();
        let mut size = self.size.write().unwrap();
        for diff in &diffs {
            let start = diff.offset as usize;
            let end = start + diff.data.len();
            if end > max {
                return Err(Error::SnapshotOverflow {
                    offset: start,
                    len: diff.data.len(),
                    max,
                });
            }

            // SAFETY: we hold the write lock and `end` is within the mapping.
            let dest = unsafe { &mut self.bytes_mut(end)[start..] };
            apply_diff(dest, diff);
            *size = (*size).max(round_up_page(end));
        }

        log::debug!("wrote {} snapshot diffs, size now {:#x}", diffs.len(), *size);
        Ok(diffs.len())
    }

    /// Adds a merge region, replacing any region with the same offset.
    pub fn add_merge_region(&self, region: MergeRegion) -> Result<()> {
        region.validate(self.max_size())?;
        log::trace!(
            "merge region {:?}/{:?} over {:#x}+{:#x}",
            region.operation,
            region.data_type,
            region.offset,
            region.length
        );
        self.merge_regions
            .lock()
            .unwrap()
            .insert(region.offset, region);
        Ok(())
    }

    /// The merge regions in offset order.
    pub fn merge_regions(&self) -> Vec<MergeRegion> {
        self.merge_regions.lock().unwrap().values().cloned().collect()
    }

    /// Computes the diffs that bring the image in line with `memory`.
    ///
    /// Ranges covered by `Ignore` regions produce nothing; ranges covered by
    /// arithmetic regions produce one typed diff each. Every other changed
    /// host page produces an overwrite. Memory past the end of the image is
    /// always copied.
    pub fn diff_with_memory(&self, memory: &[u8]) -> Vec<SnapshotDiff> {
        let regions = self.merge_regions();
        let size = self.size.read().unwrap();
        // SAFETY: writers hold the write lock.
        let snap = unsafe { self.bytes(*size) };
        let common = snap.len().min(memory.len());
        let mut diffs = Vec::new();

        for region in regions.iter().filter(|r| r.operation.is_arithmetic()) {
            let Some(elem) = region.data_type.element_size() else {
                continue;
            };
            let start = region.offset as usize;
            let end = region.range().end.min(common);
            if start >= end {
                continue;
            }
            let end = start + (end - start) / elem * elem;
            let (old, new) = (&snap[start..end], &memory[start..end]);
            if old == new {
                continue;
            }
            diffs.push(SnapshotDiff {
                offset: region.offset,
                data: typed_operands(region.data_type, region.operation, old, new),
                data_type: region.data_type,
                operation: region.operation,
            });
        }

        let excluded: Vec<Range<usize>> = regions
            .iter()
            .filter(|r| r.operation != MergeOp::Overwrite)
            .map(MergeRegion::range)
            .collect();
        for run in dirty_runs(&snap[..common], &memory[..common]) {
            for range in subtract_ranges(run, &excluded) {
                if snap[range.clone()] == memory[range.clone()] {
                    continue;
                }
                diffs.push(SnapshotDiff::overwrite(
                    range.start as u32,
                    memory[range].to_vec(),
                ));
            }
        }

        if memory.len() > snap.len() {
            diffs.push(SnapshotDiff::overwrite(
                snap.len() as u32,
                memory[snap.len()..].to_vec(),
            ));
        }

        log::trace!("found {} diffs against snapshot of {:#x} bytes", diffs.len(), *size);
        diffs
    }

    /// Maps the image copy-on-write over `[base, base + size)`.
    ///
    /// # Safety
    ///
    /// `base` must be page aligned and the range must be owned by the caller
    /// with nothing else referencing it.
    pub unsafe fn map_to_memory(&self, base: *mut u8) -> Result<()> {
        let size = self.size.read().unwrap();
        mmap::map_file_fixed(base, *size, self.file.as_fd(), 0)?;
        log::debug!("mapped snapshot of {:#x} bytes at {base:p}", *size);
        Ok(())
    }
}

#[allow(unreachable_patterns)]
fn memfd_io_error(e: memfd::Error) -> io::Error {
    match e {
        memfd::Error::Create(e) | memfd::Error::AddSeals(e) | memfd::Error::GetSeals(e) => e,
        e => io::Error::other(e),
    }
}

// Runs of host pages that differ between `old` and `new`.
fn dirty_runs(old: &[u8], new: &[u8]) -> Vec<Range<usize>> {
    debug_assert_eq!(old.len(), new.len());
    let mut runs: Vec<Range<usize>> = Vec::new();
    for (i, (a, b)) in old
        .chunks(HOST_PAGE_SIZE)
        .zip(new.chunks(HOST_PAGE_SIZE))
        .enumerate()
    {
        if a == b {
            continue;
        }
        let start = i * HOST_PAGE_SIZE;
        let end = start + a.len();
        match runs.last_mut() {
            Some(last) if last.end == start => last.end = end,
            _ => runs.push(start..end),
        }
    }
    runs
}

// Parts of `run` outside every range in `excluded`, which is sorted by start.
fn subtract_ranges(run: Range<usize>, excluded: &[Range<usize>]) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut cursor = run.start;
    for ex in excluded {
        if ex.end <= cursor {
            continue;
        }
        if ex.start >= run.end {
            break;
        }
        if ex.start > cursor {
            out.push(cursor..ex.start);
        }
        cursor = cursor.max(ex.end);
    }
    if cursor < run.end {
        out.push(cursor..run.end);
    }
    out
}

trait Element: Copy + PartialOrd {
    const SIZE: usize;
    fn load(bytes: &[u8]) -> Self;
    fn store(self, bytes: &mut [u8]);
    fn add(self, other: Self) -> Self;
    fn sub(self, other: Self) -> Self;
}

macro_rules! element {
    ($ty:ty, $add:expr, $sub:expr) => {
        impl Element for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            fn load(bytes: &[u8]) -> Self {
                <$ty>::from_le_bytes(bytes.try_into().unwrap())
            }
            fn store(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_le_bytes());
            }
            fn add(self, other: Self) -> Self {
                ($add)(self, other)
            }
            fn sub(self, other: Self) -> Self {
                ($sub)(self, other)
            }
        }
    };
}

element!(i32, i32::wrapping_add, i32::wrapping_sub);
element!(i64, i64::wrapping_add, i64::wrapping_sub);
element!(f32, |a: f32, b: f32| a + b, |a: f32, b: f32| a - b);
element!(f64, |a: f64, b: f64| a + b, |a: f64, b: f64| a - b);

// Operands of a typed diff: the change for sums and differences, the new
// value otherwise.
fn typed_operands(data_type: DataType, op: MergeOp, old: &[u8], new: &[u8]) -> Vec<u8> {
    fn operands<T: Element>(op: MergeOp, old: &[u8], new: &[u8]) -> Vec<u8> {
        let mut out = vec![0; new.len()];
        for ((o, n), d) in old
            .chunks_exact(T::SIZE)
            .zip(new.chunks_exact(T::SIZE))
            .zip(out.chunks_exact_mut(T::SIZE))
        {
            let (o, n) = (T::load(o), T::load(n));
            let value = match op {
                MergeOp::Sum => n.sub(o),
                MergeOp::Subtract => o.sub(n),
                _ => n,
            };
            value.store(d);
        }
        out
    }

    match data_type {
        DataType::Raw => new.to_vec(),
        DataType::Int => operands::<i32>(op, old, new),
        DataType::Long => operands::<i64>(op, old, new),
        DataType::Float => operands::<f32>(op, old, new),
        DataType::Double => operands::<f64>(op, old, new),
    }
}

fn apply_diff(dest: &mut [u8], diff: &SnapshotDiff) {
    fn merge<T: Element>(op: MergeOp, dest: &mut [u8], data: &[u8]) {
        for (d, v) in dest.chunks_exact_mut(T::SIZE).zip(data.chunks_exact(T::SIZE)) {
            let (cur, v) = (T::load(d), T::load(v));
            let value = match op {
                MergeOp::Sum => cur.add(v),
                MergeOp::Subtract => cur.sub(v),
                MergeOp::Max if v > cur => v,
                MergeOp::Min if v < cur => v,
                MergeOp::Max | MergeOp::Min => cur,
                MergeOp::Overwrite | MergeOp::Ignore => v,
            };
            value.store(d);
        }
    }

    match (diff.operation, diff.data_type) {
        (MergeOp::Ignore, _) => {}
        (MergeOp::Overwrite, _) | (_, DataType::Raw) => dest.copy_from_slice(&diff.data),
        (op, DataType::Int) => merge::<i32>(op, dest, &diff.data),
        (op, DataType::Long) => merge::<i64>(op, dest, &diff.data),
        (op, DataType::Float) => merge::<f32>(op, dest, &diff.data),
        (op, DataType::Double) => merge::<f64>(op, dest, &diff.data),
    }
}
