//! Mapping of shared key-value state into guest memory.

use crate::pages::{round_up_host_page, HOST_PAGE_SIZE};
use std::ptr::NonNull;

/// A value held by the external state service that can be mapped into a
/// guest's address space.
pub trait StateKeyValue: Send + Sync {
    /// Owner of the value.
    fn user(&self) -> &str;

    /// Key of the value.
    fn key(&self) -> &str;

    /// Maps `n_pages` host pages of the value, starting at page
    /// `page_offset`, over the host memory at `host_ptr`.
    fn map_shared_memory(
        &self,
        host_ptr: NonNull<u8>,
        page_offset: usize,
        n_pages: usize,
    ) -> anyhow::Result<()>;
}

/// A byte range of a value widened to whole host pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedChunk {
    /// Start of the requested range.
    pub original_offset: usize,
    /// Length of the requested range.
    pub original_length: usize,
    /// Start of the first page, in bytes.
    pub n_bytes_offset: usize,
    /// Length of the page-aligned range, in bytes.
    pub n_bytes_length: usize,
    /// Index of the first page.
    pub n_pages_offset: usize,
    /// Number of pages.
    pub n_pages_length: usize,
    /// Distance from the first page to the requested start.
    pub offset_remainder: usize,
}

impl AlignedChunk {
    /// The page-aligned chunk covering `[offset, offset + length)`.
    pub fn new(offset: usize, length: usize) -> Self {
        let n_pages_offset = offset / HOST_PAGE_SIZE;
        let n_bytes_offset = n_pages_offset * HOST_PAGE_SIZE;
        let n_bytes_length = round_up_host_page(offset + length - n_bytes_offset);
        Self {
            original_offset: offset,
            original_length: length,
            n_bytes_offset,
            n_bytes_length,
            n_pages_offset,
            n_pages_length: n_bytes_length / HOST_PAGE_SIZE,
            offset_remainder: offset - n_bytes_offset,
        }
    }
}

/// Cache key of one mapped chunk.
pub(crate) fn segment_key(kv: &dyn StateKeyValue, offset: usize, length: usize) -> String {
    format!("{}_{}__{offset}__{length}", kv.user(), kv.key())
}
