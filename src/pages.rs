//! Page arithmetic for 32-bit Wasm linear memories.

/// Size of a Wasm page in bytes.
pub const WASM_PAGE_SIZE: usize = 65_536;

/// Size of a host page in bytes, used to align chunks of shared state.
pub const HOST_PAGE_SIZE: usize = 4096;

/// Largest linear memory a guest may have: 4 GiB minus one Wasm page, so that
/// every live offset and the break itself fit in a `u32`.
pub const MAX_WASM_MEMORY_BYTES: usize = (1 << 32) - WASM_PAGE_SIZE;

/// Size of the read-only region flanking each thread stack.
pub const GUARD_REGION_SIZE: usize = 10 * WASM_PAGE_SIZE;

/// Size of each guest thread stack.
pub const THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Number of Wasm pages needed to hold `n_bytes`.
#[inline]
pub fn pages_for_bytes(n_bytes: usize) -> usize {
    n_bytes.div_ceil(WASM_PAGE_SIZE)
}

/// Rounds `n_bytes` up to a multiple of the Wasm page size.
#[inline]
pub fn round_up_page(n_bytes: usize) -> usize {
    pages_for_bytes(n_bytes) * WASM_PAGE_SIZE
}

/// Whether `x` sits on a Wasm page boundary.
#[inline]
pub fn is_page_aligned(x: usize) -> bool {
    x % WASM_PAGE_SIZE == 0
}

/// Rounds `n_bytes` up to a multiple of the host page size.
#[inline]
pub fn round_up_host_page(n_bytes: usize) -> usize {
    n_bytes.div_ceil(HOST_PAGE_SIZE) * HOST_PAGE_SIZE
}
