//! Environment variables and argument vectors handed to the guest.

use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use std::collections::BTreeMap;

/// Environment variables visible to the guest through `environ_get`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WasmEnvironment {
    vars: BTreeMap<String, String>,
}

impl WasmEnvironment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Number of variables.
    pub fn count(&self) -> u32 {
        self.vars.len() as u32
    }

    /// `KEY=value` strings in key order.
    pub fn strings(&self) -> Vec<String> {
        self.vars.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Bytes needed to hold every `KEY=value` string with its NUL.
    pub fn buffer_size(&self) -> u32 {
        buffer_size(&self.strings())
    }
}

/// Bytes needed to hold `strings` with a NUL after each.
pub(crate) fn buffer_size(strings: &[String]) -> u32 {
    strings.iter().map(|s| s.len() as u32 + 1).sum()
}

/// Writes `strings` NUL-terminated into the buffer at `buf` and a pointer to
/// each into the array at `ptrs`, the layout `args_get` and `environ_get`
/// produce.
pub(crate) fn write_strings(
    memory: &dyn GuestMemory,
    strings: &[String],
    ptrs: u32,
    buf: u32,
) -> Result<()> {
    check_bounds(memory, ptrs, strings.len() * 4)?;
    check_bounds(memory, buf, buffer_size(strings) as usize)?;

    let mut next = buf;
    for (i, s) in strings.iter().enumerate() {
        // SAFETY: both ranges were checked against the live region above.
        unsafe {
            let dst = memory.guest_to_host(next);
            std::ptr::copy_nonoverlapping(s.as_ptr(), dst, s.len());
            *dst.add(s.len()) = 0;
            let slot = memory.guest_to_host(ptrs + 4 * i as u32);
            std::ptr::write_unaligned(slot.cast::<[u8; 4]>(), next.to_le_bytes());
        }
        next += s.len() as u32 + 1;
    }
    Ok(())
}

fn check_bounds(memory: &dyn GuestMemory, ptr: u32, len: usize) -> Result<()> {
    if ptr as usize + len > memory.current_brk() as usize {
        return Err(Error::OutOfBounds { ptr, len });
    }
    Ok(())
}
