use crate::context::ExecutionContext;
use crate::error::Result;
use crate::memory::GuestMemory;
use crate::message::Message;

/// A Wasm engine able to run one guest.
///
/// The core drives the guest's lifecycle through this trait and manipulates
/// its linear memory through [`Backend::memory`]. Every call receives the
/// [`ExecutionContext`] of the invocation, which the engine's host functions
/// can also reach via [`ExecutionContext::with_current`].
pub trait Backend: Send + Sync {
    /// The guest's linear memory.
    fn memory(&self) -> &dyn GuestMemory;

    /// Loads and instantiates the function named by `msg`. With `cache` set
    /// the engine may reuse a previously compiled module.
    fn bind(&self, msg: &Message, cache: bool) -> Result<()>;

    /// Runs the guest's entry point and returns its exit code.
    fn execute_function(&self, ctx: &ExecutionContext<'_>) -> Result<i32>;

    /// Runs the OpenMP microtask `ctx.message().func_ptr` as worker
    /// `thread_idx` on the stack at `stack_top`.
    fn execute_omp(&self, thread_idx: usize, stack_top: u32, ctx: &ExecutionContext<'_>)
        -> Result<i32>;

    /// Runs the pthread entry `ctx.message().func_ptr` with the argument
    /// pointer in `ctx.message().input_data` on the stack at `stack_top`.
    fn execute_pthread(
        &self,
        thread_idx: usize,
        stack_top: u32,
        ctx: &ExecutionContext<'_>,
    ) -> Result<i32>;

    /// Whether the engine runs guest threads on host-provisioned stacks.
    /// Modules only carve thread stacks out of guest memory when it does.
    fn supports_threads(&self) -> bool {
        true
    }

    /// Engine-specific part of resetting the guest between invocations.
    fn reset(&self, msg: &Message, snapshot_key: &str) -> Result<()> {
        let _ = snapshot_key;
        log::warn!("backend has no reset for {}", msg.func_str());
        Ok(())
    }

    /// Logs engine-specific diagnostics.
    fn print_debug_info(&self) {
        let memory = self.memory();
        log::debug!(
            "guest memory: base {:p}, {:#x} bytes mapped, break {:#x}, max {:#x}",
            memory.base(),
            memory.size_bytes(),
            memory.current_brk(),
            memory.max_bytes()
        );
    }
}
