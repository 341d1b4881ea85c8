use crate::message::{BatchExecuteRequest, Message};
use std::time::Duration;

/// The batch scheduler that runs thread fan-out on this or other hosts.
///
/// Every method may block on the network; failures are handed back to the
/// guest's invocation unchanged.
pub trait Scheduler: Send + Sync {
    /// Submits a batch for execution. Each message's `id` is the call id
    /// later passed to [`Scheduler::await_thread_result`].
    fn call_functions(&self, req: BatchExecuteRequest) -> anyhow::Result<()>;

    /// Blocks until the thread call `call_id` finishes and returns its
    /// return value, failing once `timeout` elapses.
    fn await_thread_result(&self, call_id: u32, timeout: Duration) -> anyhow::Result<i32>;

    /// Tells every other host to drop the snapshot `key`.
    fn broadcast_snapshot_delete(&self, msg: &Message, key: &str) -> anyhow::Result<()>;

    /// Tells every other host to drop its cached state.
    fn broadcast_flush(&self) -> anyhow::Result<()>;
}
