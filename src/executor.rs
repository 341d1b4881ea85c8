use crate::error::Result;
use crate::message::{BatchExecuteRequest, BatchType, Message};
use crate::module::WasmModule;
use std::thread;

/// Runs whole batches on one module.
///
/// The module is bound to the batch's function on first use and reset to
/// the batch's snapshot before running it. Thread batches run on one worker
/// per thread stack, so no stack ever hosts two guest threads at once, then
/// queue their combined writes onto the snapshot for the main thread to pick
/// up. Function batches run one message after another.
pub struct Executor {
    module: WasmModule,
}

impl Executor {
    /// Creates an executor driving `module`.
    pub fn new(module: WasmModule) -> Self {
        Self { module }
    }

    /// The module batches run on.
    pub fn module(&self) -> &WasmModule {
        &self.module
    }

    /// Executes every message of `req`, recording outputs and return values
    /// in the messages, and returns the return values in message order.
    pub fn execute_batch(&self, req: &mut BatchExecuteRequest) -> Result<Vec<i32>> {
        let module = &self.module;
        let Some(first) = req.messages.first() else {
            return Ok(Vec::new());
        };

        if !module.is_bound() {
            module.bind(first, false)?;
        }

        let snapshot_key = first.snapshot_key.clone().filter(|k| !k.is_empty());
        if let Some(key) = &snapshot_key {
            module.restore(key)?;
        }

        let (ty, subtype) = (req.ty, req.subtype);
        let level = req.omp_level.clone();
        log::debug!(
            "executing batch {} of {} {ty:?}/{subtype:?} messages",
            req.id,
            req.messages.len()
        );

        let results = match ty {
            BatchType::Functions => req
                .messages
                .iter_mut()
                .map(|msg| module.execute_message(0, ty, subtype, None, msg))
                .collect(),
            BatchType::Threads => {
                // One worker per stack; a worker runs its messages in turn.
                let n_workers = module.thread_stacks().len().clamp(1, req.messages.len());
                let mut assigned: Vec<Vec<(usize, &mut Message)>> =
                    (0..n_workers).map(|_| Vec::new()).collect();
                for (i, msg) in req.messages.iter_mut().enumerate() {
                    assigned[i % n_workers].push((i, msg));
                }

                let level = level.as_ref();
                let mut results = vec![1; assigned.iter().map(Vec::len).sum()];
                thread::scope(|s| {
                    let handles: Vec<_> = assigned
                        .into_iter()
                        .enumerate()
                        .map(|(pool_idx, msgs)| {
                            s.spawn(move || {
                                let mut done = Vec::with_capacity(msgs.len());
                                for (i, msg) in msgs {
                                    let level = level.cloned();
                                    let rv =
                                        module.execute_message(pool_idx, ty, subtype, level, msg);
                                    done.push((i, rv));
                                }
                                done
                            })
                        })
                        .collect();
                    for handle in handles {
                        match handle.join() {
                            Ok(done) => {
                                for (i, rv) in done {
                                    results[i] = rv;
                                }
                            }
                            Err(_) => log::error!("guest thread panicked"),
                        }
                    }
                });
                results
            }
        };

        if ty == BatchType::Threads {
            if let Some(key) = &snapshot_key {
                let snap = module.platform().registry.get(key)?;
                // SAFETY: every thread of the batch has been joined.
                let diffs = snap.diff_with_memory(unsafe { module.memory().live_bytes() });
                log::debug!(
                    "queueing {} diffs from batch {} onto {key}",
                    diffs.len(),
                    req.id
                );
                snap.queue_diffs(diffs);
            }
        }

        Ok(results)
    }

    /// Drops every snapshot held in this process and asks other hosts to
    /// drop theirs.
    pub fn flush(&self) -> Result<()> {
        log::debug!("flushing executor");
        self.module.platform().registry.clear();
        self.module.platform().scheduler.broadcast_flush()?;
        Ok(())
    }
}
