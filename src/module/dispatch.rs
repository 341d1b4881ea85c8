use super::WasmModule;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::message::{BatchExecuteRequest, BatchType, Message, ThreadRequestType};
use crate::openmp;

impl WasmModule {
    /// Executes message `msg_idx` of `req` on thread-pool slot `pool_idx`
    /// and returns the guest's return value.
    ///
    /// Failures never escape: they are logged, recorded in the message's
    /// output and turned into a non-zero return value.
    pub fn execute_task(
        &self,
        pool_idx: usize,
        msg_idx: usize,
        req: &mut BatchExecuteRequest,
    ) -> i32 {
        let (ty, subtype) = (req.ty, req.subtype);
        let level = req.omp_level.clone();
        let Some(msg) = req.messages.get_mut(msg_idx) else {
            log::error!("batch {} has no message {msg_idx}", req.id);
            return 1;
        };
        self.execute_message(pool_idx, ty, subtype, level, msg)
    }

    pub(crate) fn execute_message(
        &self,
        pool_idx: usize,
        ty: BatchType,
        subtype: ThreadRequestType,
        level: Option<openmp::Level>,
        msg: &mut Message,
    ) -> i32 {
        let mut rv = match self.try_execute_task(pool_idx, ty, subtype, level, msg) {
            Ok(rv) => rv,
            Err(e) => {
                log::error!("failed executing {}: {e}", msg.func_str());
                1
            }
        };

        if rv != 0 {
            msg.output_data = format!("Call failed (return value={rv})");
        }

        if self.config().capture_stdout() {
            match self.stdout.read_all() {
                Ok(stdout) => {
                    if !stdout.is_empty() {
                        msg.output_data.insert_str(0, &stdout);
                    }
                }
                Err(e) => {
                    log::error!("failed reading captured stdout: {e}");
                    if rv == 0 {
                        rv = 1;
                    }
                }
            }
            self.stdout.clear();
        }

        msg.return_value = rv;
        rv
    }

    /// The fallible part of [`WasmModule::execute_task`].
    pub fn try_execute_task(
        &self,
        pool_idx: usize,
        ty: BatchType,
        subtype: ThreadRequestType,
        level: Option<openmp::Level>,
        msg: &mut Message,
    ) -> Result<i32> {
        let bound = self.bound()?;
        if bound.user != msg.user || bound.function != msg.function {
            return Err(Error::FunctionMismatch {
                bound: format!("{}/{}", bound.user, bound.function),
                requested: msg.func_str(),
            });
        }

        let stack_top = self.thread_stacks().get(pool_idx).copied();
        if let Some(key) = msg.snapshot_key.as_deref().filter(|k| !k.is_empty()) {
            self.ignore_thread_stacks_in_snapshot(key)?;
        }

        let ctx = ExecutionContext::new(self, std::mem::take(msg));
        let result = ctx.enter(|ctx| {
            let stack_top = || stack_top.ok_or(Error::NoThreadStack(pool_idx));
            match (ty, subtype) {
                (BatchType::Threads, ThreadRequestType::Pthread) => {
                    self.backend.execute_pthread(pool_idx, stack_top()?, ctx)
                }
                (BatchType::Threads, ThreadRequestType::OpenMp) => {
                    let stack_top = stack_top()?;
                    openmp::with_level(level.unwrap_or_default(), || {
                        self.backend.execute_omp(pool_idx, stack_top, ctx)
                    })
                }
                (BatchType::Threads, ThreadRequestType::Unknown) => {
                    Err(Error::UnknownThreadSubtype)
                }
                (BatchType::Functions, _) => {
                    let rv = self.backend.execute_function(ctx)?;
                    self.delete_app_snapshot(&ctx.message())?;
                    Ok(rv)
                }
            }
        });
        *msg = ctx.into_message();
        result
    }
}
