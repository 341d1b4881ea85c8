use super::WasmModule;
use crate::error::{Error, Result};
use crate::message::{
    generate_gid, BatchExecuteRequest, BatchType, Message, ThreadRequestType,
};
use crate::threads::PthreadCall;

impl WasmModule {
    /// Records a `pthread_create` made by the guest. Calls are dispatched in
    /// one batch on the next join.
    pub fn queue_pthread_call(&self, call: PthreadCall) {
        log::trace!(
            "queueing pthread {:#x} entry {} args {:#x}",
            call.pthread_ptr,
            call.entry_func,
            call.args_ptr
        );
        self.pthreads.lock().unwrap().queue.push(call);
    }

    /// Number of queued calls not yet dispatched.
    pub fn pending_pthread_calls(&self) -> usize {
        self.pthreads.lock().unwrap().queue.len()
    }

    /// Number of dispatched calls not yet joined.
    pub fn awaiting_pthread_calls(&self) -> usize {
        self.pthreads.lock().unwrap().call_ids.len()
    }

    /// Joins the thread with handle `pthread_ptr` and returns its result.
    ///
    /// Any queued calls are first sent to the scheduler as one batch. Once
    /// the last dispatched thread is joined, memory is synced from the app
    /// snapshot the threads merged their writes into.
    pub fn await_pthread_call(&self, msg: &Message, pthread_ptr: u32) -> Result<i32> {
        let queued = std::mem::take(&mut self.pthreads.lock().unwrap().queue);
        if !queued.is_empty() {
            if let Err(e) = self.dispatch_pthread_calls(msg, &queued) {
                // Undispatched calls go back in front of any queued since.
                let mut state = self.pthreads.lock().unwrap();
                let later = std::mem::replace(&mut state.queue, queued);
                state.queue.extend(later);
                return Err(e);
            }
        }

        let call_id = self
            .pthreads
            .lock()
            .unwrap()
            .call_ids
            .get(&pthread_ptr)
            .copied()
            .ok_or(Error::UnknownPthread(pthread_ptr))?;

        log::debug!("awaiting pthread {pthread_ptr:#x} (call {call_id})");
        let result = self
            .platform
            .scheduler
            .await_thread_result(call_id, self.config().thread_result_timeout())?;

        let all_joined = {
            let mut state = self.pthreads.lock().unwrap();
            state.call_ids.remove(&pthread_ptr);
            state.call_ids.is_empty()
        };
        if all_joined {
            self.sync_app_snapshot(msg)?;
        }
        Ok(result)
    }

    fn dispatch_pthread_calls(&self, msg: &Message, calls: &[PthreadCall]) -> Result<()> {
        let key = self.get_or_create_app_snapshot(msg, true)?;
        self.ignore_thread_stacks_in_snapshot(&key)?;

        let group_id = generate_gid();
        let group_size = calls.len() as u32;
        let messages: Vec<Message> = calls
            .iter()
            .zip(1..)
            .map(|(call, group_idx)| Message {
                id: generate_gid(),
                app_id: msg.app_id,
                app_idx: msg.app_idx,
                user: msg.user.clone(),
                function: msg.function.clone(),
                snapshot_key: Some(key.clone()),
                func_ptr: call.entry_func,
                input_data: call.args_ptr.to_string(),
                group_id,
                group_idx,
                group_size,
                ..Message::default()
            })
            .collect();
        let call_ids: Vec<u32> = messages.iter().map(|m| m.id).collect();

        let req = BatchExecuteRequest::new(BatchType::Threads, messages)
            .with_subtype(ThreadRequestType::Pthread);
        log::debug!("dispatching {group_size} pthreads in group {group_id}");
        self.platform.scheduler.call_functions(req)?;

        let mut state = self.pthreads.lock().unwrap();
        state
            .call_ids
            .extend(calls.iter().map(|c| c.pthread_ptr).zip(call_ids));
        Ok(())
    }
}
