use super::WasmModule;
use crate::error::{Error, Result};
use crate::message::{generate_gid, Message};
use crate::snapshot::{DataType, MergeOp, MergeRegion, SnapshotData};

/// Key of the snapshot shared by every call of `msg`'s application.
pub fn app_snapshot_key(msg: &Message) -> Result<String> {
    if msg.app_id == 0 {
        return Err(Error::MissingAppId(msg.id));
    }
    Ok(format!("{}_{}_{}", msg.user, msg.function, msg.app_id))
}

impl WasmModule {
    fn take_snapshot(&self) -> Result<SnapshotData> {
        let memory = self.memory();
        // SAFETY: snapshots are only taken while the guest is not running
        // on other threads.
        let live = unsafe { memory.live_bytes() };
        SnapshotData::from_bytes(live, memory.max_bytes())
    }

    /// Snapshots the live guest memory under a fresh key and returns the key.
    pub fn snapshot(&self) -> Result<String> {
        let bound = self.bound()?;
        let key = format!("{}_{}_{}", bound.user, bound.function, generate_gid());

        let _lock = self.module_lock.read().unwrap();
        let data = self.take_snapshot()?;
        self.platform.registry.register(&key, data);
        Ok(key)
    }

    /// Resets guest memory to the snapshot `key`.
    ///
    /// Memory grows or shrinks to the snapshot's size first; thread-stack
    /// guards covered by the snapshot are protected again afterwards.
    pub fn restore(&self, key: &str) -> Result<()> {
        self.bound()?;
        let snap = self.platform.registry.get(key)?;
        let memory = self.memory();

        let size = snap.size();
        let brk = memory.current_brk() as usize;
        if size > brk {
            memory.grow(size - brk)?;
        } else if size < brk {
            memory.shrink((brk - size) as u32)?;
        }

        // SAFETY: `[base, base + size)` is guest memory we own and the guest
        // is not running.
        unsafe { snap.map_to_memory(memory.base())? };

        if let Some(stacks) = self.thread_stacks.get() {
            stacks.reinstall_guards(memory, size)?;
        }
        log::debug!("restored snapshot {key} ({size:#x} bytes)");
        Ok(())
    }

    /// Ensures the app snapshot for `msg` exists and returns its key.
    ///
    /// The first caller takes the snapshot. Later callers with `update` set
    /// merge the current memory into it.
    pub fn get_or_create_app_snapshot(&self, msg: &Message, update: bool) -> Result<String> {
        let key = app_snapshot_key(msg)?;
        let _lock = self.module_lock.write().unwrap();

        let registry = &self.platform.registry;
        if !registry.exists(&key) {
            log::debug!("creating app snapshot {key}");
            let data = self.take_snapshot()?;
            registry.register(&key, data);
        } else if update {
            log::debug!("updating app snapshot {key}");
            let snap = registry.get(&key)?;
            // SAFETY: the guest's other threads are not running while the
            // main thread fans out or joins.
            let diffs = snap.diff_with_memory(unsafe { self.memory().live_bytes() });
            snap.queue_diffs(diffs);
            snap.write_queued_diffs()?;
        }
        Ok(key)
    }

    /// Makes merges into snapshot `key` skip the thread-stack band, so one
    /// thread's stack never overwrites another's.
    pub fn ignore_thread_stacks_in_snapshot(&self, key: &str) -> Result<()> {
        let Some((start, len)) = self.thread_stacks.get().and_then(|s| s.band()) else {
            log::debug!("no thread stacks to ignore in {key}");
            return Ok(());
        };

        let _lock = self.module_lock.read().unwrap();
        let snap = self.platform.registry.get(key)?;
        snap.add_merge_region(MergeRegion::new(start, len, DataType::Raw, MergeOp::Ignore))
    }

    /// Deletes the app snapshot of `msg` here and on every other host.
    /// Does nothing when there is none.
    pub fn delete_app_snapshot(&self, msg: &Message) -> Result<()> {
        if msg.app_id == 0 {
            return Ok(());
        }
        let key = app_snapshot_key(msg)?;

        let _lock = self.module_lock.write().unwrap();
        let registry = &self.platform.registry;
        if !registry.exists(&key) {
            return Ok(());
        }

        self.platform.scheduler.broadcast_snapshot_delete(msg, &key)?;
        registry.delete(&key);
        Ok(())
    }

    /// Writes the diffs queued on the app snapshot of `msg` and restores
    /// memory from it, making thread writes visible to the main thread.
    pub fn sync_app_snapshot(&self, msg: &Message) -> Result<()> {
        let key = app_snapshot_key(msg)?;
        let snap = {
            let _lock = self.module_lock.read().unwrap();
            self.platform.registry.get(&key)?
        };
        let written = snap.write_queued_diffs()?;
        log::debug!("syncing app snapshot {key} after {written} diffs");
        self.restore(&key)
    }

    /// Prepares the module for the next invocation: restores `snapshot_key`
    /// when given, drops captured stdout and lets the backend reset itself.
    pub fn reset(&self, msg: &Message, snapshot_key: &str) -> Result<()> {
        if !snapshot_key.is_empty() {
            self.restore(snapshot_key)?;
        }
        self.stdout.clear();
        self.backend.reset(msg, snapshot_key)
    }
}
