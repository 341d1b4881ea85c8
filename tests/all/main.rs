mod dispatch;
mod memory;
mod snapshot;
mod stdout;

use faaslet::pages::WASM_PAGE_SIZE;
use faaslet::snapshot::SnapshotDiff;
use faaslet::{
    Backend, BatchExecuteRequest, Config, ExecutionContext, GuestMemory, LinearMemory, Message,
    Platform, Scheduler, SnapshotRegistry, WasmModule,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Largest memory test guests get.
pub(crate) const TEST_MAX_MEMORY: usize = 64 * 1024 * 1024;

/// Pages a test guest starts with once bound.
pub(crate) const INITIAL_PAGES: usize = 4;

/// Where remote pthreads in [`MockScheduler`] write their results.
pub(crate) const THREAD_OUTPUT: u32 = 1024;

/// Entry point a [`TestBackend`] was asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Entry {
    Main,
    Omp { thread_idx: usize, stack_top: u32 },
    Pthread { thread_idx: usize, stack_top: u32 },
}

type Guest = dyn Fn(&ExecutionContext<'_>, Entry) -> faaslet::Result<i32> + Send + Sync;

/// A backend whose "guest" is a Rust closure working on a real
/// [`LinearMemory`].
pub(crate) struct TestBackend {
    memory: LinearMemory,
    guest: Box<Guest>,
    binds: AtomicUsize,
}

impl TestBackend {
    pub(crate) fn new(
        guest: impl Fn(&ExecutionContext<'_>, Entry) -> faaslet::Result<i32>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        TestBackend {
            memory: LinearMemory::with_maximum(TEST_MAX_MEMORY).unwrap(),
            guest: Box::new(guest),
            binds: AtomicUsize::new(0),
        }
    }

    /// A guest whose every entry point returns zero.
    pub(crate) fn noop() -> Self {
        Self::new(|_, _| Ok(0))
    }
}

impl Backend for TestBackend {
    fn memory(&self) -> &dyn GuestMemory {
        &self.memory
    }

    fn bind(&self, _msg: &Message, _cache: bool) -> faaslet::Result<()> {
        if self.binds.fetch_add(1, SeqCst) == 0 {
            self.memory.grow(INITIAL_PAGES * WASM_PAGE_SIZE)?;
        }
        Ok(())
    }

    fn execute_function(&self, ctx: &ExecutionContext<'_>) -> faaslet::Result<i32> {
        (self.guest)(ctx, Entry::Main)
    }

    fn execute_omp(
        &self,
        thread_idx: usize,
        stack_top: u32,
        ctx: &ExecutionContext<'_>,
    ) -> faaslet::Result<i32> {
        (self.guest)(ctx, Entry::Omp { thread_idx, stack_top })
    }

    fn execute_pthread(
        &self,
        thread_idx: usize,
        stack_top: u32,
        ctx: &ExecutionContext<'_>,
    ) -> faaslet::Result<i32> {
        (self.guest)(ctx, Entry::Pthread { thread_idx, stack_top })
    }
}

/// Records what is sent to it. Thread batches carrying a snapshot key are
/// "run remotely": every thread writes `10 * group_idx` at
/// `THREAD_OUTPUT + 4 * (group_idx - 1)` of the snapshot and returns its
/// group index.
#[derive(Default)]
pub(crate) struct MockScheduler {
    registry: Arc<SnapshotRegistry>,
    pub(crate) batches: Mutex<Vec<BatchExecuteRequest>>,
    pub(crate) results: Mutex<HashMap<u32, i32>>,
    pub(crate) awaited: Mutex<Vec<(u32, Duration)>>,
    pub(crate) deleted: Mutex<Vec<String>>,
    pub(crate) flushes: AtomicUsize,
}

impl MockScheduler {
    pub(crate) fn new(registry: Arc<SnapshotRegistry>) -> Self {
        MockScheduler {
            registry,
            ..Default::default()
        }
    }

    pub(crate) fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

impl Scheduler for MockScheduler {
    fn call_functions(&self, req: BatchExecuteRequest) -> anyhow::Result<()> {
        let mut results = self.results.lock().unwrap();
        for msg in &req.messages {
            results.insert(msg.id, msg.group_idx as i32);
            if let Some(key) = &msg.snapshot_key {
                let snap = self.registry.get(key)?;
                let value = 10 * msg.group_idx;
                snap.queue_diffs([SnapshotDiff::overwrite(
                    THREAD_OUTPUT + 4 * (msg.group_idx - 1),
                    value.to_le_bytes().to_vec(),
                )]);
            }
        }
        self.batches.lock().unwrap().push(req);
        Ok(())
    }

    fn await_thread_result(&self, call_id: u32, timeout: Duration) -> anyhow::Result<i32> {
        self.awaited.lock().unwrap().push((call_id, timeout));
        self.results
            .lock()
            .unwrap()
            .get(&call_id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no result for call {call_id}"))
    }

    fn broadcast_snapshot_delete(&self, _msg: &Message, key: &str) -> anyhow::Result<()> {
        self.deleted.lock().unwrap().push(key.to_string());
        Ok(())
    }

    fn broadcast_flush(&self) -> anyhow::Result<()> {
        self.flushes.fetch_add(1, SeqCst);
        Ok(())
    }
}

/// Everything a test needs around one module.
pub(crate) struct Harness {
    pub(crate) registry: Arc<SnapshotRegistry>,
    pub(crate) scheduler: Arc<MockScheduler>,
    pub(crate) config: Config,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let _ = env_logger::try_init();
        let registry = Arc::new(SnapshotRegistry::new());
        let scheduler = Arc::new(MockScheduler::new(registry.clone()));
        let mut config = Config::new();
        config.with_thread_pool_size(2);
        Harness {
            registry,
            scheduler,
            config,
        }
    }

    pub(crate) fn platform(&self) -> Platform {
        Platform::new(
            self.config.clone(),
            self.registry.clone(),
            self.scheduler.clone(),
        )
    }

    pub(crate) fn module(&self, backend: TestBackend) -> WasmModule {
        WasmModule::new(Box::new(backend), self.platform())
    }

    /// A module bound to `u/f`.
    pub(crate) fn bound_module(&self, backend: TestBackend) -> WasmModule {
        let module = self.module(backend);
        module.bind(&Message::new("u", "f"), false).unwrap();
        module
    }
}

pub(crate) fn write_guest(module: &WasmModule, ptr: u32, bytes: &[u8]) {
    let end = ptr as usize + bytes.len();
    assert!(end <= module.memory().current_brk() as usize);
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), module.guest_to_host(ptr), bytes.len()) }
}

pub(crate) fn read_guest(module: &WasmModule, ptr: u32, len: usize) -> Vec<u8> {
    let end = ptr as usize + len;
    assert!(end <= module.memory().current_brk() as usize);
    unsafe { std::slice::from_raw_parts(module.guest_to_host(ptr), len).to_vec() }
}

pub(crate) fn read_u32(module: &WasmModule, ptr: u32) -> u32 {
    let bytes = read_guest(module, ptr, 4);
    u32::from_le_bytes(bytes.try_into().unwrap())
}

/// Whether the host range `[addr, addr + len)` is mapped read-only,
/// according to `/proc/self/maps`.
pub(crate) fn is_read_only(addr: usize, len: usize) -> bool {
    let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
    let mut covered = addr;
    let end = addr + len;
    for line in maps.lines() {
        let mut parts = line.split_whitespace();
        let (Some(range), Some(perms)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Some((lo, hi)) = range.split_once('-') else {
            continue;
        };
        let lo = usize::from_str_radix(lo, 16).unwrap();
        let hi = usize::from_str_radix(hi, 16).unwrap();
        if lo <= covered && covered < hi {
            if !perms.starts_with("r-") {
                return false;
            }
            covered = hi;
            if covered >= end {
                return true;
            }
        }
    }
    false
}
