//! A bound guest program and everything the host keeps for it.

mod dispatch;
mod snapshots;
mod threads;

use crate::backend::Backend;
use crate::config::Config;
use crate::environment::{self, WasmEnvironment};
use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use crate::message::Message;
use crate::pages::round_up_page;
use crate::scheduler::Scheduler;
use crate::snapshot::registry::SnapshotRegistry;
use crate::state::{segment_key, AlignedChunk, StateKeyValue};
use crate::stdout::StdoutCapture;
use crate::threads::{PthreadState, ThreadStacks};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

pub use self::snapshots::app_snapshot_key;

/// Process-wide services a module works with.
#[derive(Clone)]
pub struct Platform {
    /// Settings shared by every module.
    pub config: Config,
    /// Where snapshots are registered.
    pub registry: Arc<SnapshotRegistry>,
    /// Where thread batches are sent.
    pub scheduler: Arc<dyn Scheduler>,
}

impl Platform {
    /// Bundles the services.
    pub fn new(
        config: Config,
        registry: Arc<SnapshotRegistry>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            config,
            registry,
            scheduler,
        }
    }
}

#[derive(Debug)]
struct BoundFunction {
    user: String,
    function: String,
}

#[derive(Debug, Default)]
struct Argv {
    args: Vec<String>,
    buffer_size: u32,
}

/// One guest program, bound at most once to a `(user, function)` pair.
///
/// The module owns the guest's [`Backend`] and layers on top of it the
/// lifecycle the worker needs: thread stacks, snapshots, stdout capture,
/// shared state and pthread fan-out. All operations take `&self`; a module
/// is shared between the threads of one guest.
pub struct WasmModule {
    backend: Box<dyn Backend>,
    platform: Platform,

    bound: OnceLock<BoundFunction>,
    thread_stacks: OnceLock<ThreadStacks>,

    // Serialises the app snapshot lifecycle.
    module_lock: RwLock<()>,

    // Insert-only.
    shared_mem_ptrs: RwLock<HashMap<String, u32>>,

    // Only ever touched by the guest's main thread.
    pthreads: Mutex<PthreadState>,

    stdout: StdoutCapture,
    argv: RwLock<Argv>,
    environment: WasmEnvironment,
}

impl WasmModule {
    /// Creates an unbound module running on `backend`.
    pub fn new(backend: Box<dyn Backend>, platform: Platform) -> Self {
        Self::with_environment(backend, platform, WasmEnvironment::new())
    }

    /// Creates an unbound module whose guest sees `environment`.
    pub fn with_environment(
        backend: Box<dyn Backend>,
        platform: Platform,
        environment: WasmEnvironment,
    ) -> Self {
        Self {
            backend,
            platform,
            bound: OnceLock::new(),
            thread_stacks: OnceLock::new(),
            module_lock: RwLock::new(()),
            shared_mem_ptrs: RwLock::new(HashMap::new()),
            pthreads: Mutex::new(PthreadState::default()),
            stdout: StdoutCapture::new(),
            argv: RwLock::new(Argv::default()),
            environment,
        }
    }

    /// Binds the module to the function named by `msg`, loading it into the
    /// backend, preparing `argv` and provisioning thread stacks.
    ///
    /// A module can only be bound once.
    pub fn bind(&self, msg: &Message, cache: bool) -> Result<()> {
        if let Some(bound) = self.bound.get() {
            return Err(Error::AlreadyBound {
                user: bound.user.clone(),
                function: bound.function.clone(),
            });
        }

        log::debug!("binding module to {}", msg.func_str());
        self.backend.bind(msg, cache)?;
        let binding = BoundFunction {
            user: msg.user.clone(),
            function: msg.function.clone(),
        };
        if self.bound.set(binding).is_err() {
            let bound = self.bound()?;
            return Err(Error::AlreadyBound {
                user: bound.user.clone(),
                function: bound.function.clone(),
            });
        }

        self.prepare_argv(msg);
        if self.backend.supports_threads() {
            self.create_thread_stacks()?;
        }
        Ok(())
    }

    /// Whether [`WasmModule::bind`] has succeeded.
    pub fn is_bound(&self) -> bool {
        self.bound.get().is_some()
    }

    /// User the module is bound to.
    pub fn bound_user(&self) -> Option<&str> {
        self.bound.get().map(|b| b.user.as_str())
    }

    /// Function the module is bound to.
    pub fn bound_function(&self) -> Option<&str> {
        self.bound.get().map(|b| b.function.as_str())
    }

    fn bound(&self) -> Result<&BoundFunction> {
        self.bound.get().ok_or(Error::NotBound)
    }

    /// The guest's engine.
    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    /// The guest's linear memory.
    pub fn memory(&self) -> &dyn GuestMemory {
        self.backend.memory()
    }

    /// Services shared with other modules.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Settings in effect.
    pub fn config(&self) -> &Config {
        &self.platform.config
    }

    /// Host address of guest pointer `ptr`.
    pub fn guest_to_host(&self, ptr: u32) -> *mut u8 {
        self.memory().guest_to_host(ptr)
    }

    /// Provisions one guarded stack per thread-pool slot. Does nothing when
    /// the stacks already exist.
    pub fn create_thread_stacks(&self) -> Result<&ThreadStacks> {
        if let Some(stacks) = self.thread_stacks.get() {
            return Ok(stacks);
        }
        let stacks = ThreadStacks::provision(self.memory(), self.config().thread_pool_size())?;
        Ok(self.thread_stacks.get_or_init(|| stacks))
    }

    /// Tops of the thread stacks in slot order; empty before binding.
    pub fn thread_stacks(&self) -> &[u32] {
        self.thread_stacks.get().map(|s| s.tops()).unwrap_or(&[])
    }

    /// Captured guest stdout.
    pub fn stdout(&self) -> &StdoutCapture {
        &self.stdout
    }

    /// Everything the guest wrote to stdout since the last clear.
    pub fn captured_stdout(&self) -> Result<String> {
        self.stdout.read_all()
    }

    /// Forgets captured stdout.
    pub fn clear_captured_stdout(&self) {
        self.stdout.clear();
    }

    fn prepare_argv(&self, msg: &Message) {
        let args = msg.argv();
        let buffer_size = environment::buffer_size(&args);
        *self.argv.write().unwrap() = Argv { args, buffer_size };
    }

    /// Number of arguments passed to `main`.
    pub fn argc(&self) -> u32 {
        self.argv.read().unwrap().args.len() as u32
    }

    /// Arguments passed to `main`.
    pub fn argv(&self) -> Vec<String> {
        self.argv.read().unwrap().args.clone()
    }

    /// Bytes needed to hold every argument with its NUL.
    pub fn argv_buffer_size(&self) -> u32 {
        self.argv.read().unwrap().buffer_size
    }

    /// Writes the arguments into guest memory for `args_get`.
    pub fn write_argv_to_memory(&self, argv_ptrs: u32, argv_buf: u32) -> Result<()> {
        let argv = self.argv.read().unwrap();
        environment::write_strings(self.memory(), &argv.args, argv_ptrs, argv_buf)
    }

    /// The guest's environment.
    pub fn environment(&self) -> &WasmEnvironment {
        &self.environment
    }

    /// Writes the environment into guest memory for `environ_get`.
    pub fn write_env_to_memory(&self, env_ptrs: u32, env_buf: u32) -> Result<()> {
        environment::write_strings(
            self.memory(),
            &self.environment.strings(),
            env_ptrs,
            env_buf,
        )
    }

    /// Maps `[offset, offset + length)` of the shared value `kv` into guest
    /// memory and returns the guest pointer to `offset`.
    ///
    /// The same value and range always yield the same pointer; only the
    /// first call grows memory.
    pub fn map_shared_state_memory(
        &self,
        kv: &dyn StateKeyValue,
        offset: usize,
        length: usize,
    ) -> Result<u32> {
        let key = segment_key(kv, offset, length);
        if let Some(ptr) = self.shared_mem_ptrs.read().unwrap().get(&key) {
            return Ok(*ptr);
        }

        let mut ptrs = self.shared_mem_ptrs.write().unwrap();
        if let Some(ptr) = ptrs.get(&key) {
            return Ok(*ptr);
        }

        let chunk = AlignedChunk::new(offset, length);
        let base = self.memory().grow(round_up_page(chunk.n_bytes_length))?;
        let host = NonNull::new(self.guest_to_host(base)).ok_or(Error::OutOfBounds {
            ptr: base,
            len: chunk.n_bytes_length,
        })?;
        kv.map_shared_memory(host, chunk.n_pages_offset, chunk.n_pages_length)?;

        let ptr = base + chunk.offset_remainder as u32;
        log::debug!("mapped state segment {key} at {ptr:#x}");
        ptrs.insert(key, ptr);
        Ok(ptr)
    }

    /// Logs the state of the guest.
    pub fn print_debug_info(&self) {
        log::debug!(
            "module bound to {:?}/{:?} with {} thread stacks",
            self.bound_user(),
            self.bound_function(),
            self.thread_stacks().len()
        );
        self.backend.print_debug_info();
    }
}
