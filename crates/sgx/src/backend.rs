use crate::enclave::acquire_global_enclave_with;
use crate::runtime::EnclaveRuntime;
use faaslet::{Backend, Error, ExecutionContext, GuestMemory, Message, Result};
use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Source of the Wasm binaries of functions.
pub trait ModuleLoader: Send + Sync {
    /// The Wasm binary of the function named by `msg`.
    fn load_function_wasm(&self, msg: &Message) -> anyhow::Result<Vec<u8>>;
}

/// Guest memory of an enclave guest. It lives inside the enclave, so the
/// host can neither see nor resize it.
struct EnclaveMemory;

impl GuestMemory for EnclaveMemory {
    fn grow(&self, _n_bytes: usize) -> Result<u32> {
        Err(Error::Unsupported("growing enclave memory"))
    }

    fn shrink(&self, _n_bytes: u32) -> Result<()> {
        Err(Error::Unsupported("shrinking enclave memory"))
    }

    fn mmap_file(&self, _fd: BorrowedFd<'_>, _length: usize) -> Result<u32> {
        Err(Error::Unsupported("mapping files into enclave memory"))
    }

    fn unmap(&self, _offset: u32, _n_bytes: u32) -> Result<()> {
        Err(Error::Unsupported("unmapping enclave memory"))
    }

    fn base(&self) -> *mut u8 {
        NonNull::dangling().as_ptr()
    }

    fn size_bytes(&self) -> usize {
        0
    }

    fn current_brk(&self) -> u32 {
        0
    }

    fn max_bytes(&self) -> usize {
        0
    }

    fn create_guard_region(&self, _offset: u32) -> Result<u32> {
        Err(Error::Unsupported("guard regions in enclave memory"))
    }
}

/// Runs guests inside the process-wide enclave.
///
/// Binding loads the function's module into the enclave unless it is
/// already there. Each execution re-checks this, since other modules in the
/// process share the enclave and may have swapped the module out.
pub struct EnclaveBackend {
    loader: Box<dyn ModuleLoader>,
    image_path: PathBuf,
    runtime: fn() -> Box<dyn EnclaveRuntime>,
    memory: EnclaveMemory,
    wasm: OnceLock<Vec<u8>>,
}

impl EnclaveBackend {
    /// A backend using the default enclave image and runtime.
    pub fn new(loader: Box<dyn ModuleLoader>) -> Self {
        Self::with_runtime(
            loader,
            PathBuf::from(crate::DEFAULT_ENCLAVE_PATH),
            crate::default_runtime,
        )
    }

    /// A backend creating the enclave, if nobody has yet, from `image_path`
    /// with `runtime`.
    pub fn with_runtime(
        loader: Box<dyn ModuleLoader>,
        image_path: PathBuf,
        runtime: fn() -> Box<dyn EnclaveRuntime>,
    ) -> Self {
        Self {
            loader,
            image_path,
            runtime,
            memory: EnclaveMemory,
            wasm: OnceLock::new(),
        }
    }

    fn ensure_loaded(&self, wasm: &[u8]) -> Result<crate::EnclaveGuard> {
        let mut enclave = acquire_global_enclave_with(&self.image_path, self.runtime)?;
        if !enclave.is_wasm_loaded(wasm) {
            if enclave.is_any_wasm_loaded() {
                enclave.unload_module()?;
            }
            enclave.load_module(wasm.to_vec())?;
        } else {
            log::debug!("module already loaded in enclave {}", enclave.id());
        }
        Ok(enclave)
    }
}

impl Backend for EnclaveBackend {
    fn memory(&self) -> &dyn GuestMemory {
        &self.memory
    }

    fn bind(&self, msg: &Message, cache: bool) -> Result<()> {
        log::debug!("binding {} in enclave (cache={cache})", msg.func_str());
        let wasm = self.loader.load_function_wasm(msg)?;
        drop(self.ensure_loaded(&wasm)?);
        if self.wasm.set(wasm).is_err() {
            log::warn!("enclave backend bound twice, keeping first module");
        }
        Ok(())
    }

    fn execute_function(&self, ctx: &ExecutionContext<'_>) -> Result<i32> {
        let wasm = self.wasm.get().ok_or(Error::NotBound)?;
        let mut enclave = self.ensure_loaded(wasm)?;
        log::debug!("executing {} in enclave {}", ctx.message().func_str(), enclave.id());
        enclave.call_main()?;
        Ok(0)
    }

    fn execute_omp(
        &self,
        _thread_idx: usize,
        _stack_top: u32,
        _ctx: &ExecutionContext<'_>,
    ) -> Result<i32> {
        Err(Error::Unsupported("OpenMP in an enclave"))
    }

    fn execute_pthread(
        &self,
        _thread_idx: usize,
        _stack_top: u32,
        _ctx: &ExecutionContext<'_>,
    ) -> Result<i32> {
        Err(Error::Unsupported("pthreads in an enclave"))
    }

    fn supports_threads(&self) -> bool {
        false
    }

    fn reset(&self, msg: &Message, _snapshot_key: &str) -> Result<()> {
        log::debug!("enclave guests keep no host state to reset for {}", msg.func_str());
        Ok(())
    }
}
