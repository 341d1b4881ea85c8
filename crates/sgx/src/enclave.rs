use crate::runtime::{EcallResult, EnclaveId, EnclaveRuntime};
use crate::status;
use faaslet::{Error, Result};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One SGX enclave running the WAMR interpreter with at most one Wasm module
/// loaded at a time.
///
/// The enclave moves from no enclave (id 0), to created, to holding a module,
/// and back to no enclave on [`WamrEnclave::teardown`]. The bytes of the
/// loaded module are kept outside the enclave so callers can skip reloading
/// the module they already have; they are only updated once the enclave has
/// confirmed a load or an unload.
pub struct WamrEnclave {
    runtime: Box<dyn EnclaveRuntime>,
    image_path: PathBuf,
    id: EnclaveId,
    loaded_bytes: Vec<u8>,
}

impl WamrEnclave {
    /// An enclave that will be created from the image at `image_path` on
    /// [`WamrEnclave::init`].
    pub fn new(runtime: Box<dyn EnclaveRuntime>, image_path: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            image_path: image_path.into(),
            id: 0,
            loaded_bytes: Vec::new(),
        }
    }

    /// Creates the enclave and starts WAMR inside it. Does nothing when the
    /// enclave already exists.
    pub fn init(&mut self) -> Result<()> {
        if self.id != 0 {
            log::debug!("SGX enclave already exists ({})", self.id);
            return Ok(());
        }

        if !cfg!(feature = "sim-mode") {
            let support = self.runtime.sgx_support();
            if support != status::SUCCESS {
                log::error!(
                    "machine doesn't support SGX: {}",
                    status::status_string(support)
                );
                return Err(Error::EnclaveUnsupported(support));
            }
        }

        if !self.image_path.exists() {
            log::error!("enclave image {} does not exist", self.image_path.display());
            return Err(Error::EnclaveImageMissing(
                self.image_path.display().to_string(),
            ));
        }

        let id = self.runtime.create_enclave(&self.image_path).map_err(|sgx| {
            log::error!("unable to create enclave: {}", status::sgx_error_string(sgx));
            Error::EnclaveCreateFailed(sgx)
        })?;
        log::debug!("created SGX enclave {id}");
        self.id = id;

        let result = self.runtime.init_wamr(id);
        if let Err(e) = check(result, Error::EnclaveInitFailed) {
            // A half-initialised enclave is of no use; start over next time.
            if let Err(teardown) = self.teardown() {
                log::error!("failed to destroy enclave after init failure: {teardown}");
            }
            return Err(e);
        }

        log::debug!("initialised WAMR in SGX enclave {id}");
        Ok(())
    }

    /// Destroys the enclave and forgets the loaded module. Does nothing
    /// when there is no enclave.
    pub fn teardown(&mut self) -> Result<()> {
        if self.id == 0 {
            return Ok(());
        }

        log::debug!("destroying enclave {}", self.id);
        let sgx = self.runtime.destroy_enclave(self.id);
        if sgx != status::SGX_SUCCESS {
            log::error!(
                "unable to destroy enclave {}: {}",
                self.id,
                status::sgx_error_string(sgx)
            );
            return Err(Error::EnclaveDestroyFailed(sgx));
        }

        self.id = 0;
        self.loaded_bytes.clear();
        Ok(())
    }

    /// Whether the enclave exists.
    pub fn is_set_up(&self) -> bool {
        self.id != 0
    }

    /// The SGX id of the enclave; 0 when there is none.
    pub fn id(&self) -> EnclaveId {
        self.id
    }

    /// Whether any module is loaded.
    pub fn is_any_wasm_loaded(&self) -> bool {
        !self.loaded_bytes.is_empty()
    }

    /// Whether the loaded module is exactly `wasm`.
    pub fn is_wasm_loaded(&self, wasm: &[u8]) -> bool {
        self.loaded_bytes == wasm
    }

    /// Loads and instantiates `wasm` inside the enclave.
    pub fn load_module(&mut self, wasm: Vec<u8>) -> Result<()> {
        let id = self.live_id()?;
        log::debug!("loading {} byte wasm module into enclave {id}", wasm.len());
        let result = self.runtime.load_module(id, &wasm);
        check(result, Error::EnclaveLoadFailed)?;
        self.loaded_bytes = wasm;
        Ok(())
    }

    /// Drops the module loaded inside the enclave.
    pub fn unload_module(&mut self) -> Result<()> {
        let id = self.live_id()?;
        log::debug!("unloading wasm module from enclave {id}");
        let result = self.runtime.unload_module(id);
        check(result, Error::EnclaveUnloadFailed)?;
        self.loaded_bytes.clear();
        Ok(())
    }

    /// Runs the loaded module's entry point.
    pub fn call_main(&mut self) -> Result<()> {
        let id = self.live_id()?;
        let result = self.runtime.call_function(id);
        check(result, Error::EnclaveExecutionFailed)
    }

    fn live_id(&self) -> Result<EnclaveId> {
        if self.id == 0 {
            log::error!("no enclave has been created");
            return Err(Error::EnclaveEntryFailed(status::SGX_ERROR_INVALID_ENCLAVE_ID));
        }
        Ok(self.id)
    }
}

impl Drop for WamrEnclave {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("failed to tear down enclave: {e}");
        }
    }
}

/// Turns the two statuses of an ECALL into a result. A failed OCALL is
/// reported as such; any other inner failure through `inner`.
fn check(result: EcallResult, inner: fn(u32) -> Error) -> Result<()> {
    if result.sgx != status::SGX_SUCCESS {
        log::error!(
            "unable to enter enclave: {}",
            status::sgx_error_string(result.sgx)
        );
        return Err(Error::EnclaveEntryFailed(result.sgx));
    }

    if result.status != status::SUCCESS {
        if let Some(sgx) = status::ocall_sgx_error(result.status) {
            log::error!("an OCALL failed: {}", status::sgx_error_string(sgx));
            return Err(Error::OcallFailed(sgx));
        }
        log::error!("enclave call failed: {}", status::status_string(result.status));
        return Err(inner(result.status));
    }

    Ok(())
}

static ENCLAVE: Mutex<Option<WamrEnclave>> = Mutex::new(None);

/// Exclusive access to the process-wide enclave.
///
/// Holding the guard holds the process-wide enclave lock; every other
/// caller of [`acquire_global_enclave`] blocks until it is dropped.
pub struct EnclaveGuard {
    inner: MutexGuard<'static, Option<WamrEnclave>>,
}

impl Deref for EnclaveGuard {
    type Target = WamrEnclave;

    fn deref(&self) -> &WamrEnclave {
        match &*self.inner {
            Some(enclave) => enclave,
            None => unreachable!("enclave guard without enclave"),
        }
    }
}

impl DerefMut for EnclaveGuard {
    fn deref_mut(&mut self) -> &mut WamrEnclave {
        match &mut *self.inner {
            Some(enclave) => enclave,
            None => unreachable!("enclave guard without enclave"),
        }
    }
}

impl Drop for EnclaveGuard {
    fn drop(&mut self) {
        log::trace!("unlocking WAMR enclave");
    }
}

/// Locks the process-wide enclave, creating it from the default image with
/// the default runtime if needed.
pub fn acquire_global_enclave() -> Result<EnclaveGuard> {
    acquire_global_enclave_with(Path::new(crate::DEFAULT_ENCLAVE_PATH), crate::default_runtime)
}

/// Locks the process-wide enclave and makes sure it is initialised.
///
/// `runtime` and `image_path` are only used the first time the enclave is
/// acquired; later calls reuse the enclave created then.
pub fn acquire_global_enclave_with(
    image_path: &Path,
    runtime: impl FnOnce() -> Box<dyn EnclaveRuntime>,
) -> Result<EnclaveGuard> {
    log::trace!("locking WAMR enclave");
    let mut inner = ENCLAVE.lock().unwrap_or_else(PoisonError::into_inner);
    let enclave = inner.get_or_insert_with(|| WamrEnclave::new(runtime(), image_path));
    enclave.init()?;
    Ok(EnclaveGuard { inner })
}

/// Gives up access to the process-wide enclave.
pub fn release_global_enclave(guard: EnclaveGuard) {
    drop(guard);
}
