use crate::status;
use std::path::Path;

/// Identifier the SGX runtime assigns to an enclave; zero means none.
pub type EnclaveId = u64;

/// Outcome of one ECALL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcallResult {
    /// SGX runtime status of entering and leaving the enclave.
    pub sgx: u32,
    /// Status returned by the code inside the enclave.
    pub status: u32,
}

impl EcallResult {
    /// Both statuses report success.
    pub const OK: EcallResult = EcallResult {
        sgx: status::SGX_SUCCESS,
        status: status::SUCCESS,
    };

    /// The enclave could not be entered.
    pub fn entry_failed(sgx: u32) -> Self {
        Self {
            sgx,
            status: status::SUCCESS,
        }
    }

    /// The enclave was entered and returned `status`.
    pub fn returned(status: u32) -> Self {
        Self {
            sgx: status::SGX_SUCCESS,
            status,
        }
    }
}

/// The SGX runtime and the ECALLs the enclave image exports.
pub trait EnclaveRuntime: Send {
    /// Whether this machine can run enclaves, as an inner status.
    fn sgx_support(&self) -> u32;

    /// Creates an enclave from the signed image at `image`.
    fn create_enclave(&self, image: &Path) -> Result<EnclaveId, u32>;

    /// Destroys enclave `id`, returning the SGX status.
    fn destroy_enclave(&self, id: EnclaveId) -> u32;

    /// Starts the Wasm runtime inside the enclave.
    fn init_wamr(&self, id: EnclaveId) -> EcallResult;

    /// Loads and instantiates `wasm` inside the enclave.
    fn load_module(&self, id: EnclaveId, wasm: &[u8]) -> EcallResult;

    /// Drops the module loaded inside the enclave.
    fn unload_module(&self, id: EnclaveId) -> EcallResult;

    /// Calls the loaded module's entry point.
    fn call_function(&self, id: EnclaveId) -> EcallResult;
}

/// Runtime for builds without the SGX SDK: no machine supports enclaves.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableRuntime;

impl EnclaveRuntime for UnavailableRuntime {
    fn sgx_support(&self) -> u32 {
        status::NOT_SUPPORTED
    }

    fn create_enclave(&self, _image: &Path) -> Result<EnclaveId, u32> {
        Err(status::SGX_ERROR_NO_DEVICE)
    }

    fn destroy_enclave(&self, _id: EnclaveId) -> u32 {
        status::SGX_ERROR_INVALID_ENCLAVE_ID
    }

    fn init_wamr(&self, _id: EnclaveId) -> EcallResult {
        EcallResult::entry_failed(status::SGX_ERROR_INVALID_ENCLAVE_ID)
    }

    fn load_module(&self, _id: EnclaveId, _wasm: &[u8]) -> EcallResult {
        EcallResult::entry_failed(status::SGX_ERROR_INVALID_ENCLAVE_ID)
    }

    fn unload_module(&self, _id: EnclaveId) -> EcallResult {
        EcallResult::entry_failed(status::SGX_ERROR_INVALID_ENCLAVE_ID)
    }

    fn call_function(&self, _id: EnclaveId) -> EcallResult {
        EcallResult::entry_failed(status::SGX_ERROR_INVALID_ENCLAVE_ID)
    }
}
