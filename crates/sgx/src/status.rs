//! Status codes crossing the enclave boundary.
//!
//! ECALLs report two codes: the SGX runtime's status for entering and
//! leaving the enclave, and the status the code inside the enclave returned.
//! When an OCALL made from inside the enclave fails, the inner status carries
//! the OCALL's SGX status with [`OCALL_ERROR_FLAG`] set.

/// The SGX runtime call succeeded.
pub const SGX_SUCCESS: u32 = 0;
/// An argument passed to the SGX runtime was invalid.
pub const SGX_ERROR_INVALID_PARAMETER: u32 = 0x0002;
/// The enclave id does not name a live enclave.
pub const SGX_ERROR_INVALID_ENCLAVE_ID: u32 = 0x2002;
/// The SGX device is unavailable.
pub const SGX_ERROR_NO_DEVICE: u32 = 0x2006;
/// The enclave image could not be opened.
pub const SGX_ERROR_ENCLAVE_FILE_ACCESS: u32 = 0x200f;

/// The code inside the enclave succeeded.
pub const SUCCESS: u32 = 0;
/// The machine cannot run enclaves.
pub const NOT_SUPPORTED: u32 = 1;
/// The Wasm runtime inside the enclave failed to start.
pub const WAMR_INIT_FAILED: u32 = 2;
/// The module could not be loaded or instantiated.
pub const MODULE_LOAD_FAILED: u32 = 3;
/// The guest trapped or returned an error.
pub const EXECUTION_FAILED: u32 = 4;

/// Bit marking an inner status as a failed OCALL.
pub const OCALL_ERROR_FLAG: u32 = 1 << 31;

/// Inner status reporting that an OCALL failed with `sgx_status`.
pub fn ocall_error(sgx_status: u32) -> u32 {
    OCALL_ERROR_FLAG | sgx_status
}

/// The SGX status of the failed OCALL encoded in `status`, if any.
pub fn ocall_sgx_error(status: u32) -> Option<u32> {
    if status & OCALL_ERROR_FLAG != 0 {
        Some(status & !OCALL_ERROR_FLAG)
    } else {
        None
    }
}

/// Human-readable name of an SGX runtime status.
pub fn sgx_error_string(status: u32) -> &'static str {
    match status {
        SGX_SUCCESS => "success",
        SGX_ERROR_INVALID_PARAMETER => "invalid parameter",
        SGX_ERROR_INVALID_ENCLAVE_ID => "invalid enclave id",
        SGX_ERROR_NO_DEVICE => "no SGX device",
        SGX_ERROR_ENCLAVE_FILE_ACCESS => "cannot access enclave image",
        _ => "unknown SGX error",
    }
}

/// Human-readable name of an inner status.
pub fn status_string(status: u32) -> &'static str {
    match status {
        SUCCESS => "success",
        NOT_SUPPORTED => "SGX not supported",
        WAMR_INIT_FAILED => "WAMR initialisation failed",
        MODULE_LOAD_FAILED => "module load failed",
        EXECUTION_FAILED => "execution failed",
        s if ocall_sgx_error(s).is_some() => "OCALL failed",
        _ => "unknown error",
    }
}
