//! Bindings to the SGX SDK and the enclave image's ECALLs.

use crate::runtime::{EcallResult, EnclaveId, EnclaveRuntime};
use crate::status;
use std::ffi::{c_char, c_int, c_void, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

type LaunchToken = [u8; 1024];

// Set when enclaves are created for debugging.
const SGX_DEBUG_FLAG: c_int = 1;

#[cfg_attr(feature = "sim-mode", link(name = "sgx_urts_sim"))]
#[cfg_attr(not(feature = "sim-mode"), link(name = "sgx_urts"))]
extern "C" {
    fn sgx_create_enclave(
        file_name: *const c_char,
        debug: c_int,
        launch_token: *mut LaunchToken,
        launch_token_updated: *mut c_int,
        enclave_id: *mut EnclaveId,
        misc_attr: *mut c_void,
    ) -> u32;

    fn sgx_destroy_enclave(enclave_id: EnclaveId) -> u32;
}

extern "C" {
    fn faaslet_sgx_get_sgx_support() -> u32;
    fn enclave_init_wamr(enclave_id: EnclaveId, retval: *mut u32) -> u32;
    fn enclave_load_module(
        enclave_id: EnclaveId,
        retval: *mut u32,
        wasm: *const c_void,
        wasm_size: u32,
    ) -> u32;
    fn enclave_unload_module(enclave_id: EnclaveId, retval: *mut u32) -> u32;
    fn enclave_call_function(enclave_id: EnclaveId, retval: *mut u32) -> u32;
}

/// The real SGX runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct SgxRuntime;

fn ecall(f: impl FnOnce(*mut u32) -> u32) -> EcallResult {
    let mut status = status::SUCCESS;
    let sgx = f(&mut status);
    EcallResult { sgx, status }
}

impl EnclaveRuntime for SgxRuntime {
    fn sgx_support(&self) -> u32 {
        unsafe { faaslet_sgx_get_sgx_support() }
    }

    fn create_enclave(&self, image: &Path) -> Result<EnclaveId, u32> {
        let path = CString::new(image.as_os_str().as_bytes())
            .map_err(|_| status::SGX_ERROR_INVALID_PARAMETER)?;
        let mut token: LaunchToken = [0; 1024];
        let mut token_updated: c_int = 0;
        let mut id: EnclaveId = 0;
        let sgx = unsafe {
            sgx_create_enclave(
                path.as_ptr(),
                SGX_DEBUG_FLAG,
                &mut token,
                &mut token_updated,
                &mut id,
                std::ptr::null_mut(),
            )
        };
        if sgx != status::SGX_SUCCESS {
            return Err(sgx);
        }
        Ok(id)
    }

    fn destroy_enclave(&self, id: EnclaveId) -> u32 {
        unsafe { sgx_destroy_enclave(id) }
    }

    fn init_wamr(&self, id: EnclaveId) -> EcallResult {
        ecall(|ret| unsafe { enclave_init_wamr(id, ret) })
    }

    fn load_module(&self, id: EnclaveId, wasm: &[u8]) -> EcallResult {
        let Ok(len) = u32::try_from(wasm.len()) else {
            return EcallResult::entry_failed(status::SGX_ERROR_INVALID_PARAMETER);
        };
        ecall(|ret| unsafe { enclave_load_module(id, ret, wasm.as_ptr().cast(), len) })
    }

    fn unload_module(&self, id: EnclaveId) -> EcallResult {
        ecall(|ret| unsafe { enclave_unload_module(id, ret) })
    }

    fn call_function(&self, id: EnclaveId) -> EcallResult {
        ecall(|ret| unsafe { enclave_call_function(id, ret) })
    }
}
