//! Trusted-enclave variant of the faaslet guest backend.
//!
//! Guests run inside a single SGX enclave hosting the WAMR interpreter. The
//! enclave is a process-wide resource: [`acquire_global_enclave`] hands out
//! exclusive access to it and creates it on first use. Only ECALLs and
//! OCALLs cross the enclave boundary, so the guest's memory is not visible
//! to the host and the backend supports neither snapshots nor threads.
//!
//! Without the `sgx` feature no SGX SDK is linked and every attempt to
//! create an enclave reports that the machine lacks SGX support.

#![deny(missing_docs)]

mod backend;
mod enclave;
mod runtime;
pub mod status;

pub use crate::backend::{EnclaveBackend, ModuleLoader};
pub use crate::enclave::{
    acquire_global_enclave, acquire_global_enclave_with, release_global_enclave, EnclaveGuard,
    WamrEnclave,
};
pub use crate::runtime::{EcallResult, EnclaveId, EnclaveRuntime, UnavailableRuntime};

cfg_if::cfg_if! {
    if #[cfg(feature = "sgx")] {
        mod ffi;
        pub use crate::ffi::SgxRuntime;

        /// Runtime used by [`acquire_global_enclave`].
        pub type DefaultRuntime = SgxRuntime;
    } else {
        /// Runtime used by [`acquire_global_enclave`].
        pub type DefaultRuntime = UnavailableRuntime;
    }
}

/// Location of the signed enclave image.
pub const DEFAULT_ENCLAVE_PATH: &str = "/usr/local/faaslet/lib/enclave.sign.so";

/// A boxed [`DefaultRuntime`].
pub fn default_runtime() -> Box<dyn EnclaveRuntime> {
    Box::new(DefaultRuntime::default())
}
