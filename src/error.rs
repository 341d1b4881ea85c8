use thiserror::Error;

/// Result alias used throughout the faaslet crates.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while hosting a guest.
///
/// Memory, guard, snapshot and enclave failures are fatal to the invocation
/// that hit them. Failures of external collaborators (scheduler, state
/// service, loader) are carried unchanged in [`Error::External`].
#[derive(Error, Debug)]
pub enum Error {
    /// The operation requires a module bound to a function.
    #[error("module is not bound to a function")]
    NotBound,

    /// The module was already bound and cannot be rebound.
    #[error("module is already bound to {user}/{function}")]
    AlreadyBound {
        /// User of the existing binding.
        user: String,
        /// Function of the existing binding.
        function: String,
    },

    /// A message was dispatched to a module bound to a different function.
    #[error("module bound to {bound} cannot execute {requested}")]
    FunctionMismatch {
        /// `user/function` the module is bound to.
        bound: String,
        /// `user/function` of the message.
        requested: String,
    },

    /// Growing guest memory would exceed its maximum size.
    #[error("cannot grow guest memory by {requested:#x} bytes past break {brk:#x} (max {max:#x})")]
    OutOfMemory {
        /// Bytes requested, rounded up to a Wasm page.
        requested: usize,
        /// Break at the time of the request.
        brk: u32,
        /// Maximum size of the memory.
        max: usize,
    },

    /// Shrinking guest memory by more than its current break.
    #[error("cannot shrink guest memory by {requested:#x} bytes, break is {brk:#x}")]
    InvalidShrink {
        /// Bytes requested.
        requested: u32,
        /// Break at the time of the request.
        brk: u32,
    },

    /// A guest range lies outside the live region of memory.
    #[error("guest range {ptr:#x}+{len:#x} is out of bounds")]
    OutOfBounds {
        /// Start of the range.
        ptr: u32,
        /// Length of the range.
        len: usize,
    },

    /// A guest unmap did not start on a page boundary.
    #[error("cannot unmap guest memory at unaligned offset {0:#x}")]
    UnalignedUnmap(u32),

    /// A thread task targeted a pool slot without a stack.
    #[error("no thread stack for pool index {0}")]
    NoThreadStack(usize),

    /// Protecting a guard region failed.
    #[error("failed to create guard region at {offset:#x}")]
    GuardFailed {
        /// Guest offset of the guard region.
        offset: u32,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A host memory mapping operation failed.
    #[error("{context}")]
    Mmap {
        /// What was being attempted.
        context: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A thread batch carried a subtype the dispatcher does not handle.
    #[error("unknown thread request subtype")]
    UnknownThreadSubtype,

    /// An app-wide snapshot key was requested for a message without app id.
    #[error("message {0} has no app id")]
    MissingAppId(u32),

    /// Writing captured stdout failed.
    #[error("failed capturing stdout (errno {0})")]
    CaptureFailed(i32),

    /// A pthread handle was joined that was never spawned.
    #[error("no pending pthread call for handle {0:#x}")]
    UnknownPthread(u32),

    /// No snapshot is registered under the key.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    /// A diff or resize would go past the snapshot's maximum size.
    #[error("snapshot write of {len:#x} bytes at {offset:#x} exceeds max size {max:#x}")]
    SnapshotOverflow {
        /// Offset of the write.
        offset: usize,
        /// Length of the write.
        len: usize,
        /// Maximum size of the snapshot.
        max: usize,
    },

    /// A merge region does not fit its data type.
    #[error("invalid merge region at {offset:#x}: {reason}")]
    InvalidMergeRegion {
        /// Offset of the region.
        offset: u32,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The backend does not support the operation.
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    /// The host machine has no enclave support.
    #[error("machine does not support SGX (status {0:#x})")]
    EnclaveUnsupported(u32),

    /// The signed enclave image is missing.
    #[error("enclave image {0} does not exist")]
    EnclaveImageMissing(String),

    /// Creating the enclave failed.
    #[error("unable to create enclave (sgx status {0:#x})")]
    EnclaveCreateFailed(u32),

    /// An ECALL could not enter the enclave.
    #[error("unable to enter enclave (sgx status {0:#x})")]
    EnclaveEntryFailed(u32),

    /// Initialising the Wasm runtime inside the enclave failed.
    #[error("unable to initialise WAMR in enclave (status {0:#x})")]
    EnclaveInitFailed(u32),

    /// Loading a module into the enclave failed.
    #[error("unable to load wasm module into enclave (status {0:#x})")]
    EnclaveLoadFailed(u32),

    /// Unloading the enclave's module failed.
    #[error("unable to unload wasm module from enclave (status {0:#x})")]
    EnclaveUnloadFailed(u32),

    /// The guest failed while executing inside the enclave.
    #[error("error during enclave function execution (status {0:#x})")]
    EnclaveExecutionFailed(u32),

    /// An OCALL made by the enclave failed.
    #[error("an OCALL failed (sgx status {0:#x})")]
    OcallFailed(u32),

    /// Destroying the enclave failed.
    #[error("unable to destroy enclave (sgx status {0:#x})")]
    EnclaveDestroyFailed(u32),

    /// Generic backend failure carrying the backend's return value.
    #[error("backend failed with return value {0}")]
    BackendFailed(i32),

    /// Failure of an external collaborator, propagated as-is.
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn mmap(context: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        Error::Mmap {
            context: context.into(),
            source: source.into(),
        }
    }
}
