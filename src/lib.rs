//! Guest-instance lifecycle core for a serverless WebAssembly worker.
//!
//! A [`WasmModule`] hosts one untrusted guest program on top of a
//! [`Backend`] (the Wasm engine) and a [`GuestMemory`] (its linear memory).
//! Around that pair this crate provides:
//!
//! * page-granular memory growth with read-only guard regions,
//! * named snapshots of guest memory that can be restored and merged back
//!   together from diffs produced by other threads or hosts,
//! * a thread-local execution context for the call currently running,
//! * capture of guest stdout,
//! * mapping of external key-value state into the guest address space,
//! * pthread and OpenMP fan-out through an external [`Scheduler`].
//!
//! The trusted-enclave variant of the backend lives in the `faaslet-sgx`
//! crate.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod backend;
mod config;
mod context;
mod environment;
mod error;
mod executor;
mod memory;
mod message;
mod mmap;
mod module;
pub mod openmp;
pub mod pages;
mod scheduler;
pub mod snapshot;
mod state;
mod stdout;
mod threads;

pub use crate::backend::Backend;
pub use crate::config::Config;
pub use crate::context::{current_message, ExecutionContext};
pub use crate::environment::WasmEnvironment;
pub use crate::error::{Error, Result};
pub use crate::executor::Executor;
pub use crate::memory::{GuestMemory, LinearMemory};
pub use crate::message::{
    generate_gid, BatchExecuteRequest, BatchType, Message, ThreadRequestType,
};
pub use crate::module::{app_snapshot_key, Platform, WasmModule};
pub use crate::scheduler::Scheduler;
pub use crate::snapshot::registry::SnapshotRegistry;
pub use crate::snapshot::SnapshotData;
pub use crate::state::{AlignedChunk, StateKeyValue};
pub use crate::stdout::StdoutCapture;
pub use crate::threads::{PthreadCall, ThreadStacks};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
