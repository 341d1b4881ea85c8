//! Invocation messages and the batches the scheduler executes.

use crate::openmp;
use serde_derive::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Name `argv[0]` takes for every guest.
pub(crate) const ARGV0: &str = "function.wasm";

static NEXT_GID: AtomicU32 = AtomicU32::new(1);

/// Returns a process-unique, non-zero id for snapshots and thread groups.
pub fn generate_gid() -> u32 {
    NEXT_GID.fetch_add(1, Ordering::Relaxed)
}

/// One invocation of a guest function.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Message {
    /// Id of this call, used to look up its result.
    pub id: u32,
    /// Application this call belongs to; zero when it has none.
    pub app_id: u32,
    /// Index of this call within its application.
    pub app_idx: u32,
    /// Owner of the function.
    pub user: String,
    /// Name of the function.
    pub function: String,
    /// Snapshot to restore before running, if any.
    pub snapshot_key: Option<String>,
    /// Guest function-table index to call for thread messages.
    pub func_ptr: u32,
    /// Input passed to the guest. Carries the argument pointer for pthreads.
    pub input_data: String,
    /// Output produced by the guest.
    pub output_data: String,
    /// Id shared by every message of one thread group.
    pub group_id: u32,
    /// Position of this message in its group, starting at one.
    pub group_idx: u32,
    /// Number of messages in the group.
    pub group_size: u32,
    /// Command line passed to `main` after `argv[0]`.
    pub cmdline: String,
    /// Value returned by the guest.
    pub return_value: i32,
}

impl Message {
    /// Creates a message calling `function` owned by `user`.
    pub fn new(user: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            id: generate_gid(),
            user: user.into(),
            function: function.into(),
            ..Self::default()
        }
    }

    /// `user/function`, for logging.
    pub fn func_str(&self) -> String {
        format!("{}/{}", self.user, self.function)
    }

    /// The argument vector for `main`: `function.wasm` followed by the
    /// space-separated command line.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(ARGV0.to_string())
            .chain(self.cmdline.split(' ').filter(|s| !s.is_empty()).map(String::from))
            .collect()
    }
}

/// Kind of work a batch carries.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchType {
    /// Independent function calls.
    #[default]
    Functions,
    /// Threads of a single guest.
    Threads,
}

/// Threading model of a [`BatchType::Threads`] batch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThreadRequestType {
    /// Not a thread batch, or not yet known.
    #[default]
    Unknown,
    /// Spawned with `pthread_create`.
    Pthread,
    /// Workers of an OpenMP parallel section.
    OpenMp,
}

/// A set of messages submitted to the scheduler together.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BatchExecuteRequest {
    /// Id of the batch.
    pub id: u32,
    /// What the messages are.
    #[serde(rename = "type")]
    pub ty: BatchType,
    /// Threading model for thread batches.
    pub subtype: ThreadRequestType,
    /// OpenMP nesting level the workers run at.
    pub omp_level: Option<openmp::Level>,
    /// The calls themselves.
    pub messages: Vec<Message>,
}

impl BatchExecuteRequest {
    /// Creates a batch of `ty` over `messages`.
    pub fn new(ty: BatchType, messages: Vec<Message>) -> Self {
        Self {
            id: generate_gid(),
            ty,
            messages,
            ..Self::default()
        }
    }

    /// Sets the thread subtype.
    pub fn with_subtype(mut self, subtype: ThreadRequestType) -> Self {
        self.subtype = subtype;
        self
    }

    /// Sets the OpenMP level.
    pub fn with_omp_level(mut self, level: openmp::Level) -> Self {
        self.omp_level = Some(level);
        self
    }

    /// Number of messages in the batch.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the batch has no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
