use std::panic::Location;

use thiserror::Error;

use crate::map::DistKind;
use crate::task::TaskId;

#[derive(Debug, Error)]
pub enum ConduitError {
    #[error("Configuration error: {message} (at {location})")]
    Config {
        message: String,
        location: &'static Location<'static>,
    },

    #[error("Invalid dimension {dim} for a {ndims}-dimensional map (at {location})")]
    InvalidDimension {
        dim: usize,
        ndims: usize,
        location: &'static Location<'static>,
    },

    #[error("Rank list index {index} out of range for {len} ranks (at {location})")]
    InvalidRankIndex {
        index: usize,
        len: usize,
        location: &'static Location<'static>,
    },

    #[error("Cannot assign a {found} distribution to a {expected} dimension (at {location})")]
    DistributionMismatch {
        expected: DistKind,
        found: DistKind,
        location: &'static Location<'static>,
    },

    #[error("Unsupported distribution {kind} for layout of dimension {dim}")]
    UnsupportedDistribution { kind: DistKind, dim: usize },

    #[error("Out of sequence on conduit {conduit}: expected frame {expected}, received {received}")]
    OutOfSequence {
        conduit: u32,
        expected: u64,
        received: u64,
    },

    #[error("Tag mismatch on conduit {conduit} frame {frame}: connections delivered different tags")]
    TagMismatch { conduit: u32, frame: u64 },

    #[error("Payload size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("End of chunk reached on conduit {0}")]
    EndOfChunk(u32),

    #[error("Local transfer was withdrawn by the receiving end")]
    Cancelled,

    #[error("Slot is {state}, cannot {op}")]
    InvalidState { state: &'static str, op: &'static str },

    #[error("Calling thread is not inside any task scope")]
    NoTaskScope,

    #[error("Task {0} is not registered")]
    UnknownTask(TaskId),

    #[error("Calling thread belongs to task {actual}, expected task {expected}")]
    WrongTask { expected: TaskId, actual: TaskId },

    #[error("Rank {rank} is not a member of task {task}")]
    NotMember { task: TaskId, rank: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed map description: {0}")]
    Decode(String),

    #[error("Map spec parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConduitError {
    #[track_caller]
    pub fn config(message: impl Into<String>) -> Self {
        ConduitError::Config {
            message: message.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn invalid_dimension(dim: usize, ndims: usize) -> Self {
        ConduitError::InvalidDimension {
            dim,
            ndims,
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn invalid_rank_index(index: usize, len: usize) -> Self {
        ConduitError::InvalidRankIndex {
            index,
            len,
            location: Location::caller(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConduitError>;

/// Lock a mutex, recovering the guard if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
