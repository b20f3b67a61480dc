use crate::TaskPanic;

/// Errors returned by `ShardedMap` and `TaskGroup`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A keyed operation was given a zero-length key.
    #[error("the value of `key` is empty")]
    EmptyKey,
    /// The operating system refused to start a thread for a supervised task.
    #[error("failed to spawn task thread")]
    Spawn(#[source] std::io::Error),
    /// `TaskGroup::join` found panics that no handler consumed.
    #[error("{} supervised task(s) panicked", .0.len())]
    TaskPanicked(Vec<TaskPanic>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
