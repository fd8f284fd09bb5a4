use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::TaskId;

/// Errors raised while constructing the task graph. All of them are fatal:
/// the graph cannot be used until the blueprint is fixed.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task '{0}' is already registered")]
    DuplicateTask(TaskId),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<TaskId>),

    #[error("Task '{0}' has an invalid glob pattern:\n{1}")]
    Pattern(TaskId, glob::PatternError),
}

/// A task function failed. Carries the identity of the failing task and the
/// underlying cause.
#[derive(Debug, Error, Clone)]
#[error("Task '{task}' failed: {cause:#}")]
pub struct TaskExecutionError {
    pub task: TaskId,
    pub cause: Arc<anyhow::Error>,
}

impl TaskExecutionError {
    pub fn new(task: TaskId, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            task,
            cause: Arc::new(cause.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A stored entry is unreadable or does not match its fingerprint.
    #[error("Cache entry is corrupt: {0}")]
    Corruption(String),

    #[error("Couldn't encode the cache manifest.\n{0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error when reading `{0}`")]
    Io(Utf8PathBuf, #[source] std::io::Error),

    #[error("Config file parsing error:\n{0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum ClearError {
    #[error("Couldn't remove the directory `{0}`")]
    Remove(Utf8PathBuf, #[source] std::io::Error),

    #[error("Couldn't create the directory `{0}`")]
    Create(Utf8PathBuf, #[source] std::io::Error),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("Couldn't resolve watch path `{0}`:\n{1}")]
    Resolve(String, anyhow::Error),

    #[error("Couldn't install the interrupt handler:\n{0}")]
    Signal(#[from] ctrlc::Error),
}

#[derive(Debug, Error)]
pub enum TsumikiError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Error while clearing the output directory:\n{0}")]
    Clear(#[from] ClearError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
