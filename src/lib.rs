#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod assets;
mod blueprint;
mod cache;
mod config;
mod core;
mod error;
mod graph;
mod output;
mod runner;
mod scheduler;
mod task;
mod utils;

pub use crate::blueprint::{Blueprint, TaskDef};
pub use crate::cache::{ArtifactCache, CacheEntry, CacheKey, PutOutcome};
pub use crate::config::{CONFIG_FILE, Config, SourceRoots};
pub use crate::core::{Artifact, Environment, Hash32, Mode, TaskId};
pub use crate::error::*;
pub use crate::graph::TaskGraph;
pub use crate::output::{Output, OutputData};
pub use crate::runner::Pipeline;
#[cfg(feature = "live")]
pub use crate::runner::{BuildListener, LiveReload, Signal, WatchOptions, coalesce, rebuild};
pub use crate::scheduler::{
    BuildRun, CancelToken, Changes, Plan, RunStatus, Scheduler, TaskOutcome,
};
pub use crate::task::{InputFile, Inputs, Task, TaskContext, TaskResult};
pub use crate::utils::init_logging;

use std::sync::Arc;

/// The standard pipeline for `config`: every task of [`assets`], validated.
pub fn pipeline(config: Config) -> Result<Pipeline, GraphError> {
    let mut blueprint = Blueprint::new(Arc::new(config));
    assets::design(&mut blueprint)?;
    Ok(Pipeline::new(blueprint.finish()?))
}
