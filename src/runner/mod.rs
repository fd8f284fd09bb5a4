//! Entry points tying the graph, the scheduler and the adapters together.

#[cfg(feature = "live")]
mod browser;
#[cfg(feature = "server")]
mod http;
#[cfg(feature = "live")]
mod reload;
#[cfg(feature = "live")]
mod watch;

use std::sync::Arc;
use std::time::Instant;

use crate::cache::ArtifactCache;
use crate::config::Config;
use crate::core::{Environment, Mode};
use crate::error::TsumikiError;
use crate::graph::TaskGraph;
use crate::scheduler::{BuildRun, CancelToken, Changes, Scheduler};
use crate::utils::{as_overhead, clear_dir, remove_dir};

#[cfg(feature = "live")]
pub use reload::{BuildListener, LiveReload};
#[cfg(feature = "live")]
pub use watch::{Signal, WatchOptions, coalesce, rebuild};

/// A finished task graph, ready to be built or watched.
pub struct Pipeline {
    graph: Arc<TaskGraph>,
}

impl Pipeline {
    pub fn new(graph: TaskGraph) -> Self {
        Self {
            graph: Arc::new(graph),
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn config(&self) -> &Arc<Config> {
        self.graph.config()
    }

    /// A scheduler for `env`, backed by the persisted cache when enabled.
    pub fn scheduler(&self, env: Environment) -> Scheduler {
        let config = self.config();
        let cache = if config.persist_cache {
            ArtifactCache::load(config.cache_path())
        } else {
            ArtifactCache::in_memory()
        };

        tracing::debug!(entries = cache.len(), "artifact cache ready");
        Scheduler::new(self.graph.clone(), env, cache)
    }

    /// Clean the output directory and build everything once.
    ///
    /// Task failures do not make this fail; they are reported in the
    /// returned [`BuildRun`].
    pub fn build(&self) -> Result<BuildRun, TsumikiError> {
        self.clear_output()?;

        let env = Environment::new(self.config().clone(), Mode::Build);
        let mut scheduler = self.scheduler(env);
        Ok(scheduler.run(&Changes::All, &CancelToken::new()))
    }

    /// Build once, then rebuild on every change until interrupted.
    #[cfg(feature = "live")]
    pub fn watch(&self, options: &WatchOptions) -> Result<(), TsumikiError> {
        watch::watch(self, options)
    }

    /// Remove the contents of the output directory, and optionally the
    /// persisted cache. Succeeds when there is nothing to remove.
    pub fn clean(&self, cache: bool) -> Result<(), TsumikiError> {
        let config = self.config();

        if config.output_path().exists() {
            self.clear_output()?;
        }

        if cache {
            let s = Instant::now();
            remove_dir(&config.cache_path())?;
            tracing::info!("Removed the artifact cache {}", as_overhead(s));
        }

        Ok(())
    }

    fn clear_output(&self) -> Result<(), TsumikiError> {
        let s = Instant::now();
        let dir = self.config().output_path();
        clear_dir(&dir)?;
        tracing::info!("Cleaned the output directory {}", as_overhead(s));
        Ok(())
    }
}
