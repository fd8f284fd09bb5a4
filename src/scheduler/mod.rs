//! Incremental scheduling of the task graph.
//!
//! The [`Scheduler`] owns everything that changes between builds: the outputs
//! each task produced last, and the [`ArtifactCache`]. A build goes through
//! three steps:
//!
//! 1. [`Scheduler::compute_dirty_set`] maps changed paths to the tasks they
//!    affect, plus everything downstream of those.
//! 2. [`Scheduler::plan`] orders the dirty tasks topologically.
//! 3. [`Scheduler::execute`] runs the plan, skipping tasks whose inputs hit
//!    the cache and running independent tasks in parallel.

mod executor;
mod run;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::cache::ArtifactCache;
use crate::core::{Artifact, Environment, TaskId};
use crate::graph::TaskGraph;
use crate::output::{Output, normalize_path};

pub use run::{BuildRun, CancelToken, RunStatus, TaskOutcome};

/// What changed since the previous build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Changes {
    /// Treat every task as changed.
    All,
    /// Paths relative to the project root.
    Paths(BTreeSet<Utf8PathBuf>),
}

impl Changes {
    pub fn paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        Self::Paths(
            paths
                .into_iter()
                .map(Into::into)
                .map(|p: Utf8PathBuf| normalize_path(&p))
                .collect(),
        )
    }

    /// Fold `other` into `self`, so several change batches can be served by a
    /// single build.
    pub fn merge(&mut self, other: Changes) {
        match (&mut *self, other) {
            (Self::All, _) => {}
            (this, Self::All) => *this = Self::All,
            (Self::Paths(a), Self::Paths(b)) => a.extend(b),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Paths(paths) if paths.is_empty())
    }
}

/// An ordered list of tasks to execute.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    dirty: BTreeSet<TaskId>,
    order: Vec<TaskId>,
}

impl Plan {
    pub fn order(&self) -> &[TaskId] {
        &self.order
    }

    pub fn dirty(&self) -> &BTreeSet<TaskId> {
        &self.dirty
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// The last successful result of a task.
#[derive(Debug, Clone)]
struct TaskState {
    outputs: Arc<[Output]>,
    artifacts: Vec<Artifact>,
}

pub struct Scheduler {
    graph: Arc<TaskGraph>,
    env: Environment,
    cache: ArtifactCache,
    state: HashMap<TaskId, TaskState>,
    /// Files each task last wrote to the output directory. Survives failures.
    published: HashMap<TaskId, Vec<Artifact>>,
    runs: u64,
}

impl Scheduler {
    pub fn new(graph: Arc<TaskGraph>, env: Environment, cache: ArtifactCache) -> Self {
        Self {
            graph,
            env,
            cache,
            state: HashMap::new(),
            published: HashMap::new(),
            runs: 0,
        }
    }

    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.graph
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Outputs of the last successful run of `task`.
    pub fn outputs(&self, task: &str) -> Option<&Arc<[Output]>> {
        self.state.get(task).map(|s| &s.outputs)
    }

    /// Tasks affected by `changes`, closed over their dependents.
    ///
    /// A task that has never succeeded is always dirty, whatever changed.
    pub fn compute_dirty_set(&self, changes: &Changes) -> BTreeSet<TaskId> {
        let direct: Vec<&TaskId> = self
            .graph
            .tasks()
            .filter(|task| match changes {
                Changes::All => true,
                Changes::Paths(paths) => {
                    !self.state.contains_key(&task.name) || paths.iter().any(|p| task.is_dirty(p))
                }
            })
            .map(|task| &task.name)
            .collect();

        self.graph.descendants(direct).into_iter().collect()
    }

    /// Order `dirty` so that every task comes after its dependencies. Names
    /// that are not in the graph are ignored.
    pub fn plan(&self, dirty: &BTreeSet<TaskId>) -> Plan {
        let order: Vec<TaskId> = self
            .graph
            .topological_order()
            .filter(|name| dirty.contains(*name))
            .cloned()
            .collect();

        Plan {
            dirty: order.iter().cloned().collect(),
            order,
        }
    }

    /// Compute the dirty set for `changes`, execute it, and persist the cache.
    pub fn run(&mut self, changes: &Changes, cancel: &CancelToken) -> BuildRun {
        let dirty = self.compute_dirty_set(changes);
        let plan = self.plan(&dirty);
        let run = self.execute(&plan, cancel);
        self.persist();
        run
    }

    /// Write the cache manifest and drop unreferenced blobs. Failures are
    /// logged; a lost cache only costs a rebuild.
    pub fn persist(&mut self) {
        if !self.cache.is_persistent() {
            return;
        }

        if let Err(e) = self.cache.save() {
            tracing::warn!("failed to save the artifact cache: {e}");
            return;
        }

        match self.cache.gc() {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "collected unused cache blobs"),
            Err(e) => tracing::warn!("failed to collect cache blobs: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::blueprint::Blueprint;
    use crate::config::Config;
    use crate::core::Mode;
    use crate::task::{Inputs, TaskContext, TaskResult};

    fn noop(_: &TaskContext<'_>, _: &Inputs) -> TaskResult<Vec<Output>> {
        Ok(vec![])
    }

    fn scheduler() -> (tempfile::TempDir, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            root: Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            ..Config::default()
        });
        let mut bp = Blueprint::new(config.clone());
        bp.task("html").source("src/*.html").run(noop).unwrap();
        bp.task("styles")
            .source("src/scss/[!_]*.scss")
            .watch("src/scss/**/*.scss")
            .run(noop)
            .unwrap();
        bp.task("scripts").source("src/js/*.js").run(noop).unwrap();
        bp.task("inject")
            .depends_on(["html", "styles", "scripts"])
            .run(noop)
            .unwrap();
        bp.task("images").source("src/img/**/*").run(noop).unwrap();

        let graph = Arc::new(bp.finish().unwrap());
        let env = Environment::new(config, Mode::Build);
        (dir, Scheduler::new(graph, env, ArtifactCache::in_memory()))
    }

    fn names(set: &BTreeSet<TaskId>) -> Vec<&str> {
        set.iter().map(|n| n.as_ref()).collect()
    }

    #[test]
    fn everything_is_dirty_before_the_first_build() {
        let (_dir, sched) = scheduler();
        let dirty = sched.compute_dirty_set(&Changes::paths(["README.md"]));
        assert_eq!(dirty.len(), 5);
    }

    #[test]
    fn changed_path_marks_task_and_dependents() {
        let (_dir, mut sched) = scheduler();
        sched.run(&Changes::All, &CancelToken::new());

        let dirty = sched.compute_dirty_set(&Changes::paths(["src/scss/_vars.scss"]));
        assert_eq!(names(&dirty), ["inject", "styles"]);

        let dirty = sched.compute_dirty_set(&Changes::paths(["src/img/logo.png"]));
        assert_eq!(names(&dirty), ["images"]);

        let dirty = sched.compute_dirty_set(&Changes::paths(["notes.txt"]));
        assert!(dirty.is_empty());
    }

    #[test]
    fn plan_follows_topological_order() {
        let (_dir, sched) = scheduler();
        let dirty: BTreeSet<TaskId> = ["inject", "scripts", "styles", "missing"]
            .into_iter()
            .map(TaskId::from)
            .collect();

        let plan = sched.plan(&dirty);
        let order: Vec<_> = plan.order().iter().map(|n| n.as_ref()).collect();
        assert_eq!(order, ["styles", "scripts", "inject"]);
        assert_eq!(plan.dirty().len(), 3);
    }

    #[test]
    fn changes_merge() {
        let mut changes = Changes::paths(["a"]);
        changes.merge(Changes::paths(["./b"]));
        assert_eq!(changes, Changes::paths(["a", "b"]));

        changes.merge(Changes::All);
        assert_eq!(changes, Changes::All);

        changes.merge(Changes::paths(["c"]));
        assert_eq!(changes, Changes::All);
    }
}
