//! The unit of work of the pipeline.
//!
//! A [`Task`] is a named, pure build step. It declares which files it reads
//! (`sources`), which additional files influence its result (`watch`), and
//! which tasks it depends on. Its function receives only those declared
//! [`Inputs`] and returns a list of [`Output`]s; it never writes to disk.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};

use crate::core::{Environment, Hash32, TaskId};
use crate::error::GraphError;
use crate::output::{Output, normalize_path};

/// Result from a single executed task.
pub type TaskResult<T> = anyhow::Result<T, anyhow::Error>;

/// Task function pointer, shared between the graph and the worker threads.
pub(crate) type TaskFnPtr = Arc<dyn Fn(&TaskContext<'_>, &Inputs) -> TaskResult<Vec<Output>> + Send + Sync>;

/// Matching options shared by dirty checks and glob expansion.
pub(crate) const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A root-relative glob, kept both as text (for expansion on disk) and as a
/// compiled pattern (for matching changed paths).
#[derive(Debug, Clone)]
pub(crate) struct SourceGlob {
    pub text: String,
    pub pattern: Pattern,
}

impl SourceGlob {
    pub fn new(task: &TaskId, glob: &str) -> Result<Self, GraphError> {
        let text = normalize_path(Utf8Path::new(glob)).into_string();
        let pattern = Pattern::new(&text).map_err(|e| GraphError::Pattern(task.clone(), e))?;
        Ok(Self { text, pattern })
    }

    pub fn matches(&self, path: &Utf8Path) -> bool {
        self.pattern.matches_with(path.as_str(), MATCH_OPTIONS)
    }
}

/// A registered build step. Immutable once registered.
#[derive(Clone)]
pub struct Task {
    pub(crate) name: TaskId,
    pub(crate) sources: Vec<SourceGlob>,
    pub(crate) watch: Vec<SourceGlob>,
    pub(crate) dependencies: Vec<TaskId>,
    pub(crate) publish: bool,
    pub(crate) func: TaskFnPtr,
}

impl Task {
    /// Create a new task with no inputs and no dependencies.
    pub fn new<F>(name: impl Into<TaskId>, func: F) -> Self
    where
        F: Fn(&TaskContext<'_>, &Inputs) -> TaskResult<Vec<Output>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            sources: Vec::new(),
            watch: Vec::new(),
            dependencies: Vec::new(),
            publish: true,
            func: Arc::new(func),
        }
    }

    /// Add a root-relative glob of files passed to the task function.
    pub fn with_source(mut self, glob: &str) -> Result<Self, GraphError> {
        self.sources.push(SourceGlob::new(&self.name, glob)?);
        Ok(self)
    }

    /// Add a root-relative glob of files that invalidate the task without
    /// being passed to it.
    pub fn with_watch(mut self, glob: &str) -> Result<Self, GraphError> {
        self.watch.push(SourceGlob::new(&self.name, glob)?);
        Ok(self)
    }

    pub fn with_dependency(mut self, name: impl Into<TaskId>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Internal tasks feed their outputs downstream but are not written to
    /// the output directory.
    pub fn internal(mut self) -> Self {
        self.publish = false;
        self
    }

    pub fn name(&self) -> &TaskId {
        &self.name
    }

    pub fn dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }

    pub fn is_published(&self) -> bool {
        self.publish
    }

    /// Whether a change to `path` (relative to the project root) affects this
    /// task directly.
    pub fn is_dirty(&self, path: &Utf8Path) -> bool {
        let path = normalize_path(path);
        self.sources.iter().chain(&self.watch).any(|g| g.matches(&path))
    }

    /// All globs of the task, sources first.
    pub fn globs(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().chain(&self.watch).map(|g| g.text.as_str())
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("sources", &self.sources.iter().map(|g| &g.text).collect::<Vec<_>>())
            .field("watch", &self.watch.iter().map(|g| &g.text).collect::<Vec<_>>())
            .field("dependencies", &self.dependencies)
            .field("publish", &self.publish)
            .finish_non_exhaustive()
    }
}

/// The context passed to every task execution.
pub struct TaskContext<'a> {
    /// Name of the running task.
    pub name: &'a str,
    /// Access to configuration and the build mode.
    pub env: &'a Environment,
    /// Tracing span assigned to this task.
    pub span: tracing::Span,
}

/// A source file read on behalf of a task.
#[derive(Debug, Clone)]
pub struct InputFile {
    /// Path relative to the project root.
    pub path: Utf8PathBuf,
    pub data: Arc<[u8]>,
    pub fingerprint: Hash32,
}

impl InputFile {
    pub fn text(&self) -> anyhow::Result<&str> {
        std::str::from_utf8(&self.data)
            .map_err(|e| anyhow::anyhow!("{} is not valid UTF-8: {e}", self.path))
    }
}

/// Everything a task function is allowed to see.
#[derive(Debug, Default, Clone)]
pub struct Inputs {
    /// Files matched by the task's source globs, sorted by path.
    pub files: Vec<InputFile>,
    /// Outputs of the upstream dependencies, by task name.
    pub upstream: BTreeMap<TaskId, Arc<[Output]>>,
}

impl Inputs {
    /// Outputs of the named dependency. Empty if the task does not depend on
    /// it.
    pub fn upstream(&self, name: &str) -> &[Output] {
        self.upstream.get(name).map(|o| &o[..]).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &TaskContext<'_>, _: &Inputs) -> TaskResult<Vec<Output>> {
        Ok(vec![])
    }

    #[test]
    fn dirty_matches_sources_and_watch() {
        let task = Task::new("styles", noop)
            .with_source("./src/scss/[!_]*.scss")
            .unwrap()
            .with_watch("src/scss/**/*.scss")
            .unwrap();

        assert!(task.is_dirty(Utf8Path::new("src/scss/main.scss")));
        assert!(task.is_dirty(Utf8Path::new("src/scss/_vars.scss")));
        assert!(task.is_dirty(Utf8Path::new("./src/scss/mixins/_grid.scss")));
        assert!(!task.is_dirty(Utf8Path::new("src/js/app.js")));
    }

    #[test]
    fn star_does_not_cross_directories() {
        let task = Task::new("scripts", noop).with_source("src/js/*.js").unwrap();

        assert!(task.is_dirty(Utf8Path::new("src/js/app.js")));
        assert!(!task.is_dirty(Utf8Path::new("src/js/vendor/lib.js")));
    }

    #[test]
    fn invalid_glob_is_reported_with_task() {
        let err = Task::new("broken", noop).with_source("src/[").unwrap_err();
        assert!(matches!(err, GraphError::Pattern(name, _) if name.as_ref() == "broken"));
    }

    #[test]
    fn missing_upstream_is_empty() {
        let inputs = Inputs::default();
        assert!(inputs.upstream("styles").is_empty());
    }
}
