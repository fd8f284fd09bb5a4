use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::core::TaskId;
use crate::error::TaskExecutionError;

/// What happened to a single task during a [`BuildRun`].
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The task function ran and succeeded.
    Succeeded { duration: Duration },
    /// The inputs matched a cache entry; the function was not invoked.
    SkippedCached,
    /// The task function failed.
    Failed(TaskExecutionError),
    /// The task was not run because a task it depends on failed.
    SkippedDueToUpstreamFailure { upstream: TaskId },
    /// The build was cancelled before the task started.
    Cancelled,
}

impl TaskOutcome {
    /// Whether the task has valid outputs after the run.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::SkippedCached)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// One execution attempt across some subset of the task graph.
#[derive(Debug, Clone, Default)]
pub struct BuildRun {
    /// Sequence number of the run within its scheduler.
    pub id: u64,
    /// Tasks that had to be considered.
    pub dirty: BTreeSet<TaskId>,
    /// The order the tasks were planned in.
    pub order: Vec<TaskId>,
    /// Every task of the graph, in topological order. Tasks outside the
    /// plan whose outputs are still valid are reported as cached.
    pub tasks: Vec<TaskId>,
    pub outcomes: BTreeMap<TaskId, TaskOutcome>,
    /// Number of task functions actually invoked.
    pub invocations: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl BuildRun {
    pub(crate) fn new(
        id: u64,
        dirty: BTreeSet<TaskId>,
        order: Vec<TaskId>,
        tasks: Vec<TaskId>,
    ) -> Self {
        Self {
            id,
            dirty,
            order,
            tasks,
            ..Self::default()
        }
    }

    pub(crate) fn record(&mut self, task: TaskId, outcome: TaskOutcome) {
        self.outcomes.entry(task).or_insert(outcome);
    }

    pub(crate) fn is_resolved(&self, task: &str) -> bool {
        self.outcomes.contains_key(task)
    }

    pub fn status(&self) -> RunStatus {
        if self
            .outcomes
            .values()
            .any(|o| matches!(o, TaskOutcome::Failed(_)))
        {
            RunStatus::Failed
        } else if self.cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == RunStatus::Succeeded
    }

    pub fn outcome(&self, task: &str) -> Option<&TaskOutcome> {
        self.outcomes.get(task)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskExecutionError> {
        self.outcomes.values().filter_map(|o| match o {
            TaskOutcome::Failed(e) => Some(e),
            _ => None,
        })
    }

    /// Names of the tasks whose outcome satisfies `filter`, in topological
    /// order.
    pub fn tasks_where(&self, filter: impl Fn(&TaskOutcome) -> bool) -> Vec<&TaskId> {
        self.tasks
            .iter()
            .filter(|name| self.outcomes.get(*name).is_some_and(&filter))
            .collect()
    }

    pub fn executed(&self) -> Vec<&TaskId> {
        self.tasks_where(|o| matches!(o, TaskOutcome::Succeeded { .. }))
    }

    pub fn cached(&self) -> Vec<&TaskId> {
        self.tasks_where(|o| matches!(o, TaskOutcome::SkippedCached))
    }

    fn count(&self, filter: impl Fn(&TaskOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| filter(o)).count()
    }
}

impl Display for BuildRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tasks: {} built, {} cached",
            self.outcomes.len(),
            self.count(|o| matches!(o, TaskOutcome::Succeeded { .. })),
            self.count(|o| matches!(o, TaskOutcome::SkippedCached)),
        )?;

        let failed = self.count(|o| matches!(o, TaskOutcome::Failed(_)));
        if failed > 0 {
            write!(f, ", {failed} failed")?;
        }

        let skipped = self.count(|o| matches!(o, TaskOutcome::SkippedDueToUpstreamFailure { .. }));
        if skipped > 0 {
            write!(f, ", {skipped} skipped")?;
        }

        let cancelled = self.count(|o| matches!(o, TaskOutcome::Cancelled));
        if cancelled > 0 {
            write!(f, ", {cancelled} cancelled")?;
        }

        write!(f, " in {:.2?}", self.elapsed)
    }
}

/// Cooperative cancellation, checked by the scheduler between tasks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with(outcomes: Vec<(&str, TaskOutcome)>) -> BuildRun {
        let order: Vec<TaskId> = outcomes.iter().map(|(n, _)| TaskId::from(*n)).collect();
        let mut run = BuildRun::new(1, BTreeSet::new(), order.clone(), order);
        for (name, outcome) in outcomes {
            run.record(name.into(), outcome);
        }
        run
    }

    #[test]
    fn failure_dominates_status() {
        let mut run = run_with(vec![
            ("a", TaskOutcome::SkippedCached),
            (
                "b",
                TaskOutcome::Failed(TaskExecutionError::new("b".into(), anyhow::anyhow!("boom"))),
            ),
        ]);
        run.cancelled = true;

        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.failures().count(), 1);
    }

    #[test]
    fn first_outcome_wins() {
        let mut run = run_with(vec![("a", TaskOutcome::SkippedCached)]);
        run.record("a".into(), TaskOutcome::Cancelled);
        assert!(matches!(run.outcome("a"), Some(TaskOutcome::SkippedCached)));
    }

    #[test]
    fn summary_mentions_every_kind() {
        let run = run_with(vec![
            ("a", TaskOutcome::Succeeded { duration: Duration::ZERO }),
            ("b", TaskOutcome::SkippedCached),
            ("c", TaskOutcome::SkippedDueToUpstreamFailure { upstream: "x".into() }),
        ]);

        let text = run.to_string();
        assert!(text.starts_with("3 tasks: 1 built, 1 cached, 1 skipped"));
        assert_eq!(run.executed(), [&TaskId::from("a")]);
        assert_eq!(run.cached(), [&TaskId::from("b")]);
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
