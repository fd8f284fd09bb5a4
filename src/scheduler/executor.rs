use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError, channel};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use indicatif::ProgressStyle;
use rayon::prelude::*;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use super::{BuildRun, CancelToken, Plan, Scheduler, TaskOutcome, TaskState};
use crate::cache::CacheKey;
use crate::core::{Artifact, Environment, Hash32, TaskId};
use crate::error::TaskExecutionError;
use crate::graph::TaskGraph;
use crate::output::{Output, normalize_path, remove_stale, restore_outputs, save_outputs};
use crate::task::{InputFile, Inputs, MATCH_OPTIONS, SourceGlob, Task, TaskContext};

/// Everything gathered for a task on the scheduler thread before it runs.
struct Prepared {
    key: CacheKey,
    inputs: Inputs,
}

/// Result sent back by a worker.
struct Finished {
    task: TaskId,
    result: anyhow::Result<Vec<Output>>,
    duration: Duration,
}

impl Scheduler {
    /// Execute `plan` on the rayon thread pool.
    ///
    /// The calling thread acts as the coordinator. It keeps a count of
    /// unfinished dependencies for every planned task and, once a count drops
    /// to zero, reads the task's inputs and derives its cache key. A cache hit
    /// is resolved on the spot; a miss is handed to a worker, which reports
    /// back over a channel. A failure marks everything downstream of it as
    /// skipped, while independent branches keep going.
    ///
    /// Cancellation is checked before each task starts. Tasks already running
    /// are allowed to finish.
    ///
    /// Tasks outside the plan that still hold the outputs of a successful run
    /// are reported as cached.
    pub fn execute(&mut self, plan: &Plan, cancel: &CancelToken) -> BuildRun {
        let start = Instant::now();
        self.runs += 1;

        let tasks: Vec<TaskId> = self.graph.topological_order().cloned().collect();
        let mut run = BuildRun::new(self.runs, plan.dirty.clone(), plan.order.clone(), tasks);
        for name in self.graph.topological_order() {
            if !plan.dirty.contains(name) && self.state.contains_key(name) {
                run.record(name.clone(), TaskOutcome::SkippedCached);
            }
        }

        if plan.is_empty() {
            return run;
        }

        let graph = self.graph.clone();

        // Only dependencies that are part of the plan hold a task back.
        let mut waiting: HashMap<TaskId, usize> = plan
            .order
            .iter()
            .map(|name| {
                let count = graph.get(name).map_or(0, |task| {
                    task.dependencies
                        .iter()
                        .filter(|dep| plan.dirty.contains(*dep))
                        .collect::<HashSet<_>>()
                        .len()
                });
                (name.clone(), count)
            })
            .collect();

        let mut ready: VecDeque<TaskId> = plan
            .order
            .iter()
            .filter(|name| waiting.get(*name) == Some(&0))
            .cloned()
            .collect();

        let root_span = tracing::span!(Level::INFO, "building_tasks", run = run.id);
        root_span.pb_set_length(plan.order.len() as u64);
        root_span.pb_set_style(&crate::utils::style_build());
        root_span.pb_set_message("Building tasks...");
        let _enter = root_span.enter();

        let style = crate::utils::style_task();
        let out_dir = self.env.config.output_path();

        rayon::scope(|scope| {
            let (sender, receiver) = channel::<Finished>();
            let mut running: HashMap<TaskId, CacheKey> = HashMap::new();

            loop {
                while let Some(name) = ready.pop_front() {
                    if cancel.is_cancelled() {
                        run.record(name, TaskOutcome::Cancelled);
                        root_span.pb_inc(1);
                        continue;
                    }

                    let Some(task) = graph.get(&name).cloned() else {
                        continue;
                    };

                    let prepared = match self.prepare(&task) {
                        Ok(prepared) => prepared,
                        Err(e) => {
                            let resolved = self.fail(&mut run, plan, name, e);
                            root_span.pb_inc(resolved);
                            continue;
                        }
                    };

                    if let Some(outputs) = self.cache.get(&prepared.key) {
                        match self.reuse(&task, outputs) {
                            Ok(()) => {
                                tracing::debug!(task = %name, "reused cached outputs");
                                run.record(name.clone(), TaskOutcome::SkippedCached);
                                root_span.pb_inc(1);
                                unlock(&graph, &name, &mut waiting, &mut ready);
                            }
                            Err(e) => {
                                let resolved = self.fail(&mut run, plan, name, e);
                                root_span.pb_inc(resolved);
                            }
                        }
                        continue;
                    }

                    running.insert(name, prepared.key);
                    run.invocations += 1;

                    let sender = sender.clone();
                    let env = self.env.clone();
                    let out_dir = out_dir.clone();
                    let style = style.clone();
                    let inputs = prepared.inputs;

                    scope.spawn(move |_| {
                        let start = Instant::now();
                        let result = work(&task, &env, &inputs, &out_dir, &style);

                        // The receiver outlives every worker of this scope.
                        let _ = sender.send(Finished {
                            task: task.name.clone(),
                            result,
                            duration: start.elapsed(),
                        });
                    });
                }

                if running.is_empty() {
                    break;
                }

                let Some(finished) = next_finished(&receiver) else {
                    break;
                };

                let Some(key) = running.remove(&finished.task) else {
                    continue;
                };

                let name = finished.task;
                let Some(task) = graph.get(&name).cloned() else {
                    continue;
                };

                match finished
                    .result
                    .and_then(|outputs| self.commit(&task, key, outputs))
                {
                    Ok(()) => {
                        tracing::debug!(task = %name, duration = ?finished.duration, "finished");
                        run.record(
                            name.clone(),
                            TaskOutcome::Succeeded {
                                duration: finished.duration,
                            },
                        );
                        root_span.pb_inc(1);
                        unlock(&graph, &name, &mut waiting, &mut ready);
                    }
                    Err(e) => {
                        let resolved = self.fail(&mut run, plan, name, e);
                        root_span.pb_inc(resolved);
                    }
                }
            }
        });

        // Whatever is left was held back by a cancelled task.
        for name in &plan.order {
            if !run.is_resolved(name) {
                run.record(name.clone(), TaskOutcome::Cancelled);
            }
        }

        run.cancelled = run
            .outcomes
            .values()
            .any(|o| matches!(o, TaskOutcome::Cancelled));
        run.elapsed = start.elapsed();

        tracing::info!("Build #{}: {run}", run.id);
        run
    }

    /// Read the inputs of `task` and derive its cache key.
    fn prepare(&self, task: &Task) -> anyhow::Result<Prepared> {
        let root = self.env.root();

        let sources: Vec<Utf8PathBuf> = expand(root, &task.sources)?.into_iter().collect();
        let watched: Vec<Utf8PathBuf> = expand(root, &task.watch)?
            .into_iter()
            .filter(|path| !sources.contains(path))
            .collect();

        let files = sources
            .par_iter()
            .map(|path| {
                let data: Arc<[u8]> = fs::read(root.join(path))
                    .with_context(|| format!("Couldn't read {path}"))?
                    .into();

                Ok(InputFile {
                    fingerprint: Hash32::hash(&data),
                    path: path.clone(),
                    data,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut pairs: Vec<(String, Hash32)> = files
            .iter()
            .map(|file| (file.path.to_string(), file.fingerprint))
            .collect();

        pairs.extend(
            watched
                .par_iter()
                .map(|path| {
                    let hash = Hash32::hash_file(root.join(path))
                        .with_context(|| format!("Couldn't read {path}"))?;
                    Ok((path.to_string(), hash))
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
        );

        let mut upstream = BTreeMap::new();
        for dependency in &task.dependencies {
            if upstream.contains_key(dependency) {
                continue;
            }

            let state = self
                .state
                .get(dependency)
                .ok_or_else(|| anyhow!("Dependency '{dependency}' has no outputs"))?;

            pairs.extend(
                state
                    .artifacts
                    .iter()
                    .map(|a| (format!("@{dependency}/{}", a.path), a.fingerprint)),
            );
            upstream.insert(dependency.clone(), state.outputs.clone());
        }

        Ok(Prepared {
            key: CacheKey::derive(&task.name, self.env.fingerprint(), &pairs),
            inputs: Inputs { files, upstream },
        })
    }

    /// Outputs were found in the cache; bring the output directory in line.
    fn reuse(&mut self, task: &Task, outputs: Vec<Output>) -> anyhow::Result<()> {
        if task.publish {
            let dir = self.env.config.output_path();
            let written = restore_outputs(&dir, &outputs)
                .with_context(|| format!("Couldn't restore cached outputs into {dir}"))?;

            if written > 0 {
                tracing::debug!(task = %task.name, written, "restored outputs from cache");
            }
        }

        self.remember(task, outputs)
    }

    /// A worker produced fresh outputs.
    fn commit(&mut self, task: &Task, key: CacheKey, outputs: Vec<Output>) -> anyhow::Result<()> {
        if let Err(e) = self.cache.put(key, &outputs) {
            tracing::warn!(task = %task.name, "Couldn't cache outputs: {e}");
        }

        self.remember(task, outputs)
    }

    fn remember(&mut self, task: &Task, outputs: Vec<Output>) -> anyhow::Result<()> {
        let artifacts: Vec<Artifact> = outputs.iter().map(Output::to_artifact).collect();

        if task.publish {
            if let Some(previous) = self.published.get(&task.name) {
                remove_stale(&self.env.config.output_path(), previous, &artifacts)
                    .context("Couldn't remove stale outputs")?;
            }
            self.published.insert(task.name.clone(), artifacts.clone());
        }

        self.state.insert(
            task.name.clone(),
            TaskState {
                outputs: outputs.into(),
                artifacts,
            },
        );

        Ok(())
    }

    /// Record a failure and skip everything planned downstream of it. The
    /// task loses its previous outputs, so it is retried on the next build.
    /// Files it published stay tracked until a later run replaces them.
    /// Returns the number of tasks resolved by the call.
    fn fail(&mut self, run: &mut BuildRun, plan: &Plan, name: TaskId, cause: anyhow::Error) -> u64 {
        let error = TaskExecutionError::new(name.clone(), cause);
        tracing::error!("{error}");

        self.state.remove(&name);
        run.record(name.clone(), TaskOutcome::Failed(error));

        let mut resolved = 1;
        for dependent in self.graph.descendants([&name]) {
            if dependent == name || !plan.dirty.contains(&dependent) || run.is_resolved(&dependent) {
                continue;
            }

            run.record(
                dependent,
                TaskOutcome::SkippedDueToUpstreamFailure {
                    upstream: name.clone(),
                },
            );
            resolved += 1;
        }

        resolved
    }
}

/// Mark `name` as done and queue the dependents it was holding back.
fn unlock(
    graph: &TaskGraph,
    name: &str,
    waiting: &mut HashMap<TaskId, usize>,
    ready: &mut VecDeque<TaskId>,
) {
    for dependent in graph.dependents(name) {
        if let Some(count) = waiting.get_mut(&dependent) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ready.push_back(dependent);
            }
        }
    }
}

/// Wait for the next finished task. The coordinator itself occupies a pool
/// thread, so it runs queued jobs while waiting instead of blocking.
fn next_finished(receiver: &Receiver<Finished>) -> Option<Finished> {
    loop {
        match receiver.try_recv() {
            Ok(finished) => return Some(finished),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }

        if matches!(rayon::yield_now(), Some(rayon::Yield::Executed)) {
            continue;
        }

        match receiver.recv_timeout(Duration::from_millis(5)) {
            Ok(finished) => return Some(finished),
            Err(RecvTimeoutError::Disconnected) => return None,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

/// Runs on a worker thread.
fn work(
    task: &Task,
    env: &Environment,
    inputs: &Inputs,
    out_dir: &Utf8Path,
    style: &ProgressStyle,
) -> anyhow::Result<Vec<Output>> {
    let span = tracing::span!(Level::INFO, "task", name = task.name.as_ref());
    span.pb_set_style(style);
    span.pb_set_message(&format!("Running {}", task.name));
    let _enter = span.enter();

    let context = TaskContext {
        name: &task.name,
        env,
        span: span.clone(),
    };

    // The task only sees its own cloned inputs, so a panic cannot leave
    // shared state half-updated.
    let outputs = match catch_unwind(AssertUnwindSafe(|| (task.func)(&context, inputs))) {
        Ok(result) => result?,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            return Err(anyhow!(msg));
        }
    };

    if task.publish {
        save_outputs(out_dir, &outputs)
            .with_context(|| format!("Couldn't write outputs into {out_dir}"))?;
    }

    Ok(outputs)
}

/// Expand root-relative globs into the sorted set of matching files, as
/// paths relative to `root`.
fn expand(root: &Utf8Path, globs: &[SourceGlob]) -> anyhow::Result<BTreeSet<Utf8PathBuf>> {
    let base = glob::Pattern::escape(root.as_str());
    let mut found = BTreeSet::new();

    for source in globs {
        let pattern = if base.is_empty() {
            source.text.clone()
        } else {
            format!("{base}/{}", source.text)
        };

        for entry in glob::glob_with(&pattern, MATCH_OPTIONS)? {
            let path = Utf8PathBuf::try_from(entry?)?;
            if !path.is_file() {
                continue;
            }

            let relative = path.strip_prefix(root).unwrap_or(&path);
            found.insert(normalize_path(relative));
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::blueprint::Blueprint;
    use crate::cache::ArtifactCache;
    use crate::config::Config;
    use crate::core::Mode;
    use crate::scheduler::Changes;
    use crate::task::TaskResult;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        config: Arc<Config>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
            let config = Arc::new(Config {
                root: root.clone(),
                ..Config::default()
            });

            Self {
                _dir: dir,
                root,
                config,
            }
        }

        fn write(&self, path: &str, text: &str) {
            let path = self.root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }

        fn scheduler(&self, bp: Blueprint) -> Scheduler {
            let graph = Arc::new(bp.finish().unwrap());
            let env = Environment::new(self.config.clone(), Mode::Build);
            Scheduler::new(graph, env, ArtifactCache::in_memory())
        }
    }

    /// Concatenates the sources and upstream outputs into `<name>.txt`.
    fn concat(
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(&TaskContext<'_>, &Inputs) -> TaskResult<Vec<Output>> + Send + Sync + 'static {
        move |ctx, inputs| {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut text = String::new();
            for file in &inputs.files {
                text.push_str(file.text()?);
            }
            for outputs in inputs.upstream.values() {
                for output in outputs.iter() {
                    text.push_str(output.as_str().unwrap_or_default());
                }
            }
            Ok(vec![Output::text(format!("{}.txt", ctx.name), text)])
        }
    }

    fn outcome<'a>(run: &'a BuildRun, name: &str) -> &'a TaskOutcome {
        run.outcome(name).unwrap()
    }

    #[test]
    fn expand_is_sorted_and_relative() {
        let fx = Fixture::new();
        fx.write("src/b.txt", "b");
        fx.write("src/a.txt", "a");
        fx.write("src/nested/c.txt", "c");

        let globs = vec![SourceGlob::new(&"t".into(), "src/*.txt").unwrap()];
        let found: Vec<_> = expand(&fx.root, &globs).unwrap().into_iter().collect();
        assert_eq!(found, [Utf8PathBuf::from("src/a.txt"), Utf8PathBuf::from("src/b.txt")]);
    }

    #[test]
    fn second_run_hits_the_cache() {
        let fx = Fixture::new();
        fx.write("src/a.txt", "a");

        let calls = Arc::new(AtomicUsize::new(0));
        let mut bp = Blueprint::new(fx.config.clone());
        bp.task("a").source("src/*.txt").run(concat(calls.clone())).unwrap();
        bp.task("b").depends_on(["a"]).run(concat(calls.clone())).unwrap();

        let mut sched = fx.scheduler(bp);
        let first = sched.run(&Changes::All, &CancelToken::new());
        assert!(first.is_success());
        assert_eq!(first.invocations, 2);
        assert_eq!(fs::read_to_string(fx.root.join("dist/b.txt")).unwrap(), "a");

        let second = sched.run(&Changes::All, &CancelToken::new());
        assert_eq!(second.invocations, 0);
        assert!(matches!(outcome(&second, "a"), TaskOutcome::SkippedCached));
        assert!(matches!(outcome(&second, "b"), TaskOutcome::SkippedCached));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_skips_only_downstream() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut bp = Blueprint::new(fx.config.clone());
        bp.task("broken").run(|_, _| anyhow::bail!("syntax error")).unwrap();
        bp.task("after").depends_on(["broken"]).run(concat(calls.clone())).unwrap();
        bp.task("last").depends_on(["after"]).run(concat(calls.clone())).unwrap();
        bp.task("other").run(concat(calls.clone())).unwrap();

        let mut sched = fx.scheduler(bp);
        let run = sched.run(&Changes::All, &CancelToken::new());

        assert!(!run.is_success());
        assert!(matches!(outcome(&run, "broken"), TaskOutcome::Failed(e) if e.to_string().contains("syntax error")));
        assert!(matches!(
            outcome(&run, "after"),
            TaskOutcome::SkippedDueToUpstreamFailure { upstream } if upstream.as_ref() == "broken"
        ));
        assert!(matches!(outcome(&run, "last"), TaskOutcome::SkippedDueToUpstreamFailure { .. }));
        assert!(matches!(outcome(&run, "other"), TaskOutcome::Succeeded { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panics_are_reported_as_failures() {
        let fx = Fixture::new();
        let mut bp = Blueprint::new(fx.config.clone());
        bp.task("boom").run(|_, _| panic!("kaboom")).unwrap();

        let mut sched = fx.scheduler(bp);
        let run = sched.run(&Changes::All, &CancelToken::new());

        let error = run.failures().next().unwrap();
        assert!(error.to_string().contains("Task panicked: kaboom"));
    }

    #[test]
    fn cancelled_before_start_runs_nothing() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut bp = Blueprint::new(fx.config.clone());
        bp.task("a").run(concat(calls.clone())).unwrap();
        bp.task("b").depends_on(["a"]).run(concat(calls.clone())).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();

        let mut sched = fx.scheduler(bp);
        let run = sched.run(&Changes::All, &cancel);

        assert!(run.cancelled);
        assert_eq!(run.invocations, 0);
        assert!(matches!(outcome(&run, "a"), TaskOutcome::Cancelled));
        assert!(matches!(outcome(&run, "b"), TaskOutcome::Cancelled));
    }

    #[test]
    fn dropped_outputs_are_removed_from_dist() {
        let fx = Fixture::new();
        fx.write("src/one.txt", "1");
        fx.write("src/two.txt", "2");

        let mut bp = Blueprint::new(fx.config.clone());
        bp.task("copy")
            .source("src/*.txt")
            .run(|_, inputs| {
                Ok(inputs
                    .files
                    .iter()
                    .map(|f| Output::binary(f.path.file_name().unwrap(), f.data.clone()))
                    .collect())
            })
            .unwrap();

        let mut sched = fx.scheduler(bp);
        sched.run(&Changes::All, &CancelToken::new());
        assert!(fx.root.join("dist/two.txt").exists());

        fs::remove_file(fx.root.join("src/two.txt")).unwrap();
        let run = sched.run(&Changes::paths(["src/two.txt"]), &CancelToken::new());

        assert_eq!(run.invocations, 1);
        assert!(fx.root.join("dist/one.txt").exists());
        assert!(!fx.root.join("dist/two.txt").exists());
    }

    #[test]
    fn tasks_outside_the_plan_are_reported_as_cached() {
        let fx = Fixture::new();
        fx.write("src/a.txt", "a");
        fx.write("src/b.txt", "b");

        let calls = Arc::new(AtomicUsize::new(0));
        let mut bp = Blueprint::new(fx.config.clone());
        bp.task("a").source("src/a.txt").run(concat(calls.clone())).unwrap();
        bp.task("b").source("src/b.txt").run(concat(calls.clone())).unwrap();

        let mut sched = fx.scheduler(bp);
        sched.run(&Changes::All, &CancelToken::new());

        fx.write("src/b.txt", "B");
        let run = sched.run(&Changes::paths(["src/b.txt"]), &CancelToken::new());

        assert_eq!(run.order, [TaskId::from("b")]);
        assert!(!run.dirty.contains("a"));
        assert!(matches!(outcome(&run, "a"), TaskOutcome::SkippedCached));
        assert!(matches!(outcome(&run, "b"), TaskOutcome::Succeeded { .. }));
        assert_eq!(run.cached(), [&TaskId::from("a")]);
        assert!(run.to_string().starts_with("2 tasks: 1 built, 1 cached in "));

        let idle = sched.run(&Changes::paths(Vec::<&str>::new()), &CancelToken::new());
        assert!(idle.order.is_empty());
        assert_eq!(idle.cached().len(), 2);
    }

    #[test]
    fn renamed_output_after_a_failure_replaces_the_old_file() {
        let fx = Fixture::new();
        fx.write("src/page.txt", "old");

        let mut bp = Blueprint::new(fx.config.clone());
        bp.task("page")
            .source("src/page.txt")
            .run(|_, inputs| {
                let text = inputs.files[0].text()?;
                if text == "broken" {
                    anyhow::bail!("page is broken");
                }
                Ok(vec![Output::text(format!("{text}.html"), text)])
            })
            .unwrap();

        let mut sched = fx.scheduler(bp);
        sched.run(&Changes::All, &CancelToken::new());
        assert!(fx.root.join("dist/old.html").exists());

        fx.write("src/page.txt", "broken");
        let failed = sched.run(&Changes::paths(["src/page.txt"]), &CancelToken::new());
        assert!(!failed.is_success());

        fx.write("src/page.txt", "new");
        let fixed = sched.run(&Changes::paths(["src/page.txt"]), &CancelToken::new());

        assert!(fixed.is_success());
        assert!(fx.root.join("dist/new.html").exists());
        assert!(!fx.root.join("dist/old.html").exists());
    }
}
