use std::collections::HashSet;
use std::sync::Arc;

use crate::config::Config;
use crate::core::TaskId;
use crate::error::GraphError;
use crate::graph::TaskGraph;
use crate::output::Output;
use crate::task::{Inputs, Task, TaskContext, TaskResult};

/// The blueprint for your pipeline.
///
/// `Blueprint` is used to define the task graph. You register tasks and wire
/// them together by name. Registration order does not matter;
/// [`Blueprint::finish`] validates the whole graph at once and freezes it into
/// a [`TaskGraph`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tsumiki::{Blueprint, Config, Output};
///
/// let mut blueprint = Blueprint::new(Arc::new(Config::default()));
///
/// blueprint
///     .task("notes")
///     .source("notes/*.txt")
///     .run(|_, inputs| {
///         Ok(inputs
///             .files
///             .iter()
///             .map(|file| Output::binary(file.path.as_str(), file.data.clone()))
///             .collect())
///     })
///     .unwrap();
///
/// let graph = blueprint.finish().unwrap();
/// ```
pub struct Blueprint {
    config: Arc<Config>,
    tasks: Vec<Task>,
    names: HashSet<TaskId>,
}

impl Blueprint {
    /// Creates a new, empty blueprint for the given configuration.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            tasks: Vec::new(),
            names: HashSet::new(),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Register a task. Fails if a task with the same name already exists.
    pub fn register(&mut self, task: Task) -> Result<TaskId, GraphError> {
        if !self.names.insert(task.name.clone()) {
            return Err(GraphError::DuplicateTask(task.name.clone()));
        }

        let name = task.name.clone();
        self.tasks.push(task);
        Ok(name)
    }

    /// The entry point of the fluent task builder.
    pub fn task(&mut self, name: impl Into<TaskId>) -> TaskDef<'_> {
        TaskDef {
            blueprint: self,
            name: name.into(),
            sources: Vec::new(),
            watch: Vec::new(),
            dependencies: Vec::new(),
            publish: true,
        }
    }

    /// Validate dependencies and cycles, and freeze the graph.
    pub fn finish(self) -> Result<TaskGraph, GraphError> {
        TaskGraph::validate(self.config, self.tasks)
    }
}

pub struct TaskDef<'a> {
    blueprint: &'a mut Blueprint,
    name: TaskId,
    sources: Vec<String>,
    watch: Vec<String>,
    dependencies: Vec<TaskId>,
    publish: bool,
}

impl<'a> TaskDef<'a> {
    /// Files passed to the task, as a glob relative to the project root.
    pub fn source(mut self, glob: impl Into<String>) -> Self {
        self.sources.push(glob.into());
        self
    }

    /// Files that invalidate the task without being passed to it.
    pub fn watch(mut self, glob: impl Into<String>) -> Self {
        self.watch.push(glob.into());
        self
    }

    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies.extend(names.into_iter().map(Into::into));
        self
    }

    /// Keep the outputs out of the output directory.
    pub fn internal(mut self) -> Self {
        self.publish = false;
        self
    }

    pub fn run<F>(self, callback: F) -> Result<TaskId, GraphError>
    where
        F: Fn(&TaskContext<'_>, &Inputs) -> TaskResult<Vec<Output>> + Send + Sync + 'static,
    {
        let mut task = Task::new(self.name, callback);

        for glob in &self.sources {
            task = task.with_source(glob)?;
        }

        for glob in &self.watch {
            task = task.with_watch(glob)?;
        }

        for dependency in self.dependencies {
            task = task.with_dependency(dependency);
        }

        if !self.publish {
            task = task.internal();
        }

        self.blueprint.register(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn blueprint() -> Blueprint {
        Blueprint::new(Arc::new(Config::default()))
    }

    fn noop(_: &TaskContext<'_>, _: &Inputs) -> TaskResult<Vec<Output>> {
        Ok(vec![])
    }

    fn add(bp: &mut Blueprint, name: &str, deps: &[&str]) -> Result<TaskId, GraphError> {
        bp.task(name).depends_on(deps.iter().copied()).run(noop)
    }

    fn order(graph: &TaskGraph) -> Vec<String> {
        graph.topological_order().map(|n| n.to_string()).collect()
    }

    #[test]
    fn duplicate_task_is_rejected() {
        let mut bp = blueprint();
        add(&mut bp, "styles", &[]).unwrap();

        let err = add(&mut bp, "styles", &[]).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateTask(name) if name.as_ref() == "styles"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut bp = blueprint();
        add(&mut bp, "inject", &["styles"]).unwrap();

        match bp.finish() {
            Err(GraphError::UnknownDependency { task, dependency }) => {
                assert_eq!(task.as_ref(), "inject");
                assert_eq!(dependency.as_ref(), "styles");
            }
            other => panic!("expected unknown dependency, got {:?}", other.err()),
        }
    }

    #[test]
    fn dependencies_may_be_registered_after_dependents() {
        let mut bp = blueprint();
        add(&mut bp, "inject", &["styles", "scripts"]).unwrap();
        add(&mut bp, "scripts", &[]).unwrap();
        add(&mut bp, "styles", &[]).unwrap();

        let graph = bp.finish().unwrap();
        assert_eq!(order(&graph), ["scripts", "styles", "inject"]);
    }

    #[test]
    fn ties_are_broken_by_registration_order() {
        let mut bp = blueprint();
        add(&mut bp, "html", &[]).unwrap();
        add(&mut bp, "styles", &[]).unwrap();
        add(&mut bp, "inject", &["styles", "html", "scripts"]).unwrap();
        add(&mut bp, "scripts", &[]).unwrap();
        add(&mut bp, "images", &[]).unwrap();

        // `inject` becomes ready once `scripts` is done and was registered
        // before `images`, so it goes first.
        let graph = bp.finish().unwrap();
        assert_eq!(order(&graph), ["html", "styles", "scripts", "inject", "images"]);
    }

    #[test]
    fn ready_tasks_never_wait_for_later_registrations() {
        let mut bp = blueprint();
        add(&mut bp, "late", &["early"]).unwrap();
        add(&mut bp, "early", &[]).unwrap();
        add(&mut bp, "last", &[]).unwrap();

        let graph = bp.finish().unwrap();
        assert_eq!(order(&graph), ["early", "late", "last"]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let mut bp = blueprint();
        add(&mut bp, "a", &["a"]).unwrap();

        match bp.finish() {
            Err(GraphError::CyclicDependency(path)) => {
                let path: Vec<_> = path.iter().map(|n| n.as_ref()).collect();
                assert_eq!(path, ["a", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other.err()),
        }
    }

    #[test]
    fn cycle_reports_full_path() {
        let mut bp = blueprint();
        add(&mut bp, "root", &[]).unwrap();
        add(&mut bp, "a", &["root", "c"]).unwrap();
        add(&mut bp, "b", &["a"]).unwrap();
        add(&mut bp, "c", &["b"]).unwrap();

        match bp.finish() {
            Err(GraphError::CyclicDependency(path)) => {
                let path: Vec<_> = path.iter().map(|n| n.as_ref()).collect();
                assert_eq!(path, ["a", "c", "b", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other.err()),
        }
    }

    #[test]
    fn random_cycles_never_validate() {
        let mut rng = StdRng::seed_from_u64(0x7375_6d69);

        for _ in 0..200 {
            let len = rng.gen_range(1..=8);
            let extra = rng.gen_range(0..6);
            let mut specs: Vec<(String, Vec<String>)> = Vec::new();

            for i in 0..extra {
                specs.push((format!("free{i}"), vec![]));
            }

            for i in 0..len {
                let next = format!("cyc{}", (i + 1) % len);
                let mut deps = vec![next];
                if extra > 0 && rng.gen_bool(0.5) {
                    deps.push(format!("free{}", rng.gen_range(0..extra)));
                }
                specs.push((format!("cyc{i}"), deps));
            }

            specs.shuffle(&mut rng);

            let mut bp = blueprint();
            for (name, deps) in &specs {
                bp.task(name.as_str())
                    .depends_on(deps.iter().map(String::as_str))
                    .run(noop)
                    .unwrap();
            }

            match bp.finish() {
                Err(GraphError::CyclicDependency(path)) => {
                    assert_eq!(path.len(), len + 1);
                    assert_eq!(path.first(), path.last());
                    assert!(path.iter().all(|n| n.starts_with("cyc")));
                }
                other => panic!("cycle of length {len} validated: {:?}", other.err()),
            }
        }
    }

    #[test]
    fn random_dags_are_ordered_after_dependencies() {
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..200 {
            let size = rng.gen_range(1..40);
            let density = rng.gen_range(0.0..0.5);

            // Edges always point at lower ranks, so the graph is acyclic.
            let mut specs: Vec<(String, Vec<String>)> = (0..size)
                .map(|i| {
                    let deps = (0..i)
                        .filter(|_| rng.gen_bool(density))
                        .map(|j| format!("t{j}"))
                        .collect();
                    (format!("t{i}"), deps)
                })
                .collect();

            specs.shuffle(&mut rng);

            let mut bp = blueprint();
            for (name, deps) in &specs {
                bp.task(name.as_str())
                    .depends_on(deps.iter().map(String::as_str))
                    .run(noop)
                    .unwrap();
            }

            let graph = bp.finish().unwrap();
            let order = order(&graph);
            assert_eq!(order.len(), size);

            let position = |name: &str| order.iter().position(|n| n == name).unwrap();
            for (name, deps) in &specs {
                for dep in deps {
                    assert!(position(dep) < position(name), "{dep} must precede {name}");
                }
            }

            // Deterministic: the same registrations produce the same order.
            let mut bp = blueprint();
            for (name, deps) in &specs {
                bp.task(name.as_str())
                    .depends_on(deps.iter().map(String::as_str))
                    .run(noop)
                    .unwrap();
            }
            assert_eq!(self::order(&bp.finish().unwrap()), order);
        }
    }

    #[test]
    fn descendants_follow_dependents() {
        let mut bp = blueprint();
        add(&mut bp, "a", &[]).unwrap();
        add(&mut bp, "b", &["a"]).unwrap();
        add(&mut bp, "c", &["a"]).unwrap();
        add(&mut bp, "d", &["b", "c"]).unwrap();
        add(&mut bp, "e", &[]).unwrap();

        let graph = bp.finish().unwrap();
        let names: Vec<_> = graph.dependents("a").iter().map(|n| n.to_string()).collect();
        assert_eq!(names, ["b", "c"]);

        let names: Vec<_> = graph.dependencies("d").iter().map(|n| n.to_string()).collect();
        assert_eq!(names, ["b", "c"]);

        let b: TaskId = "b".into();
        let mut desc: Vec<_> = graph.descendants([&b]).into_iter().map(|n| n.to_string()).collect();
        desc.sort();
        assert_eq!(desc, ["b", "d"]);
    }

    #[test]
    fn graph_renders_as_mermaid() {
        let mut bp = blueprint();
        add(&mut bp, "styles", &[]).unwrap();
        add(&mut bp, "inject", &["styles"]).unwrap();

        let text = bp.finish().unwrap().to_string();
        assert!(text.starts_with("graph LR\n"));
        assert!(text.contains("0[\"styles\"]"));
        assert!(text.contains("0 --> 1"));
    }
}
