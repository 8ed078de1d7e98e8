//! Named tasks with prerequisites.
//!
//! Tasks form a directed acyclic graph: an edge `a -> b` means `a` has to
//! succeed before `b` may start. The graph is checked for cycles every time a
//! task is registered, and a registration that would close a loop is rolled
//! back, so [`Orchestrator::run`] can rely on the graph being a DAG.
//!
//! Prerequisites may be named before they are registered. They show up in the
//! graph as placeholders and running anything that (transitively) depends on
//! a placeholder fails with [`UnknownTaskError`].
//!
//! ## Scheduling
//!
//! A run collects the requested task together with every prerequisite that
//! has not succeeded yet, then starts each of them on a thread of its own as
//! soon as its own prerequisites are done. The calling thread only collects
//! results, so a run never waits on a worker of the `rayon` pool and task
//! bodies are free to use the pool themselves. Each task runs at most once
//! per run. When a task fails, everything downstream of it is skipped;
//! independent branches still finish.

#[cfg(feature = "live")]
mod watch;

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

#[cfg(feature = "live")]
pub use watch::{Dispatcher, WatchBinding, WatchMap};

use crate::core::Mode;
use crate::error::{
    CycleError, DuplicateTaskError, RegisterError, RunError, SkippedError, TaskError,
    UnknownTaskError,
};

static RUN_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .expect("Error setting progress bar template")
});

/// The body of a task.
pub type Action = Arc<dyn Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync>;

pub struct Task {
    id: String,
    prerequisites: Vec<String>,
    action: Action,
}

impl Task {
    pub fn new<F>(id: impl Into<String>, action: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            prerequisites: Vec::new(),
            action: Arc::new(action),
        }
    }

    /// A task that does nothing by itself and only groups its prerequisites.
    pub fn group(id: impl Into<String>) -> Self {
        Self::new(id, |_| Ok(()))
    }

    /// Tasks that must succeed before this one starts.
    pub fn after<I, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites
            .extend(prerequisites.into_iter().map(Into::into));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn prerequisites(&self) -> &[String] {
        &self.prerequisites
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("prerequisites", &self.prerequisites)
            .finish_non_exhaustive()
    }
}

/// Outcome of the most recent run of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    NotRun,
    Running,
    Succeeded,
    Failed,
}

/// What a task gets to see while running.
pub struct TaskContext<'a> {
    pub id: &'a str,
    /// Paths whose change triggered this run, empty for one-shot runs.
    pub changed: &'a [Utf8PathBuf],
    pub mode: Mode,
    /// The progress span the task runs in.
    pub span: tracing::Span,
}

struct Entry {
    task: Task,
    status: Mutex<TaskStatus>,
    /// Held for the whole run, so a task never runs twice at the same time.
    gate: Mutex<()>,
}

impl Entry {
    fn status(&self) -> TaskStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: TaskStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn execute(&self, changed: &[Utf8PathBuf], mode: Mode) -> anyhow::Result<()> {
        let _gate = self.gate.lock().unwrap();
        self.set_status(TaskStatus::Running);

        let span = tracing::span!(Level::INFO, "task", name = %self.task.id);
        span.pb_set_style(&TASK_STYLE);
        span.pb_set_message(&format!("Running {}", self.task.id));
        let _enter = span.enter();

        let ctx = TaskContext {
            id: &self.task.id,
            changed,
            mode,
            span: span.clone(),
        };

        let s = Instant::now();

        // A panicking action must not take the scheduler down with it.
        let result = match catch_unwind(AssertUnwindSafe(|| (self.task.action)(&ctx))) {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Task panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Task panicked: {s}")
                } else {
                    String::from("Task panicked with unknown payload")
                };

                Err(anyhow::anyhow!(msg))
            }
        };

        match &result {
            Ok(()) => {
                self.set_status(TaskStatus::Succeeded);
                tracing::debug!(task = %self.task.id, "finished {}", crate::core::as_overhead(s));
            }
            Err(_) => self.set_status(TaskStatus::Failed),
        }

        result
    }
}

/// Tasks that finished during one run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Identifiers in completion order.
    pub executed: Vec<String>,
    pub elapsed: Duration,
}

#[derive(Default)]
pub struct Orchestrator {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    tasks: HashMap<NodeIndex, Arc<Entry>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task. Fails without changing anything if the identifier is
    /// taken or its prerequisite edges would close a cycle.
    pub fn register(&mut self, task: Task) -> Result<(), RegisterError> {
        if self.contains(&task.id) {
            return Err(DuplicateTaskError(task.id).into());
        }

        let mut graph = self.graph.clone();
        let mut index = self.index.clone();

        let node = node_for(&mut graph, &mut index, &task.id);
        for prerequisite in &task.prerequisites {
            let from = node_for(&mut graph, &mut index, prerequisite);
            graph.update_edge(from, node, ());
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(CycleError { id: task.id }.into());
        }

        tracing::debug!(task = %task.id, prerequisites = ?task.prerequisites, "registered task");

        self.graph = graph;
        self.index = index;
        self.tasks.insert(
            node,
            Arc::new(Entry {
                task,
                status: Mutex::new(TaskStatus::NotRun),
                gate: Mutex::new(()),
            }),
        );

        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registered(id).is_some()
    }

    /// Number of registered tasks, placeholders excluded.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self
            .tasks
            .keys()
            .map(|&node| self.graph[node].as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.registered(id).map(|node| self.tasks[&node].status())
    }

    /// Forgets every finished run, so the next run of any task starts from
    /// its prerequisites again. Running tasks keep their status.
    pub fn reset(&self) {
        for entry in self.tasks.values() {
            let mut status = entry.status.lock().unwrap();
            if *status != TaskStatus::Running {
                *status = TaskStatus::NotRun;
            }
        }
    }

    /// Runs `id` and every prerequisite that has not succeeded yet.
    pub fn run(&self, id: &str) -> Result<RunReport, RunError> {
        self.run_with(id, &[], Mode::Build)
    }

    /// Like [`run`](Self::run), handing `changed` to every task of the run.
    pub fn run_with(
        &self,
        id: &str,
        changed: &[Utf8PathBuf],
        mode: Mode,
    ) -> Result<RunReport, RunError> {
        let target = self
            .registered(id)
            .ok_or_else(|| UnknownTaskError(id.to_string()))?;

        let plan = self.plan(target)?;
        self.execute(&plan, changed, mode)
    }

    fn registered(&self, id: &str) -> Option<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .filter(|node| self.tasks.contains_key(node))
    }

    /// The target plus all of its unmet prerequisites.
    fn plan(&self, target: NodeIndex) -> Result<HashSet<NodeIndex>, UnknownTaskError> {
        let mut plan = HashSet::new();
        let mut stack = vec![target];

        while let Some(node) = stack.pop() {
            if !plan.insert(node) {
                continue;
            }

            for prerequisite in self.graph.neighbors_directed(node, Direction::Incoming) {
                let Some(entry) = self.tasks.get(&prerequisite) else {
                    return Err(UnknownTaskError(self.graph[prerequisite].clone()));
                };
                if entry.status() != TaskStatus::Succeeded {
                    stack.push(prerequisite);
                }
            }
        }

        Ok(plan)
    }

    /// Dependency-count scheduler: a task gets a scoped thread once all of
    /// its prerequisites inside the plan are done, results come back over a
    /// channel to this thread, which is the only one touching the counters.
    fn execute(
        &self,
        plan: &HashSet<NodeIndex>,
        changed: &[Utf8PathBuf],
        mode: Mode,
    ) -> Result<RunReport, RunError> {
        let start = Instant::now();

        let mut waiting: HashMap<NodeIndex, usize> = plan
            .iter()
            .map(|&node| {
                let count = self
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .filter(|prerequisite| plan.contains(prerequisite))
                    .count();
                (node, count)
            })
            .collect();

        let total = plan.len();

        let root_span = tracing::span!(Level::INFO, "running_tasks");
        root_span.pb_set_length(total as u64);
        root_span.pb_set_style(&RUN_STYLE);
        root_span.pb_set_message("Running tasks...");
        let _enter = root_span.enter();

        let mut executed = Vec::new();
        let mut failure: Option<TaskError> = None;
        let mut skipped = Vec::new();
        let mut done = HashSet::new();

        std::thread::scope(|s| {
            let (sender, receiver) = channel::<(NodeIndex, anyhow::Result<()>)>();

            let spawn = |node: NodeIndex| {
                let entry = self.tasks[&node].clone();
                let sender = sender.clone();
                s.spawn(move || {
                    let result = entry.execute(changed, mode);
                    // the receiver outlives every spawned task
                    let _ = sender.send((node, result));
                });
            };

            for (&node, &count) in &waiting {
                if count == 0 {
                    spawn(node);
                }
            }

            while done.len() < total {
                let Ok((node, result)) = receiver.recv() else {
                    break;
                };
                done.insert(node);
                root_span.pb_inc(1);

                let id = &self.graph[node];

                match result {
                    Ok(()) => {
                        executed.push(id.clone());

                        for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                            if done.contains(&dependent) {
                                continue;
                            }
                            if let Some(count) = waiting.get_mut(&dependent) {
                                *count -= 1;
                                if *count == 0 {
                                    spawn(dependent);
                                }
                            }
                        }
                    }
                    Err(cause) => {
                        tracing::error!(task = %id, "{cause:#}");

                        let mut stack: Vec<_> = self
                            .graph
                            .neighbors_directed(node, Direction::Outgoing)
                            .collect();

                        while let Some(next) = stack.pop() {
                            if !waiting.contains_key(&next) || !done.insert(next) {
                                continue;
                            }
                            root_span.pb_inc(1);

                            let skip = SkippedError {
                                id: self.graph[next].clone(),
                                failed: id.clone(),
                            };
                            tracing::warn!("{skip}");
                            skipped.push(skip);

                            stack.extend(self.graph.neighbors_directed(next, Direction::Outgoing));
                        }

                        if failure.is_none() {
                            failure = Some(TaskError {
                                id: id.clone(),
                                cause,
                            });
                        }
                    }
                }
            }
        });

        if let Some(error) = failure {
            return Err(RunError::Failed { error, skipped });
        }

        let elapsed = start.elapsed();
        tracing::info!(tasks = executed.len(), "tasks complete {}", crate::core::as_overhead(start));

        Ok(RunReport { executed, elapsed })
    }
}

fn node_for(
    graph: &mut DiGraph<String, ()>,
    index: &mut HashMap<String, NodeIndex>,
    id: &str,
) -> NodeIndex {
    *index
        .entry(id.to_string())
        .or_insert_with(|| graph.add_node(id.to_string()))
}
