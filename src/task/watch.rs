//! Watch mode: file changes in, task runs out.
//!
//! 1. [`WatchMap`] maps every path of a change window to the tasks bound to
//!    it, so one window triggers each task at most once, with the union of
//!    the paths that concern it.
//! 2. [`Dispatcher`] keeps one slot per task. A trigger for an idle task
//!    starts a run; a trigger for a running task is parked in the slot,
//!    merged with whatever was parked there before. When the run ends the
//!    parked paths start exactly one follow-up run. Runs of the same task
//!    never overlap and the backlog never grows beyond one run.
//! 3. [`Orchestrator::watch`] drives both until the windows run out, which
//!    happens when the watcher is cancelled.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::thread::Scope;

use camino::Utf8PathBuf;
use glob::Pattern;

use super::Orchestrator;
use crate::core::Mode;
use crate::error::WatchError;
use crate::watcher::{ChangeEvent, resolve_watch_path};

/// Globs and the tasks to run when something matching them changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchBinding {
    pub patterns: Vec<String>,
    pub tasks: Vec<String>,
}

impl WatchBinding {
    pub fn new<P, T>(patterns: P, tasks: T) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            tasks: tasks.into_iter().map(Into::into).collect(),
        }
    }
}

/// Compiled bindings.
pub struct WatchMap {
    bindings: Vec<(Vec<Pattern>, Vec<String>)>,
    patterns: Vec<String>,
}

impl WatchMap {
    pub fn new(bindings: &[WatchBinding]) -> Result<Self, WatchError> {
        let mut compiled = Vec::new();
        let mut patterns = Vec::new();

        for binding in bindings {
            let mut filters = Vec::new();
            for pattern in &binding.patterns {
                let (_, filter) = resolve_watch_path(pattern)?;
                filters.push(filter);
                if !patterns.contains(pattern) {
                    patterns.push(pattern.clone());
                }
            }
            compiled.push((filters, binding.tasks.clone()));
        }

        Ok(Self {
            bindings: compiled,
            patterns,
        })
    }

    /// Every pattern of every binding, without duplicates.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Tasks triggered by one window, each with the paths that triggered it.
    pub fn tasks_for(&self, window: &[ChangeEvent]) -> BTreeMap<String, BTreeSet<Utf8PathBuf>> {
        let mut triggered: BTreeMap<String, BTreeSet<Utf8PathBuf>> = BTreeMap::new();

        for path in window.iter().flat_map(|event| &event.paths) {
            for (filters, tasks) in &self.bindings {
                if !filters.iter().any(|f| f.matches_path(path.as_std_path())) {
                    continue;
                }
                for task in tasks {
                    triggered
                        .entry(task.clone())
                        .or_default()
                        .insert(path.clone());
                }
            }
        }

        triggered
    }
}

#[derive(Default)]
struct Slot {
    running: bool,
    parked: Option<BTreeSet<Utf8PathBuf>>,
}

/// Serializes and coalesces watch-triggered runs per task.
pub struct Dispatcher<'o> {
    orchestrator: &'o Orchestrator,
    slots: Mutex<HashMap<String, Slot>>,
}

impl<'o> Dispatcher<'o> {
    pub fn new(orchestrator: &'o Orchestrator) -> Self {
        Self {
            orchestrator,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a run of `id` on `scope`, or parks `paths` behind the current
    /// one. Returns `true` if a new run was started.
    pub fn trigger<'scope>(
        &'scope self,
        scope: &'scope Scope<'scope, '_>,
        id: &str,
        paths: BTreeSet<Utf8PathBuf>,
    ) -> bool {
        {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots.entry(id.to_string()).or_default();

            if slot.running {
                tracing::debug!(task = %id, "run in flight, queueing");
                slot.parked.get_or_insert_with(BTreeSet::new).extend(paths);
                return false;
            }
            slot.running = true;
        }

        let id = id.to_string();
        scope.spawn(move || {
            let mut paths = paths;
            loop {
                let changed: Vec<_> = paths.into_iter().collect();
                if let Err(e) = self.orchestrator.run_with(&id, &changed, Mode::Watch) {
                    // the loop goes on, the next change gets another try
                    tracing::error!(task = %id, "rebuild failed:\n{e}");
                }

                let mut slots = self.slots.lock().unwrap();
                let slot = slots.entry(id.clone()).or_default();
                match slot.parked.take() {
                    Some(next) => paths = next,
                    None => {
                        slot.running = false;
                        break;
                    }
                }
            }
        });

        true
    }
}

impl Orchestrator {
    /// Runs the bound tasks for every window until `windows` ends.
    ///
    /// Failed runs are logged and do not end the loop. Runs still in flight
    /// when the windows end are waited for.
    pub fn watch<I>(&self, map: &WatchMap, windows: I)
    where
        I: IntoIterator<Item = Vec<ChangeEvent>>,
    {
        let dispatcher = Dispatcher::new(self);

        std::thread::scope(|scope| {
            for window in windows {
                for (id, paths) in map.tasks_for(&window) {
                    if !self.contains(&id) {
                        tracing::warn!(task = %id, "bound task is not registered");
                        continue;
                    }
                    tracing::info!(task = %id, paths = paths.len(), "change detected");
                    dispatcher.trigger(scope, &id, paths);
                }
            }
        });

        tracing::info!("stopped watching");
    }
}
