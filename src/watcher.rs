//! Filesystem change events.
//!
//! A [`Watcher`] turns raw `notify` notifications into [`ChangeEvent`]s. The
//! debouncer collects everything that happens within one window; the window
//! is then reduced to at most one event per [`ChangeKind`], each path showing
//! up once, so a burst of writes to the same file is a single change.
//!
//! Only paths matching one of the watched globs make it through. Watching
//! starts at the static prefix of every glob (`js` for `js/**/*.js`), and
//! nested roots are collapsed into their parents.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{
    DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache, new_debouncer,
};

use crate::error::WatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Paths that changed the same way within one debounce window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub paths: BTreeSet<Utf8PathBuf>,
    pub kind: ChangeKind,
}

enum Signal {
    Events(DebounceEventResult),
    Stop,
}

/// Stops a [`Watcher`] from another thread.
#[derive(Clone)]
pub struct CancelHandle(Sender<Signal>);

impl CancelHandle {
    pub fn cancel(&self) {
        // a closed channel means the watcher is already gone
        let _ = self.0.send(Signal::Stop);
    }
}

pub struct Watcher {
    /// `None` once cancelled; dropping it releases the OS handles.
    debouncer: Option<Debouncer<RecommendedWatcher, RecommendedCache>>,
    sender: Sender<Signal>,
    receiver: Receiver<Signal>,
    filters: Vec<Pattern>,
    queue: VecDeque<ChangeEvent>,
    /// The error that stopped the watcher, if any.
    error: Option<WatchError>,
}

impl Watcher {
    /// Starts watching `patterns`, merging notifications within `debounce`.
    pub fn new<S: AsRef<str>>(patterns: &[S], debounce: Duration) -> Result<Self, WatchError> {
        let (sender, receiver) = channel();

        let tx = sender.clone();
        let mut debouncer = new_debouncer(debounce, None, move |result| {
            let _ = tx.send(Signal::Events(result));
        })?;

        let mut roots = HashSet::new();
        let mut filters = Vec::new();
        for pattern in patterns {
            let (root, filter) = resolve_watch_path(pattern)?;
            roots.insert(root);
            filters.push(filter);
        }

        for root in collapse_watch_paths(roots) {
            tracing::info!("watching {}", root);
            debouncer.watch(root.as_std_path(), RecursiveMode::Recursive)?;
        }

        Ok(Self {
            debouncer: Some(debouncer),
            sender,
            receiver,
            filters,
            queue: VecDeque::new(),
            error: None,
        })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.sender.clone())
    }

    /// Blocks until the next window with at least one matching change.
    ///
    /// Returns `None` once the watcher has been cancelled or has failed, and
    /// keeps doing so. A failure is kept for [`take_error`](Self::take_error).
    pub fn next_window(&mut self) -> Option<Vec<ChangeEvent>> {
        loop {
            self.debouncer.as_ref()?;

            match self.receiver.recv() {
                Ok(Signal::Events(Ok(events))) => {
                    let window = coalesce(&self.filters, &events);
                    if !window.is_empty() {
                        return Some(window);
                    }
                }
                Ok(Signal::Events(Err(errors))) => {
                    for error in errors {
                        if is_fatal(&error) {
                            tracing::error!("file watcher failed: {error}");
                            self.debouncer = None;
                            self.error = Some(error.into());
                            return None;
                        }
                        tracing::warn!("watch error: {error}");
                    }
                }
                Ok(Signal::Stop) | Err(_) => {
                    tracing::debug!("file watcher stopped");
                    self.debouncer = None;
                    return None;
                }
            }
        }
    }

    /// The error that ended the windows, `None` after a cancellation.
    pub fn take_error(&mut self) -> Option<WatchError> {
        self.error.take()
    }

    /// The windows as an iterator; ends on cancellation or failure.
    pub fn windows(&mut self) -> impl Iterator<Item = Vec<ChangeEvent>> + '_ {
        std::iter::from_fn(move || self.next_window())
    }
}

impl Iterator for Watcher {
    type Item = ChangeEvent;

    fn next(&mut self) -> Option<ChangeEvent> {
        if self.queue.is_empty() {
            let window = self.next_window()?;
            self.queue.extend(window);
        }
        self.queue.pop_front()
    }
}

/// Errors after which the OS is no longer reporting changes.
fn is_fatal(error: &notify::Error) -> bool {
    matches!(
        error.kind,
        notify::ErrorKind::Io(_)
            | notify::ErrorKind::MaxFilesWatch
            | notify::ErrorKind::InvalidConfig(_)
    )
}

/// Reduces one debounce window to one event per kind.
///
/// A path keeps the last thing that happened to it, except that a path
/// created and then written to within the window still counts as created.
fn coalesce(filters: &[Pattern], events: &[DebouncedEvent]) -> Vec<ChangeEvent> {
    let mut latest: BTreeMap<Utf8PathBuf, ChangeKind> = BTreeMap::new();

    for event in events {
        for (path, kind) in classify(event) {
            let Some(path) = Utf8Path::from_path(path) else {
                tracing::warn!("ignoring non UTF-8 path {}", path.display());
                continue;
            };
            if !filters.iter().any(|filter| filter.matches_path(path.as_std_path())) {
                continue;
            }

            let entry = latest.entry(path.to_path_buf()).or_insert(kind);
            *entry = match (*entry, kind) {
                (ChangeKind::Created, ChangeKind::Modified) => ChangeKind::Created,
                (_, kind) => kind,
            };
        }
    }

    let mut grouped: BTreeMap<ChangeKind, BTreeSet<Utf8PathBuf>> = BTreeMap::new();
    for (path, kind) in latest {
        grouped.entry(kind).or_default().insert(path);
    }

    grouped
        .into_iter()
        .map(|(kind, paths)| ChangeEvent { paths, kind })
        .collect()
}

fn classify(event: &DebouncedEvent) -> Vec<(&std::path::Path, ChangeKind)> {
    let paths = &event.event.paths;

    let kind = match event.event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            ChangeKind::Created
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            ChangeKind::Deleted
        }
        // old name first, new name second
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            return paths
                .iter()
                .zip([ChangeKind::Deleted, ChangeKind::Created])
                .map(|(path, kind)| (path.as_path(), kind))
                .collect();
        }
        EventKind::Access(_) => return Vec::new(),
        _ => ChangeKind::Modified,
    };

    paths.iter().map(|path| (path.as_path(), kind)).collect()
}

/// Splits a glob string into a canonicalized static root path (for
/// watching) and a compiled absolute Pattern (for matching).
pub fn resolve_watch_path(glob_str: impl AsRef<str>) -> Result<(Utf8PathBuf, Pattern), WatchError> {
    let path = Utf8Path::new(glob_str.as_ref());

    // Split path into static root and dynamic suffix (containing wildcards)
    let components: Vec<_> = path.components().collect();
    let split_idx = components
        .iter()
        .position(|c| c.as_str().contains(['*', '?', '[']))
        .unwrap_or(components.len());

    let root_part: Utf8PathBuf = components.iter().take(split_idx).collect();
    let suffix_part: Utf8PathBuf = components.iter().skip(split_idx).collect();

    let absolute_root = root_part.canonicalize_utf8()?;

    // A concrete file is watched through its parent, so that editors which
    // replace the file instead of writing to it are still seen.
    let (watch_root, match_pattern) = if suffix_part.as_str().is_empty() && absolute_root.is_file()
    {
        let parent = absolute_root
            .parent()
            .unwrap_or(&absolute_root)
            .to_path_buf();
        (parent, absolute_root)
    } else {
        let pattern = absolute_root.join(&suffix_part);
        (absolute_root, pattern)
    };

    let pattern = Pattern::new(match_pattern.as_str())?;

    Ok((watch_root, pattern))
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because
/// the watcher is recursive.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Instant;

    use notify::Event;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    use super::*;

    fn root() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().canonicalize().unwrap()).unwrap();
        fs::create_dir_all(root.join("js/lib")).unwrap();
        fs::create_dir_all(root.join("scss")).unwrap();
        fs::write(root.join("js/main.js"), "").unwrap();
        (dir, root)
    }

    fn event(kind: EventKind, paths: &[&Utf8PathBuf]) -> DebouncedEvent {
        let event = paths.iter().fold(Event::new(kind), |event, path| {
            event.add_path(path.as_std_path().to_path_buf())
        });
        DebouncedEvent::new(event, Instant::now())
    }

    fn modified() -> EventKind {
        EventKind::Modify(ModifyKind::Data(DataChange::Content))
    }

    #[test]
    fn test_concrete_file() {
        let (_dir, root) = root();
        let (watch, pattern) = resolve_watch_path(root.join("js/main.js")).unwrap();

        assert_eq!(watch, root.join("js"));
        assert_eq!(pattern.as_str(), root.join("js/main.js"));
    }

    #[test]
    fn test_concrete_directory() {
        let (_dir, root) = root();
        let (watch, pattern) = resolve_watch_path(root.join("scss")).unwrap();

        assert_eq!(watch, root.join("scss"));
        assert_eq!(pattern.as_str(), root.join("scss"));
    }

    #[test]
    fn test_directory_wildcard() {
        let (_dir, root) = root();
        let (watch, pattern) = resolve_watch_path(root.join("js/**/*.js")).unwrap();

        assert_eq!(watch, root.join("js"));
        assert_eq!(pattern.as_str(), root.join("js/**/*.js"));
    }

    #[test]
    fn test_missing_root() {
        let (_dir, root) = root();
        assert!(matches!(
            resolve_watch_path(root.join("nope/**")),
            Err(WatchError::Io(_))
        ));
    }

    #[test]
    fn test_collapse_watch_paths() {
        let mut paths = HashSet::new();
        paths.insert(Utf8PathBuf::from("/a"));
        paths.insert(Utf8PathBuf::from("/a/b"));
        paths.insert(Utf8PathBuf::from("/a/b/c"));
        paths.insert(Utf8PathBuf::from("/b"));
        paths.insert(Utf8PathBuf::from("/c/d"));

        assert_eq!(
            collapse_watch_paths(paths),
            vec![
                Utf8PathBuf::from("/a"),
                Utf8PathBuf::from("/b"),
                Utf8PathBuf::from("/c/d")
            ]
        );
    }

    #[test]
    fn test_collapse_watch_paths_similar_names() {
        let mut paths = HashSet::new();
        paths.insert(Utf8PathBuf::from("/foo"));
        paths.insert(Utf8PathBuf::from("/foo-bar"));

        assert_eq!(
            collapse_watch_paths(paths),
            vec![Utf8PathBuf::from("/foo"), Utf8PathBuf::from("/foo-bar")]
        );
    }

    #[test]
    fn repeated_writes_in_one_window_are_one_change() {
        let (_dir, root) = root();
        let (_, filter) = resolve_watch_path(root.join("js/**/*.js")).unwrap();
        let main = root.join("js/main.js");

        let window = coalesce(
            &[filter],
            &[event(modified(), &[&main]), event(modified(), &[&main])],
        );

        assert_eq!(
            window,
            vec![ChangeEvent {
                paths: BTreeSet::from([main]),
                kind: ChangeKind::Modified,
            }]
        );
    }

    #[test]
    fn window_groups_by_kind_and_filters() {
        let (_dir, root) = root();
        let (_, filter) = resolve_watch_path(root.join("js/**/*.js")).unwrap();
        let fresh = root.join("js/lib/fresh.js");
        let gone = root.join("js/old.js");
        let main = root.join("js/main.js");
        let notes = root.join("js/notes.txt");

        let window = coalesce(
            &[filter],
            &[
                event(EventKind::Create(CreateKind::File), &[&fresh]),
                event(modified(), &[&fresh, &main, &notes]),
                event(EventKind::Remove(RemoveKind::File), &[&gone]),
                event(EventKind::Access(notify::event::AccessKind::Any), &[&main]),
            ],
        );

        assert_eq!(
            window,
            vec![
                ChangeEvent {
                    paths: BTreeSet::from([fresh]),
                    kind: ChangeKind::Created,
                },
                ChangeEvent {
                    paths: BTreeSet::from([main]),
                    kind: ChangeKind::Modified,
                },
                ChangeEvent {
                    paths: BTreeSet::from([gone]),
                    kind: ChangeKind::Deleted,
                },
            ]
        );
    }

    #[test]
    fn rename_is_delete_plus_create() {
        let (_dir, root) = root();
        let (_, filter) = resolve_watch_path(root.join("js/**/*.js")).unwrap();
        let from = root.join("js/a.js");
        let to = root.join("js/b.js");

        let window = coalesce(
            &[filter],
            &[event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &[&from, &to],
            )],
        );

        assert_eq!(window.len(), 2);
        assert_eq!(window[0].kind, ChangeKind::Created);
        assert!(window[0].paths.contains(&to));
        assert_eq!(window[1].kind, ChangeKind::Deleted);
        assert!(window[1].paths.contains(&from));
    }

    #[test]
    fn cancel_ends_the_sequence() {
        let (_dir, root) = root();
        let mut watcher =
            Watcher::new(&[root.join("js/**/*.js").as_str()], Duration::from_millis(10)).unwrap();

        watcher.cancel_handle().cancel();

        assert_eq!(watcher.next_window(), None);
        assert_eq!(watcher.next(), None);
        assert!(watcher.take_error().is_none());
    }

    #[test]
    fn iterator_yields_every_event_of_a_window() {
        let (_dir, root) = root();
        let mut watcher =
            Watcher::new(&[root.join("js/**/*.js").as_str()], Duration::from_millis(10)).unwrap();
        let fresh = root.join("js/fresh.js");
        let main = root.join("js/main.js");

        watcher
            .sender
            .send(Signal::Events(Ok(vec![
                event(EventKind::Create(CreateKind::File), &[&fresh]),
                event(modified(), &[&main]),
            ])))
            .unwrap();
        watcher.cancel_handle().cancel();

        let first = watcher.next().unwrap();
        let second = watcher.next().unwrap();

        assert_eq!(first.kind, ChangeKind::Created);
        assert_eq!(second.kind, ChangeKind::Modified);
        assert_eq!(second.paths, BTreeSet::from([main]));
        assert_eq!(watcher.next(), None);
    }

    #[test]
    fn fatal_error_ends_the_sequence_and_is_kept() {
        let (_dir, root) = root();
        let mut watcher =
            Watcher::new(&[root.join("js/**/*.js").as_str()], Duration::from_millis(10)).unwrap();
        let main = root.join("js/main.js");

        let sender = watcher.sender.clone();
        sender
            .send(Signal::Events(Err(vec![notify::Error::path_not_found()])))
            .unwrap();
        sender
            .send(Signal::Events(Ok(vec![event(modified(), &[&main])])))
            .unwrap();
        sender
            .send(Signal::Events(Err(vec![notify::Error::io(std::io::Error::other(
                "too many open files",
            ))])))
            .unwrap();

        // a recoverable error is skipped
        let window = watcher.next().unwrap();
        assert_eq!(window.paths, BTreeSet::from([main]));

        assert_eq!(watcher.next(), None);
        assert!(matches!(watcher.take_error(), Some(WatchError::Notify(_))));
        assert_eq!(watcher.next_window(), None);
    }
}
