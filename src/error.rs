use std::borrow::Cow;
use std::fmt::{Display, Formatter};

use camino::Utf8PathBuf;
use thiserror::Error;

/// Umbrella error returned by the high level entry points.
#[derive(Debug, Error)]
pub enum LivepackError {
    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("Error while reading the configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Adding the prerequisite edges of a task would close a loop.
#[derive(Debug, Error)]
#[error("Task '{id}' would introduce a dependency cycle")]
pub struct CycleError {
    pub id: String,
}

#[derive(Debug, Error)]
#[error("Task '{0}' is already registered")]
pub struct DuplicateTaskError(pub String);

#[derive(Debug, Error)]
#[error("Task '{0}' is not registered")]
pub struct UnknownTaskError(pub String);

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    Duplicate(#[from] DuplicateTaskError),
}

/// The first task that failed during a run, together with its cause.
#[derive(Debug, Error)]
#[error("Task '{id}':\n{cause}")]
pub struct TaskError {
    pub id: String,
    #[source]
    pub cause: anyhow::Error,
}

/// A task that was never started because one of its prerequisites failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Task '{id}' skipped, prerequisite '{failed}' did not succeed")]
pub struct SkippedError {
    pub id: String,
    pub failed: String,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Unknown(#[from] UnknownTaskError),

    #[error("{error}")]
    Failed {
        error: TaskError,
        skipped: Vec<SkippedError>,
    },
}

impl RunError {
    /// The failing task, if the run got as far as executing anything.
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            RunError::Failed { error, .. } => Some(error),
            RunError::Unknown(_) => None,
        }
    }

    pub fn skipped(&self) -> &[SkippedError] {
        match self {
            RunError::Failed { skipped, .. } => skipped,
            RunError::Unknown(_) => &[],
        }
    }
}

/// A single transform step rejected its input.
///
/// `stage` names the step (`compile`, `prefix`, `transform`, `resolve`, ...)
/// and `path` the module it was processing, when there is one.
#[derive(Debug, Error)]
pub struct TransformError {
    pub stage: Cow<'static, str>,
    pub path: Option<Utf8PathBuf>,
    #[source]
    pub cause: anyhow::Error,
}

impl TransformError {
    pub fn new(stage: impl Into<Cow<'static, str>>, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            stage: stage.into(),
            path: None,
            cause: cause.into(),
        }
    }

    pub fn at(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl Display for TransformError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "Transform '{}' failed on {}: {}", self.stage, path, self.cause),
            None => write!(f, "Transform '{}' failed: {}", self.stage, self.cause),
        }
    }
}

/// The changed paths did not touch anything reachable from the entry point.
/// Informational, never a failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("No module reachable from the entry point changed")]
pub struct NoChangeError;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    NoChange(#[from] NoChangeError),

    #[error("Error while writing the artifact:\n{0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    pub fn is_no_change(&self) -> bool {
        matches!(self, BuildError::NoChange(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse config file.\n{0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("The file watcher stopped unexpectedly")]
    Disconnected,
}
