#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod artifact;
mod bundle;
mod config;
mod core;
mod error;
mod lex;
pub mod live;
mod pipeline;
mod sourcemap;
mod style;
pub mod task;
pub mod transform;

#[cfg(feature = "logging")]
mod logging;
#[cfg(feature = "server")]
mod server;
#[cfg(feature = "live")]
mod watcher;

pub use crate::artifact::{ArtifactStore, BuildArtifact, Publish};
pub use crate::bundle::{BuildStats, Bundler, Dependency, ModuleGraph, ModuleNode};
pub use crate::config::{CONFIG_FILE, Config, ScriptTarget, StyleTarget};
pub use crate::core::{AssetClass, Hash32, Mode};
pub use crate::error::*;
pub use crate::live::{Broadcaster, SessionSink, UpdateMessage, UpdateMode};
pub use crate::pipeline::{CLIENT_SCRIPT, Pipeline};
pub use crate::sourcemap::SourceMap;
pub use crate::style::StyleCompiler;
pub use crate::task::{Orchestrator, RunReport, Task, TaskContext, TaskStatus};

#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
#[cfg(feature = "server")]
pub use crate::server::DevServer;
#[cfg(feature = "live")]
pub use crate::watcher::{CancelHandle, ChangeEvent, ChangeKind, Watcher};
