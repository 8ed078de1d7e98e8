//! The standard task set.
//!
//! [`Pipeline`] owns one bundler, one stylesheet compiler, one artifact store
//! and one broadcaster, and registers the tasks driving them:
//!
//! | task       | after                   | does                                   |
//! |------------|-------------------------|----------------------------------------|
//! | `clean`    |                         | removes the output directory           |
//! | `scripts`  |                         | bundles the script target              |
//! | `styles`   |                         | compiles the stylesheet target         |
//! | `dist:js`  | `scripts`               | writes the minified bundle             |
//! | `dist:css` | `styles`                | writes the minified stylesheet         |
//! | `dist`     | `dist:js`, `dist:css`   |                                        |
//! | `serve`    |                         | starts the development server          |
//! | `watch`    | `scripts`, `styles`     | then watches the sources               |
//! | `default`  | `scripts`, `styles`, `serve` | then watches the sources          |

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use tracing::{debug, error, info};

use crate::artifact::{ArtifactStore, BuildArtifact, Publish};
use crate::bundle::Bundler;
use crate::config::Config;
use crate::core::{AssetClass, Mode};
use crate::error::{BuildError, LivepackError, RegisterError, RunError, TransformError};
use crate::live::{Broadcaster, UpdateMessage};
use crate::style::StyleCompiler;
use crate::task::{Orchestrator, RunReport, Task, TaskContext};
use crate::transform::script::Compact;
use crate::transform::style::{EmitMap, Minify, Rename};
use crate::transform::{Asset, Registry, StyleStage, Transform, TransformContext};

#[cfg(feature = "live")]
use crate::task::WatchBinding;
#[cfg(feature = "live")]
use crate::watcher::CancelHandle;

/// File the live client script is written to, next to the artifacts.
pub const CLIENT_SCRIPT: &str = "livepack.js";

/// State shared by every task of the pipeline.
struct Shared {
    config: Config,
    store: ArtifactStore,
    broadcaster: Arc<Broadcaster>,
    bundler: Mutex<Bundler>,
    styles: Mutex<StyleCompiler>,
    /// Classes whose last build failed.
    failed: Mutex<BTreeSet<AssetClass>>,
    /// Name of the development artifact last published per class.
    served: Mutex<BTreeMap<AssetClass, String>>,
    #[cfg(feature = "server")]
    server: Mutex<Option<std::thread::JoinHandle<anyhow::Result<()>>>>,
}

impl Shared {
    fn scripts(&self, ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        let result = {
            let mut bundler = self.bundler.lock().unwrap();
            if ctx.changed.is_empty() || bundler.graph().is_none() {
                bundler.build_full(&self.config.script.entry)
            } else {
                bundler.build_incremental(ctx.changed)
            }
        };

        self.publish(AssetClass::Script, result)
    }

    fn styles(&self, _: &TaskContext<'_>) -> anyhow::Result<()> {
        let result = self
            .styles
            .lock()
            .unwrap()
            .compile(&self.config.style.entry);

        self.publish(AssetClass::Style, result)
    }

    /// Writes a successful build and tells the sessions about it.
    fn publish(
        &self,
        class: AssetClass,
        result: Result<BuildArtifact, BuildError>,
    ) -> anyhow::Result<()> {
        let artifact = match result {
            Ok(artifact) => artifact,
            Err(e) if e.is_no_change() => {
                info!(class = %class, "no change reachable from the entry point");
                return Ok(());
            }
            Err(e) => {
                self.failed.lock().unwrap().insert(class);
                return Err(e.into());
            }
        };

        let name = artifact.name.clone();
        let published = match self.store.publish(artifact) {
            Ok(published) => published,
            Err(e) => {
                self.failed.lock().unwrap().insert(class);
                return Err(anyhow::Error::new(e).context(format!("couldn't write {name}")));
            }
        };

        match published {
            Publish::Written(artifact) => {
                self.served.lock().unwrap().insert(class, name);

                let recovered = self.failed.lock().unwrap().remove(&class);
                let message = UpdateMessage::for_artifact(class, artifact.generation, recovered);
                let sessions = self.broadcaster.broadcast(message);

                info!(
                    name = %artifact.name,
                    generation = artifact.generation,
                    sessions,
                    "published"
                );
            }
            Publish::Stale { current } => {
                debug!(%name, current, "newer artifact already published");
            }
        }

        Ok(())
    }

    /// Minifies the development artifact of `class` into its `.min` variant.
    fn dist(&self, class: AssetClass, minify: &dyn Transform) -> anyhow::Result<()> {
        let name = self.served.lock().unwrap().get(&class).cloned();
        let Some(dev) = name.and_then(|name| self.store.latest(&name)) else {
            anyhow::bail!("there is no {class} artifact to minify");
        };

        let path = self.store.out_dir().join(&dev.name);
        let ctx = TransformContext {
            class,
            path: &path,
            mode: Mode::Build,
        };

        let asset = Asset {
            name: minified_name(&dev.name),
            code: dev.code.to_string(),
            map: dev.map.clone(),
        };

        let asset = [minify, &EmitMap as &dyn Transform]
            .into_iter()
            .try_fold(asset, |asset, step| {
                step.apply(asset, &ctx)
                    .map_err(|e| TransformError::new(step.name().to_string(), e).at(&path))
            })?;

        let generation = self.store.generation(&asset.name) + 1;
        let artifact = BuildArtifact::new(class, asset, generation);
        let name = artifact.name.clone();

        self.store
            .publish(artifact)
            .map_err(|e| anyhow::Error::new(e).context(format!("couldn't write {name}")))?;

        info!(%name, "wrote production variant");
        Ok(())
    }

    #[cfg(feature = "server")]
    fn serve(&self) -> anyhow::Result<()> {
        let mut server = self.server.lock().unwrap();
        if server.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let dev = crate::server::DevServer {
            port: self.config.http_port,
            serve_dir: self.config.serve_dir.clone(),
            out_dir: self.config.out_dir.clone(),
        };
        *server = Some(dev.start());

        Ok(())
    }

    #[cfg(feature = "server")]
    fn wait_for_server(&self) -> anyhow::Result<()> {
        let handle = self.server.lock().unwrap().take();

        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow::anyhow!("the development server panicked"))?,
            None => Ok(()),
        }
    }
}

/// `main.bundled.js` becomes `main.bundled.min.js`.
fn minified_name(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}.min.{ext}"),
        None => format!("{name}.min"),
    }
}

pub struct Pipeline {
    tasks: Orchestrator,
    shared: Arc<Shared>,
    /// Set while [`run`](Self::run) is watching the sources.
    #[cfg(feature = "live")]
    watching: Mutex<Option<CancelHandle>>,
}

impl Pipeline {
    /// The standard task set with the built-in transform chains.
    pub fn new(config: Config) -> Result<Self, LivepackError> {
        let registry = Self::registry_for(&config);
        Self::with_registry(config, registry)
    }

    /// The standard task set with custom transform chains.
    pub fn with_registry(config: Config, registry: Registry) -> Result<Self, LivepackError> {
        let registry = Arc::new(registry);

        let mut bundler = Bundler::new(&config.script.name, registry.clone());
        if let Some(global) = &config.script.standalone {
            bundler = bundler.standalone(global);
        }

        let shared = Arc::new(Shared {
            store: ArtifactStore::new(&config.out_dir),
            broadcaster: Arc::new(Broadcaster::new()),
            bundler: Mutex::new(bundler),
            styles: Mutex::new(StyleCompiler::new(registry)),
            failed: Mutex::default(),
            served: Mutex::default(),
            #[cfg(feature = "server")]
            server: Mutex::new(None),
            config,
        });

        let mut pipeline = Self {
            tasks: Orchestrator::new(),
            shared,
            #[cfg(feature = "live")]
            watching: Mutex::new(None),
        };
        pipeline.register_standard()?;

        Ok(pipeline)
    }

    /// Built-in chains adjusted to the stylesheet options of `config`.
    pub fn registry_for(config: &Config) -> Registry {
        let mut registry = Registry::new();
        registry.set_style(StyleStage::Rename, Arc::new(Rename::new(&config.style.prefix)));
        if config.style.minify {
            registry.set_style(StyleStage::Minify, Arc::new(Minify));
        }
        registry
    }

    fn register_standard(&mut self) -> Result<(), RegisterError> {
        let shared = self.shared.clone();
        self.tasks.register(Task::new("clean", move |_| {
            shared.store.clean()?;
            Ok(())
        }))?;

        let shared = self.shared.clone();
        self.tasks
            .register(Task::new("scripts", move |ctx| shared.scripts(ctx)))?;

        let shared = self.shared.clone();
        self.tasks
            .register(Task::new("styles", move |ctx| shared.styles(ctx)))?;

        let shared = self.shared.clone();
        self.tasks.register(
            Task::new("dist:js", move |_| shared.dist(AssetClass::Script, &Compact))
                .after(["scripts"]),
        )?;

        let shared = self.shared.clone();
        self.tasks.register(
            Task::new("dist:css", move |_| shared.dist(AssetClass::Style, &Minify))
                .after(["styles"]),
        )?;

        self.tasks
            .register(Task::group("dist").after(["dist:js", "dist:css"]))?;

        #[cfg(feature = "server")]
        {
            let shared = self.shared.clone();
            self.tasks
                .register(Task::new("serve", move |_| shared.serve()))?;
        }

        #[cfg(feature = "live")]
        {
            self.tasks
                .register(Task::group("watch").after(["scripts", "styles"]))?;

            let mut default = vec!["scripts", "styles"];
            if cfg!(feature = "server") {
                default.push("serve");
            }
            self.tasks.register(Task::group("default").after(default))?;
        }

        Ok(())
    }

    /// Adds a task next to the standard ones.
    pub fn register(&mut self, task: Task) -> Result<(), RegisterError> {
        self.tasks.register(task)
    }

    /// Runs `id`. `watch` and `default` then keep watching the sources,
    /// `serve` keeps serving; both only return when that ends.
    ///
    /// A failed initial build does not stop `watch` or `default`: the error
    /// is logged and the next change retries it.
    pub fn run(&self, id: &str) -> Result<RunReport, LivepackError> {
        let watching = cfg!(feature = "live") && matches!(id, "watch" | "default");

        let report = match self.tasks.run(id) {
            Ok(report) => report,
            Err(RunError::Failed { error: err, .. }) if watching => {
                error!("{err}");
                RunReport::default()
            }
            Err(err) => return Err(err.into()),
        };

        // outputs are gone, so nothing counts as built any more
        if report.executed.iter().any(|task| task == "clean") {
            self.tasks.reset();
        }

        #[cfg(feature = "live")]
        if watching {
            self.watch()?;
        }

        #[cfg(feature = "server")]
        if id == "serve" {
            self.shared.wait_for_server()?;
        }

        Ok(report)
    }

    /// Script globs trigger `scripts`, stylesheet globs trigger `styles`.
    #[cfg(feature = "live")]
    pub fn bindings(&self) -> Vec<WatchBinding> {
        let config = &self.shared.config;
        vec![
            WatchBinding::new(config.script.watch.iter().cloned(), ["scripts"]),
            WatchBinding::new(config.style.watch.iter().cloned(), ["styles"]),
        ]
    }

    /// Opens the live socket and runs the bound tasks on every change.
    #[cfg(feature = "live")]
    fn watch(&self) -> Result<(), LivepackError> {
        use crate::live::ws::{reserve_port, spawn_listener};
        use crate::task::WatchMap;
        use crate::watcher::Watcher;

        let config = &self.shared.config;

        let (listener, port) = reserve_port(config.live_port)?;
        let _socket = spawn_listener(listener, self.shared.broadcaster.clone());

        let client = self.write_client_script(port)?;
        info!(
            port,
            client = %console::style(&client).cyan(),
            "live updates enabled"
        );

        let map = WatchMap::new(&self.bindings())?;
        let mut watcher = Watcher::new(map.patterns(), config.debounce())?;

        *self.watching.lock().unwrap() = Some(watcher.cancel_handle());

        info!("watching for changes");
        self.tasks.watch(&map, watcher.windows());

        self.watching.lock().unwrap().take();
        match watcher.take_error() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Ends the watch loop of a running `watch` or `default` task.
    #[cfg(feature = "live")]
    pub fn stop(&self) {
        if let Some(handle) = self.watching.lock().unwrap().as_ref() {
            handle.cancel();
        }
    }

    #[cfg(feature = "live")]
    pub fn is_watching(&self) -> bool {
        self.watching.lock().unwrap().is_some()
    }

    /// Writes the client script for harness pages into the output directory.
    pub fn write_client_script(&self, port: u16) -> std::io::Result<Utf8PathBuf> {
        let out_dir = self.shared.store.out_dir();
        fs::create_dir_all(out_dir)?;

        let path = out_dir.join(CLIENT_SCRIPT);
        fs::write(&path, Broadcaster::client_script(port))?;

        Ok(path)
    }

    pub fn tasks(&self) -> &Orchestrator {
        &self.tasks
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.shared.store
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.shared.broadcaster
    }
}
