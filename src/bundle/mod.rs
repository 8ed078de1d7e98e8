//! Incremental CommonJS bundler.
//!
//! The [`Bundler`] owns the [`ModuleGraph`] of one script target and is the
//! only thing that ever mutates it. A build works on a staged copy of the
//! graph (nodes are shared, only the index is copied) and swaps it in after
//! every module has been transformed and the bundle linked, so a failed build
//! leaves the cache exactly as it was.
//!
//! ## Incremental builds
//!
//! For every changed path that is part of the graph:
//! 1. the file is re-read and hashed; an identical hash is not a change;
//! 2. the node's cached output is dropped and it is re-transformed, which
//!    also re-resolves its `require` list;
//! 3. its direct importers are re-transformed as well (one hop), since we do
//!    not analyse whether the exported shape changed;
//! 4. modules that became reachable are loaded, modules that did not stay
//!    reachable are pruned;
//! 5. the bundle is re-linked from the cached outputs.

mod graph;
mod link;
mod resolve;

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

pub use crate::bundle::graph::{Dependency, ModuleGraph, ModuleNode};
pub use crate::bundle::resolve::{absolute, resolve, scan_requires};

use crate::artifact::BuildArtifact;
use crate::core::{AssetClass, Hash32, Mode};
use crate::error::{BuildError, NoChangeError, TransformError};
use crate::sourcemap::SourceMap;
use crate::transform::{Asset, Registry, TransformContext};

/// What the last successful build did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Modules that went through the transform chain, sorted.
    pub transformed: Vec<Utf8PathBuf>,
    /// Modules dropped because nothing reaches them anymore.
    pub pruned: Vec<Utf8PathBuf>,
    /// Size of the graph after the build.
    pub modules: usize,
}

pub struct Bundler {
    name: String,
    standalone: Option<String>,
    registry: Arc<Registry>,
    mode: Mode,
    graph: Option<ModuleGraph>,
    /// Paths whose last rebuild failed; retried with the next change set.
    pending: BTreeSet<Utf8PathBuf>,
    generation: u64,
    stats: BuildStats,
}

impl Bundler {
    /// Creates a bundler producing an artifact called `name`.
    pub fn new(name: impl Into<String>, registry: Arc<Registry>) -> Self {
        Self {
            name: name.into(),
            standalone: None,
            registry,
            mode: Mode::Build,
            graph: None,
            pending: BTreeSet::new(),
            generation: 0,
            stats: BuildStats::default(),
        }
    }

    /// Exposes the entry's exports under a global name (UMD).
    pub fn standalone(mut self, global: impl Into<String>) -> Self {
        self.standalone = Some(global.into());
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Generation of the last successful build, `0` before the first one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn graph(&self) -> Option<&ModuleGraph> {
        self.graph.as_ref()
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    /// Resolves the whole graph from `entry`, transforming every module.
    pub fn build_full(&mut self, entry: impl AsRef<Utf8Path>) -> Result<BuildArtifact, BuildError> {
        let s = Instant::now();
        let entry = absolute(entry.as_ref());

        let mut graph = ModuleGraph::new(entry.clone());
        let mut transformed = Vec::new();

        self.load_missing(&mut graph, vec![entry], &mut transformed)?;

        let artifact = self.commit(graph, transformed, Vec::new())?;
        tracing::info!(
            name = %self.name,
            generation = artifact.generation,
            modules = self.stats.modules,
            "bundled {}",
            crate::core::as_overhead(s)
        );

        Ok(artifact)
    }

    /// Rebuilds after `changed` paths were modified, created or deleted.
    ///
    /// Returns [`NoChangeError`] without touching the generation when none of
    /// the paths belongs to the graph or none of them actually changed.
    pub fn build_incremental(
        &mut self,
        changed: &[Utf8PathBuf],
    ) -> Result<BuildArtifact, BuildError> {
        let Some(staged) = self.graph.clone() else {
            return Err(NoChangeError.into());
        };
        let s = Instant::now();

        let candidates: BTreeSet<Utf8PathBuf> = changed
            .iter()
            .map(|path| absolute(path))
            .filter(|path| staged.contains(path))
            .chain(self.pending.iter().cloned())
            .collect();

        if candidates.is_empty() {
            return Err(NoChangeError.into());
        }

        match self.rebuild(staged, &candidates) {
            Ok(Some(artifact)) => {
                tracing::info!(
                    name = %self.name,
                    generation = artifact.generation,
                    transformed = self.stats.transformed.len(),
                    "rebundled {}",
                    crate::core::as_overhead(s)
                );
                Ok(artifact)
            }
            Ok(None) => Err(NoChangeError.into()),
            Err(e) => {
                self.pending.extend(candidates);
                Err(e)
            }
        }
    }

    fn rebuild(
        &mut self,
        mut graph: ModuleGraph,
        candidates: &BTreeSet<Utf8PathBuf>,
    ) -> Result<Option<BuildArtifact>, BuildError> {
        // 1. re-read changed files, keep the ones whose content differs
        let reads = candidates
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|path| {
                if !path.exists() {
                    return Ok((path, None));
                }
                let source = read_module(&path)?;
                Ok((path, Some(source)))
            })
            .collect::<Result<Vec<_>, TransformError>>()?;

        let mut invalidated = BTreeSet::new();
        let mut fresh = Vec::new();
        let mut deleted = Vec::new();

        for (path, source) in reads {
            match source {
                None => deleted.push(path),
                Some(source) => {
                    let hash = Hash32::hash(source.as_bytes());
                    let cached = graph.get(&path);
                    let unchanged = cached
                        .is_some_and(|node| node.hash == hash && node.output.is_some());
                    if unchanged && !self.pending.contains(&path) {
                        continue;
                    }
                    fresh.push((path, Arc::<str>::from(source)));
                }
            }
        }

        if fresh.is_empty() && deleted.is_empty() {
            return Ok(None);
        }

        for (path, _) in &fresh {
            invalidated.insert(path.clone());
        }
        invalidated.extend(deleted.iter().cloned());

        // 2. one hop along the reverse edges
        let importers: BTreeSet<Utf8PathBuf> = invalidated
            .iter()
            .flat_map(|path| graph.dependents(path).map(Utf8Path::to_path_buf).collect::<Vec<_>>())
            .filter(|path| !invalidated.contains(path))
            .collect();

        for path in &deleted {
            graph.remove(path);
        }

        let mut work: Vec<(Utf8PathBuf, Arc<str>)> = fresh;
        for path in &importers {
            if let Some(node) = graph.get(path) {
                work.push((path.clone(), node.source.clone()));
            }
        }

        // 3. re-transform and re-resolve, in parallel
        let nodes = work
            .into_par_iter()
            .map(|(path, source)| self.process(path, source))
            .collect::<Result<Vec<_>, TransformError>>()?;

        let mut transformed = Vec::new();
        let mut discovered = Vec::new();

        for node in nodes {
            transformed.push(node.path.clone());
            discovered.extend(node.resolved().map(Utf8Path::to_path_buf));
            graph.insert(node);
        }

        // 4. newly required modules, then garbage
        self.load_missing(&mut graph, discovered, &mut transformed)?;
        let pruned = graph.prune();

        if !graph.contains(graph.entry()) {
            let entry = graph.entry().to_path_buf();
            return Err(TransformError::new(
                "read",
                anyhow::anyhow!("entry point no longer exists"),
            )
            .at(entry)
            .into());
        }

        self.commit(graph, transformed, pruned).map(Some)
    }

    /// Loads every module in `frontier` (and what it requires) that is not
    /// in the graph yet, one breadth-first level at a time.
    fn load_missing(
        &self,
        graph: &mut ModuleGraph,
        mut frontier: Vec<Utf8PathBuf>,
        transformed: &mut Vec<Utf8PathBuf>,
    ) -> Result<(), TransformError> {
        loop {
            let level: BTreeSet<Utf8PathBuf> = frontier
                .drain(..)
                .filter(|path| !graph.contains(path))
                .collect();

            if level.is_empty() {
                return Ok(());
            }

            let nodes = level
                .into_iter()
                .collect::<Vec<_>>()
                .into_par_iter()
                .map(|path| {
                    let source = read_module(&path)?;
                    self.process(path, Arc::from(source))
                })
                .collect::<Result<Vec<_>, TransformError>>()?;

            for node in nodes {
                frontier.extend(node.resolved().map(Utf8Path::to_path_buf));
                transformed.push(node.path.clone());
                graph.insert(node);
            }
        }
    }

    /// Transforms one module and resolves its dependencies.
    fn process(&self, path: Utf8PathBuf, source: Arc<str>) -> Result<ModuleNode, TransformError> {
        let ctx = TransformContext {
            class: AssetClass::Script,
            path: &path,
            mode: self.mode,
        };

        let code = match path.extension() {
            Some("json") => format!("module.exports = {};\n", source.trim_end()),
            _ => source.to_string(),
        };

        let asset = Asset {
            name: path.file_name().unwrap_or_default().to_string(),
            map: Some(SourceMap::identity(path.as_str(), &code)),
            code,
        };
        let output = self.registry.run_script(asset, &ctx)?;

        let dependencies = scan_requires(&output.code)
            .into_iter()
            .map(|specifier| {
                let resolved = resolve(&path, &specifier)?;
                Ok(Dependency {
                    specifier,
                    path: resolved,
                })
            })
            .collect::<Result<Vec<_>, TransformError>>()?;

        Ok(ModuleNode {
            hash: Hash32::hash(source.as_bytes()),
            path,
            source,
            dependencies,
            output: Some(output),
        })
    }

    /// Links the staged graph and makes it the current one.
    fn commit(
        &mut self,
        graph: ModuleGraph,
        mut transformed: Vec<Utf8PathBuf>,
        pruned: Vec<Utf8PathBuf>,
    ) -> Result<BuildArtifact, BuildError> {
        if let Some((from, to)) = graph.dangling().first() {
            return Err(TransformError::new(
                "link",
                anyhow::anyhow!("dangling edge to {to}"),
            )
            .at(*from)
            .into());
        }

        let root = graph
            .entry()
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_default();
        let asset = link::link(&graph, &self.name, self.standalone.as_deref(), &root);

        self.generation += 1;
        transformed.sort();
        transformed.dedup();

        self.stats = BuildStats {
            transformed,
            pruned,
            modules: graph.len(),
        };
        self.graph = Some(graph);
        self.pending.clear();

        Ok(BuildArtifact::new(AssetClass::Script, asset, self.generation))
    }
}

fn read_module(path: &Utf8Path) -> Result<String, TransformError> {
    fs::read_to_string(path).map_err(|e| TransformError::new("read", e).at(path))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::transform::transform_fn;

    struct Project {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    impl Project {
        fn new(files: &[(&str, &str)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(dir.path().canonicalize().unwrap()).unwrap();
            let project = Self { _dir: dir, root };
            for (path, code) in files {
                project.write(path, code);
            }
            project
        }

        fn write(&self, path: &str, code: &str) {
            let path = self.root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, code).unwrap();
        }

        fn path(&self, path: &str) -> Utf8PathBuf {
            self.root.join(path)
        }
    }

    fn bundler() -> Bundler {
        Bundler::new("app.bundled.js", Arc::new(Registry::new()))
    }

    fn sample() -> Project {
        Project::new(&[
            ("main.js", "var util = require('./util');\nmodule.exports = util.name;\n"),
            ("util.js", "var leaf = require('./leaf');\nexports.name = leaf;\n"),
            ("leaf.js", "module.exports = 'leaf';\n"),
            ("unused.js", "module.exports = 'nobody imports me';\n"),
        ])
    }

    #[test]
    fn full_build_resolves_the_whole_graph() {
        let project = sample();
        let mut bundler = bundler();

        let artifact = bundler.build_full(project.path("main.js")).unwrap();

        assert_eq!(artifact.generation, 1);
        assert_eq!(artifact.class, AssetClass::Script);
        assert!(artifact.code.contains("exports.name = leaf;"));
        assert!(!artifact.code.contains("nobody imports me"));

        let graph = bundler.graph().unwrap();
        assert_eq!(graph.len(), 3);
        assert!(graph.dangling().is_empty());
        assert_eq!(
            graph.dependents(&project.path("util.js")).collect::<Vec<_>>(),
            vec![project.path("main.js").as_path()]
        );
    }

    #[test]
    fn empty_change_set_is_a_no_op() {
        let project = sample();
        let mut bundler = bundler();
        bundler.build_full(project.path("main.js")).unwrap();

        let err = bundler.build_incremental(&[]).unwrap_err();

        assert!(err.is_no_change());
        assert_eq!(bundler.generation(), 1);
    }

    #[test]
    fn unreferenced_file_is_a_no_op() {
        let project = sample();
        let mut bundler = bundler();
        bundler.build_full(project.path("main.js")).unwrap();

        project.write("unused.js", "module.exports = 'still nobody';\n");
        let err = bundler
            .build_incremental(&[project.path("unused.js")])
            .unwrap_err();

        assert!(err.is_no_change());
        assert_eq!(bundler.generation(), 1);
    }

    #[test]
    fn touch_without_edit_is_a_no_op() {
        let project = sample();
        let mut bundler = bundler();
        bundler.build_full(project.path("main.js")).unwrap();

        project.write("leaf.js", "module.exports = 'leaf';\n");
        let err = bundler
            .build_incremental(&[project.path("leaf.js")])
            .unwrap_err();

        assert!(err.is_no_change());
    }

    #[test]
    fn change_retransforms_module_and_direct_importers_only() {
        let project = sample();
        let mut bundler = bundler();
        let first = bundler.build_full(project.path("main.js")).unwrap();

        project.write("leaf.js", "module.exports = 'leaf v2';\n");
        let second = bundler
            .build_incremental(&[project.path("leaf.js")])
            .unwrap();

        assert!(second.generation > first.generation);
        assert!(second.code.contains("leaf v2"));
        assert_eq!(
            bundler.stats().transformed,
            vec![project.path("leaf.js"), project.path("util.js")]
        );

        let node = bundler.graph().unwrap().get(&project.path("leaf.js")).unwrap();
        assert_eq!(node.hash, Hash32::hash("module.exports = 'leaf v2';\n"));
    }

    #[test]
    fn main_imports_util_scenario() {
        let project = Project::new(&[
            ("main.js", "var util = require('./util.js');\nutil();\n"),
            ("util.js", "module.exports = function () { return 1; };\n"),
        ]);
        let mut bundler = bundler();

        let first = bundler.build_full(project.path("main.js")).unwrap();
        assert_eq!(first.generation, 1);

        project.write("util.js", "module.exports = function () { return 2; };\n");
        let second = bundler
            .build_incremental(&[project.path("util.js")])
            .unwrap();

        assert_eq!(second.generation, 2);
        let node = bundler.graph().unwrap().get(&project.path("util.js")).unwrap();
        assert_eq!(
            node.hash,
            Hash32::hash("module.exports = function () { return 2; };\n")
        );
        assert_ne!(first.hash, second.hash);
    }

    #[test]
    fn new_requires_are_loaded_and_dropped_ones_pruned() {
        let project = sample();
        let mut bundler = bundler();
        bundler.build_full(project.path("main.js")).unwrap();

        project.write("extra.js", "module.exports = 'extra';\n");
        project.write("util.js", "exports.name = require('./extra');\n");
        let artifact = bundler
            .build_incremental(&[project.path("util.js")])
            .unwrap();

        assert!(artifact.code.contains("'extra'"));
        let graph = bundler.graph().unwrap();
        assert!(graph.contains(&project.path("extra.js")));
        assert!(!graph.contains(&project.path("leaf.js")));
        assert_eq!(bundler.stats().pruned, vec![project.path("leaf.js")]);
        assert!(graph.dangling().is_empty());
    }

    #[test]
    fn failed_build_keeps_cache_and_retries_later() {
        let project = sample();
        let mut registry = Registry::new();
        registry.add_script(transform_fn("lint", |asset, _| {
            if asset.code.contains("BROKEN") {
                anyhow::bail!("syntax error");
            }
            Ok(asset)
        }));
        let mut bundler = Bundler::new("app.bundled.js", Arc::new(registry));
        bundler.build_full(project.path("main.js")).unwrap();

        project.write("leaf.js", "BROKEN\n");
        let err = bundler
            .build_incremental(&[project.path("leaf.js")])
            .unwrap_err();

        match err {
            BuildError::Transform(e) => {
                assert_eq!(e.stage, "lint");
                assert_eq!(e.path, Some(project.path("leaf.js")));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(bundler.generation(), 1);
        let node = bundler.graph().unwrap().get(&project.path("leaf.js")).unwrap();
        assert_eq!(node.hash, Hash32::hash("module.exports = 'leaf';\n"));

        // fixed in place; an unrelated change set still picks it up
        project.write("leaf.js", "module.exports = 'fixed';\n");
        let artifact = bundler.build_incremental(&[]).unwrap();
        assert!(artifact.code.contains("'fixed'"));
        assert_eq!(artifact.generation, 2);
    }

    #[test]
    fn missing_module_fails_full_build() {
        let project = Project::new(&[("main.js", "require('./nope');\n")]);
        let mut bundler = bundler();

        let err = bundler.build_full(project.path("main.js")).unwrap_err();

        assert!(matches!(err, BuildError::Transform(ref e) if e.stage == "resolve"));
        assert_eq!(bundler.generation(), 0);
        assert!(bundler.graph().is_none());
    }

    #[test]
    fn requires_in_comments_and_strings_are_not_edges() {
        let project = Project::new(&[
            (
                "main.js",
                "/*\n var old = require('./old');\n*/\nvar msg = \"require('./nope')\";\nmodule.exports = require('./leaf');\n",
            ),
            ("leaf.js", "module.exports = 'leaf';\n"),
        ]);
        let mut bundler = bundler();

        bundler.build_full(project.path("main.js")).unwrap();

        assert_eq!(bundler.graph().unwrap().len(), 2);
    }

    #[test]
    fn json_modules_are_wrapped() {
        let project = Project::new(&[
            ("main.js", "module.exports = require('./data');\n"),
            ("data.json", "{ \"a\": 1 }\n"),
        ]);
        let mut bundler = bundler();

        let artifact = bundler.build_full(project.path("main.js")).unwrap();
        assert!(artifact.code.contains("module.exports = { \"a\": 1 };"));
    }
}
