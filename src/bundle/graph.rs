//! The module graph cache.
//!
//! Nodes are keyed by absolute source path. Forward edges live on the nodes
//! themselves, the reverse index (`dependents`) is kept next to them so that
//! invalidation can walk from a changed module to its importers without a
//! scan. Nodes are reference counted, so staging a new version of the graph
//! only copies the map, never the module text.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Hash32;
use crate::transform::Asset;

/// A `require(...)` found in a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// The string literal as written in the source.
    pub specifier: String,
    /// Resolved module, `None` for externals (bare package names).
    pub path: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ModuleNode {
    pub path: Utf8PathBuf,
    /// Hash of the raw file content.
    pub hash: Hash32,
    /// Raw file content, kept for re-transformation and `sourcesContent`.
    pub source: Arc<str>,
    pub dependencies: Vec<Dependency>,
    /// Transformed output, `None` once invalidated.
    pub output: Option<Asset>,
}

impl ModuleNode {
    pub fn resolved(&self) -> impl Iterator<Item = &Utf8Path> {
        self.dependencies.iter().filter_map(|dep| dep.path.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct ModuleGraph {
    entry: Utf8PathBuf,
    nodes: BTreeMap<Utf8PathBuf, Arc<ModuleNode>>,
    dependents: HashMap<Utf8PathBuf, BTreeSet<Utf8PathBuf>>,
}

impl ModuleGraph {
    pub fn new(entry: impl Into<Utf8PathBuf>) -> Self {
        Self {
            entry: entry.into(),
            nodes: BTreeMap::new(),
            dependents: HashMap::new(),
        }
    }

    pub fn entry(&self) -> &Utf8Path {
        &self.entry
    }

    pub fn get(&self, path: &Utf8Path) -> Option<&Arc<ModuleNode>> {
        self.nodes.get(path)
    }

    pub fn contains(&self, path: &Utf8Path) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.nodes.keys().map(Utf8PathBuf::as_path)
    }

    /// Modules importing `path`.
    pub fn dependents(&self, path: &Utf8Path) -> impl Iterator<Item = &Utf8Path> {
        self.dependents
            .get(path)
            .into_iter()
            .flat_map(|set| set.iter().map(Utf8PathBuf::as_path))
    }

    /// Inserts or replaces a node, keeping the reverse index in step.
    pub fn insert(&mut self, node: ModuleNode) {
        if let Some(old) = self.nodes.remove(&node.path) {
            self.unlink(&old);
        }

        for dep in node.resolved() {
            self.dependents
                .entry(dep.to_path_buf())
                .or_default()
                .insert(node.path.clone());
        }

        self.nodes.insert(node.path.clone(), Arc::new(node));
    }

    pub fn remove(&mut self, path: &Utf8Path) -> Option<Arc<ModuleNode>> {
        let node = self.nodes.remove(path)?;
        self.unlink(&node);
        Some(node)
    }

    /// Modules reachable from the entry point, entry first, then depth-first
    /// in `require` order.
    pub fn reachable(&self) -> Vec<&Utf8Path> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut stack = vec![self.entry.as_path()];

        while let Some(path) = stack.pop() {
            if !seen.insert(path) {
                continue;
            }
            let Some(node) = self.nodes.get(path) else {
                continue;
            };
            order.push(node.path.as_path());

            let deps: Vec<_> = node.resolved().collect();
            for dep in deps.into_iter().rev() {
                if !seen.contains(dep) {
                    stack.push(dep);
                }
            }
        }

        order
    }

    /// Drops every node the entry point no longer reaches.
    pub fn prune(&mut self) -> Vec<Utf8PathBuf> {
        let reachable: BTreeSet<Utf8PathBuf> =
            self.reachable().into_iter().map(Utf8Path::to_path_buf).collect();

        let stale: Vec<_> = self
            .nodes
            .keys()
            .filter(|path| !reachable.contains(*path))
            .cloned()
            .collect();

        for path in &stale {
            self.remove(path);
        }

        stale
    }

    /// Edges pointing at modules missing from the graph.
    pub fn dangling(&self) -> Vec<(&Utf8Path, &Utf8Path)> {
        self.nodes
            .values()
            .flat_map(|node| node.resolved().map(move |dep| (node.path.as_path(), dep)))
            .filter(|(_, dep)| !self.nodes.contains_key(*dep))
            .collect()
    }

    fn unlink(&mut self, node: &ModuleNode) {
        for dep in node.resolved() {
            if let Some(set) = self.dependents.get_mut(dep) {
                set.remove(&node.path);
                if set.is_empty() {
                    self.dependents.remove(dep);
                }
            }
        }
    }
}
