//! Pluggable processing steps.
//!
//! A [`Transform`] takes an [`Asset`] and returns a new one. Transforms must
//! be pure: the bundler runs them for independent modules in parallel and in
//! no particular order, so they cannot rely on hidden shared state.
//!
//! The [`Registry`] keeps two chains:
//!
//! * **scripts**: an ordered list applied to every module of the script graph
//!   before its dependencies are scanned;
//! * **styles**: fixed slots run in [`StyleStage`] order, any of which can be
//!   replaced or (except for compilation) removed.

pub mod script;
pub mod style;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use camino::Utf8Path;

use crate::core::{AssetClass, Mode};
use crate::error::TransformError;
use crate::sourcemap::SourceMap;

/// Text flowing through a transform chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    /// Output file name; the naming stage may rewrite it.
    pub name: String,
    pub code: String,
    pub map: Option<SourceMap>,
}

impl Asset {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            map: None,
        }
    }

    /// Replaces the code with derived text, keeping the source map in step.
    ///
    /// `origins[i]` is the line of the current code the new line `i` came from.
    pub fn rewrite(mut self, code: String, origins: &[Option<usize>]) -> Self {
        self.map = self.map.map(|map| map.remap(origins));
        self.code = code;
        self
    }
}

/// Read-only information handed to every transform call.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub class: AssetClass,
    /// Source file the asset originates from.
    pub path: &'a Utf8Path,
    pub mode: Mode,
}

pub trait Transform: Send + Sync {
    /// Stage name reported in errors.
    fn name(&self) -> &str;

    fn apply(&self, asset: Asset, ctx: &TransformContext<'_>) -> anyhow::Result<Asset>;
}

/// A transform built from a closure.
pub struct FnTransform<F> {
    name: String,
    func: F,
}

impl<F> Transform for FnTransform<F>
where
    F: Fn(Asset, &TransformContext<'_>) -> anyhow::Result<Asset> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, asset: Asset, ctx: &TransformContext<'_>) -> anyhow::Result<Asset> {
        (self.func)(asset, ctx)
    }
}

/// Wraps a closure into a named [`Transform`].
pub fn transform_fn<F>(name: impl Into<String>, func: F) -> Arc<dyn Transform>
where
    F: Fn(Asset, &TransformContext<'_>) -> anyhow::Result<Asset> + Send + Sync + 'static,
{
    Arc::new(FnTransform {
        name: name.into(),
        func,
    })
}

/// Fixed order of the stylesheet chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StyleStage {
    Compile,
    Prefix,
    Minify,
    Rename,
    SourceMap,
}

impl StyleStage {
    pub fn as_str(self) -> &'static str {
        match self {
            StyleStage::Compile => "compile",
            StyleStage::Prefix => "prefix",
            StyleStage::Minify => "minify",
            StyleStage::Rename => "rename",
            StyleStage::SourceMap => "sourcemap",
        }
    }
}

impl Display for StyleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct Registry {
    script: Vec<Arc<dyn Transform>>,
    style: BTreeMap<StyleStage, Arc<dyn Transform>>,
}

impl Registry {
    /// Empty script chain and the built-in stylesheet chain without
    /// minification.
    pub fn new() -> Self {
        let mut style: BTreeMap<StyleStage, Arc<dyn Transform>> = BTreeMap::new();
        style.insert(StyleStage::Compile, Arc::new(style::SassCompile));
        style.insert(StyleStage::Prefix, Arc::new(style::Prefix::default()));
        style.insert(StyleStage::Rename, Arc::new(style::Rename::new("")));
        style.insert(StyleStage::SourceMap, Arc::new(style::EmitMap));

        Self {
            script: Vec::new(),
            style,
        }
    }

    /// Appends a step to the per-module script chain.
    pub fn add_script(&mut self, transform: Arc<dyn Transform>) -> &mut Self {
        self.script.push(transform);
        self
    }

    /// Installs (or replaces) the transform for a stylesheet stage.
    pub fn set_style(&mut self, stage: StyleStage, transform: Arc<dyn Transform>) -> &mut Self {
        self.style.insert(stage, transform);
        self
    }

    /// Disables a stylesheet stage. Compilation cannot be removed.
    pub fn remove_style(&mut self, stage: StyleStage) -> &mut Self {
        if stage != StyleStage::Compile {
            self.style.remove(&stage);
        }
        self
    }

    pub fn style_stages(&self) -> impl Iterator<Item = StyleStage> + '_ {
        self.style.keys().copied()
    }

    /// Runs the script chain over a single module.
    pub fn run_script(
        &self,
        asset: Asset,
        ctx: &TransformContext<'_>,
    ) -> Result<Asset, TransformError> {
        self.script.iter().try_fold(asset, |asset, step| {
            step.apply(asset, ctx)
                .map_err(|e| TransformError::new(step.name().to_string(), e).at(ctx.path))
        })
    }

    /// Runs the stylesheet chain; a failing stage stops the chain.
    pub fn run_style(
        &self,
        asset: Asset,
        ctx: &TransformContext<'_>,
    ) -> Result<Asset, TransformError> {
        self.style.iter().try_fold(asset, |asset, (stage, step)| {
            tracing::debug!(stage = %stage, path = %ctx.path, "running stylesheet stage");
            step.apply(asset, ctx)
                .map_err(|e| TransformError::new(stage.as_str(), e).at(ctx.path))
        })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
