//! The stylesheet compiler.
//!
//! Stylesheet graphs are small, so there is no cache here: every call
//! compiles the entry point and everything it `@import`s from scratch, then
//! runs the remaining stages of the stylesheet chain in their fixed order.

use std::fs;
use std::sync::Arc;
use std::time::Instant;

use camino::Utf8Path;

use crate::artifact::BuildArtifact;
use crate::core::{AssetClass, Mode};
use crate::error::{BuildError, TransformError};
use crate::transform::{Asset, Registry, TransformContext};

pub struct StyleCompiler {
    registry: Arc<Registry>,
    mode: Mode,
    generation: u64,
}

impl StyleCompiler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            mode: Mode::Build,
            generation: 0,
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Generation of the last successful compilation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Compiles `entry` into a stylesheet artifact named after its stem
    /// (`main.scss` becomes `main.css` before the naming stage).
    ///
    /// A failing stage stops the chain and is reported by name; the
    /// generation only moves on success.
    pub fn compile(&mut self, entry: impl AsRef<Utf8Path>) -> Result<BuildArtifact, BuildError> {
        let s = Instant::now();
        let entry = entry.as_ref();

        let source =
            fs::read_to_string(entry).map_err(|e| TransformError::new("read", e).at(entry))?;

        let ctx = TransformContext {
            class: AssetClass::Style,
            path: entry,
            mode: self.mode,
        };

        let name = format!("{}.css", entry.file_stem().unwrap_or("style"));
        let asset = self.registry.run_style(Asset::new(name, source), &ctx)?;

        self.generation += 1;
        let artifact = BuildArtifact::new(AssetClass::Style, asset, self.generation);

        tracing::info!(
            name = %artifact.name,
            generation = artifact.generation,
            "compiled stylesheet {}",
            crate::core::as_overhead(s)
        );

        Ok(artifact)
    }
}
