//! Build artifacts and the store they are published to.
//!
//! An artifact is immutable; a rebuild supersedes it with a new one carrying a
//! higher generation. The store is the single writer of the output directory:
//! every artifact is written next to its source map through a temporary file
//! and a rename, so a reader never observes a half written file, and an
//! artifact that is older than the one already published is refused.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::sync::{Arc, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::NamedTempFile;

use crate::core::{AssetClass, Hash32};
use crate::sourcemap::SourceMap;
use crate::transform::Asset;

/// Output of one successful build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildArtifact {
    pub class: AssetClass,
    /// Stable file name inside the output directory.
    pub name: String,
    pub code: Arc<str>,
    pub map: Option<SourceMap>,
    /// Hash of `code`.
    pub hash: Hash32,
    /// Strictly increasing per artifact name.
    pub generation: u64,
}

impl BuildArtifact {
    pub fn new(class: AssetClass, asset: Asset, generation: u64) -> Self {
        Self {
            class,
            hash: Hash32::hash(asset.code.as_bytes()),
            name: asset.name,
            code: Arc::from(asset.code),
            map: asset.map,
            generation,
        }
    }

    /// File name of the companion source map.
    pub fn map_name(&self) -> String {
        format!("{}.map", self.name)
    }
}

/// Outcome of [`ArtifactStore::publish`].
#[derive(Debug, Clone)]
pub enum Publish {
    /// The artifact is on disk and is now the one being served.
    Written(Arc<BuildArtifact>),
    /// A build with the same or a newer generation was already published;
    /// nothing was written.
    Stale { current: u64 },
}

impl Publish {
    pub fn is_written(&self) -> bool {
        matches!(self, Publish::Written(_))
    }
}

#[derive(Debug, Default)]
struct Served {
    artifacts: HashMap<String, Arc<BuildArtifact>>,
    /// Survives `clean`, so generations never go backwards.
    generations: HashMap<String, u64>,
}

#[derive(Debug)]
pub struct ArtifactStore {
    out_dir: Utf8PathBuf,
    served: RwLock<Served>,
}

impl ArtifactStore {
    pub fn new(out_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            served: RwLock::new(Served::default()),
        }
    }

    pub fn out_dir(&self) -> &Utf8Path {
        &self.out_dir
    }

    /// Writes `artifact` and its map, replacing the previous version.
    pub fn publish(&self, artifact: BuildArtifact) -> io::Result<Publish> {
        // the write lock is held across the file writes: one writer at a time
        let mut served = self.served.write().unwrap();

        if let Some(&current) = served.generations.get(&artifact.name)
            && current >= artifact.generation
        {
            tracing::debug!(
                name = %artifact.name,
                generation = artifact.generation,
                current,
                "discarding stale artifact"
            );
            return Ok(Publish::Stale { current });
        }

        fs::create_dir_all(&self.out_dir)?;

        if let Some(map) = &artifact.map {
            let json = map.to_json().map_err(io::Error::other)?;
            write_atomic(&self.out_dir.join(artifact.map_name()), json.as_bytes())?;
        }
        write_atomic(&self.out_dir.join(&artifact.name), artifact.code.as_bytes())?;

        let artifact = Arc::new(artifact);
        served
            .generations
            .insert(artifact.name.clone(), artifact.generation);
        served
            .artifacts
            .insert(artifact.name.clone(), artifact.clone());

        tracing::debug!(name = %artifact.name, generation = artifact.generation, "published");
        Ok(Publish::Written(artifact))
    }

    /// The artifact currently served under `name`.
    pub fn latest(&self, name: &str) -> Option<Arc<BuildArtifact>> {
        self.served.read().unwrap().artifacts.get(name).cloned()
    }

    /// Last published generation for `name`, `0` if none.
    pub fn generation(&self, name: &str) -> u64 {
        self.served
            .read()
            .unwrap()
            .generations
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Removes the output directory. A missing directory is not an error.
    pub fn clean(&self) -> io::Result<()> {
        let mut served = self.served.write().unwrap();
        served.artifacts.clear();

        match fs::remove_dir_all(&self.out_dir) {
            Ok(()) => {
                tracing::info!(dir = %self.out_dir, "removed output directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Writes through a temporary file in the same directory, then renames.
fn write_atomic(path: &Utf8Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or(Utf8Path::new("."));
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
