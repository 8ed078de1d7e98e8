//! Recognized configuration options.
//!
//! Everything the pipeline needs to know about the environment lives in
//! [`Config`]. It can be written in code or read from a JSON file; missing
//! keys fall back to their defaults and unknown keys are rejected.

use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default file name looked up by the command line driver.
pub const CONFIG_FILE: &str = "livepack.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory the artifacts are written to.
    pub out_dir: Utf8PathBuf,
    /// Window in which repeated notifications for a path merge into one.
    pub debounce_ms: u64,
    /// Directory with harness pages served at `/`.
    pub serve_dir: Utf8PathBuf,
    /// Port of the development HTTP server.
    pub http_port: u16,
    /// Preferred port of the live-update socket.
    pub live_port: u16,
    pub script: ScriptTarget,
    pub style: StyleTarget,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            out_dir: "dist".into(),
            debounce_ms: 50,
            serve_dir: "demos".into(),
            http_port: 8080,
            live_port: 1337,
            script: ScriptTarget::default(),
            style: StyleTarget::default(),
        }
    }
}

impl Config {
    /// Reads the configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Reads the configuration from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// The script bundle produced from a single CommonJS entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptTarget {
    pub entry: Utf8PathBuf,
    /// Stable output file name, e.g. `app.bundled.js`.
    pub name: String,
    /// Global name the entry's exports are exposed under, if any.
    pub standalone: Option<String>,
    /// Globs whose changes trigger the `scripts` task.
    pub watch: Vec<String>,
}

impl Default for ScriptTarget {
    fn default() -> Self {
        Self {
            entry: "js/main.js".into(),
            name: "main.bundled.js".into(),
            standalone: None,
            watch: vec!["js/**/*.js".into()],
        }
    }
}

/// The stylesheet compiled from a single Sass entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StyleTarget {
    pub entry: Utf8PathBuf,
    /// Prefix applied to the output file name by the naming stage.
    pub prefix: String,
    /// Globs whose changes trigger the `styles` task.
    pub watch: Vec<String>,
    /// Minify the development artifact too.
    pub minify: bool,
}

impl Default for StyleTarget {
    fn default() -> Self {
        Self {
            entry: "scss/main.scss".into(),
            prefix: String::new(),
            watch: vec!["scss/**".into()],
            minify: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("livepack.json")).unwrap();
        fs::write(
            &path,
            r#"{ "out_dir": "build", "style": { "prefix": "teleport-" } }"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.out_dir, Utf8PathBuf::from("build"));
        assert_eq!(config.style.prefix, "teleport-");
        assert_eq!(config.style.entry, Utf8PathBuf::from("scss/main.scss"));
        assert_eq!(config.debounce(), Duration::from_millis(50));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_json::from_str::<Config>(r#"{ "outdir": "x" }"#);
        assert!(err.is_err());
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("nope.json")).unwrap();

        assert_eq!(Config::load_or_default(&path).unwrap(), Config::default());
    }
}
