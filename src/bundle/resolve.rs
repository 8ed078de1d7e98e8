//! Finding and resolving `require(...)` calls.

use std::sync::LazyLock;

use anyhow::anyhow;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::error::TransformError;
use crate::lex;

static REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[^.\w$])require\s*\(\s*(?:'([^'\n]*)'|"([^"\n]*)")\s*\)"#)
        .expect("valid require regex")
});

/// Extensions tried, in order, for a specifier without one.
const EXTENSIONS: &[&str] = &["js", "json"];

/// Static `require` specifiers in source order, without duplicates.
///
/// Calls inside comments and string or template literals are not requires.
/// The pattern runs over the masked source and the specifier is read back
/// from the original at the same offsets.
pub fn scan_requires(code: &str) -> Vec<String> {
    let masked = lex::mask(code);
    let mut found: Vec<String> = Vec::new();

    for caps in REQUIRE.captures_iter(&masked) {
        let Some(specifier) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        let specifier = &code[specifier.range()];
        if specifier.is_empty() {
            continue;
        }
        if !found.iter().any(|s| s == specifier) {
            found.push(specifier.to_string());
        }
    }

    found
}

pub fn is_relative(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/')
}

/// Resolves `specifier` as required from `from`.
///
/// Relative specifiers resolve against the importing file, trying the path
/// itself, then the known extensions, then `index.js` inside it. Anything
/// else is an external and resolves to `None`.
pub fn resolve(from: &Utf8Path, specifier: &str) -> Result<Option<Utf8PathBuf>, TransformError> {
    if !is_relative(specifier) {
        return Ok(None);
    }

    let base = match from.parent() {
        Some(dir) => dir.join(specifier),
        None => Utf8PathBuf::from(specifier),
    };

    let mut candidates = vec![base.clone()];
    for ext in EXTENSIONS {
        candidates.push(Utf8PathBuf::from(format!("{base}.{ext}")));
    }
    candidates.push(base.join("index.js"));

    for candidate in candidates {
        if candidate.is_file() {
            let path = candidate
                .canonicalize_utf8()
                .map_err(|e| TransformError::new("resolve", e).at(from))?;
            return Ok(Some(path));
        }
    }

    Err(TransformError::new("resolve", anyhow!("cannot find module '{specifier}'")).at(from))
}

/// Absolute form of `path`, following symlinks where the file still exists.
pub fn absolute(path: &Utf8Path) -> Utf8PathBuf {
    if let Ok(path) = path.canonicalize_utf8() {
        return path;
    }

    // deleted files: canonicalize what is left of the path
    if let (Some(dir), Some(name)) = (path.parent(), path.file_name())
        && let Ok(dir) = dir.canonicalize_utf8()
    {
        return dir.join(name);
    }

    path.to_path_buf()
}
