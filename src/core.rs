use std::fmt::Display;
use std::time::Instant;

use console::Style;
use serde::{Deserialize, Serialize};

const ANSI_BLUE: Style = Style::new().blue();

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `livepack`, this serves two purposes:
/// 1. It fingerprints the raw content of every module in the script graph, so
///    a file that was touched but not edited does not invalidate anything.
/// 2. It identifies the bytes of every published artifact.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The kind of deployable asset an artifact belongs to.
///
/// Serialized as `"script"` or `"style"` on the live-update wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Script,
    Style,
}

impl AssetClass {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetClass::Script => "script",
            AssetClass::Style => "style",
        }
    }

    /// File extension of artifacts of this class.
    pub fn extension(self) -> &'static str {
        match self {
            AssetClass::Script => "js",
            AssetClass::Style => "css",
        }
    }
}

impl Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mode in which the pipeline is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Run the requested tasks once and exit.
    Build,
    /// Keep watching the sources and push updates to connected sessions.
    Watch,
}

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}
