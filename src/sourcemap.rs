//! Line-granular source maps (revision 3).
//!
//! Every transform in the pipeline either keeps lines intact or collapses
//! them, so a map only ever records where each generated line starts. That
//! is enough for browsers to point stack traces and devtools at the right
//! line of the right module.

use serde::{Deserialize, Serialize};

use crate::core::AssetClass;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    pub version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources_content: Vec<Option<String>>,
    #[serde(default)]
    pub names: Vec<String>,
    pub mappings: String,
}

/// Where a generated line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineOrigin {
    pub source: u32,
    pub line: u32,
}

impl SourceMap {
    /// Maps every line of `content` onto the same line of `source`.
    pub fn identity(source: impl Into<String>, content: &str) -> Self {
        let mut builder = SourceMapBuilder::new();
        let index = builder.add_source(source, Some(content.to_string()));

        for line in 0..line_count(content) {
            builder.map_line(index, line as u32);
        }

        builder.finish()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Decodes the mappings into the origin of the first segment of each
    /// generated line.
    pub fn lines(&self) -> Vec<Option<LineOrigin>> {
        let mut out = Vec::new();
        let mut source = 0i64;
        let mut line = 0i64;

        for group in self.mappings.split(';') {
            let mut first = None;

            for segment in group.split(',').filter(|s| !s.is_empty()) {
                let fields = vlq_decode(segment);
                if fields.len() < 4 {
                    continue;
                }

                source += fields[1];
                line += fields[2];

                if first.is_none() && source >= 0 && line >= 0 {
                    first = Some(LineOrigin {
                        source: source as u32,
                        line: line as u32,
                    });
                }
            }

            out.push(first);
        }

        out
    }

    /// Builds a map for a derived file whose line `i` came from line
    /// `origins[i]` of the file this map describes.
    pub fn remap(&self, origins: &[Option<usize>]) -> Self {
        let lines = self.lines();
        let mut builder = SourceMapBuilder::new();

        for (source, content) in self.sources.iter().zip(self.contents()) {
            builder.add_source(source.clone(), content);
        }

        for origin in origins {
            match origin.and_then(|i| lines.get(i).copied().flatten()) {
                Some(LineOrigin { source, line }) => builder.map_line(source, line),
                None => builder.skip_line(),
            }
        }

        builder.finish()
    }

    /// Trailing comment pointing a browser at the companion map file.
    pub fn url_comment(class: AssetClass, map_name: &str) -> String {
        match class {
            AssetClass::Script => format!("//# sourceMappingURL={map_name}\n"),
            AssetClass::Style => format!("/*# sourceMappingURL={map_name} */\n"),
        }
    }

    fn contents(&self) -> impl Iterator<Item = Option<String>> + '_ {
        (0..self.sources.len()).map(|i| self.sources_content.get(i).cloned().flatten())
    }
}

/// Accumulates line mappings in generated order.
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    sources: Vec<String>,
    contents: Vec<Option<String>>,
    mappings: String,
    lines: usize,
    prev_source: i64,
    prev_line: i64,
}

impl SourceMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, path: impl Into<String>, content: Option<String>) -> u32 {
        self.sources.push(path.into());
        self.contents.push(content);
        (self.sources.len() - 1) as u32
    }

    /// Appends a generated line starting at `line` of `source`.
    pub fn map_line(&mut self, source: u32, line: u32) {
        self.separate();

        let (source, line) = (source as i64, line as i64);
        vlq_encode(&mut self.mappings, 0);
        vlq_encode(&mut self.mappings, source - self.prev_source);
        vlq_encode(&mut self.mappings, line - self.prev_line);
        vlq_encode(&mut self.mappings, 0);

        self.prev_source = source;
        self.prev_line = line;
    }

    /// Appends a generated line with no origin, e.g. linker glue.
    pub fn skip_line(&mut self) {
        self.separate();
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn finish(self) -> SourceMap {
        let sources_content = if self.contents.iter().any(Option::is_some) {
            self.contents
        } else {
            Vec::new()
        };

        SourceMap {
            version: 3,
            file: None,
            sources: self.sources,
            sources_content,
            names: Vec::new(),
            mappings: self.mappings,
        }
    }

    fn separate(&mut self) {
        if self.lines > 0 {
            self.mappings.push(';');
        }
        self.lines += 1;
    }
}

pub(crate) fn line_count(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        text.lines().count()
    }
}

const BASE64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn vlq_encode(out: &mut String, value: i64) {
    let mut vlq = if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    };

    loop {
        let mut digit = (vlq & 0b11111) as usize;
        vlq >>= 5;
        if vlq > 0 {
            digit |= 0b100000;
        }
        out.push(BASE64[digit] as char);
        if vlq == 0 {
            break;
        }
    }
}

fn vlq_decode(segment: &str) -> Vec<i64> {
    let mut values = Vec::new();
    let mut value = 0i64;
    let mut shift = 0;

    for byte in segment.bytes() {
        let Some(digit) = BASE64.iter().position(|&b| b == byte) else {
            break;
        };
        let digit = digit as i64;

        value += (digit & 0b11111) << shift;

        if digit & 0b100000 != 0 {
            shift += 5;
        } else {
            let negative = value & 1 == 1;
            value >>= 1;
            values.push(if negative { -value } else { value });
            value = 0;
            shift = 0;
        }
    }

    values
}
