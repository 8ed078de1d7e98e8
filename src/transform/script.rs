//! Built-in script steps.

use super::{Asset, Transform, TransformContext};
use crate::lex::{self, Region};

/// Conservative line-level minifier used for production variants.
///
/// Drops blank lines, lines holding nothing but comments (including a
/// previous `sourceMappingURL` comment) and indentation. Lines inside
/// multi-line template literals are kept verbatim.
pub struct Compact;

impl Transform for Compact {
    fn name(&self) -> &str {
        "minify"
    }

    fn apply(&self, asset: Asset, _: &TransformContext<'_>) -> anyhow::Result<Asset> {
        let regions = lex::regions(&asset.code);
        let region = |i: usize| regions.get(i).copied().unwrap_or(Region::Code);
        let bytes = asset.code.as_bytes();

        let mut out = String::with_capacity(asset.code.len());
        let mut origins = Vec::new();
        let mut start = 0;

        for (index, raw) in asset.code.split_inclusive('\n').enumerate() {
            let line = raw.trim_end_matches(['\n', '\r']);
            let end = start + line.len();

            let has_code =
                (start..end).any(|i| region(i) == Region::Code && !bytes[i].is_ascii_whitespace());

            if region(start) == Region::Literal {
                out.push_str(line);
                out.push('\n');
                origins.push(Some(index));
            } else if has_code {
                let line = line.trim_start();
                let line = match end.checked_sub(1).map(region) {
                    Some(Region::Literal) => line,
                    _ => line.trim_end(),
                };
                out.push_str(line);
                out.push('\n');
                origins.push(Some(index));
            }

            start += raw.len();
        }

        Ok(asset.rewrite(out, &origins))
    }
}
