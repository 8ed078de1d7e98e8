//! Built-in stylesheet stages.

use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::Context;
use regex::Regex;

use super::{Asset, Transform, TransformContext};
use crate::sourcemap::{SourceMap, SourceMapBuilder, line_count};

static DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)(-?[a-z][a-z-]*)\s*:\s*([^;{}]+);\s*$").expect("valid declaration regex")
});

/// Compiles Sass/SCSS (or plain CSS) with `grass`, resolving `@import`s
/// relative to the entry file.
///
/// `grass` does not report output positions, so the map it leaves behind
/// names the entry and carries its content without line mappings.
pub struct SassCompile;

impl Transform for SassCompile {
    fn name(&self) -> &str {
        "compile"
    }

    fn apply(&self, asset: Asset, ctx: &TransformContext<'_>) -> anyhow::Result<Asset> {
        let mut options = grass::Options::default().style(grass::OutputStyle::Expanded);
        if let Some(dir) = ctx.path.parent() {
            options = options.load_path(dir.as_std_path());
        }

        let css = grass::from_string(asset.code.clone(), &options)
            .map_err(|err| anyhow::anyhow!("{err}"))?;

        let mut builder = SourceMapBuilder::new();
        builder.add_source(ctx.path.as_str(), Some(asset.code));
        for _ in 0..line_count(&css) {
            builder.skip_line();
        }

        Ok(Asset {
            name: asset.name,
            code: css,
            map: Some(builder.finish()),
        })
    }
}

const PREFIXES: &[(&str, &[&str])] = &[
    ("user-select", &["-webkit-", "-moz-", "-ms-"]),
    ("appearance", &["-webkit-", "-moz-"]),
    ("backdrop-filter", &["-webkit-"]),
    ("text-size-adjust", &["-webkit-", "-moz-", "-ms-"]),
    ("hyphens", &["-webkit-", "-ms-"]),
    ("mask-image", &["-webkit-"]),
    ("box-decoration-break", &["-webkit-"]),
    ("tab-size", &["-moz-"]),
];

/// Adds vendor-prefixed copies of declarations that browsers still need.
///
/// Works on expanded output where every declaration sits on its own line,
/// which is what [`SassCompile`] produces.
pub struct Prefix {
    table: Vec<(&'static str, &'static [&'static str])>,
}

impl Default for Prefix {
    fn default() -> Self {
        Self {
            table: PREFIXES.to_vec(),
        }
    }
}

impl Prefix {
    pub fn with_table(table: Vec<(&'static str, &'static [&'static str])>) -> Self {
        Self { table }
    }

    fn prefixes(&self, property: &str) -> Option<&'static [&'static str]> {
        self.table
            .iter()
            .find(|(name, _)| *name == property)
            .map(|(_, prefixes)| *prefixes)
    }
}

impl Transform for Prefix {
    fn name(&self) -> &str {
        "prefix"
    }

    fn apply(&self, asset: Asset, _: &TransformContext<'_>) -> anyhow::Result<Asset> {
        let mut out = String::with_capacity(asset.code.len());
        let mut origins = Vec::new();
        // declarations already present in the current block
        let mut present = HashSet::new();

        for (index, line) in asset.code.lines().enumerate() {
            if let Some(caps) = DECLARATION.captures(line) {
                let indent = &caps[1];
                let property = &caps[2];
                let value = caps[3].trim();
                present.insert(property.to_string());

                if let Some(prefixes) = self.prefixes(property) {
                    for prefix in prefixes {
                        let prefixed = format!("{prefix}{property}");
                        if present.contains(&prefixed) {
                            continue;
                        }
                        out.push_str(&format!("{indent}{prefixed}: {value};\n"));
                        origins.push(Some(index));
                    }
                }
            } else {
                // selectors and closing braces sit on their own lines
                present.clear();
            }

            out.push_str(line);
            out.push('\n');
            origins.push(Some(index));
        }

        Ok(asset.rewrite(out, &origins))
    }
}

/// Compresses the stylesheet with `grass`.
pub struct Minify;

impl Transform for Minify {
    fn name(&self) -> &str {
        "minify"
    }

    fn apply(&self, asset: Asset, _: &TransformContext<'_>) -> anyhow::Result<Asset> {
        let options = grass::Options::default().style(grass::OutputStyle::Compressed);
        let css = grass::from_string(asset.code.clone(), &options)
            .map_err(|err| anyhow::anyhow!("{err}"))
            .context("couldn't minify stylesheet")?;

        let origins = vec![Some(0); line_count(&css)];
        Ok(asset.rewrite(css, &origins))
    }
}

/// Prepends a fixed prefix to the output file name.
pub struct Rename {
    prefix: String,
}

impl Rename {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Transform for Rename {
    fn name(&self) -> &str {
        "rename"
    }

    fn apply(&self, mut asset: Asset, _: &TransformContext<'_>) -> anyhow::Result<Asset> {
        if !self.prefix.is_empty() && !asset.name.starts_with(&self.prefix) {
            asset.name = format!("{}{}", self.prefix, asset.name);
        }
        Ok(asset)
    }
}

/// Finalizes the map and appends the `sourceMappingURL` comment.
pub struct EmitMap;

impl Transform for EmitMap {
    fn name(&self) -> &str {
        "sourcemap"
    }

    fn apply(&self, mut asset: Asset, ctx: &TransformContext<'_>) -> anyhow::Result<Asset> {
        let map = asset
            .map
            .take()
            .unwrap_or_else(|| SourceMap::identity(ctx.path.as_str(), &asset.code));

        if !asset.code.is_empty() && !asset.code.ends_with('\n') {
            asset.code.push('\n');
        }
        let map_name = format!("{}.map", asset.name);
        asset
            .code
            .push_str(&SourceMap::url_comment(ctx.class, &map_name));

        asset.map = Some(SourceMap {
            file: Some(asset.name.clone()),
            ..map
        });

        Ok(asset)
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;

    use super::*;
    use crate::core::{AssetClass, Mode};

    fn ctx() -> TransformContext<'static> {
        TransformContext {
            class: AssetClass::Style,
            path: Utf8Path::new("scss/app.scss"),
            mode: Mode::Build,
        }
    }

    #[test]
    fn compiles_nested_rules() {
        let asset = Asset::new("app.css", "$c: red;\n.a { .b { color: $c; } }\n");
        let out = SassCompile.apply(asset, &ctx()).unwrap();

        assert!(out.code.contains(".a .b"));
        assert!(out.code.contains("color: red;"));
        assert_eq!(out.map.unwrap().sources, vec!["scss/app.scss".to_string()]);
    }

    #[test]
    fn sass_errors_surface() {
        let asset = Asset::new("app.css", ".a { color: $missing; }");
        assert!(SassCompile.apply(asset, &ctx()).is_err());
    }

    #[test]
    fn prefixes_known_properties_once() {
        let css = ".a {\n  -webkit-user-select: none;\n  user-select: none;\n  color: red;\n}\n";
        let out = Prefix::default()
            .apply(Asset::new("app.css", css), &ctx())
            .unwrap();

        assert_eq!(
            out.code,
            ".a {\n  -webkit-user-select: none;\n  -moz-user-select: none;\n  -ms-user-select: none;\n  user-select: none;\n  color: red;\n}\n"
        );
    }

    #[test]
    fn prefix_keeps_map_in_step() {
        let css = ".a {\n  appearance: none;\n}\n";
        let mut asset = Asset::new("app.css", css);
        asset.map = Some(SourceMap::identity("app.css", css));

        let out = Prefix::default().apply(asset, &ctx()).unwrap();
        let lines = out.map.unwrap().lines();

        // two prefixed copies inserted before line 1
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[1].unwrap().line, 1);
        assert_eq!(lines[2].unwrap().line, 1);
        assert_eq!(lines[3].unwrap().line, 1);
        assert_eq!(lines[4].unwrap().line, 2);
    }

    #[test]
    fn braces_in_strings_and_comments_are_fine() {
        let scss = ".a::after { content: \"{\"; }\n/* } */\n.b { user-select: none; }\n";
        let css = SassCompile
            .apply(Asset::new("app.css", scss), &ctx())
            .unwrap();

        let out = Prefix::default().apply(css, &ctx()).unwrap();

        assert!(out.code.contains("content: \"{\";"));
        assert!(out.code.contains("-moz-user-select: none;"));
    }

    #[test]
    fn minify_compresses() {
        let out = Minify
            .apply(Asset::new("app.css", ".a {\n  color: red;\n}\n"), &ctx())
            .unwrap();
        assert_eq!(out.code.trim(), ".a{color:red}");
    }

    #[test]
    fn rename_and_emit_map() {
        let asset = Asset::new("app.css", ".a{}");
        let asset = Rename::new("teleport-").apply(asset, &ctx()).unwrap();
        let asset = EmitMap.apply(asset, &ctx()).unwrap();

        assert_eq!(asset.name, "teleport-app.css");
        assert!(
            asset
                .code
                .ends_with("/*# sourceMappingURL=teleport-app.css.map */\n")
        );
        assert_eq!(
            asset.map.unwrap().file.as_deref(),
            Some("teleport-app.css")
        );
    }
}
