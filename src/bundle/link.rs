//! Linking cached module outputs into one script.
//!
//! Every module body is wrapped in a `function (require, module, exports)`
//! and registered under a numeric id together with its specifier table. A
//! small prelude evaluates modules on first `require`, exactly once.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use camino::Utf8Path;

use super::graph::ModuleGraph;
use crate::core::AssetClass;
use crate::sourcemap::{SourceMap, SourceMapBuilder};
use crate::transform::Asset;

const PRELUDE: &str = r#"(function (modules, entry) {
var host = typeof require === "function" ? require : null;
var cache = {};
function load(id) {
if (cache[id]) return cache[id].exports;
var module = cache[id] = { exports: {} };
var local = function (name) {
var dep = modules[id][1][name];
if (dep === undefined) {
if (host) return host(name);
throw new Error("Cannot find module '" + name + "'");
}
return load(dep);
};
modules[id][0].call(module.exports, local, module, module.exports);
return module.exports;
}
return load(entry);
})({"#;

/// Links the modules reachable from the entry point.
///
/// Every node must carry transformed output. Source map paths are made
/// relative to `root` where possible.
pub(crate) fn link(
    graph: &ModuleGraph,
    name: &str,
    standalone: Option<&str>,
    root: &Utf8Path,
) -> Asset {
    let order = graph.reachable();
    let ids: HashMap<&Utf8Path, usize> = order.iter().enumerate().map(|(i, p)| (*p, i)).collect();

    let mut code = String::new();
    let mut map = SourceMapBuilder::new();

    match standalone {
        Some(global) => {
            glue(&mut code, &mut map, &umd_header(global));
            glue(&mut code, &mut map, &format!("return {PRELUDE}"));
        }
        None => glue(&mut code, &mut map, PRELUDE),
    }

    for (id, path) in order.iter().copied().enumerate() {
        let Some(node) = graph.get(path) else {
            continue;
        };
        let Some(output) = node.output.as_ref() else {
            continue;
        };

        let display = path.strip_prefix(root).unwrap_or(path);
        let source = map.add_source(display.as_str(), Some(node.source.to_string()));

        glue(&mut code, &mut map, &format!("{id}: [function (require, module, exports) {{"));

        let origins = output.map.as_ref().map(SourceMap::lines).unwrap_or_default();
        for (i, line) in output.code.lines().enumerate() {
            code.push_str(line);
            code.push('\n');
            match origins.get(i).copied().flatten() {
                Some(origin) if origin.source == 0 => map.map_line(source, origin.line),
                _ => map.skip_line(),
            }
        }

        let table: BTreeMap<&str, usize> = node
            .dependencies
            .iter()
            .filter_map(|dep| {
                let target = dep.path.as_deref()?;
                Some((dep.specifier.as_str(), *ids.get(target)?))
            })
            .collect();

        let mut footer = String::from("}, {");
        for (i, (specifier, target)) in table.iter().enumerate() {
            if i > 0 {
                footer.push_str(", ");
            }
            let _ = write!(footer, "{}: {}", quote(specifier), target);
        }
        footer.push_str("}],");
        glue(&mut code, &mut map, &footer);
    }

    glue(&mut code, &mut map, if standalone.is_some() { "}, 0);\n});" } else { "}, 0);" });

    let map_name = format!("{name}.map");
    code.push_str(&SourceMap::url_comment(AssetClass::Script, &map_name));

    let mut map = map.finish();
    map.file = Some(name.to_string());

    Asset {
        name: name.to_string(),
        code,
        map: Some(map),
    }
}

/// Appends linker glue, line by line, without source positions.
fn glue(code: &mut String, map: &mut SourceMapBuilder, text: &str) {
    for line in text.lines() {
        code.push_str(line);
        code.push('\n');
        map.skip_line();
    }
}

fn umd_header(global: &str) -> String {
    format!(
        r#"(function (root, factory) {{
if (typeof exports === "object" && typeof module !== "undefined") module.exports = factory();
else if (typeof define === "function" && define.amd) define([], factory);
else root[{}] = factory();
}})(typeof self !== "undefined" ? self : this, function () {{"#,
        quote(global)
    )
}

fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("\"{text}\""))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::bundle::graph::{Dependency, ModuleNode};
    use crate::core::Hash32;

    fn module(path: &str, code: &str, deps: &[(&str, Option<&str>)]) -> ModuleNode {
        ModuleNode {
            path: path.into(),
            hash: Hash32::hash(code),
            source: Arc::from(code),
            dependencies: deps
                .iter()
                .map(|(s, p)| Dependency {
                    specifier: s.to_string(),
                    path: p.map(Utf8PathBuf::from),
                })
                .collect(),
            output: Some(Asset {
                name: path.into(),
                code: code.into(),
                map: Some(SourceMap::identity(path, code)),
            }),
        }
    }

    fn graph() -> ModuleGraph {
        let mut graph = ModuleGraph::new("/src/main.js");
        graph.insert(module(
            "/src/main.js",
            "var util = require('./util');\nvar _ = require('lodash');\nmodule.exports = util.twice(2);\n",
            &[("./util", Some("/src/util.js")), ("lodash", None)],
        ));
        graph.insert(module(
            "/src/util.js",
            "exports.twice = function (x) {\nreturn x * 2;\n};\n",
            &[],
        ));
        graph
    }

    #[test]
    fn links_modules_with_specifier_tables() {
        let asset = link(&graph(), "app.bundled.js", None, Utf8Path::new("/src"));

        assert!(asset.code.starts_with("(function (modules, entry) {"));
        assert!(asset.code.contains("0: [function (require, module, exports) {"));
        assert!(asset.code.contains(r#"}, {"./util": 1}],"#));
        assert!(asset.code.contains("1: [function (require, module, exports) {"));
        assert!(asset.code.contains("}, 0);\n//# sourceMappingURL=app.bundled.js.map\n"));
    }

    #[test]
    fn map_points_module_lines_at_their_sources() {
        let asset = link(&graph(), "app.bundled.js", None, Utf8Path::new("/src"));
        let map = asset.map.unwrap();

        assert_eq!(map.sources, vec!["main.js".to_string(), "util.js".to_string()]);
        assert_eq!(map.file.as_deref(), Some("app.bundled.js"));

        let lines = map.lines();
        let code: Vec<_> = asset.code.lines().collect();
        let at = code.iter().position(|l| *l == "return x * 2;").unwrap();

        let origin = lines[at].unwrap();
        assert_eq!((origin.source, origin.line), (1, 1));

        // prelude glue has no origin
        assert_eq!(lines[0], None);
    }

    #[test]
    fn standalone_wraps_in_umd() {
        let asset = link(
            &graph(),
            "app.bundled.js",
            Some("TeleportAutocomplete"),
            Utf8Path::new("/src"),
        );

        assert!(asset.code.starts_with("(function (root, factory) {"));
        assert!(asset.code.contains(r#"root["TeleportAutocomplete"] = factory();"#));
        assert!(asset.code.contains("}, 0);\n});\n"));
    }
}
