//! Just enough of a JavaScript lexer to tell code apart from comments and
//! literals.
//!
//! Every byte of a source file is put in one [`Region`]. Quotes, backticks,
//! regex slashes and the `${`/`}` of template substitutions count as code;
//! what lies between them is a literal. Regex literals are told apart from
//! division by the token in front of the slash, which is right for any code
//! a bundler is realistically fed.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Region {
    Code,
    Comment,
    Literal,
}

/// Words after which a `/` starts a regex literal rather than a division.
const KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

/// The region of every byte of `code`.
pub(crate) fn regions(code: &str) -> Vec<Region> {
    let bytes = code.as_bytes();
    let mut out = vec![Region::Code; bytes.len()];

    // brace depth at which each open `${` substitution started
    let mut substitutions: Vec<usize> = Vec::new();
    let mut depth = 0usize;
    let mut regex_allowed = true;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                let end = find(bytes, i, b'\n');
                fill(&mut out, i, end, Region::Comment);
                i = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = code[i + 2..]
                    .find("*/")
                    .map_or(bytes.len(), |offset| i + 2 + offset + 2);
                fill(&mut out, i, end, Region::Comment);
                i = end;
            }
            b'/' if regex_allowed => {
                match regex_end(bytes, i + 1) {
                    Some(end) => {
                        fill(&mut out, i + 1, end, Region::Literal);
                        i = end + 1;
                        // flags
                        while i < bytes.len() && is_ident(bytes[i]) {
                            i += 1;
                        }
                    }
                    None => i += 1,
                }
                regex_allowed = false;
            }
            b'\'' | b'"' => {
                let end = string_end(bytes, i + 1, b);
                fill(&mut out, i + 1, end, Region::Literal);
                i = (end + 1).min(bytes.len());
                regex_allowed = false;
            }
            b'`' => {
                i = template(bytes, i + 1, &mut out, &mut substitutions, depth);
                regex_allowed = false;
            }
            b'}' if substitutions.last() == Some(&depth) => {
                substitutions.pop();
                i = template(bytes, i + 1, &mut out, &mut substitutions, depth);
                regex_allowed = false;
            }
            b'{' => {
                depth += 1;
                regex_allowed = true;
                i += 1;
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                regex_allowed = true;
                i += 1;
            }
            b if is_ident(b) => {
                let start = i;
                while i < bytes.len() && is_ident(bytes[i]) {
                    i += 1;
                }
                regex_allowed = KEYWORDS.contains(&&code[start..i]);
            }
            b if b.is_ascii_whitespace() => i += 1,
            b')' | b']' => {
                regex_allowed = false;
                i += 1;
            }
            _ => {
                regex_allowed = true;
                i += 1;
            }
        }
    }

    out
}

/// `code` with comments and literal contents blanked out. Byte offsets and
/// line breaks are preserved.
pub(crate) fn mask(code: &str) -> String {
    let regions = regions(code);
    let mut out = String::with_capacity(code.len());

    for (i, c) in code.char_indices() {
        if regions[i] == Region::Code || c == '\n' {
            out.push(c);
        } else {
            // one space per byte keeps the offsets aligned
            out.extend(std::iter::repeat_n(' ', c.len_utf8()));
        }
    }

    out
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn fill(out: &mut [Region], start: usize, end: usize, region: Region) {
    let end = end.min(out.len());
    if start < end {
        out[start..end].fill(region);
    }
}

fn find(bytes: &[u8], from: usize, needle: u8) -> usize {
    bytes[from..]
        .iter()
        .position(|&b| b == needle)
        .map_or(bytes.len(), |offset| from + offset)
}

/// Index of the closing quote; an unterminated string ends at the line.
fn string_end(bytes: &[u8], mut i: usize, quote: u8) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            b if b == quote => return i,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Index of the closing slash, `None` if the line ends first.
fn regex_end(bytes: &[u8], mut i: usize) -> Option<usize> {
    let mut class = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return None,
            b'[' => {
                class = true;
                i += 1;
            }
            b']' => {
                class = false;
                i += 1;
            }
            b'/' if !class => return Some(i),
            _ => i += 1,
        }
    }
    None
}

/// Scans template text from `i` up to the closing backtick or the next
/// `${`, returning the index to continue from.
fn template(
    bytes: &[u8],
    mut i: usize,
    out: &mut [Region],
    substitutions: &mut Vec<usize>,
    depth: usize,
) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                fill(out, i, i + 2, Region::Literal);
                i += 2;
            }
            b'`' => return i + 1,
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                substitutions.push(depth);
                return i + 2;
            }
            _ => {
                out[i] = Region::Literal;
                i += 1;
            }
        }
    }
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_comments_and_string_contents() {
        let code = "a('x'); // b\n/* c */ d(\"e\");";

        assert_eq!(mask(code), format!("a(' '); {}\n{}d(\" \");", " ".repeat(4), " ".repeat(8)));
    }

    #[test]
    fn template_substitutions_are_code() {
        let code = "`a ${ f({}) } b` + `c`";

        assert_eq!(mask(code), "`  ${ f({}) }  ` + ` `");
    }

    #[test]
    fn regex_literals_are_not_comments() {
        let code = "var r = /\\/\\//g; var d = a / b / c; // end";

        assert_eq!(
            mask(code),
            format!("var r = /    /g; var d = a / b / c; {}", " ".repeat(6))
        );
    }

    #[test]
    fn wide_characters_keep_offsets() {
        let code = "f('żółw'); g();";
        let masked = mask(code);

        assert_eq!(masked.len(), code.len());
        assert!(masked.ends_with("'); g();"));
    }

    #[test]
    fn quotes_inside_comments_do_not_open_strings() {
        let code = "// don't\nreal();";

        assert_eq!(regions(code)[9..].iter().filter(|r| **r == Region::Code).count(), 7);
    }
}
