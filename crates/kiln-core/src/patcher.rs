//! Textual signature patching of hand-written WGSL entry points.
//!
//! The patcher never parses expressions. It understands exactly three things:
//! comments, balanced `{}`/`()` nesting, and identifier tokens. That is enough
//! to find a `@stage ... fn name(...) { ... }` entry point that is not nested
//! inside another bracketed region, splice parameters into its header, inject
//! prologue lines into its body and rename identifiers inside it.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("no `{prefix}` function named `{name}` found")]
    FunctionNotFound { prefix: String, name: String },
    #[error("unbalanced `{bracket}` at byte {offset}")]
    UnbalancedBrackets { bracket: char, offset: usize },
}

// ---------------------------------------------------------------------------
// Stages and reserved identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionRole {
    Compute,
    Vertex,
    Fragment,
}

/// A reserved identifier that maps to a WGSL builtin parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Builtin {
    pub ident: &'static str,
    pub builtin: &'static str,
    pub ty: &'static str,
}

impl Builtin {
    pub fn parameter(&self) -> String {
        format!("@builtin({}) {}: {}", self.builtin, self.ident, self.ty)
    }
}

const COMPUTE_BUILTINS: &[Builtin] = &[
    Builtin { ident: "gid", builtin: "global_invocation_id", ty: "vec3<u32>" },
    Builtin { ident: "lid", builtin: "local_invocation_id", ty: "vec3<u32>" },
    Builtin { ident: "lindex", builtin: "local_invocation_index", ty: "u32" },
    Builtin { ident: "group_id", builtin: "workgroup_id", ty: "vec3<u32>" },
    Builtin { ident: "group_count", builtin: "num_workgroups", ty: "vec3<u32>" },
];

const VERTEX_BUILTINS: &[Builtin] = &[
    Builtin { ident: "vertex_id", builtin: "vertex_index", ty: "u32" },
    Builtin { ident: "instance_id", builtin: "instance_index", ty: "u32" },
];

const FRAGMENT_BUILTINS: &[Builtin] = &[
    Builtin { ident: "frag_coord", builtin: "position", ty: "vec4<f32>" },
    Builtin { ident: "front_facing", builtin: "front_facing", ty: "bool" },
    Builtin { ident: "sample_id", builtin: "sample_index", ty: "u32" },
];

impl FunctionRole {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Compute => "@compute",
            Self::Vertex => "@vertex",
            Self::Fragment => "@fragment",
        }
    }

    pub fn builtins(self) -> &'static [Builtin] {
        match self {
            Self::Compute => COMPUTE_BUILTINS,
            Self::Vertex => VERTEX_BUILTINS,
            Self::Fragment => FRAGMENT_BUILTINS,
        }
    }
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// If a comment starts at `i`, return the offset just past it.
fn skip_comment(bytes: &[u8], i: usize) -> Option<usize> {
    if bytes.get(i) != Some(&b'/') {
        return None;
    }
    match bytes.get(i + 1) {
        Some(b'/') => {
            let mut j = i + 2;
            while j < bytes.len() && bytes[j] != b'\n' {
                j += 1;
            }
            Some(j)
        }
        Some(b'*') => {
            // WGSL block comments nest.
            let mut depth = 1;
            let mut j = i + 2;
            while j < bytes.len() && depth > 0 {
                if bytes[j] == b'/' && bytes.get(j + 1) == Some(&b'*') {
                    depth += 1;
                    j += 2;
                } else if bytes[j] == b'*' && bytes.get(j + 1) == Some(&b'/') {
                    depth -= 1;
                    j += 2;
                } else {
                    j += 1;
                }
            }
            Some(j)
        }
        _ => None,
    }
}

fn closer_of(open: u8) -> u8 {
    if open == b'{' {
        b'}'
    } else {
        b')'
    }
}

/// Offset of the bracket matching the one at `open`.
fn matching_close(bytes: &[u8], open: usize) -> Result<usize, PatchError> {
    let mut stack = vec![closer_of(bytes[open])];
    let mut i = open + 1;
    while i < bytes.len() {
        if let Some(next) = skip_comment(bytes, i) {
            i = next;
            continue;
        }
        match bytes[i] {
            b'{' | b'(' => stack.push(closer_of(bytes[i])),
            b'}' | b')' => {
                if stack.pop() != Some(bytes[i]) {
                    return Err(PatchError::UnbalancedBrackets {
                        bracket: bytes[i] as char,
                        offset: i,
                    });
                }
                if stack.is_empty() {
                    return Ok(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(PatchError::UnbalancedBrackets {
        bracket: bytes[open] as char,
        offset: open,
    })
}

/// Byte offsets of one entry point inside a source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionSpan {
    /// Start of the role prefix token.
    pub start: usize,
    pub name_start: usize,
    pub name_end: usize,
    pub params_open: usize,
    pub params_close: usize,
    pub body_open: usize,
    pub body_close: usize,
}

impl FunctionSpan {
    pub fn end(&self) -> usize {
        self.body_close + 1
    }

    pub fn params<'a>(&self, source: &'a str) -> &'a str {
        &source[self.params_open + 1..self.params_close]
    }

    pub fn header<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.body_open]
    }

    pub fn body<'a>(&self, source: &'a str) -> &'a str {
        &source[self.body_open + 1..self.body_close]
    }

    /// The function's own text and its span relative to that text.
    pub fn extract<'a>(&self, source: &'a str) -> (&'a str, FunctionSpan) {
        let shift = |offset: usize| offset - self.start;
        (
            &source[self.start..self.end()],
            FunctionSpan {
                start: 0,
                name_start: shift(self.name_start),
                name_end: shift(self.name_end),
                params_open: shift(self.params_open),
                params_close: shift(self.params_close),
                body_open: shift(self.body_open),
                body_close: shift(self.body_close),
            },
        )
    }
}

/// Find the entry point `name` carrying `role`'s prefix at top level.
///
/// Prefixed regions whose header does not declare `name` are skipped whole,
/// so a same-named function nested inside another function's body is never
/// selected.
pub fn find_function(source: &str, role: FunctionRole, name: &str) -> Result<FunctionSpan, PatchError> {
    let bytes = source.as_bytes();
    let prefix = role.prefix().as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if let Some(next) = skip_comment(bytes, i) {
            i = next;
            continue;
        }
        match bytes[i] {
            b'{' | b'(' => {
                i = matching_close(bytes, i)? + 1;
                continue;
            }
            b'}' | b')' => {
                return Err(PatchError::UnbalancedBrackets {
                    bracket: bytes[i] as char,
                    offset: i,
                })
            }
            _ => {}
        }
        if bytes[i..].starts_with(prefix)
            && !bytes.get(i + prefix.len()).copied().is_some_and(is_ident_char)
        {
            match scan_header(bytes, i, i + prefix.len(), name)? {
                HeaderScan::Found(span) => return Ok(span),
                HeaderScan::Skip(next) => {
                    i = next;
                    continue;
                }
            }
        }
        if is_ident_start(bytes[i]) {
            while i < bytes.len() && is_ident_char(bytes[i]) {
                i += 1;
            }
            continue;
        }
        i += 1;
    }
    Err(PatchError::FunctionNotFound {
        prefix: role.prefix().to_string(),
        name: name.to_string(),
    })
}

enum HeaderScan {
    Found(FunctionSpan),
    Skip(usize),
}

fn scan_header(bytes: &[u8], start: usize, mut j: usize, name: &str) -> Result<HeaderScan, PatchError> {
    // Last two identifiers, to recognise `fn <name> (`.
    let mut previous: Option<(usize, usize)> = None;
    let mut last: Option<(usize, usize)> = None;
    let mut params: Option<(usize, usize, usize, usize)> = None;
    let ident = |r: Option<(usize, usize)>| r.map(|(a, b)| &bytes[a..b]);

    while j < bytes.len() {
        if let Some(next) = skip_comment(bytes, j) {
            j = next;
            continue;
        }
        match bytes[j] {
            b'(' => {
                let close = matching_close(bytes, j)?;
                if params.is_none()
                    && ident(previous) == Some(b"fn".as_slice())
                    && ident(last) == Some(name.as_bytes())
                {
                    if let Some((name_start, name_end)) = last {
                        params = Some((name_start, name_end, j, close));
                    }
                }
                last = None;
                previous = None;
                j = close + 1;
            }
            b'{' => {
                let body_close = matching_close(bytes, j)?;
                return Ok(match params {
                    Some((name_start, name_end, params_open, params_close)) => {
                        HeaderScan::Found(FunctionSpan {
                            start,
                            name_start,
                            name_end,
                            params_open,
                            params_close,
                            body_open: j,
                            body_close,
                        })
                    }
                    None => HeaderScan::Skip(body_close + 1),
                });
            }
            b'}' | b')' => {
                return Err(PatchError::UnbalancedBrackets {
                    bracket: bytes[j] as char,
                    offset: j,
                })
            }
            b';' => return Ok(HeaderScan::Skip(j + 1)),
            b if is_ident_start(b) => {
                let token_start = j;
                while j < bytes.len() && is_ident_char(bytes[j]) {
                    j += 1;
                }
                previous = last;
                last = Some((token_start, j));
            }
            b if b.is_ascii_whitespace() => j += 1,
            _ => {
                // `@`, `->`, `<`, `,` and friends break `fn name (` adjacency
                // only when they sit between the two identifiers.
                if bytes[j] != b'@' {
                    previous = None;
                }
                j += 1;
            }
        }
    }
    Ok(HeaderScan::Skip(j))
}

// ---------------------------------------------------------------------------
// Identifier utilities
// ---------------------------------------------------------------------------

/// Whole-identifier occurrences of `ident` in code, ignoring comments,
/// member accesses (`a.ident`) and attributes (`@ident`).
pub fn references_identifier(text: &str, ident: &str) -> bool {
    let mut found = false;
    visit_identifiers(text, |token, _| {
        if token == ident {
            found = true;
        }
    });
    found
}

/// Rename whole identifiers according to `renames`, leaving comments,
/// member accesses and attributes untouched.
pub fn rename_identifiers(text: &str, renames: &HashMap<String, String>) -> String {
    if renames.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    visit_identifiers(text, |token, at| {
        if let Some(replacement) = renames.get(token) {
            out.push_str(&text[copied..at]);
            out.push_str(replacement);
            copied = at + token.len();
        }
    });
    out.push_str(&text[copied..]);
    out
}

fn visit_identifiers<'a>(text: &'a str, mut visit: impl FnMut(&'a str, usize)) {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if let Some(next) = skip_comment(bytes, i) {
            i = next;
            continue;
        }
        if is_ident_start(bytes[i]) {
            let start = i;
            while i < bytes.len() && is_ident_char(bytes[i]) {
                i += 1;
            }
            let qualified = preceding_non_space(bytes, start).is_some_and(|b| b == b'.' || b == b'@');
            if !qualified {
                visit(&text[start..i], start);
            }
            continue;
        }
        if bytes[i].is_ascii_digit() {
            // Numeric literals such as `1u` or `0x1f` are not identifiers.
            while i < bytes.len() && is_ident_char(bytes[i]) {
                i += 1;
            }
            continue;
        }
        i += 1;
    }
}

fn preceding_non_space(bytes: &[u8], at: usize) -> Option<u8> {
    bytes[..at].iter().rev().copied().find(|b| !b.is_ascii_whitespace())
}

// ---------------------------------------------------------------------------
// Patching
// ---------------------------------------------------------------------------

/// Edits applied to one entry point.
#[derive(Debug, Default, Clone)]
pub struct FunctionPatch {
    /// Parameter declarations spliced in right after `(`.
    pub parameters: Vec<String>,
    /// Attribute inserted after the role prefix, e.g. `@workgroup_size(64)`.
    pub attribute: Option<String>,
    /// Lines inserted at the top of the body.
    pub prologue: String,
    /// New function name.
    pub rename_to: Option<String>,
    /// Identifier renames applied to parameters and body.
    pub identifiers: HashMap<String, String>,
}

/// Apply `patch` to the function at `span`, returning the whole new text.
pub fn apply(source: &str, span: &FunctionSpan, patch: &FunctionPatch) -> String {
    let prefix_end = source[span.start..]
        .find(|c: char| !(c == '@' || c.is_ascii_alphanumeric() || c == '_'))
        .map_or(span.name_start, |n| span.start + n);

    let mut out = String::with_capacity(source.len() + 256);
    out.push_str(&source[..prefix_end]);
    if let Some(attribute) = &patch.attribute {
        out.push(' ');
        out.push_str(attribute);
    }
    out.push_str(&source[prefix_end..span.name_start]);
    out.push_str(patch.rename_to.as_deref().unwrap_or(&source[span.name_start..span.name_end]));
    out.push_str(&source[span.name_end..=span.params_open]);

    let existing = span.params(source);
    out.push_str(&patch.parameters.join(", "));
    if !patch.parameters.is_empty() && !existing.trim().is_empty() {
        out.push_str(", ");
    }
    out.push_str(&rename_identifiers(existing, &patch.identifiers));
    out.push_str(&source[span.params_close..=span.body_open]);
    out.push_str(&patch.prologue);
    out.push_str(&rename_identifiers(span.body(source), &patch.identifiers));
    out.push_str(&source[span.body_close..]);
    out
}

pub fn has_attribute(source: &str, span: &FunctionSpan, attribute: &str) -> bool {
    attribute_offset(span.header(source), attribute).is_some()
}

fn attribute_offset(header: &str, attribute: &str) -> Option<usize> {
    header
        .match_indices(attribute)
        .map(|(at, _)| at)
        .find(|at| {
            !header[at + attribute.len()..]
                .bytes()
                .next()
                .is_some_and(is_ident_char)
        })
}

/// Sizes given by an existing `@workgroup_size(...)` attribute.
///
/// `None` when there is no attribute, `Some(None)` when it uses anything
/// other than integer literals.
pub fn workgroup_size(source: &str, span: &FunctionSpan) -> Option<Option<[u32; 3]>> {
    let header = span.header(source);
    let at = attribute_offset(header, "@workgroup_size")?;
    let rest = &header[at + "@workgroup_size".len()..];
    let inner = rest
        .trim_start()
        .strip_prefix('(')
        .and_then(|r| r.split_once(')'))
        .map(|(inner, _)| inner);
    let Some(inner) = inner else {
        return Some(None);
    };
    let mut sizes = [1u32; 3];
    let values: Vec<_> = inner.split(',').map(str::trim).filter(|v| !v.is_empty()).collect();
    if values.is_empty() || values.len() > 3 {
        return Some(None);
    }
    for (slot, value) in sizes.iter_mut().zip(values) {
        match value.trim_end_matches(['u', 'i']).parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => return Some(None),
        }
    }
    Some(Some(sizes))
}

/// Name of the parameter already bound to `@builtin(builtin)`, if any.
pub fn declared_builtin(params: &str, builtin: &str) -> Option<String> {
    let needle = format!("@builtin({builtin})");
    let compact: String = params.split_whitespace().collect::<Vec<_>>().join(" ");
    let compact = compact.replace("( ", "(").replace(" )", ")");
    let (_, after) = compact.split_once(&needle)?;
    let name: String = after
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then_some(name)
}
