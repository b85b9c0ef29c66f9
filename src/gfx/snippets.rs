//! Process-wide WGSL snippet registry and the textual `#include`/`#define` preprocessor run over
//! shader sources before they reach `wgpu::Device::create_shader_module` (§6.4).
//!
//! WGSL has no native preprocessor. The engine's shaders are written against a small textual
//! macro layer modeled on the GLSL sources the architecture was distilled from: `#include "name"`
//! pulls in a named snippet verbatim, and `#define NAME value` substitutes whole-word occurrences
//! of `NAME` for the rest of the file. Expansion is single-pass and non-nesting: an included
//! snippet may not itself contain `#include` (§6.4).

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};

fn registry() -> &'static Mutex<HashMap<String, String>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, String>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(builtin_snippets()))
}

fn builtin_snippets() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert(
        "common/quad_vertex".to_string(),
        include_str!("../../shaders/common/quad_vertex.wgsl").to_string(),
    );
    m.insert(
        "common/preamble".to_string(),
        include_str!("../../shaders/common/preamble.wgsl").to_string(),
    );
    m
}

/// Register or replace a named snippet. Registering under an existing name overwrites it; this
/// is how tests inject fixture snippets without touching the built-in table.
pub fn register(name: &str, source: &str) {
    registry()
        .lock()
        .expect("snippet registry poisoned")
        .insert(name.to_string(), source.to_string());
}

/// Drop every registered snippet, including built-ins. Used by test teardown to restore a clean
/// registry between cases that register fixtures under shared names.
pub fn teardown() {
    *registry().lock().expect("snippet registry poisoned") = builtin_snippets();
}

/// Expand `#include "name"` directives in `source` by substituting the named snippet's raw text.
///
/// Only one level of inclusion is honored: text pulled in by `#include` is copied verbatim and is
/// not itself scanned for further `#include` lines. Returns `shader-failure` with a diagnostic
/// label when a requested snippet was never registered.
pub fn expand_includes(label: &str, source: &str) -> Result<String> {
    let table = registry().lock().expect("snippet registry poisoned");
    let mut out = String::with_capacity(source.len());
    for line in source.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("#include") {
            let name = parse_quoted(rest).ok_or_else(|| {
                Error::shader_failure(label, source, "malformed #include directive")
            })?;
            let snippet = table.get(name).ok_or_else(|| {
                Error::shader_failure(label, source, format!("unknown include '{name}'"))
            })?;
            out.push_str(snippet);
            out.push('\n');
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    Ok(out)
}

fn parse_quoted(s: &str) -> Option<&str> {
    let s = s.trim();
    let s = s.strip_prefix('"')?;
    s.strip_suffix('"')
}

/// Apply `#define NAME value` substitutions collected from `defines` to `source`, after include
/// expansion. Substitution is whole-word only so e.g. `NUM_LANES` does not match inside
/// `NUM_LANES_MAX`.
pub fn apply_defines(source: &str, defines: &[(&str, String)]) -> String {
    let mut out = source.to_string();
    for (name, value) in defines {
        out = substitute_whole_word(&out, name, value);
    }
    out
}

fn substitute_whole_word(source: &str, name: &str, value: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let bytes = source.as_bytes();
    let name_bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if source[i..].starts_with(name)
            && !bytes
                .get(i.wrapping_sub(1))
                .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
            && !bytes
                .get(i + name_bytes.len())
                .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
        {
            out.push_str(value);
            i += name_bytes.len();
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

/// Full preprocessing pipeline: include expansion followed by define substitution. This is the
/// exact text that gets hashed for the program cache key (§4.1) and compiled by `wgpu`.
pub fn preprocess(label: &str, source: &str, defines: &[(&str, String)]) -> Result<String> {
    let expanded = expand_includes(label, source)?;
    Ok(apply_defines(&expanded, defines))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_is_expanded_verbatim_and_not_recursively_scanned() {
        register("test/inner", "#include \"should-not-expand\"\n");
        let result = expand_includes("label", "#include \"test/inner\"\n").unwrap();
        assert!(result.contains("#include \"should-not-expand\""));
        teardown();
    }

    #[test]
    fn unknown_include_is_shader_failure() {
        let err = expand_includes("label", "#include \"missing/snippet\"\n").unwrap_err();
        assert!(matches!(err, Error::ShaderFailure { .. }));
    }

    #[test]
    fn define_substitution_is_whole_word() {
        let out = substitute_whole_word("NUM_LANES + NUM_LANES_MAX", "NUM_LANES", "4");
        assert_eq!(out, "4 + NUM_LANES_MAX");
    }
}
