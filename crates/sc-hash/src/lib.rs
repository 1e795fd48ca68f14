//! Source hasher (component A): expands local `#include` directives,
//! normalizes line endings, and produces a stable CRC-32 over the result.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("include file not found: {0}")]
    IncludeMissing(PathBuf),
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("include cycle detected at {0}")]
    IncludeCycle(PathBuf),
}

/// Recursively expands local (quoted) `#include "..."` directives starting
/// from `path`, then collapses every `\r\n` pair to `\n`, and returns the
/// CRC-32 (poly 0xEDB88320, init 0xFFFFFFFF, final XOR 0xFFFFFFFF — the
/// standard CRC-32 `crc32fast` computes) of the resulting bytes.
pub fn hash_source(path: &Path) -> Result<u32, HashError> {
    let expanded = expand_source(path)?;
    let normalized = normalize_line_endings(&expanded);
    Ok(crc32fast::hash(normalized.as_bytes()))
}

/// Expands `path` and every file it transitively includes into one string,
/// substituting each `#include "..."` line with the already-expanded
/// content of the included file.
pub fn expand_source(path: &Path) -> Result<String, HashError> {
    let mut seen = HashSet::new();
    expand_inner(path, &mut seen)
}

fn expand_inner(path: &Path, seen: &mut HashSet<PathBuf>) -> Result<String, HashError> {
    let canonical = path.to_path_buf();
    if !seen.insert(canonical.clone()) {
        return Err(HashError::IncludeCycle(canonical));
    }
    let text = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            HashError::IncludeMissing(path.to_path_buf())
        } else {
            HashError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut out = String::with_capacity(text.len());
    for line in split_keep_line_endings(&text) {
        if let Some(included) = parse_local_include(line) {
            let included_path = dir.join(included);
            let expanded = expand_inner(&included_path, seen)?;
            out.push_str(&expanded);
            // the directive line itself is replaced, not kept, but we still
            // preserve its own line ending so downstream line counts used
            // for diagnostics stay sane.
            if let Some(ending) = line_ending(line) {
                out.push_str(ending);
            }
        } else {
            out.push_str(line);
        }
    }

    seen.remove(&canonical);
    Ok(out)
}

/// Splits `text` into lines, each retaining its trailing `\n` or `\r\n` (the
/// last line may have none).
fn split_keep_line_endings(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            lines.push(&text[start..=i]);
            start = i + 1;
        }
        i += 1;
    }
    if start < text.len() {
        lines.push(&text[start..]);
    }
    lines
}

fn line_ending(line: &str) -> Option<&'static str> {
    if line.ends_with("\r\n") {
        Some("\r\n")
    } else if line.ends_with('\n') {
        Some("\n")
    } else {
        None
    }
}

/// Recognises `#include "name"` (local/quoted form only; `#include <name>`
/// is left untouched, matching the original's local-form-only expansion).
fn parse_local_include(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix("#include")?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(&rest[..end])
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn expands_nested_includes() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "inner.h", "INNER\n");
        let outer = write_file(dir.path(), "outer.fxc", "A\n#include \"inner.h\"\nB\n");
        let expanded = expand_source(&outer).unwrap();
        assert_eq!(expanded, "A\nINNER\n\nB\n");
    }

    #[test]
    fn normalizes_crlf() {
        let dir = tempfile::tempdir().unwrap();
        let outer = write_file(dir.path(), "f.fxc", "A\r\nB\r\n");
        let crc = hash_source(&outer).unwrap();
        let expected = crc32fast::hash(b"A\nB\n");
        assert_eq!(crc, expected);
    }

    #[test]
    fn missing_include_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let outer = write_file(dir.path(), "f.fxc", "#include \"missing.h\"\n");
        assert!(matches!(
            expand_source(&outer),
            Err(HashError::IncludeMissing(_))
        ));
    }

    #[test]
    fn stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let outer = write_file(dir.path(), "f.fxc", "same content\n");
        let a = hash_source(&outer).unwrap();
        let b = hash_source(&outer).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn angle_include_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let outer = write_file(dir.path(), "f.fxc", "#include <system.h>\nbody\n");
        let expanded = expand_source(&outer).unwrap();
        assert_eq!(expanded, "#include <system.h>\nbody\n");
    }
}
