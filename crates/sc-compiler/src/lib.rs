//! Compiler adapter (component E): the contract between the engine and an
//! external HLSL-style back end, plus the include-file cache the back end
//! consults for local includes during compilation. The back end itself
//! (`CompilerBackend` implementations) is an external collaborator and out
//! of scope; only the contract lives here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Independent flag bits forwarded to the back end.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompileFlags: u32 {
        const PARTIAL_PRECISION     = 1 << 0;
        const SKIP_VALIDATION       = 1 << 1;
        const NO_PRESHADER          = 1 << 2;
        const AVOID_FLOW_CONTROL    = 1 << 3;
        const PREFER_FLOW_CONTROL   = 1 << 4;
        const SKIP_OPTIMIZATION     = 1 << 5;
    }
}

/// One compile request: `(source bytes, macro list, target profile, flag
/// bits) -> (bytecode bytes | diagnostic text)`.
pub struct CompileRequest<'a> {
    pub source: &'a [u8],
    pub file_name_for_diagnostics: &'a str,
    pub macros: &'a [(String, String)],
    pub target_profile: &'a str,
    pub flags: CompileFlags,
}

#[derive(Debug, Clone)]
pub enum CompileOutcome {
    Ok {
        bytecode: Vec<u8>,
        listing: Option<String>,
    },
    Err {
        listing: String,
    },
}

impl CompileOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CompileOutcome::Ok { .. })
    }
}

/// The back end's contract. A conforming implementation may run in-process
/// or delegate to an external process; no transport is specified here.
pub trait CompilerBackend: Send + Sync {
    fn compile(&self, request: &CompileRequest<'_>) -> CompileOutcome;
}

#[derive(Debug, Error)]
pub enum FileCacheError {
    #[error("manifest entry not found: {0}")]
    EntryMissing(PathBuf),
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An immutable `name -> bytes` map filled from a manifest listing of `.h`
/// and source files, consulted for local (quoted) `#include` lookups during
/// compilation. Read without locking once built.
#[derive(Debug, Default)]
pub struct FileCache {
    files: HashMap<String, Vec<u8>>,
}

impl FileCache {
    pub fn new() -> Self {
        FileCache {
            files: HashMap::new(),
        }
    }

    /// Populates the cache from a manifest of paths (one per listed file),
    /// keyed by each path's file name.
    pub fn from_manifest_paths(root: &Path, paths: &[PathBuf]) -> Result<Self, FileCacheError> {
        let mut files = HashMap::with_capacity(paths.len());
        for rel in paths {
            let full = root.join(rel);
            let bytes = std::fs::read(&full).map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    FileCacheError::EntryMissing(full.clone())
                } else {
                    FileCacheError::Io {
                        path: full.clone(),
                        source,
                    }
                }
            })?;
            let name = rel
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| rel.to_string_lossy().into_owned());
            files.insert(name, bytes);
        }
        Ok(FileCache { files })
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoBackend;
    impl CompilerBackend for EchoBackend {
        fn compile(&self, request: &CompileRequest<'_>) -> CompileOutcome {
            CompileOutcome::Ok {
                bytecode: request.source.to_vec(),
                listing: None,
            }
        }
    }

    #[test]
    fn flags_combine_independently() {
        let flags = CompileFlags::PARTIAL_PRECISION | CompileFlags::SKIP_OPTIMIZATION;
        assert!(flags.contains(CompileFlags::PARTIAL_PRECISION));
        assert!(flags.contains(CompileFlags::SKIP_OPTIMIZATION));
        assert!(!flags.contains(CompileFlags::NO_PRESHADER));
    }

    #[test]
    fn backend_contract_roundtrips() {
        let backend = EchoBackend;
        let macros = vec![("A".to_string(), "1".to_string())];
        let request = CompileRequest {
            source: b"body",
            file_name_for_diagnostics: "f.fxc",
            macros: &macros,
            target_profile: "ps_3_0",
            flags: CompileFlags::empty(),
        };
        let outcome = backend.compile(&request);
        match outcome {
            CompileOutcome::Ok { bytecode, .. } => assert_eq!(bytecode, b"body"),
            CompileOutcome::Err { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn file_cache_builds_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("common.h"), b"COMMON").unwrap();
        let cache =
            FileCache::from_manifest_paths(dir.path(), &[PathBuf::from("common.h")]).unwrap();
        assert_eq!(cache.get("common.h"), Some(&b"COMMON"[..]));
        assert_eq!(cache.get("missing.h"), None);
    }
}
