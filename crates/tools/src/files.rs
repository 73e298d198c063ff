//! Sandboxed file access.
//!
//! Every path is interpreted relative to the configured project root.
//! Absolute paths, `..` escapes, and a blocklist of secret-bearing names are
//! rejected before any I/O happens; the size cap is checked on metadata so
//! oversized files are never pulled into memory.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Default per-file read cap: 2 MiB.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;

/// File names (exact) and extensions that never leave the sandbox.
const BLOCKED_NAMES: &[&str] = &[
    ".env",
    ".envrc",
    ".netrc",
    ".npmrc",
    ".pgpass",
    "id_rsa",
    "id_ed25519",
    "credentials",
    "credentials.json",
    "secrets.json",
    "secrets.yaml",
    "secrets.yml",
];
const BLOCKED_EXTENSIONS: &[&str] = &["pem", "key", "p12", "pfx"];
const BLOCKED_PREFIXES: &[&str] = &[".env."];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileAccessError {
    #[error("absolute paths are not allowed: `{0}`")]
    Absolute(String),

    #[error("path escapes the project root: `{0}`")]
    Escapes(String),

    #[error("access to `{0}` is blocked")]
    Blocked(String),

    #[error("`{path}` is {size} bytes, over the {cap}-byte limit")]
    TooLarge { path: String, size: u64, cap: u64 },

    #[error("`{0}` does not exist or is not a regular file")]
    NotFound(String),

    #[error("reading `{path}` failed: {reason}")]
    Io { path: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct FileSandbox {
    root: PathBuf,
    max_bytes: u64,
}

impl FileSandbox {
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self { root: root.into(), max_bytes }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate `relative` and return the resolved on-disk path.
    fn resolve(&self, relative: &str) -> Result<PathBuf, FileAccessError> {
        let candidate = Path::new(relative);
        if candidate.is_absolute() {
            return Err(FileAccessError::Absolute(relative.to_string()));
        }
        for component in candidate.components() {
            match component {
                Component::ParentDir => {
                    return Err(FileAccessError::Escapes(relative.to_string()))
                }
                Component::Normal(part) => {
                    let name = part.to_string_lossy().to_ascii_lowercase();
                    if is_blocked(&name) {
                        return Err(FileAccessError::Blocked(relative.to_string()));
                    }
                }
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => {
                    return Err(FileAccessError::Absolute(relative.to_string()))
                }
            }
        }
        Ok(self.root.join(candidate))
    }

    /// Size of the file in bytes, after sandbox checks.
    pub fn file_size(&self, relative: &str) -> Result<u64, FileAccessError> {
        let path = self.resolve(relative)?;
        let meta = std::fs::metadata(&path)
            .map_err(|_| FileAccessError::NotFound(relative.to_string()))?;
        if !meta.is_file() {
            return Err(FileAccessError::NotFound(relative.to_string()));
        }
        Ok(meta.len())
    }

    /// Read the whole file as UTF-8 (lossy), enforcing the size cap first.
    pub fn read(&self, relative: &str) -> Result<String, FileAccessError> {
        let path = self.resolve(relative)?;
        let size = self.file_size(relative)?;
        if size > self.max_bytes {
            return Err(FileAccessError::TooLarge {
                path: relative.to_string(),
                size,
                cap: self.max_bytes,
            });
        }
        let bytes = std::fs::read(&path).map_err(|e| FileAccessError::Io {
            path: relative.to_string(),
            reason: e.to_string(),
        })?;
        debug!(path = %relative, bytes = bytes.len(), "file read");
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn is_blocked(lower_name: &str) -> bool {
    if BLOCKED_NAMES.contains(&lower_name) {
        return true;
    }
    if BLOCKED_PREFIXES.iter().any(|prefix| lower_name.starts_with(prefix)) {
        return true;
    }
    lower_name
        .rsplit_once('.')
        .is_some_and(|(_, extension)| BLOCKED_EXTENSIONS.contains(&extension))
}

/// Split `text` into chunks of at most `chunk_chars` characters with
/// `overlap` characters of context repeated between neighbors, capped at
/// `max_chunks`. Chunk boundaries fall on char boundaries, never inside a
/// code point.
pub fn chunk_text(text: &str, chunk_chars: usize, overlap: usize, max_chunks: usize) -> Vec<String> {
    if text.is_empty() || chunk_chars == 0 || max_chunks == 0 {
        return vec![];
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_chars {
        return vec![text.to_string()];
    }

    let step = chunk_chars.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() && chunks.len() < max_chunks {
        let end = (start + chunk_chars).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}
