//! Session file collaborator contract.
//!
//! The engine never touches storage directly. Everything goes through
//! [`SessionFiles`], including the per-(session, file) advisory lock that
//! keeps batch writes from racing an out-of-band single-file save.

mod directory;

pub use directory::DirectorySessionFiles;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FileServiceError;

pub const ENCODING_UTF8: &str = "utf-8";
pub const ENCODING_UTF8_BOM: &str = "utf-8-bom";

/// Text of one session file and the encoding it was stored in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub text: String,
    pub encoding: String,
}

impl FileContent {
    pub fn utf8(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            encoding: ENCODING_UTF8.to_string(),
        }
    }
}

/// Held while a file is being rewritten; dropping it releases the lock
pub struct FileLease {
    _guard: Option<Box<dyn Send>>,
}

impl FileLease {
    pub fn new<G: Send + 'static>(guard: G) -> Self {
        Self {
            _guard: Some(Box::new(guard)),
        }
    }

    /// For collaborators that have no locking of their own
    pub fn unguarded() -> Self {
        Self { _guard: None }
    }
}

impl std::fmt::Debug for FileLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLease")
            .field("guarded", &self._guard.is_some())
            .finish()
    }
}

#[async_trait]
pub trait SessionFiles: Send + Sync {
    /// Whether the session's workspace exists at all
    async fn session_exists(&self, session_id: &str) -> bool;

    /// Session-relative paths whose extension is in `extensions` (all files when empty)
    async fn list_files(
        &self,
        session_id: &str,
        extensions: &[String],
    ) -> Result<Vec<String>, FileServiceError>;

    async fn read_file(&self, session_id: &str, path: &str)
        -> Result<FileContent, FileServiceError>;

    async fn write_file(
        &self,
        session_id: &str,
        path: &str,
        text: &str,
        encoding: &str,
    ) -> Result<(), FileServiceError>;

    /// Acquire the advisory write lock for one file
    async fn lock_file(&self, session_id: &str, path: &str) -> Result<FileLease, FileServiceError>;
}

/// Case-insensitive extension allow-list check
pub fn extension_allowed(path: &str, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let ext = match path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => ext,
        _ => return false,
    };
    extensions
        .iter()
        .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_allowed() {
        let exts = vec!["html".to_string(), ".txt".to_string()];
        assert!(extension_allowed("OEBPS/ch1.HTML", &exts));
        assert!(extension_allowed("notes.txt", &exts));
        assert!(!extension_allowed("style.css", &exts));
        assert!(!extension_allowed("dir.html/README", &exts));
        assert!(!extension_allowed(".html", &exts));
        assert!(extension_allowed("anything", &[]));
    }
}
