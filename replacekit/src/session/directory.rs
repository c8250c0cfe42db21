use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use walkdir::WalkDir;

use super::{extension_allowed, FileContent, FileLease, SessionFiles, ENCODING_UTF8, ENCODING_UTF8_BOM};
use crate::error::FileServiceError;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Directories never descended into when listing a session
const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    ".mypy_cache",
    ".pytest_cache",
];

type LockKey = (String, String);
type LockMap = HashMap<LockKey, Arc<AsyncMutex<()>>>;
type LockTable = Arc<Mutex<LockMap>>;

fn lock_table(table: &LockTable) -> MutexGuard<'_, LockMap> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held file lock; drops its table entry once no one else holds or waits on it
struct PathLock {
    guard: Option<OwnedMutexGuard<()>>,
    key: LockKey,
    table: LockTable,
}

impl Drop for PathLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_table(&self.table);
        // Every holder and waiter owns a clone, so 1 means only the table is left
        if locks
            .get(&self.key)
            .map(|entry| Arc::strong_count(entry) == 1)
            .unwrap_or(false)
        {
            locks.remove(&self.key);
        }
    }
}

/// Session store backed by `<root>/<session_id>/` directories
pub struct DirectorySessionFiles {
    root: PathBuf,
    locks: LockTable,
}

impl DirectorySessionFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, FileServiceError> {
        if session_id.is_empty()
            || session_id.contains('/')
            || session_id.contains('\\')
            || session_id == "."
            || session_id == ".."
        {
            return Err(FileServiceError::InvalidPath(session_id.to_string()));
        }
        if !self.root.is_dir() {
            return Err(FileServiceError::StorageUnavailable(
                self.root.display().to_string(),
            ));
        }

        let dir = self.root.join(session_id);
        if !dir.is_dir() {
            return Err(FileServiceError::SessionNotFound(session_id.to_string()));
        }
        Ok(dir)
    }

    /// Resolve a session-relative path, refusing anything that escapes the session
    fn resolve(&self, session_id: &str, path: &str) -> Result<PathBuf, FileServiceError> {
        let dir = self.session_dir(session_id)?;
        let relative = Path::new(path);

        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if path.is_empty() || escapes {
            return Err(FileServiceError::InvalidPath(path.to_string()));
        }

        Ok(dir.join(relative))
    }

    fn lock_for(&self, key: &LockKey) -> Arc<AsyncMutex<()>> {
        lock_table(&self.locks)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

fn io_error(path: &str, source: std::io::Error) -> FileServiceError {
    FileServiceError::Io {
        path: path.to_string(),
        source,
    }
}

fn is_ignored(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| IGNORED_DIRS.contains(&name))
            .unwrap_or(false)
}

#[async_trait]
impl SessionFiles for DirectorySessionFiles {
    async fn session_exists(&self, session_id: &str) -> bool {
        self.session_dir(session_id).is_ok()
    }

    async fn list_files(
        &self,
        session_id: &str,
        extensions: &[String],
    ) -> Result<Vec<String>, FileServiceError> {
        let dir = self.session_dir(session_id)?;
        let extensions = extensions.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            for entry in WalkDir::new(&dir)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| !is_ignored(e))
            {
                let entry = entry.map_err(|e| {
                    FileServiceError::StorageUnavailable(format!("{}: {}", dir.display(), e))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = match entry.path().strip_prefix(&dir) {
                    Ok(relative) => relative,
                    Err(_) => continue,
                };
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if extension_allowed(&relative, &extensions) {
                    files.push(relative);
                }
            }
            files.sort();
            Ok::<_, FileServiceError>(files)
        })
        .await
        .map_err(|e| FileServiceError::StorageUnavailable(format!("listing task failed: {}", e)))?
    }

    async fn read_file(
        &self,
        session_id: &str,
        path: &str,
    ) -> Result<FileContent, FileServiceError> {
        let full = self.resolve(session_id, path)?;
        let bytes = tokio::fs::read(&full)
            .await
            .map_err(|e| io_error(path, e))?;

        let (body, encoding) = if bytes.starts_with(UTF8_BOM) {
            (bytes[UTF8_BOM.len()..].to_vec(), ENCODING_UTF8_BOM)
        } else {
            (bytes, ENCODING_UTF8)
        };

        let text = String::from_utf8(body).map_err(|_| FileServiceError::Encoding {
            path: path.to_string(),
        })?;

        Ok(FileContent {
            text,
            encoding: encoding.to_string(),
        })
    }

    async fn write_file(
        &self,
        session_id: &str,
        path: &str,
        text: &str,
        encoding: &str,
    ) -> Result<(), FileServiceError> {
        let full = self.resolve(session_id, path)?;

        let mut bytes = Vec::with_capacity(text.len() + UTF8_BOM.len());
        if encoding == ENCODING_UTF8_BOM {
            bytes.extend_from_slice(UTF8_BOM);
        }
        bytes.extend_from_slice(text.as_bytes());

        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn lock_file(&self, session_id: &str, path: &str) -> Result<FileLease, FileServiceError> {
        self.resolve(session_id, path)?;
        let key = (session_id.to_string(), path.to_string());
        let guard = self.lock_for(&key).lock_owned().await;
        Ok(FileLease::new(PathLock {
            guard: Some(guard),
            key,
            table: self.locks.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, DirectorySessionFiles) {
        let temp = TempDir::new().unwrap();
        let session = temp.path().join("s1");
        fs::create_dir_all(session.join("OEBPS/text")).unwrap();
        fs::create_dir_all(session.join(".git")).unwrap();
        fs::write(session.join("OEBPS/text/b.html"), "<p>b</p>").unwrap();
        fs::write(session.join("OEBPS/text/a.html"), "<p>a</p>").unwrap();
        fs::write(session.join("OEBPS/cover.jpg"), [0xFF, 0xD8]).unwrap();
        fs::write(session.join(".git/config.txt"), "ignored").unwrap();
        fs::write(session.join("notes.txt"), "notes").unwrap();
        let store = DirectorySessionFiles::new(temp.path());
        (temp, store)
    }

    #[tokio::test]
    async fn test_list_files_sorted_and_filtered() {
        let (_temp, store) = fixture();
        let files = store
            .list_files("s1", &["html".to_string(), "txt".to_string()])
            .await
            .unwrap();
        assert_eq!(
            files,
            vec!["OEBPS/text/a.html", "OEBPS/text/b.html", "notes.txt"]
        );
    }

    #[tokio::test]
    async fn test_missing_session() {
        let (_temp, store) = fixture();
        assert!(!store.session_exists("nope").await);
        let err = store.list_files("nope", &[]).await.unwrap_err();
        assert!(err.is_workspace_level());
    }

    #[tokio::test]
    async fn test_vanished_root_is_storage_unavailable() {
        let (temp, store) = fixture();
        drop(temp);
        let err = store.list_files("s1", &[]).await.unwrap_err();
        assert!(matches!(err, FileServiceError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_temp, store) = fixture();
        let err = store.read_file("s1", "../escape.txt").await.unwrap_err();
        assert!(matches!(err, FileServiceError::InvalidPath(_)));
        let err = store.read_file("../s1", "notes.txt").await.unwrap_err();
        assert!(matches!(err, FileServiceError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_bom_round_trip() {
        let (temp, store) = fixture();
        let path = temp.path().join("s1/bom.txt");
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice("héllo".as_bytes());
        fs::write(&path, bytes).unwrap();

        let content = store.read_file("s1", "bom.txt").await.unwrap();
        assert_eq!(content.text, "héllo");
        assert_eq!(content.encoding, ENCODING_UTF8_BOM);

        store
            .write_file("s1", "bom.txt", "bye", &content.encoding)
            .await
            .unwrap();
        let written = fs::read(&path).unwrap();
        assert!(written.starts_with(UTF8_BOM));
        assert_eq!(&written[3..], b"bye");
    }

    #[tokio::test]
    async fn test_non_utf8_is_encoding_error() {
        let (_temp, store) = fixture();
        let err = store.read_file("s1", "OEBPS/cover.jpg").await.unwrap_err();
        assert!(matches!(err, FileServiceError::Encoding { .. }));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_per_file() {
        let (_temp, store) = fixture();
        let store = Arc::new(store);

        let lease = store.lock_file("s1", "notes.txt").await.unwrap();
        let contender = {
            let store = store.clone();
            tokio::spawn(async move { store.lock_file("s1", "notes.txt").await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        // A different file is not blocked
        let other = store.lock_file("s1", "OEBPS/text/a.html").await.unwrap();
        drop(other);

        drop(lease);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lock_table_empties_after_release() {
        let (_temp, store) = fixture();

        let first = store.lock_file("s1", "notes.txt").await.unwrap();
        let second = store.lock_file("s1", "OEBPS/text/a.html").await.unwrap();
        assert_eq!(lock_table(&store.locks).len(), 2);

        drop(first);
        assert_eq!(lock_table(&store.locks).len(), 1);
        drop(second);
        assert!(lock_table(&store.locks).is_empty());

        // Relocking after pruning still works
        let again = store.lock_file("s1", "notes.txt").await.unwrap();
        drop(again);
        assert!(lock_table(&store.locks).is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_lock_entry_alive() {
        let (_temp, store) = fixture();
        let store = Arc::new(store);

        let lease = store.lock_file("s1", "notes.txt").await.unwrap();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let lease = store.lock_file("s1", "notes.txt").await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(lease);
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(lease);
        assert_eq!(lock_table(&store.locks).len(), 1);
        waiter.await.unwrap();
        assert!(lock_table(&store.locks).is_empty());
    }
}
