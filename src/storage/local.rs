//! Filesystem-backed store.

use super::{has_extension, ObjectStore};
use crate::error::StorageError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// A directory tree addressed by `/`-separated relative keys.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to a path under the root, refusing anything that escapes it.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::Io {
                path: relative.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "key must be a plain relative path",
                ),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn list(&self, prefix: &str, extensions: &[String]) -> Result<Vec<String>, StorageError> {
        let root = self.root.clone();
        let prefix = prefix.trim_matches('/').to_string();
        let extensions = extensions.to_vec();

        // walkdir is blocking; keep it off the async workers.
        tokio::task::spawn_blocking(move || walk(&root, &prefix, &extensions))
            .await
            .map_err(|e| StorageError::Remote(format!("listing task failed: {e}")))?
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::Io { path, source: e },
        })
    }

    async fn write(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        // Atomic write: write to temp, then rename
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| StorageError::Io {
                path: tmp.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::Io {
                path: path.clone(),
                source: e,
            })?;

        debug!("Wrote {} bytes to {}", body.len(), path.display());
        Ok(())
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

fn walk(root: &Path, prefix: &str, extensions: &[String]) -> Result<Vec<String>, StorageError> {
    let start = if prefix.is_empty() {
        root.to_path_buf()
    } else {
        root.join(prefix)
    };
    if !start.is_dir() {
        return Err(StorageError::NotFound(start.display().to_string()));
    }

    let mut keys = Vec::new();
    for entry in WalkDir::new(&start).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| start.clone());
            StorageError::Io {
                path,
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if has_extension(&key, extensions) {
            keys.push(key);
        }
    }
    keys.sort();
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(dir: &Path, rel: &str, body: &[u8]) {
        let p = dir.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, body).unwrap();
    }

    #[tokio::test]
    async fn lists_recursively_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        seed(dir.path(), "pdfs/b.pdf", b"%PDF");
        seed(dir.path(), "pdfs/a.PDF", b"%PDF");
        seed(dir.path(), "pdfs/sub/c.pdf", b"%PDF");
        seed(dir.path(), "pdfs/notes.txt", b"x");
        seed(dir.path(), "other/d.pdf", b"%PDF");

        let store = LocalStore::new(dir.path());
        let keys = store.list("pdfs/", &["pdf".to_string()]).await.unwrap();
        assert_eq!(keys, vec!["pdfs/a.PDF", "pdfs/b.pdf", "pdfs/sub/c.pdf"]);

        let all = store.list("", &["pdf".to_string()]).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path().join("nope"));
        let err = store.list("", &["pdf".to_string()]).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn write_then_read_creates_parents() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        store
            .write("out/deep/a.md", b"# Hello".to_vec(), "text/markdown")
            .await
            .unwrap();
        assert_eq!(store.read("out/deep/a.md").await.unwrap(), b"# Hello");
        assert!(!dir.path().join("out/deep/a.md.tmp").exists());
    }

    #[test]
    fn read_missing_maps_to_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        let err = tokio_test::block_on(store.read("missing.pdf")).unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn rejects_escaping_keys() {
        let store = LocalStore::new("/tmp/root");
        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("./a.md").is_err());
        assert!(store.resolve("a/b.md").is_ok());
    }
}
