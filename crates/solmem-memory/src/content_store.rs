//! Filesystem content store for generated memory text.
//!
//! Objects are written under a root directory at a caller-chosen relative
//! key and addressed afterwards by a locator of the form `content://{key}`.
//! Writing the same key twice overwrites the object.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use solmem_types::{CollaboratorError, PipelineError};
use thiserror::Error;
use tracing::debug;

/// Scheme prefix of every locator handed out by [`FsContentStore`].
pub const LOCATOR_SCHEME: &str = "content://";

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Unique sibling of `path` for an in-flight write: the full file name plus
/// a process id and sequence number.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".{}.{seq}.partial", std::process::id()));
    path.with_file_name(name)
}

/// Errors that can arise from content store operations.
#[derive(Error, Debug)]
pub enum ContentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid object key: {0:?}")]
    InvalidKey(String),
    #[error("Invalid locator: {0:?}")]
    InvalidLocator(String),
    #[error("Object not found: {0}")]
    NotFound(String),
}

impl From<ContentError> for PipelineError {
    fn from(err: ContentError) -> Self {
        PipelineError::Collaborator(CollaboratorError::permanent("content_store", err.to_string()))
    }
}

/// Content store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    /// Use `root` as the store directory, creating it when missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ContentError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` under `key` and return the object's locator.
    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ContentError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so readers never observe a half-written object.
        let tmp = partial_path(&path);
        std::fs::write(&tmp, bytes)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(key, bytes = bytes.len(), "stored content object");
        Ok(format!("{LOCATOR_SCHEME}{key}"))
    }

    /// Read the object addressed by `locator`.
    pub fn get(&self, locator: &str) -> Result<Vec<u8>, ContentError> {
        let key = locator
            .strip_prefix(LOCATOR_SCHEME)
            .ok_or_else(|| ContentError::InvalidLocator(locator.to_string()))?;
        let path = self
            .resolve(key)
            .map_err(|_| ContentError::InvalidLocator(locator.to_string()))?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ContentError::NotFound(locator.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Map a relative key to a path under the root, refusing anything that
    /// could escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf, ContentError> {
        let rel = Path::new(key);
        let clean = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(ContentError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::open(dir.path().join("content")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_then_get_returns_same_bytes() {
        let (_dir, store) = make_store();
        let locator = store
            .put("memories/2024-01-08/image1_memory.txt", b"Memory Entry")
            .unwrap();
        assert_eq!(locator, "content://memories/2024-01-08/image1_memory.txt");
        assert_eq!(store.get(&locator).unwrap(), b"Memory Entry");
    }

    #[test]
    fn put_same_key_overwrites() {
        let (_dir, store) = make_store();
        store.put("a.txt", b"first").unwrap();
        let locator = store.put("a.txt", b"second").unwrap();
        assert_eq!(store.get(&locator).unwrap(), b"second");
        assert!(!store.root().join("a.partial").exists());
    }

    #[test]
    fn partial_names_keep_the_full_file_name() {
        let txt = partial_path(Path::new("memories/a.txt"));
        let json = partial_path(Path::new("memories/a.json"));
        let again = partial_path(Path::new("memories/a.txt"));

        let name = txt.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("a.txt."), "{name}");
        assert!(name.ends_with(".partial"), "{name}");
        assert_eq!(txt.parent(), Some(Path::new("memories")));
        assert_ne!(txt, json);
        assert_ne!(txt, again);
    }

    #[test]
    fn keys_differing_only_in_extension_do_not_clash() {
        let (_dir, store) = make_store();
        let a = store.put("memories/image1_memory.txt", b"text").unwrap();
        let b = store.put("memories/image1_memory.json", b"{}").unwrap();
        assert_eq!(store.get(&a).unwrap(), b"text");
        assert_eq!(store.get(&b).unwrap(), b"{}");
    }

    #[test]
    fn concurrent_writers_to_one_key_all_succeed() {
        let (_dir, store) = make_store();
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.put("memories/same.txt", &[i; 64]))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let body = store.get("content://memories/same.txt").unwrap();
        assert_eq!(body.len(), 64);
        assert!(body.iter().all(|b| *b == body[0]));
        let leftovers = std::fs::read_dir(store.root().join("memories"))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".partial"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn keys_escaping_the_root_are_rejected() {
        let (_dir, store) = make_store();
        for key in ["", "../x.txt", "/etc/passwd", "a/../../b"] {
            assert!(
                matches!(store.put(key, b"x"), Err(ContentError::InvalidKey(_))),
                "key {key:?} accepted"
            );
        }
    }

    #[test]
    fn get_validates_locator() {
        let (_dir, store) = make_store();
        assert!(matches!(
            store.get("s3://bucket/a.txt"),
            Err(ContentError::InvalidLocator(_))
        ));
        assert!(matches!(
            store.get("content://../a.txt"),
            Err(ContentError::InvalidLocator(_))
        ));
        assert!(matches!(
            store.get("content://missing.txt"),
            Err(ContentError::NotFound(_))
        ));
    }

    #[test]
    fn errors_map_to_content_store_collaborator() {
        let err: PipelineError = ContentError::NotFound("content://x".into()).into();
        match err {
            PipelineError::Collaborator(c) => assert_eq!(c.service, "content_store"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
