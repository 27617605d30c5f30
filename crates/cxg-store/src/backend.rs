// SPDX-License-Identifier: Apache-2.0

use crate::error::{StoreError, StoreErrorCode};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

/// Group index file written next to every group so that listing works on
/// backends without directory semantics.
pub const GROUP_INDEX: &str = "__group.json";

/// Read-only object access relative to the root of one matrix store.
///
/// Keys are `/`-separated paths such as `X/__array.json`.
pub trait StorageBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    /// Exactly `len` bytes of `key` starting at `offset`. A short object is
    /// a validation error.
    fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>, StoreError>;
    fn exists(&self, key: &str) -> Result<bool, StoreError>;
    /// Names of the members of the group at `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    pub root: PathBuf,
}

impl LocalFsBackend {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(key.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StoreError::validation(format!("invalid store key {key}")));
        }
        Ok(self.root.join(rel))
    }
}

impl StorageBackend for LocalFsBackend {
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(|e| StoreError::io(&e, &path.display().to_string()))
    }

    fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        let what = path.display().to_string();
        let mut file = File::open(&path).map_err(|e| StoreError::io(&e, &what))?;
        let size = file.metadata().map_err(|e| StoreError::io(&e, &what))?.len();
        if offset.saturating_add(len) > size {
            return Err(short_object(&what, offset, len, size));
        }
        let len = usize::try_from(len)
            .map_err(|_| StoreError::validation(format!("{what}: range too large")))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StoreError::io(&e, &what))?;
        let mut buf = vec![0_u8; len];
        file.read_exact(&mut buf)
            .map_err(|e| StoreError::io(&e, &what))?;
        Ok(buf)
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(key)?.exists())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.path_for(prefix)?;
        let entries =
            fs::read_dir(&dir).map_err(|e| StoreError::io(&e, &dir.display().to_string()))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::new(StoreErrorCode::Io, e.to_string()))?;
            let is_dir = entry
                .file_type()
                .map_err(|e| StoreError::new(StoreErrorCode::Io, e.to_string()))?
                .is_dir();
            if is_dir {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

pub(crate) fn short_object(what: &str, offset: u64, len: u64, size: u64) -> StoreError {
    StoreError::validation(format!(
        "{what}: range {offset}+{len} is past the end of a {size} byte object"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_backend_refuses_keys_leaving_the_root() {
        let root = tempfile::tempdir().expect("tempdir");
        let backend = LocalFsBackend::new(root.path().to_path_buf());
        let err = backend.read("../secret").expect_err("traversal");
        assert_eq!(err.code, StoreErrorCode::Validation);
    }

    #[test]
    fn missing_objects_are_not_found() {
        let root = tempfile::tempdir().expect("tempdir");
        let backend = LocalFsBackend::new(root.path().to_path_buf());
        let err = backend.read("X/__array.json").expect_err("missing");
        assert_eq!(err.code, StoreErrorCode::NotFound);
        assert!(!backend.exists("X/__array.json").expect("exists"));
    }

    #[test]
    fn ranges_read_inside_the_object_and_reject_overruns() {
        let root = tempfile::tempdir().expect("tempdir");
        fs::write(root.path().join("blob.bin"), b"0123456789").expect("write");
        let backend = LocalFsBackend::new(root.path().to_path_buf());
        assert_eq!(backend.read_range("blob.bin", 3, 4).expect("range"), b"3456");
        assert!(backend.read_range("blob.bin", 8, 0).expect("empty").is_empty());
        let err = backend.read_range("blob.bin", 8, 3).expect_err("overrun");
        assert_eq!(err.code, StoreErrorCode::Validation);
    }

    #[test]
    fn list_returns_sorted_subgroups_only() {
        let root = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(root.path().join("emb/umap")).expect("mkdir");
        fs::create_dir_all(root.path().join("emb/tsne")).expect("mkdir");
        fs::write(root.path().join("emb").join(GROUP_INDEX), b"{}").expect("write");
        let backend = LocalFsBackend::new(root.path().to_path_buf());
        assert_eq!(backend.list("emb").expect("list"), vec!["tsne", "umap"]);
    }
}
