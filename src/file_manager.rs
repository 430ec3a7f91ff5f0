use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use url::Url;

use crate::error::{MirrorError, Result};
use crate::mirror_tree::MirrorTree;

/// Persists mirrored resources under the output root and owns the
/// URL-to-path mapping.
pub struct FileManager {
    base_dir: PathBuf,
    tree: Mutex<MirrorTree>,
}

impl FileManager {
    pub fn new(base_dir: &Path) -> Result<Self> {
        let base_dir = base_dir.to_path_buf();
        fs::create_dir_all(&base_dir).map_err(|e| {
            MirrorError::Config(format!(
                "Failed to create output directory {:?}: {}",
                base_dir, e
            ))
        })?;

        Ok(Self {
            base_dir,
            tree: Mutex::new(MirrorTree::new()),
        })
    }

    pub fn with_ignore_query(self, ignore_query: bool) -> Self {
        let tree = self.tree.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        Self {
            base_dir: self.base_dir,
            tree: Mutex::new(tree.with_ignore_query(ignore_query)),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn tree(&self) -> MutexGuard<'_, MirrorTree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes `content` for `url` and returns its path relative to the
    /// output root. On failure the URL is released from the mirror tree so
    /// that nothing links to a file that does not exist.
    pub fn write(&self, url: &Url, content_type: Option<&str>, content: &[u8]) -> Result<PathBuf> {
        let relative = self.tree().assign(url, content_type);

        match self.save_file(&relative, content) {
            Ok(_) => Ok(relative),
            Err(e) => {
                self.tree().release(url);
                Err(e)
            }
        }
    }

    pub fn add_alias(&self, from: Url, to: Url) {
        self.tree().add_alias(from, to);
    }

    pub fn save_file(&self, relative: &Path, content: &[u8]) -> Result<PathBuf> {
        let file_path = self.base_dir.join(relative);

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).map_err(|source| MirrorError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        fs::write(&file_path, content).map_err(|source| MirrorError::Write {
            path: file_path.clone(),
            source,
        })?;

        Ok(file_path)
    }

    pub fn read_file(&self, relative: &Path) -> Result<Vec<u8>> {
        let file_path = self.base_dir.join(relative);
        fs::read(&file_path).map_err(|source| MirrorError::Write {
            path: file_path,
            source,
        })
    }

    pub fn file_exists(&self, relative: &Path) -> bool {
        self.base_dir.join(relative).exists()
    }
}
