use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout of a resman data directory.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn records_dir(&self) -> PathBuf {
        self.root.join("transitions")
    }

    #[inline]
    pub fn record_path(&self, record_id: u64) -> PathBuf {
        self.records_dir().join(format!("{record_id}.json"))
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join("resman.lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.records_dir())?;
        Ok(())
    }
}
