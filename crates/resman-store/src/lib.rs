//! Persistence layer for resman.
//!
//! `RecordStore` keeps one JSON document per transition request under the
//! directory named by `StoreLayout`. Every write is atomic and carries a
//! blake3 checksum that is verified on read.

pub mod layout;
pub mod records;

pub use layout::StoreLayout;
pub use records::{RecordId, RecordStore, RequestState, TransitionRecord};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("integrity check failed for record '{record}': expected {expected}, got {actual}")]
    IntegrityFailure {
        record: String,
        expected: String,
        actual: String,
    },
    #[error("transition record not found: {0}")]
    RecordNotFound(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_record_not_found() {
        let e = StoreError::RecordNotFound("17".to_owned());
        assert!(e.to_string().contains("17"));
    }

    #[test]
    fn store_error_display_integrity_failure() {
        let e = StoreError::IntegrityFailure {
            record: "3".to_owned(),
            expected: "exp".to_owned(),
            actual: "act".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("exp"));
        assert!(msg.contains("act"));
    }

    #[test]
    fn store_error_display_lock_failed() {
        let e = StoreError::LockFailed("held".to_owned());
        assert!(e.to_string().contains("held"));
    }
}
