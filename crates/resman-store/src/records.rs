use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use resman_schema::Properties;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    InProgress,
    Completed,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestState::InProgress)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestState::InProgress => write!(f, "IN_PROGRESS"),
            RequestState::Completed => write!(f, "COMPLETED"),
            RequestState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Internal persistence id of a transition record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(u64);

impl RecordId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted status of one transition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub request_id: u64,
    pub transition_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_location: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_manager_id: Option<String>,
    pub request_state: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_state_reason: Option<String>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    /// blake3 checksum over the record with this field cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl TransitionRecord {
    /// A fresh IN_PROGRESS record started now.
    pub fn new(request_id: u64, transition_name: impl Into<String>) -> Self {
        Self {
            request_id,
            transition_name: transition_name.into(),
            resource_id: None,
            resource_type: None,
            resource_name: None,
            deployment_location: None,
            properties: Properties::new(),
            metric_key: None,
            resource_manager_id: None,
            request_state: RequestState::InProgress,
            request_state_reason: None,
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
            checksum: None,
        }
    }

    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

#[derive(Debug, Default)]
struct Index {
    next_id: u64,
    by_request: BTreeMap<u64, RecordId>,
}

/// Directory of transition records, one JSON file per record id, with an
/// in-memory index from request id to record.
pub struct RecordStore {
    layout: StoreLayout,
    index: Mutex<Index>,
}

impl RecordStore {
    /// Open the store, creating its directory. Record ids continue after the
    /// highest id already on disk.
    pub fn open(layout: StoreLayout) -> Result<Self, StoreError> {
        layout.initialize()?;
        let mut highest = 0;
        for entry in fs::read_dir(layout.records_dir())? {
            let entry = entry?;
            if let Some(id) = parse_record_file_name(&entry.file_name().to_string_lossy()) {
                highest = highest.max(id);
            }
        }
        debug!(
            "opened record store at {} (next id {})",
            layout.records_dir().display(),
            highest + 1
        );
        let store = Self {
            layout,
            index: Mutex::new(Index {
                next_id: highest + 1,
                by_request: BTreeMap::new(),
            }),
        };
        let by_request = store
            .entries()?
            .into_iter()
            .map(|(id, record)| (record.request_id, id))
            .collect();
        store.writer()?.by_request = by_request;
        Ok(store)
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn writer(&self) -> Result<MutexGuard<'_, Index>, StoreError> {
        self.index
            .lock()
            .map_err(|_| StoreError::LockFailed("record store writer mutex poisoned".to_owned()))
    }

    fn write_record(&self, id: u64, record: &TransitionRecord) -> Result<(), StoreError> {
        let mut with_checksum = record.clone();
        with_checksum.checksum = Some(with_checksum.compute_checksum()?);
        let content = serde_json::to_string_pretty(&with_checksum)?;

        let dir = self.layout.records_dir();
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.layout.record_path(id))
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }

    pub fn create(&self, record: &TransitionRecord) -> Result<RecordId, StoreError> {
        let mut index = self.writer()?;
        let id = index.next_id;
        self.write_record(id, record)?;
        index.next_id += 1;
        index.by_request.insert(record.request_id, RecordId(id));
        debug!("created transition record {id} for request {}", record.request_id);
        Ok(RecordId(id))
    }

    pub fn update(&self, id: RecordId, record: &TransitionRecord) -> Result<(), StoreError> {
        let mut index = self.writer()?;
        if !self.layout.record_path(id.0).exists() {
            return Err(StoreError::RecordNotFound(id.to_string()));
        }
        self.write_record(id.0, record)?;
        index.by_request.insert(record.request_id, id);
        Ok(())
    }

    pub fn remove(&self, id: RecordId) -> Result<(), StoreError> {
        let mut index = self.writer()?;
        index.by_request.retain(|_, indexed| *indexed != id);
        let path = self.layout.record_path(id.0);
        if path.exists() {
            fs::remove_file(path)?;
            debug!("removed transition record {id}");
        }
        Ok(())
    }

    pub fn get(&self, id: RecordId) -> Result<TransitionRecord, StoreError> {
        let path = self.layout.record_path(id.0);
        if !path.exists() {
            return Err(StoreError::RecordNotFound(id.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        let record: TransitionRecord = serde_json::from_str(&content)?;

        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    record: id.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(record)
    }

    /// Every readable record with its id, ordered by id. Corrupt entries are
    /// logged and skipped.
    pub fn entries(&self) -> Result<Vec<(RecordId, TransitionRecord)>, StoreError> {
        let dir = self.layout.records_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(id) = parse_record_file_name(&entry.file_name().to_string_lossy()) {
                ids.push(RecordId(id));
            }
        }
        ids.sort();

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(id) {
                Ok(record) => results.push((id, record)),
                Err(e) => warn!("skipping corrupted transition record '{id}': {e}"),
            }
        }
        Ok(results)
    }

    pub fn list(&self) -> Result<Vec<TransitionRecord>, StoreError> {
        Ok(self.entries()?.into_iter().map(|(_, r)| r).collect())
    }

    pub fn find_by_request_id(
        &self,
        request_id: u64,
    ) -> Result<Option<(RecordId, TransitionRecord)>, StoreError> {
        let indexed = self.writer()?.by_request.get(&request_id).copied();
        let Some(id) = indexed else {
            return Ok(None);
        };
        match self.get(id) {
            Ok(record) => Ok(Some((id, record))),
            Err(StoreError::RecordNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All records naming `resource_id`, oldest request first.
    pub fn find_by_resource_id(
        &self,
        resource_id: &str,
    ) -> Result<Vec<TransitionRecord>, StoreError> {
        let mut found: Vec<TransitionRecord> = self
            .list()?
            .into_iter()
            .filter(|r| r.resource_id.as_deref() == Some(resource_id))
            .collect();
        found.sort_by_key(|r| r.request_id);
        Ok(found)
    }

    /// Highest request id on record, if any.
    pub fn max_request_id(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.writer()?.by_request.keys().next_back().copied())
    }

    /// Delete every record, returning how many were removed.
    pub fn purge(&self) -> Result<usize, StoreError> {
        let mut index = self.writer()?;
        index.by_request.clear();
        let dir = self.layout.records_dir();
        let mut removed = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if parse_record_file_name(&entry.file_name().to_string_lossy()).is_some() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        fsync_dir(&dir)?;
        debug!("purged {removed} transition records");
        Ok(removed)
    }
}

fn parse_record_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".json")?.parse().ok()
}
