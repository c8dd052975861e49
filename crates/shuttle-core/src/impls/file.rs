//! JSON file stores under a shared data directory.
//!
//! Layout:
//! ```text
//! <root>/leases/<task>.json      SharedLeaseState
//! <root>/lease-tags/<task>.json  ["lease:working", ..]
//! <root>/presence/<instance>.json PresenceRecord
//! <root>/slots.json              [WorkspaceSlot, ..]
//! ```
//!
//! Each file is replaced wholesale via write-to-temp + rename, so a reader never
//! sees a torn document. There is no compare-and-swap across processes: the
//! lease store reports `conditional_writes = false` and the lease manager
//! verifies its writes by reading them back.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::domain::ids::TaskId;
use crate::domain::lease::{SharedLeaseState, StatusTag};
use crate::domain::{PresenceRecord, StoreError, WorkspaceSlot};
use crate::ports::{
    Expectation, PresenceStore, SlotStore, StateStore, StoreCapabilities, WriteOutcome,
};

/// Map an arbitrary key to a safe file stem. Unsafe bytes become `%XX`.
fn file_stem(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    // "." and ".." are valid stems after escaping but not valid file names
    if out.chars().all(|c| c == '.') {
        out = out.replace('.', "%2E");
    }
    out
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| StoreError::Corrupt {
            key: path.display().to_string(),
            reason: err.to_string(),
        })
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{:08x}.tmp", rand::random::<u32>()));

    fs::write(&tmp, &bytes).await?;
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn json_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_temp = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with('.'));
        if !is_temp && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Lease store backed by one JSON file per task.
///
/// The record and its status tags live in separate directories, so a tag
/// update never rewrites a record written by another process in between.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    dir: PathBuf,
    tags_dir: PathBuf,
}

impl JsonFileStateStore {
    /// Open (creating if needed) `<root>/leases` and `<root>/lease-tags`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = root.as_ref().join("leases");
        let tags_dir = root.as_ref().join("lease-tags");
        fs::create_dir_all(&dir).await?;
        fs::create_dir_all(&tags_dir).await?;
        Ok(Self { dir, tags_dir })
    }

    fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(task_id.as_str())))
    }

    fn tags_path_for(&self, task_id: &TaskId) -> PathBuf {
        self.tags_dir
            .join(format!("{}.json", file_stem(task_id.as_str())))
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            conditional_writes: false,
        }
    }

    async fn read(&self, task_id: &TaskId) -> Result<Option<SharedLeaseState>, StoreError> {
        read_json(&self.path_for(task_id)).await
    }

    async fn write(
        &self,
        state: &SharedLeaseState,
        _expect: Expectation,
    ) -> Result<WriteOutcome, StoreError> {
        write_json(&self.path_for(&state.task_id), state).await?;
        Ok(WriteOutcome::Written)
    }

    async fn clear(
        &self,
        task_id: &TaskId,
        _expect: Expectation,
    ) -> Result<WriteOutcome, StoreError> {
        remove_if_exists(&self.path_for(task_id)).await?;
        Ok(WriteOutcome::Written)
    }

    async fn list(&self) -> Result<Vec<SharedLeaseState>, StoreError> {
        let mut records = Vec::new();
        for path in json_files(&self.dir).await? {
            // A file removed between listing and reading is simply gone.
            if let Some(record) = read_json(&path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn list_tags(&self, task_id: &TaskId) -> Result<Vec<String>, StoreError> {
        Ok(read_json(&self.tags_path_for(task_id))
            .await?
            .unwrap_or_default())
    }

    async fn set_status_tag(
        &self,
        task_id: &TaskId,
        tag: Option<StatusTag>,
    ) -> Result<(), StoreError> {
        let path = self.tags_path_for(task_id);
        let mut tags: Vec<String> = read_json(&path).await?.unwrap_or_default();
        tags.retain(|label| !label.starts_with(StatusTag::PREFIX));
        if let Some(tag) = tag {
            tags.push(tag.label().to_string());
        }
        if tags.is_empty() {
            remove_if_exists(&path).await
        } else {
            write_json(&path, &tags).await
        }
    }
}

/// Presence registry backed by one JSON file per instance.
#[derive(Debug, Clone)]
pub struct JsonFilePresenceStore {
    dir: PathBuf,
}

impl JsonFilePresenceStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = root.as_ref().join("presence");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl PresenceStore for JsonFilePresenceStore {
    async fn upsert(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        let path = self
            .dir
            .join(format!("{}.json", file_stem(record.instance_id.as_str())));
        write_json(&path, record).await
    }

    async fn list(&self) -> Result<Vec<PresenceRecord>, StoreError> {
        let mut records = Vec::new();
        for path in json_files(&self.dir).await? {
            if let Some(record) = read_json(&path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Slot registry persisted as a single JSON list.
#[derive(Debug, Clone)]
pub struct JsonFileSlotStore {
    path: PathBuf,
}

impl JsonFileSlotStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        fs::create_dir_all(root.as_ref()).await?;
        Ok(Self {
            path: root.as_ref().join("slots.json"),
        })
    }
}

#[async_trait]
impl SlotStore for JsonFileSlotStore {
    async fn load(&self) -> Result<Vec<WorkspaceSlot>, StoreError> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    async fn save(&self, slots: &[WorkspaceSlot]) -> Result<(), StoreError> {
        write_json(&self.path, slots).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{AttemptToken, InstanceId, OwnerId};
    use crate::domain::Role;
    use chrono::Utc;
    use ulid::Ulid;

    fn record(task: &str) -> SharedLeaseState {
        SharedLeaseState::claimed(
            TaskId::new(task),
            OwnerId::new(InstanceId::new("w1"), "a"),
            AttemptToken::from_ulid(Ulid::new()),
            Utc::now(),
            0,
        )
    }

    #[test]
    fn file_stem_escapes_path_separators() {
        assert_eq!(file_stem("T-42"), "T-42");
        assert_eq!(file_stem("org/repo#7"), "org%2Frepo%237");
        assert_eq!(file_stem(".."), "%2E%2E");
    }

    #[tokio::test]
    async fn lease_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let state = record("org/repo#7");

        let store = JsonFileStateStore::open(dir.path()).await.unwrap();
        store.write(&state, Expectation::Absent).await.unwrap();

        let reopened = JsonFileStateStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.read(&state.task_id).await.unwrap(),
            Some(state.clone())
        );
        assert_eq!(reopened.list().await.unwrap(), vec![state]);
    }

    #[tokio::test]
    async fn missing_record_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::open(dir.path()).await.unwrap();
        assert_eq!(store.read(&TaskId::new("T-1")).await.unwrap(), None);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_does_not_enforce_expectations() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::open(dir.path()).await.unwrap();
        let first = record("T-1");
        let second = record("T-1");

        store.write(&first, Expectation::Absent).await.unwrap();
        let outcome = store.write(&second, Expectation::Absent).await.unwrap();

        assert_eq!(outcome, WriteOutcome::Written);
        assert!(!store.capabilities().conditional_writes);
        assert_eq!(store.read(&first.task_id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn clear_keeps_tags_until_they_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::open(dir.path()).await.unwrap();
        let state = record("T-1");

        store.write(&state, Expectation::Any).await.unwrap();
        store
            .set_status_tag(&state.task_id, Some(StatusTag::Stale))
            .await
            .unwrap();
        store.clear(&state.task_id, Expectation::Any).await.unwrap();

        assert_eq!(store.read(&state.task_id).await.unwrap(), None);
        assert_eq!(
            store.list_tags(&state.task_id).await.unwrap(),
            vec!["lease:stale".to_string()]
        );

        store.set_status_tag(&state.task_id, None).await.unwrap();
        assert!(!store.tags_path_for(&state.task_id).exists());
        assert!(!store.path_for(&state.task_id).exists());
    }

    #[tokio::test]
    async fn tag_update_never_reverts_a_record_written_by_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let tagger = JsonFileStateStore::open(dir.path()).await.unwrap();
        let writer = JsonFileStateStore::open(dir.path()).await.unwrap();
        let task = TaskId::new("T-1");
        tagger.write(&record("T-1"), Expectation::Any).await.unwrap();

        for _ in 0..100 {
            let newer = record("T-1");
            let (tagged, written) = tokio::join!(
                tagger.set_status_tag(&task, Some(StatusTag::Stale)),
                writer.write(&newer, Expectation::Any),
            );
            tagged.unwrap();
            written.unwrap();
            assert_eq!(tagger.read(&task).await.unwrap(), Some(newer));
        }
    }

    #[tokio::test]
    async fn record_write_leaves_tags_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::open(dir.path()).await.unwrap();
        let state = record("T-1");
        store
            .set_status_tag(&state.task_id, Some(StatusTag::Working))
            .await
            .unwrap();

        store.write(&state, Expectation::Any).await.unwrap();
        store.write(&record("T-1"), Expectation::Any).await.unwrap();

        assert_eq!(
            store.list_tags(&state.task_id).await.unwrap(),
            vec!["lease:working".to_string()]
        );
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported_not_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::open(dir.path()).await.unwrap();
        let task = TaskId::new("T-1");
        fs::write(store.path_for(&task), b"{not json").await.unwrap();

        let err = store.read(&task).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn presence_and_slots_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let presence = JsonFilePresenceStore::open(dir.path()).await.unwrap();
        let record = PresenceRecord::new(InstanceId::new("w1"), Role::Worker, Utc::now());
        presence.upsert(&record).await.unwrap();
        presence.upsert(&record).await.unwrap();
        assert_eq!(presence.list().await.unwrap(), vec![record]);

        let slots = JsonFileSlotStore::open(dir.path()).await.unwrap();
        assert!(slots.load().await.unwrap().is_empty());
        let pool = vec![WorkspaceSlot::free("ws-0"), WorkspaceSlot::free("ws-1")];
        slots.save(&pool).await.unwrap();
        assert_eq!(slots.load().await.unwrap(), pool);
    }
}
