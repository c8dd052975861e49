//! Issue-tracker-backed lease store.
//!
//! The lease record lives verbatim as JSON inside a marked comment on the
//! task's issue, and the status is mirrored as a `lease:*` label:
//!
//! ````text
//! <!-- shuttle:lease -->
//! ```json
//! {"taskId":"T-42","ownerId":"w1/agent",...}
//! ```
//! ````
//!
//! Trackers offer no compare-and-swap, so this store reports
//! `conditional_writes = false`. If two writers race to create the comment,
//! reads resolve to the newest lease comment, which makes the later writer win
//! and lets the earlier one detect the loss on re-read.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::ids::TaskId;
use crate::domain::lease::{SharedLeaseState, StatusTag};
use crate::domain::StoreError;
use crate::ports::{
    Comment, Expectation, IssueTracker, StateStore, StoreCapabilities, WriteOutcome,
};

const BLOCK_MARKER: &str = "<!-- shuttle:lease -->";
const FENCE_OPEN: &str = "```json\n";
const FENCE_CLOSE: &str = "\n```";

/// Render a record as a comment body.
pub fn encode_block(state: &SharedLeaseState) -> Result<String, StoreError> {
    let json = serde_json::to_string(state)?;
    Ok(format!("{BLOCK_MARKER}\n{FENCE_OPEN}{json}{FENCE_CLOSE}\n"))
}

/// Extract a record from a comment body; `Ok(None)` if it is not a lease block.
pub fn decode_block(issue: &str, body: &str) -> Result<Option<SharedLeaseState>, StoreError> {
    let Some(after_marker) = body.split_once(BLOCK_MARKER).map(|(_, rest)| rest) else {
        return Ok(None);
    };
    let corrupt = |reason: String| StoreError::Corrupt {
        key: issue.to_string(),
        reason,
    };

    let start = after_marker
        .find(FENCE_OPEN)
        .ok_or_else(|| corrupt("lease block without json fence".to_string()))?
        + FENCE_OPEN.len();
    let len = after_marker[start..]
        .find(FENCE_CLOSE)
        .ok_or_else(|| corrupt("unterminated json fence".to_string()))?;

    serde_json::from_str(&after_marker[start..start + len])
        .map(Some)
        .map_err(|err| corrupt(err.to_string()))
}

fn is_lease_comment(comment: &Comment) -> bool {
    comment.body.contains(BLOCK_MARKER)
}

/// `StateStore` over any [`IssueTracker`].
pub struct TrackerStateStore<T> {
    tracker: T,
}

impl<T: IssueTracker> TrackerStateStore<T> {
    pub fn new(tracker: T) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    async fn lease_comments(&self, issue: &str) -> Result<Vec<Comment>, StoreError> {
        let comments = self.tracker.comments(issue).await?;
        Ok(comments.into_iter().filter(is_lease_comment).collect())
    }
}

#[async_trait]
impl<T: IssueTracker> StateStore for TrackerStateStore<T> {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            conditional_writes: false,
        }
    }

    async fn read(&self, task_id: &TaskId) -> Result<Option<SharedLeaseState>, StoreError> {
        let comments = self.lease_comments(task_id.as_str()).await?;
        match comments.last() {
            Some(newest) => decode_block(task_id.as_str(), &newest.body),
            None => Ok(None),
        }
    }

    async fn write(
        &self,
        state: &SharedLeaseState,
        _expect: Expectation,
    ) -> Result<WriteOutcome, StoreError> {
        let issue = state.task_id.as_str();
        let body = encode_block(state)?;

        match self.lease_comments(issue).await?.last() {
            Some(existing) => {
                self.tracker
                    .update_comment(issue, &existing.id, &body)
                    .await?
            }
            None => {
                self.tracker.create_comment(issue, &body).await?;
            }
        }
        Ok(WriteOutcome::Written)
    }

    async fn clear(
        &self,
        task_id: &TaskId,
        _expect: Expectation,
    ) -> Result<WriteOutcome, StoreError> {
        let issue = task_id.as_str();
        for comment in self.lease_comments(issue).await? {
            self.tracker.delete_comment(issue, &comment.id).await?;
        }
        Ok(WriteOutcome::Written)
    }

    async fn list(&self) -> Result<Vec<SharedLeaseState>, StoreError> {
        // A failed tag write leaves a block without a label, so both are searched.
        let mut issues: BTreeSet<String> = self
            .tracker
            .issues_with_label_prefix(StatusTag::PREFIX)
            .await?
            .into_iter()
            .collect();
        issues.extend(
            self.tracker
                .issues_with_comment_containing(BLOCK_MARKER)
                .await?,
        );

        let mut records = Vec::new();
        for issue in issues {
            // Labels may lag the comment; an issue whose block is gone is skipped.
            if let Some(record) = self.read(&TaskId::new(issue)).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn list_tags(&self, task_id: &TaskId) -> Result<Vec<String>, StoreError> {
        self.tracker.labels(task_id.as_str()).await
    }

    async fn set_status_tag(
        &self,
        task_id: &TaskId,
        tag: Option<StatusTag>,
    ) -> Result<(), StoreError> {
        let issue = task_id.as_str();
        let mut labels = self.tracker.labels(issue).await?;
        labels.retain(|label| !label.starts_with(StatusTag::PREFIX));
        if let Some(tag) = tag {
            labels.push(tag.label().to_string());
        }
        self.tracker.set_labels(issue, &labels).await
    }
}

#[derive(Debug, Default, Clone)]
struct IssueState {
    labels: Vec<String>,
    comments: Vec<Comment>,
}

#[derive(Debug, Default)]
struct InMemoryTrackerState {
    issues: BTreeMap<String, IssueState>,
    next_comment_id: u64,
}

/// Issue tracker held in memory, for tests and local demos.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTracker {
    state: Arc<Mutex<InMemoryTrackerState>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IssueTracker for InMemoryTracker {
    async fn labels(&self, issue: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .issues
            .get(issue)
            .map(|i| i.labels.clone())
            .unwrap_or_default())
    }

    async fn set_labels(&self, issue: &str, labels: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.issues.entry(issue.to_string()).or_default().labels = labels.to_vec();
        Ok(())
    }

    async fn comments(&self, issue: &str) -> Result<Vec<Comment>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .issues
            .get(issue)
            .map(|i| i.comments.clone())
            .unwrap_or_default())
    }

    async fn create_comment(&self, issue: &str, body: &str) -> Result<String, StoreError> {
        let mut state = self.state.lock().await;
        state.next_comment_id += 1;
        let id = format!("c{}", state.next_comment_id);
        state
            .issues
            .entry(issue.to_string())
            .or_default()
            .comments
            .push(Comment {
                id: id.clone(),
                body: body.to_string(),
            });
        Ok(id)
    }

    async fn update_comment(
        &self,
        issue: &str,
        comment_id: &str,
        body: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let comment = state
            .issues
            .get_mut(issue)
            .and_then(|i| i.comments.iter_mut().find(|c| c.id == comment_id))
            .ok_or_else(|| {
                StoreError::Unavailable(format!("comment {comment_id} not found on {issue}"))
            })?;
        comment.body = body.to_string();
        Ok(())
    }

    async fn delete_comment(&self, issue: &str, comment_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(i) = state.issues.get_mut(issue) {
            i.comments.retain(|c| c.id != comment_id);
        }
        Ok(())
    }

    async fn issues_with_label_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .issues
            .iter()
            .filter(|(_, i)| i.labels.iter().any(|l| l.starts_with(prefix)))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn issues_with_comment_containing(
        &self,
        needle: &str,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .issues
            .iter()
            .filter(|(_, i)| i.comments.iter().any(|c| c.body.contains(needle)))
            .map(|(name, _)| name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{AttemptToken, InstanceId, OwnerId};
    use chrono::Utc;
    use ulid::Ulid;

    fn record(task: &str, agent: &str) -> SharedLeaseState {
        SharedLeaseState::claimed(
            TaskId::new(task),
            OwnerId::new(InstanceId::new("w1"), agent),
            AttemptToken::from_ulid(Ulid::new()),
            Utc::now(),
            0,
        )
    }

    #[test]
    fn block_embeds_record_json_verbatim() {
        let state = record("T-42", "a");
        let body = encode_block(&state).unwrap();

        assert!(body.starts_with(BLOCK_MARKER));
        assert!(body.contains(&serde_json::to_string(&state).unwrap()));
        assert_eq!(decode_block("T-42", &body).unwrap(), Some(state));
    }

    #[test]
    fn ordinary_comments_are_not_lease_blocks() {
        assert_eq!(decode_block("T-1", "LGTM, merging").unwrap(), None);
    }

    #[test]
    fn truncated_block_is_corrupt() {
        let body = format!("{BLOCK_MARKER}\n```json\n{{\"taskId\":");
        assert!(matches!(
            decode_block("T-1", &body),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn write_updates_the_existing_block_in_place() {
        let tracker = InMemoryTracker::new();
        tracker.create_comment("T-1", "first!").await.unwrap();
        let store = TrackerStateStore::new(tracker.clone());

        store
            .write(&record("T-1", "a"), Expectation::Any)
            .await
            .unwrap();
        let second = record("T-1", "b");
        store.write(&second, Expectation::Any).await.unwrap();

        let comments = tracker.comments("T-1").await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(store.read(&TaskId::new("T-1")).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn newest_block_wins_when_two_writers_created_one() {
        let tracker = InMemoryTracker::new();
        let store = TrackerStateStore::new(tracker.clone());
        let early = record("T-1", "early");
        let late = record("T-1", "late");

        tracker
            .create_comment("T-1", &encode_block(&early).unwrap())
            .await
            .unwrap();
        tracker
            .create_comment("T-1", &encode_block(&late).unwrap())
            .await
            .unwrap();

        assert_eq!(store.read(&TaskId::new("T-1")).await.unwrap(), Some(late));
    }

    #[tokio::test]
    async fn list_finds_blocks_with_or_without_a_status_label() {
        let tracker = InMemoryTracker::new();
        let store = TrackerStateStore::new(tracker.clone());
        let state = record("T-7", "a");
        let task = state.task_id.clone();

        // the tag write after a claim failed: block present, no label
        store.write(&state, Expectation::Any).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![state.clone()]);

        store
            .set_status_tag(&task, Some(StatusTag::Claimed))
            .await
            .unwrap();
        assert_eq!(store.list().await.unwrap(), vec![state]);

        // a stale label left behind after the block is gone lists nothing
        store.clear(&task, Expectation::Any).await.unwrap();
        assert_eq!(store.read(&task).await.unwrap(), None);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unlabelled_overdue_lease_is_still_swept() {
        use crate::app::{CoordinatorContext, LeaseManager, LeaseSettings, StaleSweeper};
        use crate::impls::MemoryEventSink;
        use crate::ports::{Clock, FixedClock, UlidGenerator};
        use chrono::TimeZone;
        use std::time::Duration;

        let tracker = InMemoryTracker::new();
        let store = TrackerStateStore::new(tracker.clone());
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let state = SharedLeaseState::claimed(
            TaskId::new("T-9"),
            OwnerId::new(InstanceId::new("w1"), "a"),
            AttemptToken::from_ulid(Ulid::new()),
            clock.now(),
            0,
        );
        store.write(&state, Expectation::Any).await.unwrap();
        clock.advance(Duration::from_secs(301));

        let leases = Arc::new(LeaseManager::new(
            Arc::new(store),
            Arc::new(clock.clone()),
            Arc::new(UlidGenerator::new(clock.clone())),
            Arc::new(MemoryEventSink::new()),
            LeaseSettings {
                verify_delay: Duration::ZERO,
                ..LeaseSettings::default()
            },
        ));
        let sweeper = StaleSweeper::new(
            Arc::clone(&leases),
            Arc::new(UlidGenerator::new(clock.clone())),
        );
        let ctx = CoordinatorContext::assume(InstanceId::new("c1"), clock.now());

        let report = sweeper.sweep(&ctx).await.unwrap();

        assert_eq!(report.reclaimed.len(), 1);
        assert_eq!(
            tracker.labels("T-9").await.unwrap(),
            vec!["lease:stale".to_string()]
        );
    }
}
