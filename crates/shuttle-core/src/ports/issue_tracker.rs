//! IssueTracker port - the minimal surface of an external issue tracker.
//!
//! Only what the tracker-backed state store needs: labels and comments on an
//! issue, plus label and comment search. Transport, auth and pagination belong to the
//! concrete client.

use async_trait::async_trait;

use crate::domain::StoreError;

/// One comment on an issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub body: String,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn labels(&self, issue: &str) -> Result<Vec<String>, StoreError>;

    async fn set_labels(&self, issue: &str, labels: &[String]) -> Result<(), StoreError>;

    async fn comments(&self, issue: &str) -> Result<Vec<Comment>, StoreError>;

    /// Returns the new comment's id.
    async fn create_comment(&self, issue: &str, body: &str) -> Result<String, StoreError>;

    async fn update_comment(
        &self,
        issue: &str,
        comment_id: &str,
        body: &str,
    ) -> Result<(), StoreError>;

    async fn delete_comment(&self, issue: &str, comment_id: &str) -> Result<(), StoreError>;

    /// Issues carrying at least one label that starts with `prefix`.
    async fn issues_with_label_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Issues with at least one comment whose body contains `needle`.
    async fn issues_with_comment_containing(
        &self,
        needle: &str,
    ) -> Result<Vec<String>, StoreError>;
}
