//! ドメイン識別子（型付き ID）
//!
//! 2 種類ある:
//!
//! - **発行する ID** (`AttemptToken`, `SweepId`): ULID ベースで
//!   [`IdGenerator`](crate::ports::IdGenerator) がローカルに生成する。
//!   phantom marker で型を分けつつ実装は 1 つ。
//! - **外部 ID** (`TaskId`, `InstanceId`, `OwnerId`): backlog、デプロイ、
//!   エージェント実行環境から渡される文字列。こちらでは発行しない。
//!
//! ## ULID
//! - 生成時刻順にソート可能
//! - どのノードでも調整なしに生成できる
//! - 128-bit なので、2 つの worker が同時に発行しても衝突しない

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for minted ID kinds.
///
/// Supplies the prefix used by `Display`/`FromStr` (e.g. `"attempt-"`).
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed ID.
///
/// `T` only exists at compile time; `Id<T>` is exactly as large as a `Ulid`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when a minted ID string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {expected}ID: {input:?}")]
pub struct ParseIdError {
    expected: &'static str,
    input: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIdError {
            expected: T::prefix(),
            input: s.to_string(),
        };
        let raw = s.strip_prefix(T::prefix()).ok_or_else(err)?;
        let ulid = Ulid::from_string(raw).map_err(|_| err())?;
        Ok(Self::from_ulid(ulid))
    }
}

// Persisted records carry IDs as their display form ("attempt-01J..."), so a
// hand-inspected tracker comment reads the same as a log line.
impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attempt {}

impl IdMarker for Attempt {
    fn prefix() -> &'static str {
        "attempt-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sweep {}

impl IdMarker for Sweep {
    fn prefix() -> &'static str {
        "sweep-"
    }
}

/// Unique marker for one claim attempt. A re-claim always mints a new one.
pub type AttemptToken = Id<Attempt>;

/// Identifier of one sweep pass, used to correlate reclaim events.
pub type SweepId = Id<Sweep>;

/// Identifier of a task in the external backlog (e.g. `"T-42"`, an issue number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of one running worker process.
///
/// Ordering is plain lexicographic string order; coordinator election depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Who holds a lease: `"<workerInstanceId>/<agentId>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId {
    instance: InstanceId,
    agent: String,
}

impl OwnerId {
    pub fn new(instance: InstanceId, agent: impl Into<String>) -> Self {
        Self {
            instance,
            agent: agent.into(),
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance, self.agent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("owner id must look like <instance>/<agent>, got {0:?}")]
pub struct ParseOwnerError(String);

impl FromStr for OwnerId {
    type Err = ParseOwnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Agent ids may themselves contain '/', instance ids may not.
        match s.split_once('/') {
            Some((instance, agent)) if !instance.is_empty() && !agent.is_empty() => {
                Ok(Self::new(InstanceId::new(instance), agent))
            }
            _ => Err(ParseOwnerError(s.to_string())),
        }
    }
}

impl TryFrom<String> for OwnerId {
    type Error = ParseOwnerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OwnerId> for String {
    fn from(value: OwnerId) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_display_with_prefix() {
        let token = AttemptToken::from_ulid(Ulid::new());
        let sweep = SweepId::from_ulid(Ulid::new());

        assert!(token.to_string().starts_with("attempt-"));
        assert!(sweep.to_string().starts_with("sweep-"));
    }

    #[test]
    fn minted_ids_parse_back_from_display() {
        let token = AttemptToken::from_ulid(Ulid::new());
        let parsed: AttemptToken = token.to_string().parse().unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn parsing_rejects_wrong_prefix() {
        let sweep = SweepId::from_ulid(Ulid::new());
        let err = sweep.to_string().parse::<AttemptToken>().unwrap_err();
        assert!(err.to_string().contains("attempt-"));
    }

    #[test]
    fn attempt_token_serializes_as_plain_string() {
        let token = AttemptToken::from_ulid(Ulid::new());
        let json = serde_json::to_value(token).unwrap();
        assert_eq!(json, serde_json::Value::String(token.to_string()));

        let back: AttemptToken = serde_json::from_value(json).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<AttemptToken>(), size_of::<Ulid>());
        assert_eq!(size_of::<SweepId>(), 16);
    }

    #[test]
    fn owner_id_splits_on_first_slash() {
        let owner: OwnerId = "host-a/agent/reviewer".parse().unwrap();
        assert_eq!(owner.instance().as_str(), "host-a");
        assert_eq!(owner.agent(), "agent/reviewer");
        assert_eq!(owner.to_string(), "host-a/agent/reviewer");
    }

    #[test]
    fn owner_id_rejects_missing_parts() {
        assert!("no-slash".parse::<OwnerId>().is_err());
        assert!("/agent".parse::<OwnerId>().is_err());
        assert!("host/".parse::<OwnerId>().is_err());
    }

    #[test]
    fn instance_ids_order_lexicographically() {
        let mut ids = vec![
            InstanceId::new("worker-b"),
            InstanceId::new("worker-a"),
            InstanceId::new("worker-10"),
        ];
        ids.sort();
        assert_eq!(ids[0].as_str(), "worker-10");
        assert_eq!(ids[1].as_str(), "worker-a");
    }
}
