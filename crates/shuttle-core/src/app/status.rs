use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{LeaseStatus, SharedLeaseState, should_retry};

/// Lease records bucketed by what an operator would do about them.
///
/// `overdue` holds claimed/working leases past the stale threshold that no
/// sweep has reached yet; they are not counted under `claimed`/`working`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseCounts {
    pub claimed: usize,
    pub working: usize,
    pub overdue: usize,
    pub stale: usize,
    pub needs_attention: usize,
    pub ignored: usize,
}

impl LeaseCounts {
    pub fn from_records(
        records: &[SharedLeaseState],
        now: DateTime<Utc>,
        stale_threshold: Duration,
        max_retries: u32,
    ) -> Self {
        let mut counts = Self::default();
        for record in records {
            match record.status {
                _ if record.is_overdue(now, stale_threshold) => counts.overdue += 1,
                LeaseStatus::Claimed => counts.claimed += 1,
                LeaseStatus::Working => counts.working += 1,
                LeaseStatus::Stale if !should_retry(record.retry_count, max_retries) => {
                    counts.needs_attention += 1
                }
                LeaseStatus::Stale => counts.stale += 1,
                LeaseStatus::Ignored => counts.ignored += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.claimed + self.working + self.overdue + self.stale + self.needs_attention + self.ignored
    }
}
