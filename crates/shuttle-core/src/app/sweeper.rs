//! StaleSweeper - 更新の止まった lease の回収
//!
//! その tick の `CoordinatorContext` が coordinator だと言うときだけ動く。
//! sweep 自身は何も claim しない。期限切れの lease を `stale` に移し、
//! 次の `claim` が拾えるようにするだけ。

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::lease_manager::{LeaseManager, ReclaimedLease};
use crate::app::presence::CoordinatorContext;
use crate::domain::{LeaseError, SweepId};
use crate::ports::IdGenerator;

/// 1 回の sweep の結果
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// `None` when the pass was skipped because this instance is not coordinator.
    pub sweep_id: Option<SweepId>,
    pub scanned: usize,
    pub reclaimed: Vec<ReclaimedLease>,
    /// Overdue leases whose stale write kept failing; the next pass retries them.
    pub failed: usize,
}

impl SweepReport {
    pub fn was_skipped(&self) -> bool {
        self.sweep_id.is_none()
    }
}

pub struct StaleSweeper {
    leases: Arc<LeaseManager>,
    ids: Arc<dyn IdGenerator>,
}

impl StaleSweeper {
    pub fn new(leases: Arc<LeaseManager>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { leases, ids }
    }

    pub async fn sweep(&self, ctx: &CoordinatorContext) -> Result<SweepReport, LeaseError> {
        if !ctx.is_coordinator() {
            debug!(
                instance = %ctx.instance_id(),
                coordinator = ?ctx.coordinator().map(|id| id.as_str()),
                "not coordinator, sweep skipped"
            );
            return Ok(SweepReport::default());
        }

        let sweep_id = self.ids.generate_sweep_id();
        let records = self.leases.list_leases().await?;
        let mut report = SweepReport {
            sweep_id: Some(sweep_id),
            scanned: records.len(),
            ..SweepReport::default()
        };

        for record in records.iter().filter(|r| self.leases.is_overdue(r)) {
            match self.leases.mark_stale(record, Some(sweep_id)).await {
                Ok(Some(reclaimed)) => report.reclaimed.push(reclaimed),
                Ok(None) => {}
                Err(err) => {
                    warn!(sweep = %sweep_id, task = %record.task_id, error = %err, "failed to mark lease stale");
                    report.failed += 1;
                }
            }
        }

        if report.reclaimed.is_empty() {
            debug!(sweep = %sweep_id, scanned = report.scanned, "sweep found nothing overdue");
        } else {
            info!(
                sweep = %sweep_id,
                scanned = report.scanned,
                reclaimed = report.reclaimed.len(),
                failed = report.failed,
                "sweep complete"
            );
        }
        Ok(report)
    }
}
