//! App - ports を組み合わせた調停ロジック
//!
//! # 構成要素
//! - **NodeBuilder**: 1 インスタンス分の組み立てと検証
//! - **LeaseManager**: claim / renew / release とオペレータ操作
//! - **PresenceRegistry**: heartbeat と coordinator 選出
//! - **StaleSweeper**: coordinator だけが行う期限切れ lease の回収
//! - **WorkspaceAllocator**: ホストごとの workspace slot プール
//! - **Worker**: claim → 作業 → heartbeat → release
//! - **BackgroundLoops**: presence / sweep / slot prune のループ

pub mod allocator;
pub mod backoff;
pub mod builder;
pub mod lease_manager;
pub mod loops;
pub mod presence;
pub mod status;
pub mod sweeper;
pub mod worker;

pub use self::allocator::WorkspaceAllocator;
pub use self::backoff::{BackoffPolicy, RetriesExhausted};
pub use self::builder::{BuildError, Node, NodeBuilder};
pub use self::lease_manager::{LeaseInspection, LeaseManager, LeaseSettings, ReclaimedLease};
pub use self::loops::{BackgroundLoops, heartbeat_assignment, wait_for_shutdown};
pub use self::presence::{CoordinatorContext, PresenceRegistry, select_coordinator};
pub use self::status::LeaseCounts;
pub use self::sweeper::{StaleSweeper, SweepReport};
pub use self::worker::{Assignment, AssignmentOutcome, Worker, WorkerError, WorkerSummary};
