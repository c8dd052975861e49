//! Ports - 調停ロジックと外部世界の境界
//!
//! 各 trait は外部システム（tracker API、ファイルシステム、壁時計）を 1 つずつ隠す。
//! lease の状態機械を in-memory や遅延シミュレーションの代替でテストできる。

pub mod clock;
pub mod collaborators;
pub mod event_sink;
pub mod id_generator;
pub mod issue_tracker;
pub mod presence_store;
pub mod slot_store;
pub mod state_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::collaborators::{Backlog, StaticBacklog, TaskExecutor};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::issue_tracker::{Comment, IssueTracker};
pub use self::presence_store::PresenceStore;
pub use self::slot_store::SlotStore;
pub use self::state_store::{Expectation, StateStore, StoreCapabilities, WriteOutcome};
