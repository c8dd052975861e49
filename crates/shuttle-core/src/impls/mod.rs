//! Impls - ports のアダプタ実装
//!
//! # 含まれるもの
//! - **memory**: アトミックな in-memory ストア（テスト用の基準実装）
//! - **file**: データディレクトリ上の JSON ファイル（プロセス間 CAS なし）
//! - **tracker**: issue コメントに lease レコード + status ラベル
//! - **latency**: 書き込みを遅延・並べ替えするラッパー
//! - **event_sinks**: tracing / in-memory / fan-out のイベント出力

pub mod event_sinks;
pub mod file;
pub mod latency;
pub mod memory;
pub mod tracker;

pub use self::event_sinks::{FanoutEventSink, MemoryEventSink, TracingEventSink};
pub use self::file::{JsonFilePresenceStore, JsonFileSlotStore, JsonFileStateStore};
pub use self::latency::SimulatedLatencyStore;
pub use self::memory::{InMemoryPresenceStore, InMemorySlotStore, InMemoryStateStore};
pub use self::tracker::{InMemoryTracker, TrackerStateStore};
