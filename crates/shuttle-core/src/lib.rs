//! shuttle-core
//!
//! タスク backlog を共有するエージェント群のための lease / claim 調停。
//!
//! # モジュール構成
//! - **domain**: ID、lease / presence / slot レコード、イベント、エラー
//! - **ports**: ストレージ、時計、ID、イベントの抽象
//! - **impls**: in-memory / JSON ファイル / issue tracker / 遅延シミュレーションのアダプタ
//! - **app**: lease manager、sweeper、presence、allocator、worker、各ループ
//! - **config**: TOML + 環境変数による設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
