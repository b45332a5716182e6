//! docket-core
//!
//! 共有ドキュメントストア上のジョブストレージ協調レイヤー。
//! 複数のワーカープロセスが名前付きキューからジョブを取り出し、
//! 終わらなかったジョブは返却し、分散ロックを順番に取り、
//! スキーマ更新を 1 プロセスだけで実行する。
//!
//! # モジュール構成
//! - **domain**: レコードと ID（QueueEntry, LeaseDocument, NotificationEvent, SchemaVersion）
//! - **ports**: 抽象化レイヤー（DocumentStore, ChangeStream, TailCursor, Clock）
//! - **app**: wake-up, 通知ブリッジ, dequeue, リース, マイグレーション, JobStorage
//! - **impls**: 実装（InMemoryDocumentStore）
//! - **config**: StorageOptions
//! - **error**: DocketError
//! - **observability**: tracing の初期化とキュー件数

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;

pub use crate::app::{FetchedJob, JobStorage, LeaseLock, MigrationStep, StorageBuilder};
pub use crate::config::{MigrationStrategy, NotificationStrategy, StorageOptions};
pub use crate::domain::{EntryId, JobId, SchemaVersion};
pub use crate::error::{DocketError, StepError};
