//! Port の実装
//!
//! - **InMemoryDocumentStore**: 1 プロセス内で完結するストア。
//!   change stream と上限付きの通知ログを持つ。テストとデモで使う。
//!
//! データベースを使うストアは別 crate で `ports::DocumentStore` を実装する。

pub mod inmem_store;

pub use self::inmem_store::{InMemoryDocumentStore, NotificationLogLimits};
