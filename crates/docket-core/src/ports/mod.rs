//! Ports - 協調レイヤーの外側との境界
//!
//! - `DocumentStore`: 共有ストア（キューエントリ、リース、スキーマバージョン、ライブ通知）
//! - `Clock`: ストアに書き込むタイムスタンプの時刻源

pub mod clock;
pub mod document_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::document_store::{
    ChangeStream, DocumentStore, EntryInserted, StoreCapabilities, TailCursor,
};
