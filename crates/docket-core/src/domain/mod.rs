//! ドメインモデル: ID、レコード、エラー分類

pub mod entry;
pub mod errors;
pub mod ids;
pub mod lease;
pub mod notification;
pub mod schema;

pub use self::entry::QueueEntry;
pub use self::errors::{ErrorKind, StoreError};
pub use self::ids::{EntryId, HolderId, Id, IdMarker, JobId, NotificationId};
pub use self::lease::LeaseDocument;
pub use self::notification::{NotificationEvent, NotificationKind};
pub use self::schema::SchemaVersion;
