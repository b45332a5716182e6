//! App 層: ports の上に組み立てた協調ロジック
//!
//! - **WakeupRegistry**: プロセス内のキューごとの wake-up シグナル
//! - **NotificationBridge**: ストアのイベントを wake-up に変換（poll / watch / tail）
//! - **DequeueCoordinator**: claim ループと `FetchedJob` ハンドル
//! - **LeaseLock**: heartbeat 付きの分散ロック
//! - **MigrationCoordinator**: マイグレーション用リースの下でのスキーマ更新
//! - **JobStorage**: ファサード（`StorageBuilder` で組み立てる）

pub mod backoff;
pub mod builder;
pub mod dequeue;
pub mod lease_lock;
pub mod migration;
pub mod notify;
pub mod storage;
pub mod wakeup;

pub use self::backoff::RestartPolicy;
pub use self::builder::StorageBuilder;
pub use self::dequeue::{DequeueCoordinator, FetchedJob};
pub use self::lease_lock::{DistributedLocks, LeaseLock, LockWaiters};
pub use self::migration::{
    MIGRATION_LOCK_RESOURCE, MigrationCoordinator, MigrationPlan, MigrationReport, MigrationStep,
};
pub use self::notify::{BridgeHandle, EventPublisher, NotificationBridge, WakeTargets};
pub use self::storage::JobStorage;
pub use self::wakeup::{WaitOutcome, WakeupError, WakeupRegistry};
