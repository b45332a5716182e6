//! StorageBuilder - [`JobStorage`] の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: キューを動かす前に [`StorageBuilder::build`] で全部確認する
//!   - オプションの検証
//!   - 通知戦略をストアが提供できるか
//!   - マイグレーションステップの重複
//!   - スキーマを target まで上げる（または拒否）

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::app::backoff::RestartPolicy;
use crate::app::dequeue::DequeueCoordinator;
use crate::app::lease_lock::{DistributedLocks, LockWaiters};
use crate::app::migration::{MigrationCoordinator, MigrationPlan, MigrationStep};
use crate::app::notify::{EventPublisher, NotificationBridge, WakeTargets, check_capabilities};
use crate::app::storage::JobStorage;
use crate::app::wakeup::WakeupRegistry;
use crate::config::StorageOptions;
use crate::domain::SchemaVersion;
use crate::error::DocketError;
use crate::ports::{Clock, DocumentStore, SystemClock};

/// # 使用例
/// ```ignore
/// let storage = JobStorage::builder(store)
///     .options(StorageOptions::default())
///     .migration(CreateIndexes)
///     .target_schema(SchemaVersion::new(2))
///     .build()
///     .await?;
/// ```
pub struct StorageBuilder {
    store: Arc<dyn DocumentStore>,
    options: StorageOptions,
    clock: Arc<dyn Clock>,
    steps: Vec<Arc<dyn MigrationStep>>,
    target_schema: Option<SchemaVersion>,
}

impl StorageBuilder {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            options: StorageOptions::default(),
            clock: Arc::new(SystemClock),
            steps: Vec::new(),
            target_schema: None,
        }
    }

    pub fn options(mut self, options: StorageOptions) -> Self {
        self.options = options;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// マイグレーションステップを登録
    pub fn migration(mut self, step: impl MigrationStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// このコードが扱うスキーマバージョン
    ///
    /// 省略時は登録済みステップの最大バージョン。
    pub fn target_schema(mut self, version: SchemaVersion) -> Self {
        self.target_schema = Some(version);
        self
    }

    pub async fn build(self) -> Result<JobStorage, DocketError> {
        let Self {
            store,
            options,
            clock,
            steps,
            target_schema,
        } = self;

        options.validate()?;
        let strategy = options.notification_strategy;
        check_capabilities(strategy, store.capabilities())?;
        let plan = MigrationPlan::new(steps)?;
        let target = target_schema.unwrap_or_else(|| plan.latest_version());

        let registry = Arc::new(WakeupRegistry::new(options.wakeup_capacity));
        let waiters = Arc::new(LockWaiters::new());
        let publisher = EventPublisher::new(Arc::clone(&store), strategy);

        let locks = DistributedLocks::new(Arc::clone(&store), Arc::clone(&clock), &options)
            .with_waiters(Arc::clone(&waiters))
            .with_publisher(publisher.clone());
        let migrations = MigrationCoordinator::new(
            Arc::clone(&store),
            locks.clone(),
            plan,
            options.migration_strategy,
            options.migration_lock_timeout,
        );
        let schema = migrations.ensure_schema(target).await?;

        let bridge = NotificationBridge::new(
            strategy,
            Arc::clone(&store),
            WakeTargets::new(Arc::clone(&registry), waiters),
        )
        .with_restart_policy(RestartPolicy::new(options.bridge_max_backoff))
        .start()
        .await?;

        let dequeue = DequeueCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&registry),
            &options,
        )
        .with_publisher(publisher.clone());

        info!(
            ?strategy,
            schema = %schema.to,
            migrated = !schema.is_noop(),
            publishes_events = publisher.is_enabled(),
            "job storage ready"
        );
        Ok(JobStorage {
            store,
            options,
            registry,
            locks,
            dequeue,
            migrations,
            publisher,
            bridge: Mutex::new(Some(bridge)),
            schema,
        })
    }
}
