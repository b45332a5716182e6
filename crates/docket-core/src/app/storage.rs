//! JobStorage - ジョブプロセッサが話しかける窓口
//!
//! プロセス（またはテスト）ごとに 1 インスタンス。協調に使うものはすべて
//! インスタンス自身が持つ（wake-up レジストリ、ローカルのロック待機、ブリッジのタスク）。
//! グローバルな singleton はないので、1 プロセスに複数の独立したインスタンスを置ける。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::builder::StorageBuilder;
use crate::app::dequeue::{DequeueCoordinator, FetchedJob};
use crate::app::lease_lock::{DistributedLocks, LeaseLock};
use crate::app::migration::{MigrationCoordinator, MigrationReport};
use crate::app::notify::{BridgeHandle, EventPublisher};
use crate::app::wakeup::WakeupRegistry;
use crate::config::StorageOptions;
use crate::domain::{EntryId, JobId, QueueEntry, SchemaVersion};
use crate::error::DocketError;
use crate::observability::QueueCounts;
use crate::ports::DocumentStore;

pub struct JobStorage {
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) options: StorageOptions,
    pub(crate) registry: Arc<WakeupRegistry>,
    pub(crate) locks: DistributedLocks,
    pub(crate) dequeue: DequeueCoordinator,
    pub(crate) migrations: MigrationCoordinator,
    pub(crate) publisher: EventPublisher,
    pub(crate) bridge: Mutex<Option<BridgeHandle>>,
    pub(crate) schema: MigrationReport,
}

impl JobStorage {
    pub fn builder(store: Arc<dyn DocumentStore>) -> StorageBuilder {
        StorageBuilder::new(store)
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// 起動時にスキーマに対して行ったこと
    pub fn schema(&self) -> &MigrationReport {
        &self.schema
    }

    pub fn registry(&self) -> &Arc<WakeupRegistry> {
        &self.registry
    }

    pub fn locks(&self) -> &DistributedLocks {
        &self.locks
    }

    /// `job_id` を `queue` に積む
    pub async fn enqueue(&self, queue: &str, job_id: JobId) -> Result<EntryId, DocketError> {
        if queue.is_empty() {
            return Err(DocketError::invalid_argument("queue name must not be empty"));
        }
        let entry = QueueEntry::new(job_id, queue);
        let entry_id = entry.id;
        self.store.insert_entry(entry).await?;
        self.publisher.job_enqueued(queue).await;
        debug!(queue, %job_id, %entry_id, "enqueued job");
        Ok(entry_id)
    }

    /// `queues`（優先順）からジョブを claim するか、`cancel` が発火するまでブロック
    pub async fn dequeue(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Result<FetchedJob, DocketError> {
        self.dequeue.dequeue(queues, cancel).await
    }

    pub async fn dequeue_within(
        &self,
        queues: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<FetchedJob, DocketError> {
        self.dequeue.dequeue_within(queues, timeout, cancel).await
    }

    pub async fn acquire_distributed_lock(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<LeaseLock, DocketError> {
        self.locks.acquire(resource, timeout).await
    }

    /// `resource` のリースの下で `work` を実行（どの経路でも解放する）
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource: &str,
        timeout: Duration,
        work: F,
    ) -> Result<T, DocketError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, DocketError>>,
    {
        self.locks.with_lock(resource, timeout, work).await
    }

    /// ストアを `target` まで上げる
    ///
    /// [`StorageBuilder::build`] で 1 回実行済み。最新なら再呼び出しは安い。
    pub async fn ensure_schema(
        &self,
        target: SchemaVersion,
    ) -> Result<MigrationReport, DocketError> {
        self.migrations.ensure_schema(target).await
    }

    pub async fn queue_counts(&self, queue: &str) -> Result<QueueCounts, DocketError> {
        Ok(self.store.queue_counts(queue).await?)
    }

    /// ブリッジを止め、wake-up レジストリを破棄する
    ///
    /// このインスタンスでブロック中の dequeue は `Wakeup(Closed)` で失敗する。
    /// 2 回目以降は何もしない。
    pub async fn shutdown(&self) {
        if self.registry.is_closed() {
            return;
        }
        if let Some(bridge) = self.bridge.lock().await.take() {
            bridge.shutdown().await;
        }
        self.registry.close();
        info!("job storage shut down");
    }

    pub async fn is_bridge_running(&self) -> bool {
        self.bridge
            .lock()
            .await
            .as_ref()
            .is_some_and(BridgeHandle::is_running)
    }
}
