//! NotificationBridge - ストアのイベントをローカルの wake-up に変換
//!
//! # 戦略
//! - **Poll**: バックグラウンドタスクなし。dequeue ループは backstop に頼る
//! - **Watch**: キューエントリ insert の change stream
//! - **Tail**: 上限付き通知ログのカーソル（ロック解放も運ぶ）
//!
//! # 学習ポイント
//! - Watch と Tail はストレージインスタンスごとに 1 つの監視付きタスクで動く（[`supervisor`]）
//! - ストアが提供できない戦略は、何も spawn する前に [`NotificationBridge::start`] で弾く

pub mod publisher;
mod supervisor;
mod tail;
mod watch;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app::backoff::RestartPolicy;
use crate::app::lease_lock::LockWaiters;
use crate::app::wakeup::{WakeupError, WakeupRegistry};
use crate::config::NotificationStrategy;
use crate::domain::StoreError;
use crate::error::DocketError;
use crate::ports::{DocumentStore, StoreCapabilities};

pub use self::publisher::EventPublisher;
pub use self::tail::TailSource;
pub use self::watch::WatchSource;

/// ライブフィードの 1 回分の実行（開いてから終わるまで）
#[async_trait]
pub trait NotificationSource: Send {
    fn name(&self) -> &'static str;

    /// フィードが正常に終わったか `cancel` が発火したら `Ok(())`（supervisor が開き直す）
    ///
    /// エラーは [`StoreError::is_fatal`] で分類される。
    async fn run_once(&mut self, cancel: &CancellationToken) -> Result<(), StoreError>;
}

/// ブリッジのイベントの届け先
#[derive(Clone)]
pub struct WakeTargets {
    registry: Arc<WakeupRegistry>,
    waiters: Arc<LockWaiters>,
}

impl WakeTargets {
    pub fn new(registry: Arc<WakeupRegistry>, waiters: Arc<LockWaiters>) -> Self {
        Self { registry, waiters }
    }

    pub fn job_enqueued(&self, queue: &str) {
        match self.registry.release(queue) {
            Ok(()) => {}
            Err(WakeupError::Overflow { queue, capacity }) => {
                error!(queue = %queue, capacity, "wake-up signal overflow; dropping notification");
            }
            // ブリッジが読み切る前に破棄された
            Err(WakeupError::Closed) => {}
        }
    }

    pub fn lock_released(&self, resource: &str) {
        self.waiters.notify(resource);
    }
}

/// `strategy` に必要な機能が `capabilities` になければ即座に失敗
pub fn check_capabilities(
    strategy: NotificationStrategy,
    capabilities: StoreCapabilities,
) -> Result<(), DocketError> {
    match strategy {
        NotificationStrategy::Poll => Ok(()),
        NotificationStrategy::Watch if !capabilities.change_streams => {
            Err(DocketError::configuration(
                "the watch notification strategy needs change streams, which this store \
                 topology does not support; use `tail` or `poll`",
            ))
        }
        NotificationStrategy::Tail if !capabilities.tailable_log => {
            Err(DocketError::configuration(
                "the tail notification strategy needs a tailable notification log, which \
                 this store does not support; use `watch` or `poll`",
            ))
        }
        NotificationStrategy::Watch | NotificationStrategy::Tail => Ok(()),
    }
}

pub struct NotificationBridge {
    strategy: NotificationStrategy,
    store: Arc<dyn DocumentStore>,
    targets: WakeTargets,
    policy: RestartPolicy,
}

impl NotificationBridge {
    pub fn new(
        strategy: NotificationStrategy,
        store: Arc<dyn DocumentStore>,
        targets: WakeTargets,
    ) -> Self {
        Self {
            strategy,
            store,
            targets,
            policy: RestartPolicy::default(),
        }
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 互換性を確認してバックグラウンドタスクを spawn（Poll ではしない）
    pub async fn start(self) -> Result<BridgeHandle, DocketError> {
        check_capabilities(self.strategy, self.store.capabilities())?;

        let source: Box<dyn NotificationSource> = match self.strategy {
            NotificationStrategy::Poll => {
                info!("notification bridge disabled; relying on queue polling");
                return Ok(BridgeHandle::idle(self.strategy));
            }
            NotificationStrategy::Watch => Box::new(WatchSource::new(self.store, self.targets)),
            NotificationStrategy::Tail => {
                Box::new(TailSource::bootstrap(self.store, self.targets).await?)
            }
        };

        info!(strategy = source.name(), "notification bridge started");
        Ok(BridgeHandle::spawn(self.strategy, source, self.policy))
    }
}

/// ブリッジのタスクを所有する
///
/// ハンドルを drop するとタスクをキャンセルする（終了は待たない）。
pub struct BridgeHandle {
    strategy: NotificationStrategy,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    fn idle(strategy: NotificationStrategy) -> Self {
        Self {
            strategy,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    fn spawn(
        strategy: NotificationStrategy,
        source: Box<dyn NotificationSource>,
        policy: RestartPolicy,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor::supervise(source, policy, cancel.clone()));
        Self {
            strategy,
            cancel,
            task: Some(task),
        }
    }

    pub fn strategy(&self) -> NotificationStrategy {
        self.strategy
    }

    /// バックグラウンドタスクがまだイベントを届けているか
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// タスクを止めて終了を待つ
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
