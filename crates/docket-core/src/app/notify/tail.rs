use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{NotificationSource, WakeTargets};
use crate::domain::{NotificationId, NotificationKind, StoreError};
use crate::ports::DocumentStore;

/// 自分専用の位置から通知ログを tail する
///
/// # 実装
/// - 位置は新しく upsert した sentinel から始まる（起動前のイベントは再生しない）
/// - イベントを読むたびに位置を進める
/// - カーソルが終了したら、最後に見たイベントの直後から開き直す
pub struct TailSource {
    store: Arc<dyn DocumentStore>,
    targets: WakeTargets,
    position: NotificationId,
}

impl TailSource {
    pub async fn bootstrap(
        store: Arc<dyn DocumentStore>,
        targets: WakeTargets,
    ) -> Result<Self, StoreError> {
        let position = store.upsert_notification_sentinel().await?;
        debug!(%position, "tailing notification log");
        Ok(Self {
            store,
            targets,
            position,
        })
    }

    pub fn position(&self) -> NotificationId {
        self.position
    }
}

#[async_trait]
impl NotificationSource for TailSource {
    fn name(&self) -> &'static str {
        "tail"
    }

    async fn run_once(&mut self, cancel: &CancellationToken) -> Result<(), StoreError> {
        let mut cursor = self.store.tail_notifications(self.position).await?;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = cursor.next() => next?,
            };
            let Some(event) = next else {
                return Ok(());
            };
            self.position = event.id;
            trace!(kind = ?event.kind, payload = %event.payload, "notification");
            match event.kind {
                NotificationKind::JobEnqueued => self.targets.job_enqueued(&event.payload),
                NotificationKind::LockReleased => self.targets.lock_released(&event.payload),
                NotificationKind::Sentinel => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::lease_lock::LockWaiters;
    use crate::app::wakeup::WakeupRegistry;
    use crate::impls::{InMemoryDocumentStore, NotificationLogLimits};
    use std::time::Duration;

    fn short_lived_store() -> Arc<InMemoryDocumentStore> {
        Arc::new(
            InMemoryDocumentStore::new().with_log_limits(NotificationLogLimits {
                cursor_await: Duration::from_millis(30),
                ..Default::default()
            }),
        )
    }

    #[tokio::test]
    async fn events_before_bootstrap_are_not_replayed() {
        let store = short_lived_store();
        store
            .append_notification(NotificationKind::JobEnqueued, "old")
            .await
            .unwrap();

        let registry = Arc::new(WakeupRegistry::default());
        let targets = WakeTargets::new(registry.clone(), Arc::new(LockWaiters::new()));
        let mut source = TailSource::bootstrap(store.clone(), targets).await.unwrap();

        store
            .append_notification(NotificationKind::JobEnqueued, "new")
            .await
            .unwrap();
        // 読み切った後、待機時間を過ぎるとカーソルは終了する
        source.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(registry.pending("old"), 0);
        assert_eq!(registry.pending("new"), 1);
    }

    #[tokio::test]
    async fn reopened_cursor_resumes_after_last_event() {
        let store = short_lived_store();
        let registry = Arc::new(WakeupRegistry::default());
        let targets = WakeTargets::new(registry.clone(), Arc::new(LockWaiters::new()));
        let mut source = TailSource::bootstrap(store.clone(), targets).await.unwrap();
        let cancel = CancellationToken::new();

        store
            .append_notification(NotificationKind::JobEnqueued, "q")
            .await
            .unwrap();
        source.run_once(&cancel).await.unwrap();
        let after_first = source.position();

        store
            .append_notification(NotificationKind::JobEnqueued, "q")
            .await
            .unwrap();
        source.run_once(&cancel).await.unwrap();

        assert!(source.position() > after_first);
        assert_eq!(registry.pending("q"), 2);
    }

    #[tokio::test]
    async fn lock_released_wakes_lock_waiters() {
        let store = short_lived_store();
        let waiters = Arc::new(LockWaiters::new());
        let targets = WakeTargets::new(Arc::new(WakeupRegistry::default()), waiters.clone());
        let mut source = TailSource::bootstrap(store.clone(), targets).await.unwrap();

        let notify = waiters.notifier("res");
        let woken = notify.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();

        store
            .append_notification(NotificationKind::LockReleased, "res")
            .await
            .unwrap();
        source.run_once(&CancellationToken::new()).await.unwrap();

        tokio::time::timeout(Duration::from_millis(100), woken)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bootstrap_surfaces_store_errors() {
        let store = short_lived_store();
        store.close();
        let targets = WakeTargets::new(
            Arc::new(WakeupRegistry::default()),
            Arc::new(LockWaiters::new()),
        );
        let result = TailSource::bootstrap(store, targets).await;
        assert!(matches!(result, Err(StoreError::Closed)));
    }
}
