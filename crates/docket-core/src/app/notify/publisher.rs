//! EventPublisher - JobEnqueued / LockReleased を通知ログに書き、
//! 他プロセスの tail ブリッジを起こす

use std::sync::Arc;

use tracing::warn;

use crate::config::NotificationStrategy;
use crate::domain::NotificationKind;
use crate::ports::DocumentStore;

/// tail 戦略の時だけ有効。それ以外ではすべての呼び出しが何もしない
///
/// 書き込みはベストエフォート。通知を失っても遅延が増えるだけなので、
/// 失敗はログに残して握りつぶす。
#[derive(Clone, Default)]
pub struct EventPublisher {
    store: Option<Arc<dyn DocumentStore>>,
}

impl EventPublisher {
    pub fn new(store: Arc<dyn DocumentStore>, strategy: NotificationStrategy) -> Self {
        match strategy {
            NotificationStrategy::Tail => Self { store: Some(store) },
            NotificationStrategy::Poll | NotificationStrategy::Watch => Self::disabled(),
        }
    }

    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub async fn job_enqueued(&self, queue: &str) {
        self.publish(NotificationKind::JobEnqueued, queue).await;
    }

    pub async fn lock_released(&self, resource: &str) {
        self.publish(NotificationKind::LockReleased, resource).await;
    }

    async fn publish(&self, kind: NotificationKind, payload: &str) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.append_notification(kind, payload).await {
            warn!(?kind, payload, error = %e, "failed to publish notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryDocumentStore;

    #[tokio::test]
    async fn only_tail_strategy_publishes() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let watch = EventPublisher::new(store.clone(), NotificationStrategy::Watch);
        let tail = EventPublisher::new(store.clone(), NotificationStrategy::Tail);
        assert!(!watch.is_enabled());

        watch.job_enqueued("default").await;
        tail.job_enqueued("critical").await;
        tail.lock_released("migration").await;

        let events = store.notifications().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, NotificationKind::JobEnqueued);
        assert_eq!(events[0].payload, "critical");
        assert_eq!(events[1].kind, NotificationKind::LockReleased);
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.inject_transient_failures(1);
        let tail = EventPublisher::new(store.clone(), NotificationStrategy::Tail);
        tail.job_enqueued("default").await;
        assert!(store.notifications().await.is_empty());
    }
}
