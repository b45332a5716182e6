use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{NotificationSource, WakeTargets};
use crate::domain::StoreError;
use crate::ports::DocumentStore;

/// change stream で見た insert ごとに、そのキューを release する
pub struct WatchSource {
    store: Arc<dyn DocumentStore>,
    targets: WakeTargets,
}

impl WatchSource {
    pub fn new(store: Arc<dyn DocumentStore>, targets: WakeTargets) -> Self {
        Self { store, targets }
    }
}

#[async_trait]
impl NotificationSource for WatchSource {
    fn name(&self) -> &'static str {
        "watch"
    }

    async fn run_once(&mut self, cancel: &CancellationToken) -> Result<(), StoreError> {
        let mut stream = self.store.watch_entry_inserts().await?;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = stream.next() => next?,
            };
            let Some(inserted) = next else {
                return Ok(());
            };
            trace!(queue = %inserted.queue, entry_id = %inserted.entry_id, "entry inserted");
            self.targets.job_enqueued(&inserted.queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::lease_lock::LockWaiters;
    use crate::app::notify::NotificationBridge;
    use crate::app::wakeup::{WaitOutcome, WakeupRegistry};
    use crate::config::NotificationStrategy;
    use crate::domain::{JobId, QueueEntry};
    use crate::impls::InMemoryDocumentStore;
    use std::time::Duration;

    #[tokio::test]
    async fn inserts_release_their_queue() {
        let store = InMemoryDocumentStore::arc();
        let registry = Arc::new(WakeupRegistry::default());
        let targets = WakeTargets::new(registry.clone(), Arc::new(LockWaiters::new()));
        let bridge = NotificationBridge::new(NotificationStrategy::Watch, store.clone(), targets)
            .start()
            .await
            .unwrap();
        // タスクの購読を待つ
        tokio::time::sleep(Duration::from_millis(20)).await;

        store
            .insert_entry(QueueEntry::new(JobId::generate(), "mail"))
            .await
            .unwrap();

        let outcome = registry
            .wait_any(
                &["mail".to_string()],
                &CancellationToken::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Signalled("mail".into()));
        bridge.shutdown().await;
    }
}
