//! DequeueCoordinator - ワーカーがブロックする取得ループ
//!
//! # 実装
//! 1. 優先順にキューを走査し、それぞれアトミックに claim を試す
//! 2. 取れなければ wake-up レジストリで最大 poll 間隔だけブロック
//! 3. シグナルが来たキューで claim。取れなければ 1 に戻る
//!
//! 待つ前に必ず走査するので、wake-up を失っても遅れは poll 間隔 1 回分だけ。
//! キャンセルはストア呼び出しの間でしか見ないため、ストアに届いた claim は
//! 必ず [`FetchedJob`] として返る。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::app::backoff::deadline_after;
use crate::app::notify::EventPublisher;
use crate::app::wakeup::{WaitOutcome, WakeupRegistry};
use crate::config::StorageOptions;
use crate::domain::{EntryId, JobId, QueueEntry};
use crate::error::DocketError;
use crate::ports::{Clock, DocumentStore};

#[derive(Clone)]
pub struct DequeueCoordinator {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<WakeupRegistry>,
    publisher: EventPublisher,
    poll_interval: Duration,
    invisibility_timeout: Option<Duration>,
}

impl DequeueCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        registry: Arc<WakeupRegistry>,
        options: &StorageOptions,
    ) -> Self {
        Self {
            store,
            clock,
            registry,
            publisher: EventPublisher::disabled(),
            poll_interval: options.queue_poll_interval,
            invisibility_timeout: options.invisibility_timeout,
        }
    }

    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    /// `queues` のどれかからジョブを claim するか、`cancel` が発火するまでブロック
    ///
    /// 複数のキューが準備済みなら先頭のキューが勝つ。
    #[instrument(skip(self, cancel))]
    pub async fn dequeue(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Result<FetchedJob, DocketError> {
        if queues.is_empty() {
            return Err(DocketError::invalid_argument(
                "at least one queue must be given to dequeue",
            ));
        }

        loop {
            if cancel.is_cancelled() {
                return Err(DocketError::Cancelled);
            }

            for queue in queues {
                if let Some(job) = self.try_claim(queue).await? {
                    // レジストリの件数が増え続けないように
                    if let Err(e) = self.registry.wait_non_block(queue) {
                        debug!(queue = %queue, error = %e, "could not consume wake-up signal");
                    }
                    return Ok(job);
                }
            }

            match self
                .registry
                .wait_any(queues, cancel, self.poll_interval)
                .await?
            {
                WaitOutcome::Signalled(queue) => {
                    if let Some(job) = self.try_claim(&queue).await? {
                        return Ok(job);
                    }
                    debug!(queue = %queue, "signalled queue was drained by another worker");
                }
                WaitOutcome::TimedOut => {}
                WaitOutcome::Cancelled => return Err(DocketError::Cancelled),
            }
        }
    }

    /// `timeout` 付きの [`dequeue`](Self::dequeue)
    ///
    /// 時間切れは `DequeueTimeout`、`cancel` の発火は `Cancelled` のまま。
    pub async fn dequeue_within(
        &self,
        queues: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<FetchedJob, DocketError> {
        let bounded = cancel.child_token();
        let deadline = deadline_after(timeout);
        let timer = {
            let bounded = bounded.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                bounded.cancel();
            })
        };

        let result = self.dequeue(queues, &bounded).await;
        timer.abort();

        match result {
            Err(DocketError::Cancelled) if !cancel.is_cancelled() => {
                Err(DocketError::DequeueTimeout {
                    queues: queues.to_vec(),
                    waited: timeout,
                })
            }
            other => other,
        }
    }

    async fn try_claim(&self, queue: &str) -> Result<Option<FetchedJob>, DocketError> {
        let now = self.clock.now();
        match self
            .store
            .claim_entry(queue, now, self.invisibility_timeout)
            .await
        {
            Ok(Some(entry)) => {
                debug!(queue, job_id = %entry.job_id, entry_id = %entry.id, "claimed job");
                Ok(Some(FetchedJob::new(
                    entry,
                    now,
                    Arc::clone(&self.store),
                    self.publisher.clone(),
                )))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_transient() => {
                warn!(queue, error = %e, "transient store error while claiming; will retry");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Held,
    Removed,
    Requeued,
}

/// claim 済みのキューエントリ 1 つ
///
/// ジョブが終わったら [`remove_from_queue`](Self::remove_from_queue) で完了させる。
/// それ以外はすべてジョブを返却する:
/// - 明示的な [`requeue`](Self::requeue)
/// - [`dispose`](Self::dispose)
/// - ハンドルの drop（バックグラウンドで requeue を予約）
pub struct FetchedJob {
    entry_id: EntryId,
    job_id: JobId,
    queue: String,
    fetched_at: DateTime<Utc>,
    store: Arc<dyn DocumentStore>,
    publisher: EventPublisher,
    state: HandleState,
}

impl std::fmt::Debug for FetchedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedJob")
            .field("entry_id", &self.entry_id)
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("fetched_at", &self.fetched_at)
            .field("state", &self.state)
            .finish()
    }
}

impl FetchedJob {
    fn new(
        entry: QueueEntry,
        claimed_at: DateTime<Utc>,
        store: Arc<dyn DocumentStore>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            entry_id: entry.id,
            job_id: entry.job_id,
            fetched_at: entry.fetched_at.unwrap_or(claimed_at),
            queue: entry.queue,
            store,
            publisher,
            state: HandleState::Held,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    /// claim 時刻。エントリに触るのはこの値がまだ残っている間だけ
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn is_held(&self) -> bool {
        self.state == HandleState::Held
    }

    /// エントリを削除（ジョブ完了）
    pub async fn remove_from_queue(&mut self) -> Result<(), DocketError> {
        if !self.is_held() {
            return Ok(());
        }
        let deleted = self
            .store
            .delete_entry(self.entry_id, self.fetched_at)
            .await?;
        self.state = HandleState::Removed;
        if deleted {
            debug!(queue = %self.queue, job_id = %self.job_id, "removed job from queue");
        } else {
            warn!(
                queue = %self.queue,
                job_id = %self.job_id,
                "claim expired and was taken over before completion; entry left for its new holder"
            );
        }
        Ok(())
    }

    /// ジョブをキューに返却。2 回目以降は何もしない
    pub async fn requeue(&mut self) -> Result<(), DocketError> {
        if !self.is_held() {
            return Ok(());
        }
        let requeued = self
            .store
            .requeue_entry(self.entry_id, self.fetched_at)
            .await?;
        self.state = HandleState::Requeued;
        if requeued {
            debug!(queue = %self.queue, job_id = %self.job_id, "requeued job");
            self.publisher.job_enqueued(&self.queue).await;
        } else {
            debug!(queue = %self.queue, job_id = %self.job_id, "claim no longer held; nothing to requeue");
        }
        Ok(())
    }

    /// ハンドルを手放す。完了済みでなければ requeue する
    pub async fn dispose(mut self) -> Result<(), DocketError> {
        self.requeue().await
    }
}

impl Drop for FetchedJob {
    fn drop(&mut self) {
        if !self.is_held() {
            return;
        }
        self.state = HandleState::Requeued;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                queue = %self.queue,
                job_id = %self.job_id,
                "fetched job dropped outside a runtime; it returns after the invisibility timeout"
            );
            return;
        };
        let store = Arc::clone(&self.store);
        let publisher = self.publisher.clone();
        let (entry_id, fetched_at) = (self.entry_id, self.fetched_at);
        let queue = std::mem::take(&mut self.queue);
        runtime.spawn(async move {
            match store.requeue_entry(entry_id, fetched_at).await {
                Ok(true) => publisher.job_enqueued(&queue).await,
                Ok(false) => {}
                Err(e) => warn!(queue = %queue, %entry_id, error = %e, "failed to requeue dropped job"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationStrategy;
    use crate::domain::NotificationKind;
    use crate::impls::InMemoryDocumentStore;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;
    use tokio::time::Instant;

    fn names(queues: &[&str]) -> Vec<String> {
        queues.iter().map(|queue| queue.to_string()).collect()
    }

    fn coordinator(
        store: &Arc<InMemoryDocumentStore>,
        clock: Arc<dyn Clock>,
        options: StorageOptions,
    ) -> (DequeueCoordinator, Arc<WakeupRegistry>) {
        let registry = Arc::new(WakeupRegistry::default());
        let coordinator =
            DequeueCoordinator::new(store.clone(), clock, registry.clone(), &options);
        (coordinator, registry)
    }

    fn options() -> StorageOptions {
        StorageOptions::default().with_queue_poll_interval(Duration::from_millis(50))
    }

    async fn enqueue(store: &InMemoryDocumentStore, queue: &str) -> JobId {
        let job_id = JobId::generate();
        store
            .insert_entry(QueueEntry::new(job_id, queue))
            .await
            .unwrap();
        job_id
    }

    #[tokio::test]
    async fn empty_queue_list_is_an_argument_error() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        let err = coordinator
            .dequeue(&[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DocketError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn sweep_honours_queue_priority() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        enqueue(&store, "low").await;
        let high = enqueue(&store, "high").await;

        let job = coordinator
            .dequeue(&names(&["high", "low"]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(job.job_id(), high);
        assert_eq!(job.queue(), "high");
    }

    #[tokio::test]
    async fn unbounded_dequeue_within_claims_normally() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        let job_id = enqueue(&store, "q").await;

        let job = coordinator
            .dequeue_within(&names(&["q"]), Duration::MAX, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(job.job_id(), job_id);
    }

    #[tokio::test]
    async fn sweep_claim_consumes_a_pending_signal() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, registry) = coordinator(&store, Arc::new(SystemClock), options());
        enqueue(&store, "q").await;
        registry.release("q").unwrap();

        let _job = coordinator
            .dequeue(&names(&["q"]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(registry.pending("q"), 0);
    }

    #[tokio::test]
    async fn wake_up_beats_the_poll_interval() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, registry) = coordinator(
            &store,
            Arc::new(SystemClock),
            options().with_queue_poll_interval(Duration::from_secs(30)),
        );

        let worker = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .dequeue(&names(&["q"]), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let job_id = enqueue(&store, "q").await;
        registry.release("q").unwrap();

        let job = tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(job.job_id(), job_id);
    }

    #[tokio::test]
    async fn poll_interval_finds_jobs_without_any_wake_up() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());

        let worker = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .dequeue(&names(&["q"]), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let job_id = enqueue(&store, "q").await;

        let job = tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(job.job_id(), job_id);
    }

    #[tokio::test]
    async fn cancellation_is_not_a_failure_and_claims_nothing() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        let cancel = CancellationToken::new();

        let worker = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { coordinator.dequeue(&names(&["q"]), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = worker.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(store.queue_counts("q").await.unwrap().fetched, 0);
    }

    #[tokio::test]
    async fn bounded_dequeue_times_out() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        let started = Instant::now();
        let err = coordinator
            .dequeue_within(
                &names(&["q"]),
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DocketError::DequeueTimeout { .. }));
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn bounded_dequeue_reports_outer_cancellation() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = coordinator
            .dequeue_within(&names(&["q"]), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_never_share_a_job() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        let mut enqueued = HashSet::new();
        for _ in 0..40 {
            enqueued.insert(enqueue(&store, "q").await);
        }

        let mut workers = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            workers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    match coordinator
                        .dequeue_within(
                            &names(&["q"]),
                            Duration::from_millis(150),
                            &CancellationToken::new(),
                        )
                        .await
                    {
                        Ok(mut job) => {
                            seen.push(job.job_id());
                            job.remove_from_queue().await.unwrap();
                        }
                        Err(DocketError::DequeueTimeout { .. }) => return seen,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            }));
        }

        let mut fetched = Vec::new();
        for worker in workers {
            fetched.extend(worker.await.unwrap());
        }
        let unique: HashSet<_> = fetched.iter().copied().collect();
        assert_eq!(fetched.len(), 40);
        assert_eq!(unique, enqueued);
    }

    #[tokio::test]
    async fn abandoned_claim_is_reclaimed_after_invisibility_timeout() {
        let store = InMemoryDocumentStore::arc();
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let options = options().with_invisibility_timeout(Some(Duration::from_secs(1)));
        let (first, _) = coordinator(&store, clock.clone(), options.clone());
        let (second, _) = coordinator(&store, clock.clone(), options);
        let job_id = enqueue(&store, "q").await;

        let abandoned = first
            .dequeue(&names(&["q"]), &CancellationToken::new())
            .await
            .unwrap();

        clock.advance(ChronoDuration::seconds(2));
        let mut reclaimed = second
            .dequeue_within(&names(&["q"]), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reclaimed.job_id(), job_id);

        // 古い保持者は奪われた claim を完了も requeue もできない
        let mut abandoned = abandoned;
        abandoned.remove_from_queue().await.unwrap();
        assert!(store.entry(reclaimed.entry_id()).await.is_some());

        reclaimed.remove_from_queue().await.unwrap();
        assert!(store.entry(reclaimed.entry_id()).await.is_none());
    }

    #[tokio::test]
    async fn without_invisibility_timeout_claims_are_never_stolen() {
        let store = InMemoryDocumentStore::arc();
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let options = options().with_invisibility_timeout(None);
        let (coordinator, _) = coordinator(&store, clock.clone(), options);
        enqueue(&store, "q").await;

        let mut held = coordinator
            .dequeue(&names(&["q"]), &CancellationToken::new())
            .await
            .unwrap();
        clock.advance(ChronoDuration::days(7));
        let err = coordinator
            .dequeue_within(&names(&["q"]), Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        held.remove_from_queue().await.unwrap();
    }

    #[tokio::test]
    async fn requeue_is_idempotent_and_restores_the_entry() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        enqueue(&store, "q").await;

        let mut job = coordinator
            .dequeue(&names(&["q"]), &CancellationToken::new())
            .await
            .unwrap();
        job.requeue().await.unwrap();
        job.requeue().await.unwrap();
        assert!(!job.is_held());

        let entry = store.entry(job.entry_id()).await.unwrap();
        assert_eq!(entry.fetched_at, None);

        // 完了済みのハンドルはもうエントリを削除できない
        job.remove_from_queue().await.unwrap();
        assert!(store.entry(job.entry_id()).await.is_some());
    }

    #[tokio::test]
    async fn dispose_requeues_unfinished_jobs() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        enqueue(&store, "q").await;

        let job = coordinator
            .dequeue(&names(&["q"]), &CancellationToken::new())
            .await
            .unwrap();
        let entry_id = job.entry_id();
        job.dispose().await.unwrap();
        assert_eq!(store.entry(entry_id).await.unwrap().fetched_at, None);
    }

    #[tokio::test]
    async fn dispose_after_completion_is_a_no_op() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        enqueue(&store, "q").await;

        let mut job = coordinator
            .dequeue(&names(&["q"]), &CancellationToken::new())
            .await
            .unwrap();
        let entry_id = job.entry_id();
        job.remove_from_queue().await.unwrap();
        job.dispose().await.unwrap();
        assert!(store.entry(entry_id).await.is_none());
    }

    #[tokio::test]
    async fn dropped_handle_requeues_in_the_background() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        let job_id = enqueue(&store, "q").await;

        let job = coordinator
            .dequeue(&names(&["q"]), &CancellationToken::new())
            .await
            .unwrap();
        drop(job);

        let again = coordinator
            .dequeue_within(&names(&["q"]), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.job_id(), job_id);
    }

    #[tokio::test]
    async fn requeue_publishes_under_tail() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        let coordinator = coordinator
            .with_publisher(EventPublisher::new(store.clone(), NotificationStrategy::Tail));
        enqueue(&store, "q").await;

        let mut job = coordinator
            .dequeue(&names(&["q"]), &CancellationToken::new())
            .await
            .unwrap();
        job.requeue().await.unwrap();

        let events = store.notifications().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, NotificationKind::JobEnqueued);
        assert_eq!(events[0].payload, "q");
    }

    #[tokio::test]
    async fn transient_claim_errors_are_retried() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        let job_id = enqueue(&store, "q").await;
        store.inject_transient_failures(2);

        let job = coordinator
            .dequeue_within(&names(&["q"]), Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(job.job_id(), job_id);
    }

    #[tokio::test]
    async fn fatal_store_errors_propagate() {
        let store = InMemoryDocumentStore::arc();
        let (coordinator, _) = coordinator(&store, Arc::new(SystemClock), options());
        store.close();
        let err = coordinator
            .dequeue(&names(&["q"]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DocketError::Store(_)));
    }
}
