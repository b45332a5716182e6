use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use docket_core::impls::InMemoryDocumentStore;
use docket_core::observability::{QueueCounts, init_tracing};
use docket_core::ports::DocumentStore;
use docket_core::{
    DocketError, JobId, JobStorage, MigrationStep, NotificationStrategy, SchemaVersion,
    StepError, StorageOptions,
};

const QUEUES: [&str; 2] = ["critical", "default"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HelloPayload {
    name: String,
    /// 実行前に 1 回だけジョブを返却する
    #[serde(default)]
    flaky: bool,
}

/// ジョブの payload はキューの外に job id をキーにして置く
type Payloads = Arc<Mutex<HashMap<JobId, Vec<u8>>>>;

struct CreateQueueIndex;

#[async_trait]
impl MigrationStep for CreateQueueIndex {
    fn target_version(&self) -> SchemaVersion {
        SchemaVersion::new(1)
    }

    fn sequence(&self) -> u32 {
        1
    }

    fn name(&self) -> &str {
        "create-queue-index"
    }

    async fn execute(&self, _store: &dyn DocumentStore) -> Result<(), StepError> {
        info!("creating index on (queue, fetched_at)");
        Ok(())
    }
}

struct ExpireNotificationLog;

#[async_trait]
impl MigrationStep for ExpireNotificationLog {
    fn target_version(&self) -> SchemaVersion {
        SchemaVersion::new(2)
    }

    fn sequence(&self) -> u32 {
        1
    }

    fn name(&self) -> &str {
        "expire-notification-log"
    }

    async fn execute(&self, _store: &dyn DocumentStore) -> Result<(), StepError> {
        info!("capping the notification log");
        Ok(())
    }
}

/// worker：JobStorage とジョブ処理をつなぐ接着剤
async fn worker_loop(
    worker: usize,
    storage: Arc<JobStorage>,
    payloads: Payloads,
    cancel: CancellationToken,
) {
    let queues: Vec<String> = QUEUES.iter().map(|queue| queue.to_string()).collect();
    loop {
        // 1) ジョブを 1 件 claim する（来るまでブロック）
        let mut job = match storage.dequeue(&queues, &cancel).await {
            Ok(job) => job,
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                warn!(worker, error = %e, "dequeue failed; stopping worker");
                break;
            }
        };

        // 2) payload を引いて処理
        let raw = payloads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&job.job_id())
            .cloned();
        let payload = raw.map(|bytes| serde_json::from_slice::<HelloPayload>(&bytes));

        let finished = match payload {
            Some(Ok(p)) if p.flaky => {
                info!(worker, queue = job.queue(), name = %p.name, "not ready yet; giving the job back");
                let retry = HelloPayload { flaky: false, ..p };
                if let Ok(bytes) = serde_json::to_vec(&retry) {
                    payloads
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(job.job_id(), bytes);
                }
                job.requeue().await
            }
            Some(Ok(p)) => {
                info!(worker, queue = job.queue(), "Hello, {}!", p.name);
                job.remove_from_queue().await
            }
            Some(Err(e)) => {
                warn!(worker, job_id = %job.job_id(), error = %e, "undecodable payload; dropping job");
                job.remove_from_queue().await
            }
            None => {
                warn!(worker, job_id = %job.job_id(), "no payload; dropping job");
                job.remove_from_queue().await
            }
        };
        // 3) 完了できなければ invisibility timeout 後に戻ってくる
        if let Err(e) = finished {
            warn!(worker, error = %e, "could not finish job; it returns after the invisibility timeout");
        }
    }
    info!(worker, "worker stopped");
}

async fn counts(storage: &JobStorage) -> Result<Vec<(&'static str, QueueCounts)>, DocketError> {
    let mut all = Vec::with_capacity(QUEUES.len());
    for queue in QUEUES {
        all.push((queue, storage.queue_counts(queue).await?));
    }
    Ok(all)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    // (A) 設定: DOCKET_OPTIONS（JSON）か、tail 戦略のデモ用デフォルト
    let options = match std::env::var("DOCKET_OPTIONS") {
        Ok(json) => StorageOptions::from_json_str(&json)?,
        Err(_) => StorageOptions::default()
            .with_notification_strategy(NotificationStrategy::Tail)
            .with_queue_poll_interval(Duration::from_secs(1)),
    };

    // (B) ストアと JobStorage を用意（マイグレーションは build() の中で走る）
    let store = Arc::new(
        InMemoryDocumentStore::new().with_log_limits(options.notification_log.into()),
    );
    let storage = Arc::new(
        JobStorage::builder(store)
            .options(options)
            .migration(CreateQueueIndex)
            .migration(ExpireNotificationLog)
            .build()
            .await?,
    );
    info!(
        from = %storage.schema().from,
        to = %storage.schema().to,
        applied = ?storage.schema().applied,
        "schema ready"
    );

    // (C) worker を起動（今回は 2 本）
    let payloads: Payloads = Arc::default();
    let cancel = CancellationToken::new();
    let workers: Vec<_> = (0..2)
        .map(|worker| {
            tokio::spawn(worker_loop(
                worker,
                Arc::clone(&storage),
                Arc::clone(&payloads),
                cancel.clone(),
            ))
        })
        .collect();

    // (D) ジョブ投入（1 件は flaky で 1 回 requeue される）
    let jobs = [
        ("default", "ada", false),
        ("default", "docket", true),
        ("critical", "pager", false),
        ("default", "world", false),
    ];
    for (queue, name, flaky) in jobs {
        let job_id = JobId::generate();
        let payload = HelloPayload {
            name: name.to_string(),
            flaky,
        };
        payloads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(job_id, serde_json::to_vec(&payload)?);
        let entry_id = storage.enqueue(queue, job_id).await?;
        info!(queue, %job_id, %entry_id, "enqueued");
    }

    // (E) 分散ロックの下で排他的なメンテナンス
    storage
        .with_lock("nightly-report", Duration::from_secs(5), || async {
            info!("building report while holding the lock");
            sleep(Duration::from_millis(100)).await;
            Ok(())
        })
        .await?;

    // (F) キューが空になるのをポーリングで待つ
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = counts(&storage).await?;
        if snapshot.iter().all(|(_, c)| c.total() == 0) || Instant::now() >= deadline {
            for (queue, c) in &snapshot {
                println!("{queue}: {}", serde_json::to_string(c)?);
            }
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    // (G) graceful shutdown（worker を止めてからブリッジを止める）
    cancel.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    storage.shutdown().await;
    Ok(())
}
