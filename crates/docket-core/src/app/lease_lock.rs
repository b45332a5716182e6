//! LeaseLock - 1 つのリースドキュメントによる分散排他制御
//!
//! # 学習ポイント
//! - ドキュメントの有無と期限だけを信じる（プロセス内の状態は信じない）
//! - heartbeat をリース自身の `CancellationToken` に結びつけた周期タスクにする
//! - RAII: 明示的な `release` が本筋で、`Drop` は最後の手段
//!
//! # 取得ループ
//! 1. リソースのリースが期限切れなら削除（クラッシュからの回収）
//! 2. 新しい holder id でリースを挿入（存在しない時だけ）
//! 3. 競合したらローカルの release かリトライ間隔を待って再試行
//!
//! 保持中は heartbeat がリース寿命の 1/3 ごとに `expire_at` を延長する。
//! release の順序: heartbeat を止める → リースを削除 → 期限切れリースを掃除。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::app::backoff::deadline_after;
use crate::app::notify::EventPublisher;
use crate::config::StorageOptions;
use crate::domain::{HolderId, StoreError};
use crate::error::DocketError;
use crate::ports::{Clock, DocumentStore};

const HEARTBEAT_STOP_WAIT: Duration = Duration::from_secs(1);

/// このプロセスで待っている取得者へのリソースごとの wake-up
///
/// ローカルの release と tail ブリッジの LockReleased イベントで通知される。
/// 待機側はリトライ間隔を待たずにすぐ再試行できる。
#[derive(Default)]
pub struct LockWaiters {
    by_resource: Mutex<HashMap<String, Arc<Notify>>>,
}

impl LockWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn notifier(&self, resource: &str) -> Arc<Notify> {
        let mut map = self
            .by_resource
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(map.entry(resource.to_string()).or_default())
    }

    /// `resource` を待っているローカルの取得者をすべて起こす
    pub fn notify(&self, resource: &str) {
        let map = self
            .by_resource
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(notify) = map.get(resource) {
            notify.notify_waiters();
        }
    }
}

fn expiry(now: DateTime<Utc>, lifetime: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(lifetime)
        .ok()
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// [`LeaseLock`] を発行する
#[derive(Clone)]
pub struct DistributedLocks {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    waiters: Arc<LockWaiters>,
    publisher: EventPublisher,
    lifetime: Duration,
    heartbeat_interval: Duration,
    retry_interval: Duration,
}

impl DistributedLocks {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        options: &StorageOptions,
    ) -> Self {
        Self {
            store,
            clock,
            waiters: Arc::new(LockWaiters::new()),
            publisher: EventPublisher::disabled(),
            lifetime: options.lease_lifetime(),
            heartbeat_interval: options.heartbeat_interval(),
            retry_interval: options.lock_retry_interval,
        }
    }

    pub fn with_waiters(mut self, waiters: Arc<LockWaiters>) -> Self {
        self.waiters = waiters;
        self
    }

    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    /// `resource` のリースを取得。`timeout` を過ぎたら諦める
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> Result<LeaseLock, DocketError> {
        self.acquire_with_cancel(resource, timeout, &CancellationToken::new())
            .await
    }

    #[instrument(skip(self, cancel))]
    pub async fn acquire_with_cancel(
        &self,
        resource: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LeaseLock, DocketError> {
        if resource.is_empty() {
            return Err(DocketError::invalid_argument("lock resource must not be empty"));
        }
        let holder = HolderId::generate();
        let deadline = deadline_after(timeout);
        let released = self.waiters.notifier(resource);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let woken = released.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();

            match self.try_acquire(resource, holder).await {
                Ok(true) => {
                    debug!(%holder, attempt, "lock acquired");
                    return Ok(self.start_lease(resource, holder));
                }
                Ok(false) => {}
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "transient store error while acquiring lock; retrying");
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DocketError::LockTimeout {
                    resource: resource.to_string(),
                    timeout,
                });
            }
            let pause = self.retry_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(DocketError::Cancelled),
                _ = &mut woken => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// `resource` のリースを保持したまま `work` を実行
    ///
    /// どの経路で抜けてもリースは解放される。`work` のエラーは release の
    /// エラーより優先する。
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource: &str,
        timeout: Duration,
        work: F,
    ) -> Result<T, DocketError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DocketError>>,
    {
        let lock = self.acquire(resource, timeout).await?;
        let result = work().await;
        let released = lock.release().await;
        let value = result?;
        released?;
        Ok(value)
    }

    async fn try_acquire(&self, resource: &str, holder: HolderId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        if self.store.delete_expired_lease(resource, now).await? {
            debug!("removed expired lease");
        }
        self.store
            .insert_lease_if_absent(resource, holder, expiry(now, self.lifetime))
            .await
    }

    fn start_lease(&self, resource: &str, holder: HolderId) -> LeaseLock {
        let cancel = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            resource.to_string(),
            holder,
            self.lifetime,
            self.heartbeat_interval,
            cancel.clone(),
        ));
        LeaseLock {
            resource: resource.to_string(),
            holder,
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            waiters: Arc::clone(&self.waiters),
            publisher: self.publisher.clone(),
            heartbeat_cancel: cancel,
            heartbeat: Some(heartbeat),
            released: false,
        }
    }
}

async fn heartbeat_loop(
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    resource: String,
    holder: HolderId,
    lifetime: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(deadline_after(interval), interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut lost = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match store
            .renew_lease(&resource, holder, expiry(clock.now(), lifetime))
            .await
        {
            Ok(true) => lost = false,
            Ok(false) if !lost => {
                lost = true;
                warn!(
                    resource = %resource,
                    %holder,
                    "lease lost: the lock document expired or was taken over; still treating the lock as held until release"
                );
            }
            Ok(false) => {}
            Err(e) => warn!(resource = %resource, %holder, error = %e, "failed to renew lease"),
        }
    }
}

/// 保持中のリース
///
/// [`LeaseLock::release`] を呼ぶこと。drop は最後の手段で、release を予約するだけ。
pub struct LeaseLock {
    resource: String,
    holder: HolderId,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    waiters: Arc<LockWaiters>,
    publisher: EventPublisher,
    heartbeat_cancel: CancellationToken,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("resource", &self.resource)
            .field("holder", &self.holder)
            .field("released", &self.released)
            .finish()
    }
}

impl LeaseLock {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn holder(&self) -> HolderId {
        self.holder
    }

    /// リースを解放
    ///
    /// # 実装
    /// 1. heartbeat を止める（少しだけ待ち、止まらなければ abort）
    /// 2. リースを削除
    /// 3. 期限切れリースを掃除
    /// 4. ローカルの待機者を起こす
    pub async fn release(mut self) -> Result<(), DocketError> {
        self.released = true;
        self.heartbeat_cancel.cancel();
        if let Some(mut heartbeat) = self.heartbeat.take() {
            if tokio::time::timeout(HEARTBEAT_STOP_WAIT, &mut heartbeat)
                .await
                .is_err()
            {
                warn!(resource = %self.resource, "heartbeat did not stop in time; aborting it");
                heartbeat.abort();
            }
        }

        let deleted = self.store.delete_lease(&self.resource, self.holder).await;
        let swept = self
            .store
            .delete_expired_lease(&self.resource, self.clock.now())
            .await;

        match &deleted {
            Ok(true) => {
                debug!(resource = %self.resource, holder = %self.holder, "lock released");
                self.publisher.lock_released(&self.resource).await;
            }
            Ok(false) => warn!(
                resource = %self.resource,
                holder = %self.holder,
                "lease was already gone at release"
            ),
            Err(_) => {}
        }
        self.waiters.notify(&self.resource);

        deleted?;
        swept?;
        Ok(())
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.heartbeat_cancel.cancel();
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                resource = %self.resource,
                "lease dropped outside a runtime; it will be recovered after expiry"
            );
            return;
        };
        let resource = std::mem::take(&mut self.resource);
        let holder = self.holder;
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let waiters = Arc::clone(&self.waiters);
        let publisher = self.publisher.clone();
        runtime.spawn(async move {
            match store.delete_lease(&resource, holder).await {
                Ok(true) => publisher.lock_released(&resource).await,
                Ok(false) => {}
                Err(e) => warn!(resource = %resource, error = %e, "failed to release dropped lease"),
            }
            let _ = store.delete_expired_lease(&resource, clock.now()).await;
            waiters.notify(&resource);
        });
    }
}
