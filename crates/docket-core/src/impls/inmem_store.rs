//! InMemoryDocumentStore - 1 プロセス内で完結する開発用ストア
//!
//! # 学習ポイント
//! - 各操作は状態ロックを 1 回だけ取り、終わるまで離さない（1 ドキュメントのアトミック性）
//! - 1 つの `Arc` を複数の `JobStorage` で共有すると、1 つの DB を共有する複数プロセスのように振る舞う
//! - broadcast channel による change stream
//! - 件数と経過時間で上限を切る通知ログ（`cursor_await` の間データがなければカーソルは終了）

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{Mutex, Notify, broadcast};
use ulid::{Generator, Ulid};

use crate::config::NotificationLogOptions;
use crate::domain::{
    EntryId, HolderId, LeaseDocument, NotificationEvent, NotificationId, NotificationKind,
    QueueEntry, SchemaVersion, StoreError,
};
use crate::observability::QueueCounts;
use crate::ports::{
    ChangeStream, DocumentStore, EntryInserted, StoreCapabilities, TailCursor,
};

const CHANGE_STREAM_BUFFER: usize = 1024;

/// 通知ログの上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationLogLimits {
    /// これを超えたら古いイベントから捨てる
    pub max_events: usize,
    /// これより古いイベントは次の追記時に捨てる
    pub retention: Duration,
    /// tail カーソルが新しいデータを待つ時間（過ぎたら終了）
    pub cursor_await: Duration,
}

impl Default for NotificationLogLimits {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            retention: Duration::from_secs(60 * 60),
            cursor_await: Duration::from_secs(5),
        }
    }
}

impl From<NotificationLogOptions> for NotificationLogLimits {
    fn from(options: NotificationLogOptions) -> Self {
        Self {
            max_events: options.max_events,
            retention: options.retention,
            ..Self::default()
        }
    }
}

struct StoreState {
    entries: BTreeMap<EntryId, QueueEntry>,
    leases: HashMap<String, LeaseDocument>,
    schema: Option<SchemaVersion>,
    log: VecDeque<NotificationEvent>,
    ids: Generator,
}

impl StoreState {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            leases: HashMap::new(),
            schema: None,
            log: VecDeque::new(),
            ids: Generator::new(),
        }
    }

    /// 次の（狭義単調増加する）通知 ID
    fn next_notification_id(&mut self) -> NotificationId {
        let ulid = self.ids.generate().unwrap_or_else(|_| Ulid::new());
        NotificationId::from_ulid(ulid)
    }

    fn trim_log(&mut self, limits: &NotificationLogLimits, now: DateTime<Utc>) {
        while self.log.len() > limits.max_events {
            self.log.pop_front();
        }
        let retention = ChronoDuration::from_std(limits.retention).unwrap_or(ChronoDuration::MAX);
        if let Some(cutoff) = now.checked_sub_signed(retention) {
            while self.log.front().is_some_and(|event| event.created_at < cutoff) {
                self.log.pop_front();
            }
        }
    }
}

pub struct InMemoryDocumentStore {
    state: Arc<Mutex<StoreState>>,
    inserts: broadcast::Sender<EntryInserted>,
    appended: Arc<Notify>,
    capabilities: StoreCapabilities,
    limits: NotificationLogLimits,
    injected_failures: AtomicU32,
    closed: AtomicBool,
}

impl InMemoryDocumentStore {
    /// すべての通知機能を持つストアを作成
    pub fn new() -> Self {
        Self::with_capabilities(StoreCapabilities::all())
    }

    /// 指定した機能だけを持つストアを作成
    ///
    /// change stream のない standalone 構成の代わりなどに使う
    pub fn with_capabilities(capabilities: StoreCapabilities) -> Self {
        let (inserts, _) = broadcast::channel(CHANGE_STREAM_BUFFER);
        Self {
            state: Arc::new(Mutex::new(StoreState::new())),
            inserts,
            appended: Arc::new(Notify::new()),
            capabilities,
            limits: NotificationLogLimits::default(),
            injected_failures: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_log_limits(mut self, limits: NotificationLogLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// 次の `count` 回の操作を一時的エラーで失敗させる
    pub fn inject_transient_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// 以降の操作をすべて `StoreError::Closed` で拒否する
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.appended.notify_waiters();
    }

    /// エントリのスナップショット（確認用）
    pub async fn entry(&self, id: EntryId) -> Option<QueueEntry> {
        self.state.lock().await.entries.get(&id).cloned()
    }

    /// `resource` のリースのスナップショット（確認用）
    pub async fn lease(&self, resource: &str) -> Option<LeaseDocument> {
        self.state.lock().await.leases.get(resource).cloned()
    }

    /// 通知ログに残っているイベント
    pub async fn notifications(&self) -> Vec<NotificationEvent> {
        self.state.lock().await.log.iter().cloned().collect()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let consumed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if consumed.is_ok() {
            return Err(StoreError::transient("injected failure"));
        }
        Ok(())
    }

    fn require_log(&self) -> Result<(), StoreError> {
        if self.capabilities.tailable_log {
            Ok(())
        } else {
            Err(StoreError::unsupported("tailable notification logs"))
        }
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    async fn insert_entry(&self, entry: QueueEntry) -> Result<(), StoreError> {
        self.check()?;
        let inserted = EntryInserted {
            entry_id: entry.id,
            queue: entry.queue.clone(),
        };
        {
            let mut state = self.state.lock().await;
            state.entries.insert(entry.id, entry);
        }
        if self.capabilities.change_streams {
            // 購読者がいなくてもよい
            let _ = self.inserts.send(inserted);
        }
        Ok(())
    }

    async fn claim_entry(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        invisibility: Option<Duration>,
    ) -> Result<Option<QueueEntry>, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let claimed = state
            .entries
            .values_mut()
            .find(|entry| entry.queue == queue && entry.is_claimable(now, invisibility))
            .map(|entry| {
                entry.fetched_at = Some(now);
                entry.clone()
            });
        Ok(claimed)
    }

    async fn delete_entry(
        &self,
        id: EntryId,
        fetched_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let matches = state
            .entries
            .get(&id)
            .is_some_and(|entry| entry.matches_claim(id, fetched_at));
        if matches {
            state.entries.remove(&id);
        }
        Ok(matches)
    }

    async fn requeue_entry(
        &self,
        id: EntryId,
        fetched_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.entries.get_mut(&id) {
            Some(entry) if entry.matches_claim(id, fetched_at) => {
                entry.fetched_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for entry in state.entries.values().filter(|entry| entry.queue == queue) {
            if entry.is_fetched() {
                counts.fetched += 1;
            } else {
                counts.enqueued += 1;
            }
        }
        Ok(counts)
    }

    async fn delete_expired_lease(
        &self,
        resource: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let expired = state
            .leases
            .get(resource)
            .is_some_and(|lease| lease.is_expired(now));
        if expired {
            state.leases.remove(resource);
        }
        Ok(expired)
    }

    async fn insert_lease_if_absent(
        &self,
        resource: &str,
        holder: HolderId,
        expire_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if state.leases.contains_key(resource) {
            return Ok(false);
        }
        state.leases.insert(
            resource.to_string(),
            LeaseDocument::new(resource, holder, expire_at),
        );
        Ok(true)
    }

    async fn renew_lease(
        &self,
        resource: &str,
        holder: HolderId,
        expire_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.leases.get_mut(resource) {
            Some(lease) if lease.holder == holder => {
                lease.expire_at = expire_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_lease(&self, resource: &str, holder: HolderId) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let owned = state
            .leases
            .get(resource)
            .is_some_and(|lease| lease.holder == holder);
        if owned {
            state.leases.remove(resource);
        }
        Ok(owned)
    }

    async fn schema_version(&self) -> Result<Option<SchemaVersion>, StoreError> {
        self.check()?;
        Ok(self.state.lock().await.schema)
    }

    async fn set_schema_version(&self, version: SchemaVersion) -> Result<(), StoreError> {
        self.check()?;
        self.state.lock().await.schema = Some(version);
        Ok(())
    }

    async fn watch_entry_inserts(&self) -> Result<Box<dyn ChangeStream>, StoreError> {
        self.check()?;
        if !self.capabilities.change_streams {
            return Err(StoreError::unsupported("change streams"));
        }
        Ok(Box::new(InMemoryChangeStream {
            rx: self.inserts.subscribe(),
        }))
    }

    async fn append_notification(
        &self,
        kind: NotificationKind,
        payload: &str,
    ) -> Result<NotificationId, StoreError> {
        self.check()?;
        self.require_log()?;
        let now = Utc::now();
        let id = {
            let mut state = self.state.lock().await;
            let id = state.next_notification_id();
            state
                .log
                .push_back(NotificationEvent::new(id, kind, payload, now));
            state.trim_log(&self.limits, now);
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn upsert_notification_sentinel(&self) -> Result<NotificationId, StoreError> {
        self.check()?;
        self.require_log()?;
        let now = Utc::now();
        let id = {
            let mut state = self.state.lock().await;
            match state.log.back() {
                Some(last) if last.kind == NotificationKind::Sentinel => last.id,
                _ => {
                    let id = state.next_notification_id();
                    state.log.push_back(NotificationEvent::sentinel(id, now));
                    state.trim_log(&self.limits, now);
                    id
                }
            }
        };
        Ok(id)
    }

    async fn tail_notifications(
        &self,
        after: NotificationId,
    ) -> Result<Box<dyn TailCursor>, StoreError> {
        self.check()?;
        self.require_log()?;
        Ok(Box::new(InMemoryTailCursor {
            state: Arc::clone(&self.state),
            appended: Arc::clone(&self.appended),
            after,
            cursor_await: self.limits.cursor_await,
        }))
    }
}

struct InMemoryChangeStream {
    rx: broadcast::Receiver<EntryInserted>,
}

#[async_trait]
impl ChangeStream for InMemoryChangeStream {
    async fn next(&mut self) -> Result<Option<EntryInserted>, StoreError> {
        match self.rx.recv().await {
            Ok(inserted) => Ok(Some(inserted)),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(StoreError::transient(
                format!("change stream fell behind by {skipped} events"),
            )),
        }
    }
}

struct InMemoryTailCursor {
    state: Arc<Mutex<StoreState>>,
    appended: Arc<Notify>,
    after: NotificationId,
    cursor_await: Duration,
}

#[async_trait]
impl TailCursor for InMemoryTailCursor {
    async fn next(&mut self) -> Result<Option<NotificationEvent>, StoreError> {
        loop {
            // 確認より先に待機を登録する（間に入った追記を取りこぼさないため）
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            {
                let state = self.state.lock().await;
                let idx = state.log.partition_point(|event| event.id <= self.after);
                if let Some(event) = state.log.get(idx) {
                    self.after = event.id;
                    return Ok(Some(event.clone()));
                }
            }

            if tokio::time::timeout(self.cursor_await, appended).await.is_err() {
                return Ok(None);
            }
        }
    }
}
