//! DocumentStore port - すべてのワーカープロセスが使う共有ストア
//!
//! # 学習ポイント
//! - 整合性の前提は「1 ドキュメントのアトミック更新」だけ
//! - 各メソッドはその 1 操作に対応し、複数ドキュメントのトランザクションは不要
//! - ライブ通知はオプション機能。[`StoreCapabilities`] で申告させ、
//!   対応していないブリッジ戦略は起動時に弾く（バックグラウンドで後から失敗させない）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::domain::{
    EntryId, HolderId, NotificationEvent, NotificationId, NotificationKind, QueueEntry,
    SchemaVersion, StoreError,
};
use crate::observability::QueueCounts;

/// 現在の構成でストアが提供できるライブ通知機能
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// ライブの change stream（`watch_entry_inserts`）
    pub change_streams: bool,
    /// 上限付きで tail 可能な通知ログ（`append_notification`, `tail_notifications`）
    pub tailable_log: bool,
}

impl StoreCapabilities {
    pub fn all() -> Self {
        Self {
            change_streams: true,
            tailable_log: true,
        }
    }

    pub fn none() -> Self {
        Self {
            change_streams: false,
            tailable_log: false,
        }
    }
}

/// キューエントリのコレクションで観測された insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInserted {
    pub entry_id: EntryId,
    pub queue: String,
}

/// キューエントリ insert のライブフィード
#[async_trait]
pub trait ChangeStream: Send {
    /// 次の insert。`Ok(None)` はストリームが終わったので開き直す必要があるという意味
    async fn next(&mut self) -> Result<Option<EntryInserted>, StoreError>;
}

/// 通知ログを読み続けられるカーソル
#[async_trait]
pub trait TailCursor: Send {
    /// カーソル位置の次のイベント。`Ok(None)` はカーソルが終了したという意味で、
    /// 最後に見た id から開き直す
    async fn next(&mut self) -> Result<Option<NotificationEvent>, StoreError>;
}

/// ストアの境界
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn capabilities(&self) -> StoreCapabilities;

    // ---- キューエントリ ---------------------------------------------------

    async fn insert_entry(&self, entry: QueueEntry) -> Result<(), StoreError>;

    /// `queue` のエントリを 1 つアトミックに claim
    ///
    /// # 実装
    /// 1. `fetched_at` が未設定、または（`invisibility` があれば）`now - invisibility` より古いものに一致
    /// 2. `fetched_at = now` を設定
    /// 3. 更新後のドキュメントを返す
    async fn claim_entry(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        invisibility: Option<Duration>,
    ) -> Result<Option<QueueEntry>, StoreError>;

    /// この claim がまだ残っている場合だけエントリを削除
    async fn delete_entry(
        &self,
        id: EntryId,
        fetched_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// この claim がまだ残っている場合だけ `fetched_at` をクリア
    async fn requeue_entry(
        &self,
        id: EntryId,
        fetched_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts, StoreError>;

    // ---- リース ----------------------------------------------------------

    /// `resource` のリースが `now` より前に期限切れなら削除
    async fn delete_expired_lease(
        &self,
        resource: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// 存在しない時だけ upsert。この呼び出しで作成した時に `true`
    /// （更新前の状態が「存在しない」だった）
    async fn insert_lease_if_absent(
        &self,
        resource: &str,
        holder: HolderId,
        expire_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// `expire_at` を延長。`holder` がもう `resource` のリースを持っていなければ `false`
    async fn renew_lease(
        &self,
        resource: &str,
        holder: HolderId,
        expire_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn delete_lease(&self, resource: &str, holder: HolderId) -> Result<bool, StoreError>;

    // ---- スキーマバージョン --------------------------------------------------

    async fn schema_version(&self) -> Result<Option<SchemaVersion>, StoreError>;

    async fn set_schema_version(&self, version: SchemaVersion) -> Result<(), StoreError>;

    // ---- ライブ通知 ----------------------------------------------

    /// キューエントリの insert に絞った change stream を開く
    async fn watch_entry_inserts(&self) -> Result<Box<dyn ChangeStream>, StoreError>;

    async fn append_notification(
        &self,
        kind: NotificationKind,
        payload: &str,
    ) -> Result<NotificationId, StoreError>;

    /// 起動時の sentinel を書き、その id を読み戻す。
    /// 新しい読み手はこの位置から tail を始める
    async fn upsert_notification_sentinel(&self) -> Result<NotificationId, StoreError>;

    /// `after` の直後に位置する tail 可能なカーソルを開く
    async fn tail_notifications(
        &self,
        after: NotificationId,
    ) -> Result<Box<dyn TailCursor>, StoreError>;
}
