//! 通知ログのイベント（tail ブリッジが読む）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::NotificationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// ジョブが取得可能になった。payload はキュー名
    JobEnqueued,
    /// リースが解放された。payload はリソース名
    LockReleased,
    /// ブリッジ起動時に書く位置マーカー。dispatch では無視する
    Sentinel,
}

/// 追記専用のレコード。読み手は `id` で自分の位置を管理する
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(
        id: NotificationId,
        kind: NotificationKind,
        payload: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            payload: payload.into(),
            created_at: now,
        }
    }

    pub fn sentinel(id: NotificationId, now: DateTime<Utc>) -> Self {
        Self::new(id, NotificationKind::Sentinel, String::new(), now)
    }
}
