//! LeaseDocument - ロック所有の唯一の根拠

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::HolderId;

/// 名前付きリソースの期限付き所有権
///
/// # ライフサイクル
/// - 最初に acquire に成功したプロセスが作成
/// - 保持者の heartbeat が `expire_at` を延長
/// - release で削除
///
/// `expire_at` を過ぎたリースは誰でも削除できる。クラッシュした保持者の
/// ロックはこれで回収される。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseDocument {
    pub resource: String,
    pub holder: HolderId,
    pub expire_at: DateTime<Utc>,
}

impl LeaseDocument {
    pub fn new(resource: impl Into<String>, holder: HolderId, expire_at: DateTime<Utc>) -> Self {
        Self {
            resource: resource.into(),
            holder,
            expire_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at < now
    }
}
