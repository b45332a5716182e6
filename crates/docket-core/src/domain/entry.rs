//! QueueEntry - ワーカーが claim するレコード

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ids::{EntryId, JobId};

/// 名前付きキューで待っている（または claim された）1 つのジョブ
///
/// # ライフサイクル
/// - enqueue: `fetched_at = None` で挿入
/// - claim: `fetched_at` に claim 時刻を設定
/// - requeue: `fetched_at` をクリア
/// - 完了: レコードを削除
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub job_id: JobId,
    pub queue: String,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new(job_id: JobId, queue: impl Into<String>) -> Self {
        Self {
            id: EntryId::generate(),
            job_id,
            queue: queue.into(),
            fetched_at: None,
        }
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched_at.is_some()
    }

    /// `now` の時点で claim できるか
    ///
    /// 未 claim なら常に可能。claim 済みなら、claim が `invisibility` より
    /// 古くなった時だけ可能。invisibility timeout が None なら放棄扱いにしない。
    pub fn is_claimable(&self, now: DateTime<Utc>, invisibility: Option<Duration>) -> bool {
        match (self.fetched_at, invisibility) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(fetched_at), Some(timeout)) => {
                let timeout = ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::MAX);
                match now.checked_sub_signed(timeout) {
                    Some(cutoff) => fetched_at < cutoff,
                    None => false,
                }
            }
        }
    }

    /// ハンドルが取った claim がまだこのレコードに残っているか
    pub fn matches_claim(&self, id: EntryId, fetched_at: DateTime<Utc>) -> bool {
        self.id == id && self.fetched_at == Some(fetched_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn fresh_entry_is_claimable() {
        let entry = QueueEntry::new(JobId::generate(), "default");
        assert!(!entry.is_fetched());
        assert!(entry.is_claimable(at(0), None));
        assert!(entry.is_claimable(at(0), Some(Duration::from_secs(1))));
    }

    #[rstest]
    #[case::within_window(Some(Duration::from_secs(30)), 10, false)]
    #[case::window_elapsed(Some(Duration::from_secs(30)), 31, true)]
    #[case::exactly_at_cutoff(Some(Duration::from_secs(30)), 30, false)]
    #[case::reclaim_disabled(None, 86_400, false)]
    fn claimed_entry_visibility(
        #[case] invisibility: Option<Duration>,
        #[case] elapsed_secs: i64,
        #[case] claimable: bool,
    ) {
        let mut entry = QueueEntry::new(JobId::generate(), "default");
        entry.fetched_at = Some(at(0));
        assert_eq!(entry.is_claimable(at(elapsed_secs), invisibility), claimable);
    }

    #[test]
    fn claim_match_requires_same_timestamp() {
        let mut entry = QueueEntry::new(JobId::generate(), "default");
        entry.fetched_at = Some(at(5));
        assert!(entry.matches_claim(entry.id, at(5)));
        assert!(!entry.matches_claim(entry.id, at(6)));
        assert!(!entry.matches_claim(EntryId::generate(), at(5)));
    }
}
