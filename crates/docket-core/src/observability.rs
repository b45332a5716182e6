//! キューの状態表示と tracing の初期化

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// 1 キューのエントリ件数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// claim 待ちのエントリ
    pub enqueued: usize,
    /// いずれかのワーカーが claim 中のエントリ
    pub fetched: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.enqueued + self.fetched
    }
}

/// `RUST_LOG`（デフォルト `info`）で絞ったプロセス全体の fmt subscriber を設定
///
/// 何度呼んでもよい。設定されるのは最初の 1 回だけ。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
    }

    #[test]
    fn total_sums_both_states() {
        let counts = QueueCounts {
            enqueued: 3,
            fetched: 2,
        };
        assert_eq!(counts.total(), 5);
    }
}
