//! WakeupRegistry - プロセス内の「キュー X で何か起きた」シグナル
//!
//! # 学習ポイント
//! - キューごとに 0 から始まる計数セマフォ（`tokio::sync::Semaphore`）
//! - `Notify` の `enable()` を確認より先に呼んで、通知の取りこぼしを防ぐ
//! - `CancellationToken` とタイムアウトを `select!` で同時に待つ
//!
//! ブリッジはジョブが現れたら [`WakeupRegistry::release`] を呼び、
//! dequeue ループは [`WakeupRegistry::wait_any`] でブロックする。
//! このレジストリは補助的なもので、wake-up を失っても遅延が増えるだけ
//! （dequeue ループは backstop 間隔でストアを再確認する）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::app::backoff::deadline_after;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WakeupError {
    /// 待機側が消費しきれないほどの release。上流のバグ
    #[error("wake-up signal for queue `{queue}` is already at capacity ({capacity})")]
    Overflow { queue: String, capacity: usize },

    #[error("wake-up registry is closed")]
    Closed,
}

/// [`WakeupRegistry::wait_any`] の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// このキューのシグナルを 1 つ消費した
    Signalled(String),
    TimedOut,
    Cancelled,
}

impl WaitOutcome {
    pub fn queue(&self) -> Option<&str> {
        match self {
            WaitOutcome::Signalled(queue) => Some(queue),
            _ => None,
        }
    }
}

struct Signals {
    by_queue: HashMap<String, Arc<Semaphore>>,
    closed: bool,
}

pub struct WakeupRegistry {
    signals: Mutex<Signals>,
    released: Notify,
    capacity: usize,
}

impl WakeupRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            signals: Mutex::new(Signals {
                by_queue: HashMap::new(),
                closed: false,
            }),
            released: Notify::new(),
            capacity: capacity.clamp(1, Semaphore::MAX_PERMITS),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Signals> {
        self.signals.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn signal(&self, queue: &str) -> Result<Arc<Semaphore>, WakeupError> {
        let mut signals = self.lock();
        if signals.closed {
            return Err(WakeupError::Closed);
        }
        let signal = signals
            .by_queue
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)));
        Ok(Arc::clone(signal))
    }

    /// `queue` のシグナルを 1 増やし、ブロック中のタスクを起こす
    ///
    /// 上限に達していれば件数は変えずに `Overflow` を返す
    pub fn release(&self, queue: &str) -> Result<(), WakeupError> {
        {
            let mut signals = self.lock();
            if signals.closed {
                return Err(WakeupError::Closed);
            }
            let signal = signals
                .by_queue
                .entry(queue.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(0)));
            // 加算は map のロック内でしか起きないので、この確認は競合しない
            if signal.available_permits() >= self.capacity {
                return Err(WakeupError::Overflow {
                    queue: queue.to_string(),
                    capacity: self.capacity,
                });
            }
            signal.add_permits(1);
        }
        self.released.notify_waiters();
        Ok(())
    }

    /// `queues` のどれかにシグナルが来るまでブロック
    ///
    /// `timeout` の経過か `cancel` の発火でも戻る。シグナルを消費するのは
    /// `Signalled` の時だけ。
    ///
    /// # 実装
    /// 1. `Notify` の待機を登録（`enable()`）
    /// 2. 指定順に `try_acquire` を試す（準備済みのキューは先頭優先）
    /// 3. なければ cancel / release / 期限のいずれかを待ち、1 に戻る
    ///
    /// すでにブロック中のタスクは、先に release されたキューを返す。
    pub async fn wait_any(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<WaitOutcome, WakeupError> {
        let signals = queues
            .iter()
            .map(|queue| self.signal(queue).map(|signal| (queue, signal)))
            .collect::<Result<Vec<_>, _>>()?;
        let deadline = deadline_after(timeout);

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if cancel.is_cancelled() {
                return Ok(WaitOutcome::Cancelled);
            }
            for (queue, signal) in &signals {
                match signal.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        return Ok(WaitOutcome::Signalled((*queue).clone()));
                    }
                    Err(TryAcquireError::Closed) => return Err(WakeupError::Closed),
                    Err(TryAcquireError::NoPermits) => {}
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
                _ = &mut released => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(WaitOutcome::TimedOut),
            }
        }
    }

    /// 待たずに `queue` のシグナルを 1 つ消費する（あれば）
    pub fn wait_non_block(&self, queue: &str) -> Result<bool, WakeupError> {
        match self.signal(queue)?.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(true)
            }
            Err(TryAcquireError::NoPermits) => Ok(false),
            Err(TryAcquireError::Closed) => Err(WakeupError::Closed),
        }
    }

    /// `queue` に溜まっているシグナル数
    pub fn pending(&self, queue: &str) -> usize {
        self.lock()
            .by_queue
            .get(queue)
            .map_or(0, |signal| signal.available_permits())
    }

    /// すべてのシグナルを破棄する。ブロック中の待機も、以降の呼び出しも `Closed` になる
    pub fn close(&self) {
        {
            let mut signals = self.lock();
            signals.closed = true;
            for signal in signals.by_queue.values() {
                signal.close();
            }
        }
        self.released.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl Default for WakeupRegistry {
    fn default() -> Self {
        Self::new(Semaphore::MAX_PERMITS)
    }
}
