//! StorageOptions - ストレージの設定
//!
//! # 学習ポイント
//! - `#[serde(default)]` で全フィールドにデフォルトを持たせる（空の JSON オブジェクトも有効）
//! - Duration はミリ秒の整数で読み書き
//! - `validate()` で起動前に検証（Fail-fast 設計）

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::DocketError;

/// `distributed_lock_lifetime` の上限（1 日）
pub const MAX_LOCK_LIFETIME: Duration = Duration::from_secs(86_400);

/// insert をブロック中の dequeue ループに届ける方法
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStrategy {
    /// push なし。dequeue ループは backstop 間隔だけに頼る
    Poll,
    /// キューエントリ insert のライブ change stream
    #[default]
    Watch,
    /// 上限付き通知ログを tail する
    Tail,
}

/// 保存済みスキーマが古い時に起動処理がどうするか
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStrategy {
    #[default]
    Migrate,
    /// ストアに触らず `MigrationRequired` で失敗する
    Throw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationLogOptions {
    pub max_events: usize,
    #[serde(with = "duration_ms")]
    pub retention: Duration,
}

impl Default for NotificationLogOptions {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            retention: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Backstop: dequeue がストアを再確認するまでの最大待ち時間
    #[serde(with = "duration_ms")]
    pub queue_poll_interval: Duration,

    /// claim がエントリを隠す時間。`None` なら放棄された claim は回収されず、
    /// 運用者が requeue する必要がある
    #[serde(with = "option_duration_ms")]
    pub invisibility_timeout: Option<Duration>,

    /// リースの寿命。heartbeat はその 1/3 ごとに更新する
    #[serde(with = "duration_ms")]
    pub distributed_lock_lifetime: Duration,

    #[serde(with = "duration_ms")]
    pub lock_retry_interval: Duration,

    #[serde(with = "duration_ms")]
    pub migration_lock_timeout: Duration,

    pub notification_strategy: NotificationStrategy,
    pub migration_strategy: MigrationStrategy,

    #[serde(with = "duration_ms")]
    pub bridge_max_backoff: Duration,

    pub wakeup_capacity: usize,
    pub notification_log: NotificationLogOptions,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            queue_poll_interval: Duration::from_secs(15),
            invisibility_timeout: Some(Duration::from_secs(30 * 60)),
            distributed_lock_lifetime: Duration::from_secs(30),
            lock_retry_interval: Duration::from_millis(20),
            migration_lock_timeout: Duration::from_secs(60),
            notification_strategy: NotificationStrategy::default(),
            migration_strategy: MigrationStrategy::default(),
            bridge_max_backoff: Duration::from_secs(10),
            wakeup_capacity: Semaphore::MAX_PERMITS,
            notification_log: NotificationLogOptions::default(),
        }
    }
}

impl StorageOptions {
    pub fn from_json_str(json: &str) -> Result<Self, DocketError> {
        let options: StorageOptions = serde_json::from_str(json)
            .map_err(|e| DocketError::configuration(format!("invalid storage options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), DocketError> {
        if self.queue_poll_interval.is_zero() {
            return Err(DocketError::configuration(
                "queue_poll_interval must be greater than zero",
            ));
        }
        if self.invisibility_timeout.is_some_and(|t| t.is_zero()) {
            return Err(DocketError::configuration(
                "invisibility_timeout must be greater than zero; use null to disable reclaiming",
            ));
        }
        if self.distributed_lock_lifetime < Duration::from_millis(3)
            || self.distributed_lock_lifetime > MAX_LOCK_LIFETIME
        {
            return Err(DocketError::configuration(format!(
                "distributed_lock_lifetime must be between 3ms and {}s",
                MAX_LOCK_LIFETIME.as_secs()
            )));
        }
        if self.lock_retry_interval.is_zero() {
            return Err(DocketError::configuration(
                "lock_retry_interval must be greater than zero",
            ));
        }
        if self.wakeup_capacity == 0 || self.wakeup_capacity > Semaphore::MAX_PERMITS {
            return Err(DocketError::configuration(format!(
                "wakeup_capacity must be between 1 and {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.notification_strategy == NotificationStrategy::Tail
            && self.notification_log.max_events == 0
        {
            return Err(DocketError::configuration(
                "notification_log.max_events must be greater than zero for the tail strategy",
            ));
        }
        Ok(())
    }

    /// 上限に丸めたリースの寿命
    pub fn lease_lifetime(&self) -> Duration {
        self.distributed_lock_lifetime.min(MAX_LOCK_LIFETIME)
    }

    /// リース更新の間隔（寿命の 1/3、最低 1ms）
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease_lifetime() / 3).max(Duration::from_millis(1))
    }

    pub fn with_queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    pub fn with_invisibility_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invisibility_timeout = timeout;
        self
    }

    pub fn with_distributed_lock_lifetime(mut self, lifetime: Duration) -> Self {
        self.distributed_lock_lifetime = lifetime;
        self
    }

    pub fn with_lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    pub fn with_migration_lock_timeout(mut self, timeout: Duration) -> Self {
        self.migration_lock_timeout = timeout;
        self
    }

    pub fn with_notification_strategy(mut self, strategy: NotificationStrategy) -> Self {
        self.notification_strategy = strategy;
        self
    }

    pub fn with_migration_strategy(mut self, strategy: MigrationStrategy) -> Self {
        self.migration_strategy = strategy;
        self
    }

    pub fn with_bridge_max_backoff(mut self, backoff: Duration) -> Self {
        self.bridge_max_backoff = backoff;
        self
    }

    pub fn with_wakeup_capacity(mut self, capacity: usize) -> Self {
        self.wakeup_capacity = capacity;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_object_yields_defaults() {
        let options = StorageOptions::from_json_str("{}").unwrap();
        assert_eq!(options, StorageOptions::default());
        assert_eq!(options.heartbeat_interval(), Duration::from_secs(10));
    }

    #[test]
    fn durations_are_milliseconds() {
        let options = StorageOptions::from_json_str(
            r#"{
                "queue_poll_interval": 250,
                "invisibility_timeout": null,
                "notification_strategy": "tail",
                "migration_strategy": "throw"
            }"#,
        )
        .unwrap();
        assert_eq!(options.queue_poll_interval, Duration::from_millis(250));
        assert_eq!(options.invisibility_timeout, None);
        assert_eq!(options.notification_strategy, NotificationStrategy::Tail);
        assert_eq!(options.migration_strategy, MigrationStrategy::Throw);
    }

    #[test]
    fn serialises_back_to_the_same_shape() {
        let options = StorageOptions::default().with_invisibility_timeout(None);
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["queue_poll_interval"], 15_000);
        assert!(json["invisibility_timeout"].is_null());
    }

    #[rstest]
    #[case::zero_poll(StorageOptions::default().with_queue_poll_interval(Duration::ZERO))]
    #[case::zero_invisibility(StorageOptions::default().with_invisibility_timeout(Some(Duration::ZERO)))]
    #[case::tiny_lease(StorageOptions::default().with_distributed_lock_lifetime(Duration::from_millis(1)))]
    #[case::endless_lease(StorageOptions::default().with_distributed_lock_lifetime(Duration::MAX))]
    #[case::zero_retry(StorageOptions::default().with_lock_retry_interval(Duration::ZERO))]
    #[case::zero_capacity(StorageOptions::default().with_wakeup_capacity(0))]
    fn rejects_invalid_options(#[case] options: StorageOptions) {
        assert!(matches!(
            options.validate(),
            Err(DocketError::Configuration(_))
        ));
    }

    #[test]
    fn setters_override_defaults() {
        let options = StorageOptions::default()
            .with_migration_lock_timeout(Duration::from_secs(5))
            .with_bridge_max_backoff(Duration::from_millis(500))
            .with_wakeup_capacity(16);
        assert_eq!(options.migration_lock_timeout, Duration::from_secs(5));
        assert_eq!(options.bridge_max_backoff, Duration::from_millis(500));
        assert_eq!(options.wakeup_capacity, 16);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn lease_lifetime_is_capped_for_unvalidated_options() {
        let options = StorageOptions::default().with_distributed_lock_lifetime(Duration::MAX);
        assert_eq!(options.lease_lifetime(), MAX_LOCK_LIFETIME);
        assert_eq!(options.heartbeat_interval(), MAX_LOCK_LIFETIME / 3);
    }

    #[test]
    fn malformed_json_is_a_configuration_error() {
        let err = StorageOptions::from_json_str(r#"{"queue_poll_interval": "soon"}"#).unwrap_err();
        assert!(matches!(err, DocketError::Configuration(_)));
    }
}
