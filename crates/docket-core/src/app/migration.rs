//! MigrationCoordinator - プロセスをまたいだスキーマ更新の直列化
//!
//! # 学習ポイント
//! - 生成するバージョンでステップをグループ化し、グループ内は sequence 順
//! - グループごとにバージョンを書くので、失敗しても完了済みのグループから再開できる
//! - 全体をグローバルなマイグレーション用リースの下で実行

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::app::lease_lock::DistributedLocks;
use crate::config::MigrationStrategy;
use crate::domain::SchemaVersion;
use crate::error::{DocketError, StepError};
use crate::ports::DocumentStore;

/// マイグレーション前に全プロセスが取り合うリースのリソース名
pub const MIGRATION_LOCK_RESOURCE: &str = "docket:migration";

/// スキーマ更新の 1 単位。ストアに何をするかはステップ次第
#[async_trait]
pub trait MigrationStep: Send + Sync {
    /// このステップのグループが終わった時のストアのバージョン
    fn target_version(&self) -> SchemaVersion;

    /// グループ内の順序
    fn sequence(&self) -> u32;

    fn name(&self) -> &str;

    async fn execute(&self, store: &dyn DocumentStore) -> Result<(), StepError>;
}

/// 検証・整列済みのステップ集合
#[derive(Clone, Default)]
pub struct MigrationPlan {
    steps: Vec<Arc<dyn MigrationStep>>,
}

impl MigrationPlan {
    pub fn new(steps: Vec<Arc<dyn MigrationStep>>) -> Result<Self, DocketError> {
        let mut seen = HashSet::new();
        for step in &steps {
            let key = (step.target_version(), step.sequence());
            if !seen.insert(key) {
                return Err(DocketError::DuplicateMigration {
                    version: key.0,
                    sequence: key.1,
                });
            }
        }
        let mut steps = steps;
        steps.sort_by_key(|step| (step.target_version(), step.sequence()));
        Ok(Self { steps })
    }

    /// ステップが生成する最大のバージョン
    pub fn latest_version(&self) -> SchemaVersion {
        self.steps
            .last()
            .map_or(SchemaVersion::EMPTY, |step| step.target_version())
    }

    /// `from < version <= to` のグループをバージョン順に返す
    fn groups_between(
        &self,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> BTreeMap<SchemaVersion, Vec<Arc<dyn MigrationStep>>> {
        let mut groups: BTreeMap<SchemaVersion, Vec<Arc<dyn MigrationStep>>> = BTreeMap::new();
        for step in &self.steps {
            let version = step.target_version();
            if from < version && version <= to {
                groups.entry(version).or_default().push(Arc::clone(step));
            }
        }
        groups
    }
}

/// `ensure_schema` 1 回の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    /// 実行したステップ名（実行順）
    pub applied: Vec<String>,
}

impl MigrationReport {
    fn unchanged(version: SchemaVersion) -> Self {
        Self {
            from: version,
            to: version,
            applied: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

pub struct MigrationCoordinator {
    store: Arc<dyn DocumentStore>,
    locks: DistributedLocks,
    plan: MigrationPlan,
    strategy: MigrationStrategy,
    lock_timeout: Duration,
}

impl MigrationCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: DistributedLocks,
        plan: MigrationPlan,
        strategy: MigrationStrategy,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            plan,
            strategy,
            lock_timeout,
        }
    }

    /// ストアを `target` まで上げる。できなければストアに触らず失敗する
    ///
    /// # 実装
    /// 1. 現在 > target なら `SchemaAhead`（後退はしない）
    /// 2. 現在 == target なら何もしない
    /// 3. `Throw` 戦略なら `MigrationRequired`
    /// 4. それ以外はマイグレーション用リースを取って実行
    #[instrument(skip(self))]
    pub async fn ensure_schema(&self, target: SchemaVersion) -> Result<MigrationReport, DocketError> {
        let current = self.current_version().await?;
        if current > target {
            return Err(DocketError::SchemaAhead { current, target });
        }
        if current == target {
            info!(version = %current, "schema is up to date");
            return Ok(MigrationReport::unchanged(current));
        }
        if self.strategy == MigrationStrategy::Throw {
            return Err(DocketError::MigrationRequired { current, target });
        }

        self.locks
            .with_lock(MIGRATION_LOCK_RESOURCE, self.lock_timeout, || {
                self.migrate_locked(target)
            })
            .await
    }

    async fn current_version(&self) -> Result<SchemaVersion, DocketError> {
        Ok(self
            .store
            .schema_version()
            .await?
            .unwrap_or(SchemaVersion::EMPTY))
    }

    async fn migrate_locked(&self, target: SchemaVersion) -> Result<MigrationReport, DocketError> {
        // リースを待つ間に別プロセスが済ませたかもしれない
        let from = self.current_version().await?;
        if from > target {
            return Err(DocketError::SchemaAhead {
                current: from,
                target,
            });
        }
        if from == target {
            info!(version = %from, "schema was migrated by another process");
            return Ok(MigrationReport::unchanged(from));
        }

        info!(from = %from, to = %target, "migrating schema");
        let mut applied = Vec::new();
        let mut recorded = from;
        for (version, steps) in self.plan.groups_between(from, target) {
            for step in steps {
                info!(step = step.name(), version = %version, "running migration step");
                step.execute(self.store.as_ref())
                    .await
                    .map_err(|source| DocketError::MigrationFailed {
                        step: step.name().to_string(),
                        version,
                        source,
                    })?;
                applied.push(step.name().to_string());
            }
            self.store.set_schema_version(version).await?;
            recorded = version;
            info!(version = %version, "schema version recorded");
        }
        if recorded < target {
            self.store.set_schema_version(target).await?;
        }

        info!(from = %from, to = %target, steps = applied.len(), "schema migration complete");
        Ok(MigrationReport {
            from,
            to: target,
            applied,
        })
    }
}
