use std::time::Duration;

use thiserror::Error;

use crate::app::wakeup::WakeupError;
use crate::domain::{SchemaVersion, StoreError};

/// Error raised by a migration step.
pub type StepError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum DocketError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Cooperative cancellation; not a failure of the operation itself.
    #[error("operation cancelled")]
    Cancelled,

    #[error("no job fetched from queues {queues:?} within {waited:?}")]
    DequeueTimeout { queues: Vec<String>, waited: Duration },

    #[error(
        "could not acquire lock on `{resource}` within {timeout:?}; another process may be \
         stuck holding it. If no live process owns it, delete its lease document manually"
    )]
    LockTimeout { resource: String, timeout: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wakeup(#[from] WakeupError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("stored schema {current} is newer than supported schema {target}; downgrades are not supported")]
    SchemaAhead {
        current: SchemaVersion,
        target: SchemaVersion,
    },

    #[error("stored schema {current} must be upgraded to {target}, but the migration strategy forbids it")]
    MigrationRequired {
        current: SchemaVersion,
        target: SchemaVersion,
    },

    #[error("duplicate migration step {sequence} for {version}")]
    DuplicateMigration { version: SchemaVersion, sequence: u32 },

    #[error("migration step `{step}` towards {version} failed: {source}")]
    MigrationFailed {
        step: String,
        version: SchemaVersion,
        #[source]
        source: StepError,
    },
}

impl DocketError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DocketError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DocketError::DequeueTimeout { .. } | DocketError::LockTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_message_guides_the_operator() {
        let err = DocketError::LockTimeout {
            resource: "migration".into(),
            timeout: Duration::from_secs(1),
        };
        let msg = err.to_string();
        assert!(msg.contains("migration"));
        assert!(msg.contains("manually"));
        assert!(err.is_timeout());
    }

    #[test]
    fn store_errors_convert() {
        let err: DocketError = StoreError::Closed.into();
        assert!(matches!(err, DocketError::Store(StoreError::Closed)));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn migration_failure_keeps_its_source() {
        let err = DocketError::MigrationFailed {
            step: "add-index".into(),
            version: SchemaVersion::new(3),
            source: "boom".into(),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("add-index"));
    }
}
