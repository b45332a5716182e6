//! ストアエラーの分類
//!
//! `DocumentStore` が返す失敗は次のいずれか:
//! - Transient: 一時的な失敗。競合時と同じ間隔でリトライする
//! - Permanent: 現在の構成ではストアが要求に応えられない
//! - Infrastructure: ストアが使えない（停止済み、恒久的に切断）

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store does not support {0}")]
    Unsupported(String),

    #[error("store is closed")]
    Closed,
}

impl StoreError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn unsupported(capability: impl Into<String>) -> Self {
        Self::Unsupported(capability.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Transient(_) => ErrorKind::Transient,
            StoreError::Unsupported(_) => ErrorKind::Permanent,
            StoreError::Closed => ErrorKind::Infrastructure,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// リトライしても解決しない
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(StoreError::transient("timeout").is_transient());
        assert!(StoreError::unsupported("change streams").is_fatal());
        assert_eq!(StoreError::Closed.kind(), ErrorKind::Infrastructure);
    }
}
