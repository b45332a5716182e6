//! 永続化されたスキーマバージョン

use serde::{Deserialize, Serialize};
use std::fmt;

/// 永続化レイアウトの順序付きバージョン。ストアの寿命の間、減ることはない
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(pub u32);

impl SchemaVersion {
    /// 空のストアのバージョン
    pub const EMPTY: SchemaVersion = SchemaVersion(0);

    pub fn new(version: u32) -> Self {
        Self(version)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u32> for SchemaVersion {
    fn from(version: u32) -> Self {
        Self(version)
    }
}
