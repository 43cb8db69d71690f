//! Paging and sorting types shared by storage backends.

use serde::{Deserialize, Serialize};

/// Zero-based window into a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

impl Page {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    /// Page that starts at `offset` with no effective limit.
    pub fn from_offset(offset: u64) -> Self {
        Self {
            offset,
            limit: u64::MAX,
        }
    }

    /// Offset of the row following this page.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, 10)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// One key of an ORDER BY clause, expressed as a column name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub column: String,
    pub direction: SortDirection,
}

impl SortSpec {
    #[must_use]
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Asc,
        }
    }

    #[must_use]
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Desc,
        }
    }
}
