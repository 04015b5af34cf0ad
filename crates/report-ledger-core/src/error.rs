use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Domain failures raised by the ledger, versioning, and revert operations.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HistoryError {
    /// Bad or missing caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// A referenced version, history entry, or ledger event does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A precondition was violated; nothing was mutated.
    #[error("integrity error: {0}")]
    Integrity(String),
}

impl HistoryError {
    #[must_use]
    pub fn kind(&self) -> HistoryErrorKind {
        match self {
            Self::Validation(_) => HistoryErrorKind::Validation,
            Self::NotFound(_) => HistoryErrorKind::NotFound,
            Self::Integrity(_) => HistoryErrorKind::Integrity,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }
}

/// Error category reported to callers. `Storage` covers every failure that carries no
/// [`HistoryError`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HistoryErrorKind {
    Validation,
    NotFound,
    Integrity,
    Storage,
}

impl HistoryErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Integrity => "integrity",
            Self::Storage => "storage",
        }
    }
}

impl Display for HistoryErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
