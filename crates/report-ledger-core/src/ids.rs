use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::HistoryError;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = HistoryError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    HistoryError::validation(format!("invalid {} `{raw}`: {err}", $label))
                })
            }
        }
    };
}

ulid_id!(
    /// Stable identity of a report-scoped record, constant across data versions.
    EntryIdent,
    "entry ident"
);
ulid_id!(ReportId, "report id");
ulid_id!(
    /// Identity of one legacy data-history entry.
    HistoryIdent,
    "history ident"
);

/// Position of an event in the change-history ledger.
///
/// Assigned by storage on insert and strictly increasing, so it orders events
/// independently of wall-clock timestamps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ChangeSeq(pub i64);

impl Display for ChangeSeq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    /// # Errors
    /// Returns [`HistoryError::Validation`] when the actor id is blank.
    pub fn new(raw: impl Into<String>) -> Result<Self, HistoryError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(HistoryError::validation("actor id MUST be provided for every write"));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
