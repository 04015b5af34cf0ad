//! Domain types for report change history: record kinds, versioned rows, ledger events,
//! and the pure preconditions checked before a revert.

mod alteration;
mod error;
mod history;
mod ids;
mod kind;
mod record;

pub use alteration::AlterationKey;
pub use error::{HistoryError, HistoryErrorKind};
pub use history::{
    ChangeHistoryEvent, ChangeRecord, DataHistoryEntry, DeleteRevertCheck, EventType,
    CHANGE_HISTORY_TYPE,
};
pub use ids::{ActorId, ChangeSeq, EntryIdent, HistoryIdent, ReportId};
pub use kind::{EntityKind, VariantRef, RESERVED_COLUMNS};
pub use record::{Content, RowSnapshot, VersionedRow};
