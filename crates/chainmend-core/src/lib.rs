pub mod breakpoints;
pub mod chain;
pub mod metadata;
pub mod record;
pub mod splice;
pub mod validate;

pub use breakpoints::{
    scope_start, BreakPoint, BreakPointSelector, BreakReason, DEFAULT_BREAK_INTERVAL,
    TIME_GAP_THRESHOLD_SECS,
};
pub use chain::{compaction_boundary, Chain, ChainLink};
pub use metadata::{extract_metadata, SessionMetadata, DEFAULT_VERSION};
pub use record::{
    parse_transcript, render_transcript, ParsedLine, RecordKind, TranscriptRecord,
    COMPACT_BOUNDARY_SUBTYPE, TURN_BOUNDARY_SUBTYPE,
};
pub use splice::{IdSource, SpliceOutcome, SplicePlan, SyntheticAnchor, UuidV4Source};
pub use validate::{validate_lines, ValidationReport};

use thiserror::Error;

pub const DEFAULT_MARKER: &str = "⚓";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transcript is empty")]
    EmptyInput,
    #[error("no user record carries a session id")]
    MissingMetadata,
    #[error("no record carries a uuid; nothing to link")]
    EmptyChain,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
