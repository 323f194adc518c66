use crate::record::{ParsedLine, RecordKind};
use crate::CoreError;
use serde::Serialize;

pub const DEFAULT_VERSION: &str = "1";

/// Session identity copied onto every synthetic record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub version: String,
    pub cwd: String,
    pub git_branch: Option<String>,
    pub slug: Option<String>,
}

pub fn extract_metadata(lines: &[ParsedLine]) -> Result<SessionMetadata, CoreError> {
    let record = lines
        .iter()
        .filter_map(ParsedLine::record)
        .find(|record| *record.kind() == RecordKind::User && record.session_id().is_some())
        .ok_or(CoreError::MissingMetadata)?;

    Ok(SessionMetadata {
        session_id: record.session_id().unwrap_or_default().to_string(),
        version: record.version().unwrap_or(DEFAULT_VERSION).to_string(),
        cwd: record.cwd().unwrap_or_default().to_string(),
        git_branch: record.git_branch().map(ToString::to_string),
        slug: record.slug().map(ToString::to_string),
    })
}
