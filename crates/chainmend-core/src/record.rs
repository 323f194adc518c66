use crate::CoreError;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;

pub const TURN_BOUNDARY_SUBTYPE: &str = "turn_duration";
pub const COMPACT_BOUNDARY_SUBTYPE: &str = "compact_boundary";

const UUID_KEYS: [&str; 2] = ["uuid", "id"];
const PARENT_KEYS: [&str; 2] = ["parentUuid", "parentId"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    User,
    Assistant,
    System,
    Summary,
    FileHistorySnapshot,
    Other(String),
}

impl RecordKind {
    pub fn parse(value: &str) -> Self {
        match value {
            "user" | "human" => Self::User,
            "assistant" => Self::Assistant,
            "system" => Self::System,
            "summary" => Self::Summary,
            "file-history-snapshot" => Self::FileHistorySnapshot,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Summary => "summary",
            Self::FileHistorySnapshot => "file-history-snapshot",
            Self::Other(value) => value.as_str(),
        }
    }

    pub fn is_noise(&self) -> bool {
        matches!(self, Self::Summary | Self::FileHistorySnapshot)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded transcript line. The full JSON object is kept so a rewritten
/// record carries every field it was read with.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptRecord {
    fields: Map<String, Value>,
    kind: RecordKind,
}

impl TranscriptRecord {
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Self::from_fields(fields),
            _ => None,
        }
    }

    pub fn from_fields(fields: Map<String, Value>) -> Option<Self> {
        let kind = fields
            .get("type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(RecordKind::parse)?;
        Some(Self { fields, kind })
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    pub fn uuid(&self) -> Option<&str> {
        self.first_str(&UUID_KEYS)
    }

    pub fn parent_uuid(&self) -> Option<&str> {
        self.first_str(&PARENT_KEYS)
    }

    pub fn subtype(&self) -> Option<&str> {
        self.first_str(&["subtype"])
    }

    pub fn timestamp_raw(&self) -> Option<&str> {
        self.first_str(&["timestamp"])
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp_raw().and_then(parse_timestamp)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.first_str(&["sessionId"])
    }

    pub fn version(&self) -> Option<&str> {
        self.first_str(&["version"])
    }

    pub fn cwd(&self) -> Option<&str> {
        self.first_str(&["cwd", "workingDirectory"])
    }

    pub fn git_branch(&self) -> Option<&str> {
        self.first_str(&["gitBranch", "branch"])
    }

    pub fn slug(&self) -> Option<&str> {
        self.first_str(&["slug"])
    }

    /// Plain-string message content. Block-list content yields `None`.
    pub fn message_text(&self) -> Option<&str> {
        self.fields
            .get("message")
            .and_then(Value::as_object)
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
    }

    pub fn is_assistant(&self) -> bool {
        self.kind == RecordKind::Assistant
    }

    pub fn is_turn_boundary(&self) -> bool {
        self.kind == RecordKind::System && self.subtype() == Some(TURN_BOUNDARY_SUBTYPE)
    }

    pub fn is_compact_boundary(&self) -> bool {
        self.kind == RecordKind::System && self.subtype() == Some(COMPACT_BOUNDARY_SUBTYPE)
    }

    /// Copy of this record pointing at `parent`. The key the record was read
    /// with is reused; records that had neither key get `parentUuid`.
    pub fn with_parent(&self, parent: &str) -> Self {
        let key = PARENT_KEYS
            .iter()
            .find(|key| self.fields.contains_key(**key))
            .copied()
            .unwrap_or(PARENT_KEYS[0]);
        let mut fields = self.fields.clone();
        fields.insert(key.to_string(), Value::String(parent.to_string()));
        Self {
            fields,
            kind: self.kind.clone(),
        }
    }

    pub fn to_json_line(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(&self.fields)?)
    }

    fn first_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| {
            self.fields
                .get(*key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
        })
    }
}

/// One non-blank source line. The bytes around the content (blank lines
/// before it and its terminator) are kept so untouched lines render back
/// exactly as read.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    raw: String,
    source_line: Option<usize>,
    record: Option<TranscriptRecord>,
    leading: String,
    ending: String,
}

impl ParsedLine {
    pub fn parse(raw: &str, source_line: usize) -> Self {
        let record = serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(TranscriptRecord::from_value);
        Self {
            raw: raw.to_string(),
            source_line: Some(source_line),
            record,
            leading: String::new(),
            ending: "\n".to_string(),
        }
    }

    /// A line produced by the engine rather than read from disk.
    pub fn from_record(record: TranscriptRecord) -> Result<Self, CoreError> {
        Ok(Self {
            raw: record.to_json_line()?,
            source_line: None,
            record: Some(record),
            leading: String::new(),
            ending: "\n".to_string(),
        })
    }

    /// Same source position and surrounding bytes, new content.
    pub fn rewritten(&self, record: TranscriptRecord) -> Result<Self, CoreError> {
        Ok(Self {
            raw: record.to_json_line()?,
            source_line: self.source_line,
            record: Some(record),
            leading: self.leading.clone(),
            ending: self.ending.clone(),
        })
    }

    /// Uses the terminator style of `neighbour`, so lines spliced into a CRLF
    /// file stay CRLF.
    pub fn with_line_ending_of(mut self, neighbour: &ParsedLine) -> Self {
        self.ending = neighbour.line_ending().to_string();
        self
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// `\r\n` or `\n`; an unterminated last line counts as `\n`.
    pub fn line_ending(&self) -> &'static str {
        if self.ending.starts_with("\r\n") {
            "\r\n"
        } else {
            "\n"
        }
    }

    /// 1-based line number in the file this line was read from.
    pub fn source_line(&self) -> Option<usize> {
        self.source_line
    }

    pub fn record(&self) -> Option<&TranscriptRecord> {
        self.record.as_ref()
    }

    pub fn is_malformed(&self) -> bool {
        self.record.is_none()
    }

    pub fn uuid(&self) -> Option<&str> {
        self.record.as_ref().and_then(TranscriptRecord::uuid)
    }

    pub fn parent_uuid(&self) -> Option<&str> {
        self.record.as_ref().and_then(TranscriptRecord::parent_uuid)
    }
}

/// Splits on `\n`, keeping `\r\n` terminators and blank lines attached to the
/// surrounding records instead of dropping them.
pub fn parse_transcript(text: &str) -> Result<Vec<ParsedLine>, CoreError> {
    let mut lines: Vec<ParsedLine> = Vec::new();
    let mut blank_run = String::new();

    for (index, chunk) in text.split_inclusive('\n').enumerate() {
        let (content, ending) = split_line_ending(chunk);
        if content.trim().is_empty() {
            blank_run.push_str(chunk);
            continue;
        }
        let mut line = ParsedLine::parse(content, index + 1);
        line.leading = std::mem::take(&mut blank_run);
        line.ending = ending.to_string();
        lines.push(line);
    }

    let Some(last) = lines.last_mut() else {
        return Err(CoreError::EmptyInput);
    };
    last.ending.push_str(&blank_run);
    Ok(lines)
}

pub fn render_transcript(lines: &[ParsedLine]) -> String {
    let capacity = lines
        .iter()
        .map(|line| line.leading.len() + line.raw.len() + line.ending.len() + 1)
        .sum();
    let mut output = String::with_capacity(capacity);
    for (position, line) in lines.iter().enumerate() {
        output.push_str(&line.leading);
        output.push_str(&line.raw);
        output.push_str(&line.ending);
        // An unterminated source tail that is no longer last.
        if !line.ending.ends_with('\n') && position + 1 < lines.len() {
            output.push_str(line.line_ending());
        }
    }
    output
}

fn split_line_ending(chunk: &str) -> (&str, &str) {
    if let Some(content) = chunk.strip_suffix("\r\n") {
        (content, "\r\n")
    } else if let Some(content) = chunk.strip_suffix('\n') {
        (content, "\n")
    } else {
        (chunk, "")
    }
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|datetime| datetime.with_timezone(&Utc))
}
