use crate::breakpoints::BreakPoint;
use crate::chain::Chain;
use crate::metadata::SessionMetadata;
use crate::record::{ParsedLine, TranscriptRecord};
use crate::CoreError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

pub trait IdSource {
    fn next_id(&mut self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV4Source;

impl IdSource for UuidV4Source {
    fn next_id(&mut self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticAnchor {
    pub chain_index: usize,
    /// Line index the anchor record is spliced after.
    pub after_line: usize,
    pub uuid: String,
    /// Uuid of the chain successor whose parent becomes `uuid`.
    pub reparented: String,
    pub record: TranscriptRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpliceOutcome {
    pub lines: Vec<ParsedLine>,
    pub inserted: usize,
}

/// Insertions are chain-relative while the rewrite is file-relative, so every
/// anchor and reparenting is planned before any line is emitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplicePlan {
    anchors: Vec<SyntheticAnchor>,
}

impl SplicePlan {
    pub fn build(
        lines: &[ParsedLine],
        chain: &Chain,
        break_points: &[BreakPoint],
        metadata: &SessionMetadata,
        marker: &str,
        compaction_boundary: Option<usize>,
        ids: &mut dyn IdSource,
    ) -> Self {
        let mut anchors = Vec::with_capacity(break_points.len());

        for point in break_points {
            let (Some(anchor), Some(successor)) = (
                chain.get(point.chain_index),
                chain.get(point.chain_index + 1),
            ) else {
                continue;
            };
            if compaction_boundary.is_some_and(|boundary| {
                anchor.line_index <= boundary || successor.line_index <= boundary
            }) {
                debug!(
                    event = "splice_skipped_compacted",
                    chain_index = point.chain_index
                );
                continue;
            }
            let anchor_record = lines.get(anchor.line_index).and_then(ParsedLine::record);
            let successor_record = lines.get(successor.line_index).and_then(ParsedLine::record);
            let (Some(anchor_record), Some(successor_record)) = (anchor_record, successor_record)
            else {
                continue;
            };
            let (Some(anchor_uuid), Some(successor_uuid)) =
                (anchor_record.uuid(), successor_record.uuid())
            else {
                continue;
            };

            let uuid = ids.next_id();
            let timestamp = midpoint(anchor_record.timestamp(), successor_record.timestamp());
            let Some(record) = synthetic_record(&uuid, anchor_uuid, timestamp, metadata, marker)
            else {
                continue;
            };

            anchors.push(SyntheticAnchor {
                chain_index: point.chain_index,
                after_line: anchor.line_index,
                uuid,
                reparented: successor_uuid.to_string(),
                record,
            });
        }

        Self { anchors }
    }

    pub fn anchors(&self) -> &[SyntheticAnchor] {
        &self.anchors
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn apply(&self, lines: &[ParsedLine]) -> Result<SpliceOutcome, CoreError> {
        let reparent: HashMap<&str, &str> = self
            .anchors
            .iter()
            .map(|anchor| (anchor.reparented.as_str(), anchor.uuid.as_str()))
            .collect();
        let mut splices: HashMap<usize, Vec<&SyntheticAnchor>> = HashMap::new();
        for anchor in &self.anchors {
            splices.entry(anchor.after_line).or_default().push(anchor);
        }

        let mut output = Vec::with_capacity(lines.len() + self.anchors.len());
        let mut inserted = 0usize;

        for (index, line) in lines.iter().enumerate() {
            let new_parent = line
                .record()
                .and_then(|record| record.uuid().and_then(|uuid| reparent.get(uuid)));
            match (line.record(), new_parent) {
                (Some(record), Some(parent)) => {
                    output.push(line.rewritten(record.with_parent(parent))?);
                }
                _ => output.push(line.clone()),
            }

            if let Some(anchors) = splices.get(&index) {
                for anchor in anchors {
                    output.push(
                        ParsedLine::from_record(anchor.record.clone())?.with_line_ending_of(line),
                    );
                    inserted += 1;
                }
            }
        }

        Ok(SpliceOutcome {
            lines: output,
            inserted,
        })
    }
}

fn midpoint(left: Option<DateTime<Utc>>, right: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match (left, right) {
        (Some(left), Some(right)) => left + (right - left) / 2,
        (Some(single), None) | (None, Some(single)) => single,
        (None, None) => Utc::now(),
    }
}

fn synthetic_record(
    uuid: &str,
    parent: &str,
    timestamp: DateTime<Utc>,
    metadata: &SessionMetadata,
    marker: &str,
) -> Option<TranscriptRecord> {
    let mut fields = Map::new();
    fields.insert("parentUuid".to_string(), json!(parent));
    fields.insert("isSidechain".to_string(), json!(false));
    fields.insert("userType".to_string(), json!("external"));
    fields.insert("cwd".to_string(), json!(metadata.cwd));
    fields.insert("sessionId".to_string(), json!(metadata.session_id));
    fields.insert("version".to_string(), json!(metadata.version));
    if let Some(branch) = &metadata.git_branch {
        fields.insert("gitBranch".to_string(), json!(branch));
    }
    if let Some(slug) = &metadata.slug {
        fields.insert("slug".to_string(), json!(slug));
    }
    fields.insert("type".to_string(), json!("user"));
    fields.insert(
        "message".to_string(),
        json!({"role": "user", "content": marker}),
    );
    fields.insert("uuid".to_string(), json!(uuid));
    fields.insert(
        "timestamp".to_string(),
        Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    TranscriptRecord::from_fields(fields)
}
