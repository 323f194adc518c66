use crate::record::{ParsedLine, RecordKind, TURN_BOUNDARY_SUBTYPE};
use crate::CoreError;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ChainLink {
    /// Index into the parsed line list, not a 1-based file line.
    pub line_index: usize,
    pub uuid: String,
    pub kind: RecordKind,
    pub subtype: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub timestamp_raw: Option<String>,
}

impl ChainLink {
    pub fn is_assistant(&self) -> bool {
        self.kind == RecordKind::Assistant
    }

    pub fn is_turn_boundary(&self) -> bool {
        self.kind == RecordKind::System && self.subtype.as_deref() == Some(TURN_BOUNDARY_SUBTYPE)
    }
}

/// The conversational path a rewind UI would traverse, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chain {
    links: Vec<ChainLink>,
    cycle_detected: bool,
}

impl Chain {
    pub fn build(lines: &[ParsedLine]) -> Result<Self, CoreError> {
        let mut by_uuid: HashMap<&str, usize> = HashMap::new();
        let mut tail = None;
        for (index, line) in lines.iter().enumerate() {
            if let Some(uuid) = line.uuid() {
                by_uuid.entry(uuid).or_insert(index);
                tail = Some(index);
            }
        }
        let tail = tail.ok_or(CoreError::EmptyChain)?;

        let mut visited: HashSet<&str> = HashSet::new();
        let mut links = Vec::new();
        let mut cycle_detected = false;
        let mut cursor = Some(tail);

        while let Some(index) = cursor {
            let Some(record) = lines[index].record() else {
                break;
            };
            let Some(uuid) = record.uuid() else {
                break;
            };
            if !visited.insert(uuid) {
                cycle_detected = true;
                debug!(event = "chain_cycle", uuid = uuid, line_index = index);
                break;
            }

            links.push(ChainLink {
                line_index: index,
                uuid: uuid.to_string(),
                kind: record.kind().clone(),
                subtype: record.subtype().map(ToString::to_string),
                timestamp: record.timestamp(),
                timestamp_raw: record.timestamp_raw().map(ToString::to_string),
            });

            cursor = record
                .parent_uuid()
                .and_then(|parent| by_uuid.get(parent).copied());
        }

        if links.is_empty() {
            return Err(CoreError::EmptyChain);
        }
        links.reverse();

        Ok(Self {
            links,
            cycle_detected,
        })
    }

    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    pub fn get(&self, index: usize) -> Option<&ChainLink> {
        self.links.get(index)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn tail(&self) -> Option<&ChainLink> {
        self.links.last()
    }

    pub fn cycle_detected(&self) -> bool {
        self.cycle_detected
    }
}

/// Line index of the most recent compaction-boundary system record.
pub fn compaction_boundary(lines: &[ParsedLine]) -> Option<usize> {
    lines.iter().rposition(|line| {
        line.record()
            .map(|record| record.is_compact_boundary())
            .unwrap_or(false)
    })
}
