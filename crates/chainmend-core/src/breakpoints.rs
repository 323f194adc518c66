use crate::chain::{Chain, ChainLink};
use chrono::Duration;
use serde::Serialize;

pub const DEFAULT_BREAK_INTERVAL: usize = 5;
pub const TIME_GAP_THRESHOLD_SECS: i64 = 60;
const MIN_BREAK_SPACING: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakReason {
    Interval,
    TurnBoundary,
    TimeGap,
}

impl BreakReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::TurnBoundary => "turn_boundary",
            Self::TimeGap => "time_gap",
        }
    }
}

/// Chain position after which a synthetic anchor is spliced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakPoint {
    pub chain_index: usize,
    pub reason: BreakReason,
}

#[derive(Debug, Clone)]
pub struct BreakPointSelector {
    interval: usize,
    time_gap: Duration,
}

impl Default for BreakPointSelector {
    fn default() -> Self {
        Self::new(DEFAULT_BREAK_INTERVAL)
    }
}

impl BreakPointSelector {
    pub fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
            time_gap: Duration::seconds(TIME_GAP_THRESHOLD_SECS),
        }
    }

    /// Pauses longer than `time_gap` between chain neighbours propose a break.
    pub fn with_time_gap(mut self, time_gap: Duration) -> Self {
        self.time_gap = time_gap;
        self
    }

    /// Walks the chain from `scope_start` and returns accepted break points in
    /// ascending chain order. Every accepted position has an assistant record
    /// as its chain successor and sits at least two positions after the
    /// previous one.
    pub fn select(&self, chain: &Chain, scope_start: usize) -> Vec<BreakPoint> {
        let links = chain.links();
        let mut accepted: Vec<BreakPoint> = Vec::new();
        let mut assistants_since_break = 0usize;

        for index in scope_start..links.len() {
            let link = &links[index];
            let mut proposal = None;

            if link.is_assistant() {
                assistants_since_break += 1;
                if assistants_since_break >= self.interval {
                    proposal = Some((index.saturating_sub(1), BreakReason::Interval));
                }
            }
            if proposal.is_none() && link.is_turn_boundary() {
                proposal = Some((index, BreakReason::TurnBoundary));
            }
            if proposal.is_none()
                && index > scope_start
                && self.exceeds_gap(&links[index - 1], link)
            {
                proposal = Some((index - 1, BreakReason::TimeGap));
            }

            let Some((candidate, reason)) = proposal else {
                continue;
            };
            let Some(position) = snap_forward(links, candidate.max(scope_start)) else {
                continue;
            };
            if accepted
                .last()
                .is_some_and(|last| position < last.chain_index + MIN_BREAK_SPACING)
            {
                continue;
            }

            accepted.push(BreakPoint {
                chain_index: position,
                reason,
            });
            assistants_since_break = 0;
        }

        accepted
    }

    fn exceeds_gap(&self, previous: &ChainLink, current: &ChainLink) -> bool {
        match (previous.timestamp, current.timestamp) {
            (Some(previous), Some(current)) => current - previous > self.time_gap,
            _ => false,
        }
    }
}

/// Position just after the last chain link whose file line is at or before
/// the compaction boundary, or 0 without a boundary. Returns `chain.len()`
/// when the chain ends at or before the boundary.
pub fn scope_start(chain: &Chain, boundary: Option<usize>) -> usize {
    let Some(boundary) = boundary else {
        return 0;
    };
    chain
        .links()
        .iter()
        .rposition(|link| link.line_index <= boundary)
        .map_or(0, |position| position + 1)
}

/// Anchors are only reachable when their chain child is an assistant turn.
fn snap_forward(links: &[ChainLink], from: usize) -> Option<usize> {
    (from..links.len().saturating_sub(1)).find(|&position| links[position + 1].is_assistant())
}
