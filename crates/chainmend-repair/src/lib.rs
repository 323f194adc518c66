pub mod backup;

use chainmend_core::{
    compaction_boundary, extract_metadata, parse_transcript, render_transcript, scope_start,
    validate_lines, BreakPoint, BreakPointSelector, BreakReason, Chain, CoreError, IdSource,
    ParsedLine, SplicePlan, UuidV4Source, DEFAULT_BREAK_INTERVAL, DEFAULT_MARKER,
    TIME_GAP_THRESHOLD_SECS,
};
use chrono::Duration;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use backup::{backup_path_for, create_backup, latest_backup, sha256_hex, write_atomic};

pub const NO_BREAK_POINTS_WARNING: &str =
    "no break points found: segment too short or already well-anchored";
pub const VALIDATION_SKIPPED_WARNING: &str = "validation skipped; repaired chain was not verified";

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("transcript {} is empty", .path.display())]
    EmptyInput { path: PathBuf },
    #[error("cannot read {}: {reason}", .path.display())]
    UnreadableFile { path: PathBuf, reason: String },
    #[error("no user record with a session id in {}", .path.display())]
    MissingMetadata { path: PathBuf },
    #[error("no linkable records in {}", .path.display())]
    EmptyChain { path: PathBuf },
    #[error("backup {} failed: {reason}", .path.display())]
    BackupFailed { path: PathBuf, reason: String },
    #[error("validation failed with {} error(s): {}", .errors.len(), .errors.join("; "))]
    ValidationFailed { errors: Vec<String> },
    #[error("cannot write {}: {reason}", .path.display())]
    WriteFailed { path: PathBuf, reason: String },
    #[error("no backup found for {}", .path.display())]
    NoBackup { path: PathBuf },
    #[error("core error: {0}")]
    Core(CoreError),
}

impl RepairError {
    fn from_core(path: &Path, err: CoreError) -> Self {
        let path = path.to_path_buf();
        match err {
            CoreError::EmptyInput => Self::EmptyInput { path },
            CoreError::MissingMetadata => Self::MissingMetadata { path },
            CoreError::EmptyChain => Self::EmptyChain { path },
            other => Self::Core(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStage {
    /// Report created; the file has not been read yet.
    Started,
    Parsed,
    MetadataExtracted,
    ChainBuilt,
    BreakPointsFound,
    DryRunReported,
    BackedUp,
    Inserted,
    Validated,
    Written,
    Done,
    Aborted,
}

impl RepairStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Parsed => "parsed",
            Self::MetadataExtracted => "metadata_extracted",
            Self::ChainBuilt => "chain_built",
            Self::BreakPointsFound => "break_points_found",
            Self::DryRunReported => "dry_run_reported",
            Self::BackedUp => "backed_up",
            Self::Inserted => "inserted",
            Self::Validated => "validated",
            Self::Written => "written",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RepairStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RepairOptions {
    pub dry_run: bool,
    pub interval: usize,
    pub verify: bool,
    pub marker: String,
    pub time_gap_secs: i64,
    /// Where backups go; `None` keeps them next to the transcript.
    pub backup_dir: Option<PathBuf>,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            interval: DEFAULT_BREAK_INTERVAL,
            verify: true,
            marker: DEFAULT_MARKER.to_string(),
            time_gap_secs: TIME_GAP_THRESHOLD_SECS,
            backup_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakPointLocation {
    pub chain_index: usize,
    /// 1-based line of the anchor record in the original file.
    pub line: Option<usize>,
    pub timestamp: Option<String>,
    pub reason: BreakReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub path: PathBuf,
    pub stage: RepairStage,
    /// Last stage reached before an abort.
    pub aborted_after: Option<RepairStage>,
    pub dry_run: bool,
    pub records: usize,
    pub malformed_lines: usize,
    pub chain_len: usize,
    pub inserted: usize,
    pub break_points: Vec<BreakPointLocation>,
    pub backup_path: Option<PathBuf>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl RepairReport {
    fn new(path: &Path, dry_run: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            stage: RepairStage::Started,
            aborted_after: None,
            dry_run,
            records: 0,
            malformed_lines: 0,
            chain_len: 0,
            inserted: 0,
            break_points: Vec::new(),
            backup_path: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    fn advance(&mut self, stage: RepairStage) {
        debug!(event = "repair_stage", from = %self.stage, to = %stage);
        self.stage = stage;
    }
}

/// Sequences parse → metadata → chain → break points → backup → splice →
/// validate → write for one transcript file. Failures never escape: they end
/// up in the returned report.
pub struct TranscriptRepairer {
    options: RepairOptions,
    ids: Box<dyn IdSource>,
}

impl TranscriptRepairer {
    pub fn new(options: RepairOptions) -> Self {
        Self::with_id_source(options, Box::new(UuidV4Source))
    }

    pub fn with_id_source(options: RepairOptions, ids: Box<dyn IdSource>) -> Self {
        Self { options, ids }
    }

    pub fn options(&self) -> &RepairOptions {
        &self.options
    }

    pub fn repair(&mut self, path: impl AsRef<Path>) -> RepairReport {
        let path = path.as_ref();
        let mut report = RepairReport::new(path, self.options.dry_run);

        match self.run(path, &mut report) {
            Ok(()) => report.advance(RepairStage::Done),
            Err(err) => {
                warn!(
                    event = "repair_aborted",
                    path = %path.display(),
                    stage = %report.stage,
                    error = %err
                );
                report.aborted_after = Some(report.stage);
                report.errors.push(err.to_string());
                report.advance(RepairStage::Aborted);
            }
        }

        report
    }

    fn run(&mut self, path: &Path, report: &mut RepairReport) -> Result<(), RepairError> {
        let (bytes, lines) = read_transcript(path)?;
        report.records = lines.len();
        report.malformed_lines = lines.iter().filter(|line| line.is_malformed()).count();
        report.advance(RepairStage::Parsed);

        let metadata = extract_metadata(&lines).map_err(|err| RepairError::from_core(path, err))?;
        report.advance(RepairStage::MetadataExtracted);

        let chain = Chain::build(&lines).map_err(|err| RepairError::from_core(path, err))?;
        report.chain_len = chain.len();
        if chain.cycle_detected() {
            report
                .warnings
                .push("parent cycle detected; chain walk stopped at the repeat".to_string());
        }
        report.advance(RepairStage::ChainBuilt);

        let boundary = compaction_boundary(&lines);
        let break_points = BreakPointSelector::new(self.options.interval)
            .with_time_gap(Duration::seconds(self.options.time_gap_secs))
            .select(&chain, scope_start(&chain, boundary));
        report.break_points = locate(&lines, &chain, &break_points);
        report.advance(RepairStage::BreakPointsFound);

        if break_points.is_empty() {
            report.warnings.push(NO_BREAK_POINTS_WARNING.to_string());
            return Ok(());
        }

        if self.options.dry_run {
            report.inserted = break_points.len();
            report.advance(RepairStage::DryRunReported);
            return Ok(());
        }

        let backup_path = create_backup(path, self.options.backup_dir.as_deref(), &bytes)?;
        report.backup_path = Some(backup_path);
        report.advance(RepairStage::BackedUp);

        let plan = SplicePlan::build(
            &lines,
            &chain,
            &break_points,
            &metadata,
            &self.options.marker,
            boundary,
            self.ids.as_mut(),
        );
        for anchor in plan.anchors() {
            debug!(
                event = "anchor_planned",
                chain_index = anchor.chain_index,
                uuid = %anchor.uuid,
                reparented = %anchor.reparented
            );
        }
        let outcome = plan
            .apply(&lines)
            .map_err(|err| RepairError::from_core(path, err))?;
        report.advance(RepairStage::Inserted);

        if self.options.verify {
            let validation = validate_lines(&outcome.lines);
            if !validation.passed() {
                return Err(RepairError::ValidationFailed {
                    errors: validation.errors,
                });
            }
            report.advance(RepairStage::Validated);
        } else {
            report.warnings.push(VALIDATION_SKIPPED_WARNING.to_string());
        }

        write_atomic(path, &render_transcript(&outcome.lines))?;
        report.inserted = outcome.inserted;
        report.advance(RepairStage::Written);
        info!(
            event = "repair_committed",
            path = %path.display(),
            inserted = outcome.inserted,
            records = outcome.lines.len()
        );

        Ok(())
    }
}

fn read_transcript(path: &Path) -> Result<(Vec<u8>, Vec<ParsedLine>), RepairError> {
    let unreadable = |reason: String| RepairError::UnreadableFile {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = fs::read(path).map_err(|err| unreadable(err.to_string()))?;
    let text = std::str::from_utf8(&bytes).map_err(|err| unreadable(err.to_string()))?;
    let lines = parse_transcript(text).map_err(|err| RepairError::from_core(path, err))?;
    Ok((bytes, lines))
}

fn locate(
    lines: &[ParsedLine],
    chain: &Chain,
    break_points: &[BreakPoint],
) -> Vec<BreakPointLocation> {
    break_points
        .iter()
        .filter_map(|point| {
            let link = chain.get(point.chain_index)?;
            Some(BreakPointLocation {
                chain_index: point.chain_index,
                line: lines.get(link.line_index).and_then(ParsedLine::source_line),
                timestamp: link.timestamp_raw.clone(),
                reason: point.reason,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub path: PathBuf,
    pub records: usize,
    pub malformed_lines: usize,
    pub chain_len: usize,
    pub cycle_detected: bool,
    /// 1-based line of the most recent compaction boundary.
    pub compaction_boundary_line: Option<usize>,
    /// Chain records that already carry the marker as their content.
    pub existing_anchors: usize,
    pub validation_errors: Vec<String>,
}

impl CheckReport {
    pub fn is_valid(&self) -> bool {
        self.validation_errors.is_empty()
    }
}

/// Read-only structural inspection of a transcript.
pub fn check_transcript(path: &Path, marker: &str) -> Result<CheckReport, RepairError> {
    let (_, lines) = read_transcript(path)?;
    let chain = Chain::build(&lines).map_err(|err| RepairError::from_core(path, err))?;

    let existing_anchors = chain
        .links()
        .iter()
        .filter_map(|link| lines.get(link.line_index).and_then(ParsedLine::record))
        .filter(|record| record.message_text() == Some(marker))
        .count();
    let compaction_boundary_line = compaction_boundary(&lines)
        .and_then(|index| lines.get(index))
        .and_then(ParsedLine::source_line);

    Ok(CheckReport {
        path: path.to_path_buf(),
        records: lines.len(),
        malformed_lines: lines.iter().filter(|line| line.is_malformed()).count(),
        chain_len: chain.len(),
        cycle_detected: chain.cycle_detected(),
        compaction_boundary_line,
        existing_anchors,
        validation_errors: validate_lines(&lines).errors,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub path: PathBuf,
    pub backup_path: PathBuf,
    pub records: usize,
}

/// Replaces `path` with its most recent backup.
pub fn restore_latest_backup(
    path: &Path,
    backup_dir: Option<&Path>,
) -> Result<RestoreReport, RepairError> {
    let backup_path = latest_backup(path, backup_dir)
        .map_err(|err| RepairError::UnreadableFile {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?
        .ok_or_else(|| RepairError::NoBackup {
            path: path.to_path_buf(),
        })?;

    let (bytes, lines) = read_transcript(&backup_path)?;
    let text = String::from_utf8(bytes).map_err(|err| RepairError::UnreadableFile {
        path: backup_path.clone(),
        reason: err.to_string(),
    })?;
    write_atomic(path, &text)?;
    info!(
        event = "backup_restored",
        path = %path.display(),
        backup = %backup_path.display()
    );

    Ok(RestoreReport {
        path: path.to_path_buf(),
        backup_path,
        records: lines.len(),
    })
}
