use chainmend_core::{
    parse_transcript, validate_lines, BreakReason, Chain, IdSource, COMPACT_BOUNDARY_SUBTYPE,
};
use chainmend_repair::{
    check_transcript, restore_latest_backup, RepairOptions, RepairStage, TranscriptRepairer,
    NO_BREAK_POINTS_WARNING, VALIDATION_SKIPPED_WARNING,
};
use chrono::{Duration, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn stamp(offset_secs: i64) -> String {
    (Utc.with_ymd_and_hms(2026, 2, 23, 12, 0, 0)
        .single()
        .expect("valid timestamp")
        + Duration::seconds(offset_secs))
    .to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn entry(uuid: &str, parent: Option<&str>, kind: &str, offset_secs: i64) -> Value {
    json!({
        "parentUuid": parent,
        "isSidechain": false,
        "userType": "external",
        "cwd": "/work/project",
        "sessionId": "sess-1",
        "version": "2.0.14",
        "gitBranch": "main",
        "type": kind,
        "message": {"role": kind, "content": format!("{kind} {uuid}")},
        "uuid": uuid,
        "timestamp": stamp(offset_secs),
    })
}

fn alternating(count: usize) -> Vec<Value> {
    (0..count)
        .map(|index| {
            let uuid = format!("u-{index}");
            let parent = index.checked_sub(1).map(|prev| format!("u-{prev}"));
            let kind = if index % 2 == 0 { "user" } else { "assistant" };
            entry(&uuid, parent.as_deref(), kind, index as i64 * 10)
        })
        .collect()
}

fn write_transcript(dir: &TempDir, values: &[Value]) -> PathBuf {
    let mut text = String::new();
    for value in values {
        text.push_str(&value.to_string());
        text.push('\n');
    }
    let path = dir.path().join("sess-1.jsonl");
    fs::write(&path, text).expect("write transcript");
    path
}

fn backups_in(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .expect("read dir")
        .map(|entry| entry.expect("entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("bak"))
        .collect()
}

fn options(interval: usize) -> RepairOptions {
    RepairOptions {
        interval,
        ..RepairOptions::default()
    }
}

struct FixedIds(&'static str);

impl IdSource for FixedIds {
    fn next_id(&mut self) -> String {
        self.0.to_string()
    }
}

#[test]
fn interval_repair_inserts_one_anchor_and_keeps_chain_sound() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(&dir, &alternating(7));
    let original = fs::read_to_string(&path).expect("read original");

    let report = TranscriptRepairer::new(options(3)).repair(&path);

    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(report.stage, RepairStage::Done);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.break_points.len(), 1);
    assert_eq!(report.break_points[0].line, Some(5));

    let backup = report.backup_path.clone().expect("backup path");
    assert_eq!(fs::read_to_string(&backup).expect("read backup"), original);

    let repaired = fs::read_to_string(&path).expect("read repaired");
    assert!(repaired.ends_with('\n'));
    let lines = parse_transcript(&repaired).expect("parse repaired");
    assert_eq!(lines.len(), 7 + 1);
    assert!(validate_lines(&lines).passed());

    let anchor = lines[5].record().expect("anchor record");
    assert_eq!(anchor.parent_uuid(), Some("u-4"));
    assert_eq!(anchor.message_text(), Some("⚓"));
    assert_eq!(anchor.session_id(), Some("sess-1"));
    assert_eq!(lines[6].parent_uuid(), anchor.uuid());

    let chain = Chain::build(&lines).expect("chain");
    assert_eq!(chain.len(), 8);
    let anchor_position = chain
        .links()
        .iter()
        .position(|link| Some(link.uuid.as_str()) == anchor.uuid())
        .expect("anchor on chain");
    assert!(chain.links()[anchor_position + 1].is_assistant());

    let original_lines = original.lines().collect::<Vec<_>>();
    for (index, raw) in original_lines.iter().enumerate() {
        if index == 5 {
            continue;
        }
        assert!(repaired.lines().any(|line| line == *raw));
    }
}

#[test]
fn two_record_chain_reports_no_break_points_and_writes_nothing() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(&dir, &alternating(2));
    let before = fs::read(&path).expect("read");

    let report = TranscriptRepairer::new(RepairOptions::default()).repair(&path);

    assert!(report.is_success());
    assert_eq!(report.inserted, 0);
    assert_eq!(report.warnings, vec![NO_BREAK_POINTS_WARNING.to_string()]);
    assert_eq!(report.backup_path, None);
    assert_eq!(fs::read(&path).expect("read"), before);
    assert!(backups_in(dir.path()).is_empty());
}

#[test]
fn dry_run_reports_locations_without_touching_the_file() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(&dir, &alternating(12));
    let before = fs::read(&path).expect("read");

    let report = TranscriptRepairer::new(RepairOptions {
        dry_run: true,
        ..options(3)
    })
    .repair(&path);

    assert!(report.is_success());
    assert_eq!(report.stage, RepairStage::Done);
    assert!(report.dry_run);
    assert_eq!(report.inserted, 2);
    let located = report
        .break_points
        .iter()
        .map(|location| (location.chain_index, location.line))
        .collect::<Vec<_>>();
    assert_eq!(located, vec![(4, Some(5)), (10, Some(11))]);
    assert_eq!(
        report.break_points[0].timestamp.as_deref(),
        Some(stamp(40).as_str())
    );
    assert_eq!(fs::read(&path).expect("read"), before);
    assert!(backups_in(dir.path()).is_empty());
}

#[test]
fn colliding_anchor_id_fails_validation_and_leaves_original_intact() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(&dir, &alternating(7));
    let before = fs::read(&path).expect("read");

    let report =
        TranscriptRepairer::with_id_source(options(3), Box::new(FixedIds("u-2"))).repair(&path);

    assert!(!report.is_success());
    assert_eq!(report.stage, RepairStage::Aborted);
    assert_eq!(report.aborted_after, Some(RepairStage::Inserted));
    assert!(report.errors[0].starts_with("validation failed"));
    assert!(report.errors[0].contains("duplicate uuid u-2"));

    let backup = report.backup_path.clone().expect("backup kept");
    assert!(backup.exists());
    assert_eq!(fs::read(&backup).expect("read backup"), before);
    assert_eq!(fs::read(&path).expect("read"), before);
}

#[test]
fn single_time_gap_yields_single_anchor_at_the_gap() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(
        &dir,
        &[
            entry("u-0", None, "user", 0),
            entry("u-1", Some("u-0"), "assistant", 5),
            entry("u-2", Some("u-1"), "user", 10),
            entry("u-3", Some("u-2"), "assistant", 100),
            entry("u-4", Some("u-3"), "user", 105),
            entry("u-5", Some("u-4"), "assistant", 110),
        ],
    );

    let report = TranscriptRepairer::new(options(50)).repair(&path);

    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.break_points[0].chain_index, 2);

    let lines = parse_transcript(&fs::read_to_string(&path).expect("read")).expect("parse");
    let anchor = lines[3].record().expect("anchor");
    assert_eq!(anchor.parent_uuid(), Some("u-2"));
    assert_eq!(anchor.timestamp_raw(), Some(stamp(55).as_str()));
    assert_eq!(lines[4].uuid(), Some("u-3"));
    assert_eq!(lines[4].parent_uuid(), anchor.uuid());
}

#[test]
fn records_up_to_compaction_boundary_are_byte_identical() {
    let dir = TempDir::new().expect("temp dir");
    let mut values = alternating(8);
    values.push(json!({
        "parentUuid": null,
        "logicalParentUuid": "u-7",
        "type": "system",
        "subtype": COMPACT_BOUNDARY_SUBTYPE,
        "sessionId": "sess-1",
        "uuid": "c-8",
        "timestamp": stamp(75),
    }));
    for index in 9..15 {
        let kind = if index % 2 == 0 { "assistant" } else { "user" };
        let parent = if index == 9 {
            "c-8".to_string()
        } else {
            format!("u-{}", index - 1)
        };
        values.push(entry(
            &format!("u-{index}"),
            Some(parent.as_str()),
            kind,
            index * 10,
        ));
    }
    let path = write_transcript(&dir, &values);
    let original = fs::read_to_string(&path).expect("read");

    let report = TranscriptRepairer::new(options(2)).repair(&path);
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert!(report.inserted >= 1);

    let repaired = fs::read_to_string(&path).expect("read");
    let original_lines = original.lines().collect::<Vec<_>>();
    let repaired_lines = repaired.lines().collect::<Vec<_>>();
    assert_eq!(&repaired_lines[..9], &original_lines[..9]);
    assert_eq!(
        repaired_lines.len(),
        original_lines.len() + report.inserted
    );
}

#[test]
fn crlf_transcript_keeps_its_line_endings() {
    let dir = TempDir::new().expect("temp dir");
    let mut values = vec![
        entry("a", None, "user", 0),
        entry("b", Some("a"), "assistant", 5),
        json!({
            "parentUuid": "b",
            "type": "system",
            "subtype": COMPACT_BOUNDARY_SUBTYPE,
            "sessionId": "sess-1",
            "uuid": "c",
            "timestamp": stamp(8),
        }),
    ];
    let mut parent = "c".to_string();
    for index in 0..6 {
        let uuid = format!("u-{index}");
        let kind = if index % 2 == 0 { "user" } else { "assistant" };
        values.push(entry(&uuid, Some(parent.as_str()), kind, 10 + index * 10));
        parent = uuid;
    }
    let path = dir.path().join("sess-1.jsonl");
    let original = values
        .iter()
        .map(|value| format!("{value}\r\n"))
        .collect::<String>();
    fs::write(&path, &original).expect("write transcript");

    let report = TranscriptRepairer::new(options(2)).repair(&path);
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert!(report.inserted >= 1);

    let repaired = fs::read_to_string(&path).expect("read");
    let prefix_len = original
        .match_indices("\r\n")
        .nth(2)
        .map(|(offset, _)| offset + 2)
        .expect("three lines");
    assert_eq!(&repaired[..prefix_len], &original[..prefix_len]);
    assert_eq!(
        repaired.matches("\r\n").count(),
        values.len() + report.inserted
    );
    assert_eq!(
        repaired.matches('\n').count(),
        repaired.matches("\r\n").count()
    );
}

#[test]
fn failed_backup_aborts_before_insertion() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(&dir, &alternating(7));
    let before = fs::read(&path).expect("read");
    let blocker = dir.path().join("backups");
    fs::write(&blocker, "").expect("file where the backup dir should be");

    let report = TranscriptRepairer::new(RepairOptions {
        backup_dir: Some(blocker),
        ..options(3)
    })
    .repair(&path);

    assert_eq!(report.stage, RepairStage::Aborted);
    assert_eq!(report.aborted_after, Some(RepairStage::BreakPointsFound));
    assert!(report.errors[0].starts_with("backup"), "{:?}", report.errors);
    assert_eq!(report.backup_path, None);
    assert_eq!(report.inserted, 0);
    assert_eq!(fs::read(&path).expect("read"), before);
    assert!(backups_in(dir.path()).is_empty());
}

#[test]
fn failed_write_leaves_original_and_backup_in_place() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(&dir, &alternating(7));
    let before = fs::read(&path).expect("read");
    fs::create_dir(dir.path().join("sess-1.jsonl.tmp")).expect("block temp file");

    let report = TranscriptRepairer::new(options(3)).repair(&path);

    assert_eq!(report.stage, RepairStage::Aborted);
    assert_eq!(report.aborted_after, Some(RepairStage::Validated));
    assert!(report.errors[0].starts_with("cannot write"), "{:?}", report.errors);
    assert_eq!(report.inserted, 0);
    assert_eq!(fs::read(&path).expect("read"), before);

    let backup = report.backup_path.clone().expect("backup kept");
    assert_eq!(fs::read(&backup).expect("read backup"), before);
}

#[test]
fn backups_can_live_in_a_separate_directory() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(&dir, &alternating(7));
    let before = fs::read(&path).expect("read");
    let backups = dir.path().join("backups");

    let report = TranscriptRepairer::new(RepairOptions {
        backup_dir: Some(backups.clone()),
        ..options(3)
    })
    .repair(&path);
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert!(backups_in(dir.path()).is_empty());
    assert_eq!(backups_in(&backups).len(), 1);

    assert!(restore_latest_backup(&path, None).is_err());
    restore_latest_backup(&path, Some(backups.as_path())).expect("restore");
    assert_eq!(fs::read(&path).expect("read"), before);
}

#[test]
fn time_gap_threshold_is_configurable() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(&dir, &alternating(6));

    let default_gap = TranscriptRepairer::new(RepairOptions {
        dry_run: true,
        ..options(50)
    })
    .repair(&path);
    assert_eq!(default_gap.inserted, 0);

    let tight_gap = TranscriptRepairer::new(RepairOptions {
        dry_run: true,
        time_gap_secs: 5,
        ..options(50)
    })
    .repair(&path);
    assert_eq!(tight_gap.inserted, 3);
    assert!(tight_gap
        .break_points
        .iter()
        .all(|location| location.reason == BreakReason::TimeGap));
}

#[cfg(unix)]
#[test]
fn repair_keeps_private_file_mode() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(&dir, &alternating(7));
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).expect("chmod");

    let report = TranscriptRepairer::new(options(3)).repair(&path);
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(report.inserted, 1);

    let mode = |path: &Path| {
        fs::metadata(path)
            .expect("metadata")
            .permissions()
            .mode()
            & 0o777
    };
    assert_eq!(mode(&path), 0o600);
    assert_eq!(mode(&report.backup_path.clone().expect("backup")), 0o600);
}

#[test]
fn repaired_output_holds_uniqueness_closure_and_spacing() {
    let dir = TempDir::new().expect("temp dir");
    let mut values = alternating(30);
    values.insert(
        12,
        json!({"type": "file-history-snapshot", "messageId": "m-1", "snapshot": {}}),
    );
    let path = write_transcript(&dir, &values);
    let mut text = fs::read_to_string(&path).expect("read");
    text.push_str("{\"truncated\n");
    fs::write(&path, &text).expect("append malformed");
    let original_count = parse_transcript(&text).expect("parse").len();

    let report = TranscriptRepairer::new(options(2)).repair(&path);
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert!(report.inserted >= 2);
    for pair in report.break_points.windows(2) {
        assert!(pair[1].chain_index - pair[0].chain_index >= 2);
    }

    let repaired = fs::read_to_string(&path).expect("read");
    assert!(repaired.contains("{\"truncated\n"));
    let lines = parse_transcript(&repaired).expect("parse");
    assert_eq!(lines.len(), original_count + report.inserted);

    let mut seen = HashSet::new();
    for uuid in lines.iter().filter_map(|line| line.uuid()) {
        assert!(seen.insert(uuid.to_string()), "duplicate {uuid}");
    }
    for line in lines.iter().skip(1) {
        if let Some(parent) = line.parent_uuid() {
            assert!(seen.contains(parent), "dangling {parent}");
        }
    }

    let chain = Chain::build(&lines).expect("chain");
    for (position, link) in chain.links().iter().enumerate() {
        let is_anchor = lines[link.line_index].record().and_then(|record| record.message_text())
            == Some("⚓");
        if is_anchor {
            assert!(chain.links()[position + 1].is_assistant());
        }
    }
}

#[test]
fn skipping_verification_is_reported_as_warning() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(&dir, &alternating(7));

    let report = TranscriptRepairer::new(RepairOptions {
        verify: false,
        ..options(3)
    })
    .repair(&path);

    assert!(report.is_success());
    assert_eq!(report.inserted, 1);
    assert!(report
        .warnings
        .contains(&VALIDATION_SKIPPED_WARNING.to_string()));
}

#[test]
fn failures_are_reported_not_raised() {
    let dir = TempDir::new().expect("temp dir");

    let missing = TranscriptRepairer::new(RepairOptions::default())
        .repair(dir.path().join("absent.jsonl"));
    assert_eq!(missing.stage, RepairStage::Aborted);
    assert!(missing.errors[0].starts_with("cannot read"));
    assert_eq!(missing.aborted_after, Some(RepairStage::Started));

    let empty_path = dir.path().join("empty.jsonl");
    fs::write(&empty_path, "\n\n").expect("write");
    let empty = TranscriptRepairer::new(RepairOptions::default()).repair(&empty_path);
    assert!(empty.errors[0].contains("is empty"));

    let anonymous_path = dir.path().join("anon.jsonl");
    fs::write(
        &anonymous_path,
        format!("{}\n", json!({"type": "assistant", "uuid": "a"})),
    )
    .expect("write");
    let anonymous = TranscriptRepairer::new(RepairOptions::default()).repair(&anonymous_path);
    assert!(anonymous.errors[0].starts_with("no user record"));
    assert_eq!(anonymous.aborted_after, Some(RepairStage::Parsed));

    let unlinked_path = dir.path().join("unlinked.jsonl");
    fs::write(
        &unlinked_path,
        format!("{}\n", json!({"type": "user", "sessionId": "s"})),
    )
    .expect("write");
    let unlinked = TranscriptRepairer::new(RepairOptions::default()).repair(&unlinked_path);
    assert!(unlinked.errors[0].starts_with("no linkable records"));
    assert!(backups_in(dir.path()).is_empty());
}

#[test]
fn check_reports_structure_and_existing_anchors() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(&dir, &alternating(7));
    TranscriptRepairer::new(options(3)).repair(&path);

    let check = check_transcript(&path, "⚓").expect("check");

    assert!(check.is_valid());
    assert_eq!(check.records, 8);
    assert_eq!(check.chain_len, 8);
    assert_eq!(check.existing_anchors, 1);
    assert_eq!(check.compaction_boundary_line, None);
    assert!(!check.cycle_detected);
}

#[test]
fn restore_brings_back_the_pre_repair_bytes() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(&dir, &alternating(7));
    let before = fs::read(&path).expect("read");

    let report = TranscriptRepairer::new(options(3)).repair(&path);
    assert_ne!(fs::read(&path).expect("read"), before);

    let restored = restore_latest_backup(&path, None).expect("restore");
    assert_eq!(Some(restored.backup_path), report.backup_path);
    assert_eq!(restored.records, 7);
    assert_eq!(fs::read(&path).expect("read"), before);
}

#[test]
fn restore_without_backup_is_an_error() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_transcript(&dir, &alternating(3));

    let err = restore_latest_backup(&path, None).expect_err("no backup");
    assert!(err.to_string().starts_with("no backup found"));
}
