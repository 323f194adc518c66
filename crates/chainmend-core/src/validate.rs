use crate::record::ParsedLine;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub records_checked: usize,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Uuid uniqueness and parent resolution over a full line set. The first
/// record may reference a parent outside the file.
pub fn validate_lines(lines: &[ParsedLine]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for (position, line) in lines.iter().enumerate() {
        if line.record().is_some() {
            report.records_checked += 1;
        }
        if let Some(uuid) = line.uuid() {
            if !seen.insert(uuid) {
                report.errors.push(format!(
                    "duplicate uuid {uuid} at {}",
                    describe_position(line, position)
                ));
            }
        }
    }

    for (position, line) in lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.record().is_some())
        .skip(1)
    {
        if let Some(parent) = line.parent_uuid() {
            if !seen.contains(parent) {
                report.errors.push(format!(
                    "dangling parentUuid {parent} on {} at {}",
                    line.uuid().unwrap_or("<no uuid>"),
                    describe_position(line, position)
                ));
            }
        }
    }

    report
}

fn describe_position(line: &ParsedLine, position: usize) -> String {
    match line.source_line() {
        Some(source_line) => format!("line {source_line}"),
        None => format!("inserted record #{}", position + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_transcript;
    use crate::test_support::{alternating, entry, to_text};

    #[test]
    fn linear_transcript_passes() {
        let lines = parse_transcript(&to_text(&alternating(6))).expect("parse");
        let report = validate_lines(&lines);

        assert!(report.passed());
        assert_eq!(report.records_checked, 6);
    }

    #[test]
    fn duplicate_uuid_is_reported_with_its_line() {
        let text = to_text(&[
            entry("a", None, "user", 0),
            entry("b", Some("a"), "assistant", 5),
            entry("b", Some("a"), "user", 10),
        ]);
        let lines = parse_transcript(&text).expect("parse");
        let report = validate_lines(&lines);

        assert!(!report.passed());
        assert_eq!(report.errors, vec!["duplicate uuid b at line 3".to_string()]);
    }

    #[test]
    fn dangling_parent_is_reported_but_first_record_is_exempt() {
        let text = to_text(&[
            entry("a", Some("before-file"), "user", 0),
            entry("b", Some("a"), "assistant", 5),
            entry("c", Some("gone"), "user", 10),
        ]);
        let lines = parse_transcript(&text).expect("parse");
        let report = validate_lines(&lines);

        assert_eq!(
            report.errors,
            vec!["dangling parentUuid gone on c at line 3".to_string()]
        );
    }

    #[test]
    fn malformed_lines_do_not_count_as_first_record() {
        let mut text = String::from("garbage line\n");
        text.push_str(&to_text(&[
            entry("a", Some("before-file"), "user", 0),
            entry("b", Some("a"), "assistant", 5),
        ]));
        let lines = parse_transcript(&text).expect("parse");

        assert!(validate_lines(&lines).passed());
    }
}
