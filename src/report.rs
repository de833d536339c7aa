use std::collections::HashMap;
use std::fmt::Write;
use std::path::Path;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{Decision, Deliberation, DeliberationResult, RosterEntry};

/// One result row joined with the student it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub rank: Option<i32>,
    pub student_id: Uuid,
    pub student_name: String,
    pub student_email: String,
    pub average: Option<f64>,
    pub credits_obtained: i32,
    pub credits_required: i32,
    pub decision: Decision,
    pub mention: Option<String>,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliberationReport {
    pub deliberation: Deliberation,
    pub rows: Vec<ReportRow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionSummary {
    pub decision: Decision,
    pub count: usize,
}

impl DeliberationReport {
    /// Students missing from the roster (dropped since compilation) keep
    /// their row, labelled by id.
    pub fn new(
        deliberation: Deliberation,
        results: &[DeliberationResult],
        roster: &[RosterEntry],
    ) -> Self {
        let students: HashMap<Uuid, &RosterEntry> = roster
            .iter()
            .map(|entry| (entry.student.id, entry))
            .collect();

        let rows = results
            .iter()
            .map(|result| {
                let (name, email) = match students.get(&result.student_id) {
                    Some(entry) => (entry.student.full_name.clone(), entry.student.email.clone()),
                    None => (result.student_id.to_string(), String::new()),
                };
                ReportRow {
                    rank: result.rank,
                    student_id: result.student_id,
                    student_name: name,
                    student_email: email,
                    average: result.average,
                    credits_obtained: result.credits_obtained,
                    credits_required: result.credits_required,
                    decision: result.decision,
                    mention: result.mention.map(|m| m.to_string()),
                    remarks: result.remarks.clone(),
                }
            })
            .collect();

        Self { deliberation, rows }
    }
}

pub fn summarize_by_decision(rows: &[ReportRow]) -> Vec<DecisionSummary> {
    let mut counts: HashMap<Decision, usize> = HashMap::new();
    for row in rows {
        *counts.entry(row.decision).or_insert(0) += 1;
    }

    let mut summaries: Vec<DecisionSummary> = counts
        .into_iter()
        .map(|(decision, count)| DecisionSummary { decision, count })
        .collect();
    summaries.sort_by(|a, b| a.decision.cmp(&b.decision));
    summaries
}

fn format_average(average: Option<f64>) -> String {
    average.map_or_else(|| "n/a".to_string(), |value| format!("{value:.2}"))
}

pub fn build_report(report: &DeliberationReport) -> String {
    let deliberation = &report.deliberation;
    let summaries = summarize_by_decision(&report.rows);

    let mut output = String::new();
    let scope = deliberation
        .semester
        .as_deref()
        .map_or_else(|| deliberation.term.clone(), |s| format!("{} {}", deliberation.term, s));

    let _ = writeln!(output, "# Deliberation Report");
    let _ = writeln!(
        output,
        "Cohort {} ({}, {} session), {} to {}",
        deliberation.cohort_id,
        scope,
        deliberation.session_type,
        deliberation.starts_on,
        deliberation.ends_on
    );
    let _ = writeln!(
        output,
        "Status {} with pass mark {:.2}",
        deliberation.status, deliberation.pass_mark
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Decision Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No results compiled yet.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(output, "- {}: {} students", summary.decision, summary.count);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Ranking");

    if report.rows.is_empty() {
        let _ = writeln!(output, "No results compiled yet.");
    } else {
        let _ = writeln!(output, "| Rank | Student | Average | Credits | Decision | Mention |");
        let _ = writeln!(output, "|---|---|---|---|---|---|");
        for row in report.rows.iter() {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {}/{} | {} | {} |",
                row.rank.map_or_else(|| "-".to_string(), |r| r.to_string()),
                row.student_name,
                format_average(row.average),
                row.credits_obtained,
                row.credits_required,
                row.decision,
                row.mention.as_deref().unwrap_or("-")
            );
        }
    }

    let remarked: Vec<&ReportRow> = report
        .rows
        .iter()
        .filter(|row| row.remarks.is_some())
        .collect();
    if !remarked.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Remarks");
        for row in remarked {
            let _ = writeln!(
                output,
                "- {}: {}",
                row.student_name,
                row.remarks.as_deref().unwrap_or_default()
            );
        }
    }

    output
}

pub fn export_csv(rows: &[ReportRow], csv_path: &Path) -> Result<usize> {
    let mut writer = csv::Writer::from_path(csv_path)
        .map_err(|err| EngineError::Internal(format!("open {}: {err}", csv_path.display())))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|err| EngineError::Internal(format!("write result row: {err}")))?;
    }
    writer
        .flush()
        .map_err(|err| EngineError::Internal(format!("flush {}: {err}", csv_path.display())))?;
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::models::{DeliberationStatus, Mention, SessionType, Standing, Student};

    fn deliberation() -> Deliberation {
        Deliberation {
            id: Uuid::from_u128(0xD1),
            cohort_id: Uuid::from_u128(0xC0),
            term: "2025-2026".to_string(),
            semester: Some("S1".to_string()),
            session_type: SessionType::Normal,
            status: DeliberationStatus::Compiled,
            pass_mark: 10.0,
            starts_on: NaiveDate::from_ymd_opt(2026, 6, 20).unwrap(),
            ends_on: NaiveDate::from_ymd_opt(2026, 6, 27).unwrap(),
            president_id: None,
            secretary_id: None,
            version: 1,
        }
    }

    fn result(student: u128, average: Option<f64>, decision: Decision, rank: i32) -> DeliberationResult {
        DeliberationResult {
            deliberation_id: Uuid::from_u128(0xD1),
            student_id: Uuid::from_u128(student),
            average,
            credits_obtained: 10,
            credits_required: 10,
            decision,
            rank: Some(rank),
            mention: None,
            remarks: None,
        }
    }

    fn roster_entry(id: u128, name: &str) -> RosterEntry {
        RosterEntry {
            student: Student {
                id: Uuid::from_u128(id),
                full_name: name.to_string(),
                email: format!("{}@example.edu", name.to_lowercase()),
                cohort_id: Uuid::from_u128(0xC0),
                standing: Standing::Active,
                payment_blocked: false,
            },
            courses: Vec::new(),
        }
    }

    fn sample() -> DeliberationReport {
        let mut top = result(1, Some(16.25), Decision::Admitted, 1);
        top.mention = Some(Mention::VeryGood);
        let mut low = result(2, Some(7.5), Decision::Refused, 2);
        low.remarks = Some("1 of 2 courses ungraded".to_string());
        let gone = result(3, None, Decision::Refused, 3);
        DeliberationReport::new(
            deliberation(),
            &[top, low, gone],
            &[roster_entry(1, "Avery"), roster_entry(2, "Jules")],
        )
    }

    #[test]
    fn markdown_lists_mix_ranking_and_remarks() {
        let output = build_report(&sample());

        assert!(output.starts_with("# Deliberation Report"));
        assert!(output.contains("2025-2026 S1, normal session"));
        assert!(output.contains("- ADMITTED: 1 students"));
        assert!(output.contains("- REFUSED: 2 students"));
        assert!(output.contains("| 1 | Avery | 16.25 | 10/10 | ADMITTED | very_good |"));
        assert!(output.contains("| 3 | 00000000-0000-0000-0000-000000000003 | n/a |"));
        assert!(output.contains("- Jules: 1 of 2 courses ungraded"));
    }

    #[test]
    fn empty_report_says_so() {
        let report = DeliberationReport::new(deliberation(), &[], &[]);
        let output = build_report(&report);
        assert!(output.contains("No results compiled yet."));
        assert!(!output.contains("## Remarks"));
    }

    #[test]
    fn csv_export_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let written = export_csv(&sample().rows, &path).unwrap();
        assert_eq!(written, 3);

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "rank,student_id,student_name,student_email,average,credits_obtained,credits_required,decision,mention,remarks"
        );
        assert!(lines.next().unwrap().contains(",Avery,avery@example.edu,16.25,10,10,ADMITTED,very_good,"));
        assert_eq!(contents.lines().count(), 4);
    }
}
