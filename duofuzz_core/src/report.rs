//! Pure renderings of a finalized [`RunSummary`]. Writing them anywhere is the caller's job.

use crate::collector::{RunSummary, StatusCounts};
use crate::mutator::MutationKind;
use crate::outcome::{Outcome, Status};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Response descriptors longer than this are cut in the text report.
pub const RESPONSE_PREVIEW_CHARS: usize = 200;
/// Lines of a sampled input printed before the rest is elided.
pub const INPUT_PREVIEW_LINES: usize = 40;

const RULE: &str = "==================================================";
const THIN_RULE: &str = "--------------------------------------------------";

/// Machine-readable form of one run.
#[derive(Debug, Serialize)]
pub struct SummaryRecord<'a> {
    pub target: &'a str,
    pub generated_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
    pub total_attempts: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub unique_failing_inputs: usize,
    pub status_distribution: &'a StatusCounts,
    pub kind_distribution: &'a BTreeMap<MutationKind, StatusCounts>,
    pub failure_sample_cap: usize,
    pub failure_sample: &'a [Outcome],
}

pub fn render_record(summary: &RunSummary) -> SummaryRecord<'_> {
    SummaryRecord {
        target: summary.target(),
        generated_at: summary.finished_at(),
        started_at: summary.started_at(),
        cancelled: summary.cancelled(),
        total_attempts: summary.total_attempts(),
        success_count: summary.success_count(),
        error_count: summary.error_count(),
        unique_failing_inputs: summary.unique_failing_inputs(),
        status_distribution: summary.status_counts(),
        kind_distribution: summary.kind_counts(),
        failure_sample_cap: summary.failure_sample_cap(),
        failure_sample: summary.failure_sample(),
    }
}

pub fn to_json<T: Serialize + ?Sized>(record: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(record)
}

/// Per-target totals for a multi-target run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetTotals {
    pub total_attempts: u64,
    pub error_count: u64,
    pub unique_failing_inputs: usize,
    pub cancelled: bool,
}

pub fn render_combined<'a>(
    summaries: impl IntoIterator<Item = &'a RunSummary>,
) -> BTreeMap<String, TargetTotals> {
    summaries
        .into_iter()
        .map(|summary| {
            (
                summary.target().to_string(),
                TargetTotals {
                    total_attempts: summary.total_attempts(),
                    error_count: summary.error_count(),
                    unique_failing_inputs: summary.unique_failing_inputs(),
                    cancelled: summary.cancelled(),
                },
            )
        })
        .collect()
}

pub fn render_text(summary: &RunSummary) -> String {
    TextReport(summary).to_string()
}

struct TextReport<'a>(&'a RunSummary);

impl fmt::Display for TextReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.0;
        writeln!(f, "Fuzzing Summary: {}", summary.target())?;
        writeln!(f, "Generated: {}", summary.finished_at().to_rfc3339())?;
        writeln!(f, "{RULE}")?;
        writeln!(f, "Total attempts: {}", summary.total_attempts())?;
        writeln!(f, "Successes: {}", summary.success_count())?;
        writeln!(f, "Errors: {}", summary.error_count())?;
        writeln!(f, "Unique failing inputs: {}", summary.unique_failing_inputs())?;
        if summary.cancelled() {
            writeln!(f, "Run cancelled before the matrix was exhausted")?;
        }

        writeln!(f)?;
        writeln!(f, "Status distribution:")?;
        for status in Status::ALL {
            writeln!(f, "  {status}: {}", summary.count(status))?;
        }

        writeln!(f)?;
        writeln!(f, "Mutation kind distribution:")?;
        for (kind, counts) in summary.kind_counts() {
            let breakdown: Vec<String> = Status::ALL
                .iter()
                .map(|status| format!("{status} {}", counts.get(*status)))
                .collect();
            writeln!(
                f,
                "  {kind}: {} attempts ({})",
                counts.total(),
                breakdown.join(", ")
            )?;
        }

        let sample = summary.failure_sample();
        writeln!(f)?;
        writeln!(
            f,
            "Sample failures ({} retained, cap {}):",
            sample.len(),
            summary.failure_sample_cap()
        )?;
        for (i, outcome) in sample.iter().enumerate() {
            writeln!(f, "{THIN_RULE}")?;
            writeln!(f, "Failure #{}", i + 1)?;
            writeln!(f, "  Mutation: {}", outcome.kind)?;
            writeln!(f, "  Status: {}", outcome.status)?;
            writeln!(f, "  Input:")?;
            let input = serde_json::to_string_pretty(&outcome.payload.to_json())
                .unwrap_or_else(|_| outcome.payload.to_wire());
            let lines: Vec<&str> = input.lines().collect();
            for line in lines.iter().take(INPUT_PREVIEW_LINES) {
                writeln!(f, "    {}", preview(line))?;
            }
            if lines.len() > INPUT_PREVIEW_LINES {
                writeln!(f, "    ... {} more lines", lines.len() - INPUT_PREVIEW_LINES)?;
            }
            writeln!(f, "  Response: {}", preview(&outcome.response.summary()))?;
            if let Some(detail) = &outcome.detail {
                writeln!(f, "  Detail: {}", preview(detail))?;
            }
        }
        Ok(())
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= RESPONSE_PREVIEW_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(RESPONSE_PREVIEW_CHARS).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ResultCollector;
    use crate::input::{FieldValue, Payload};
    use crate::outcome::ResponseDescriptor;

    fn summary() -> RunSummary {
        let mut collector = ResultCollector::new("http", 2);
        let payload = Payload::new()
            .with_field("name", FieldValue::text("Product1"))
            .with_field("divide_by", FieldValue::text("0"));
        collector.record(Outcome::new(
            MutationKind::BoundaryValue,
            payload.clone(),
            Status::Success,
            ResponseDescriptor::Http {
                status_code: Some(201),
                body: "created".into(),
            },
        ));
        collector.record(Outcome::new(
            MutationKind::DivideByZero,
            payload,
            Status::ApplicationError,
            ResponseDescriptor::Http {
                status_code: Some(500),
                body: "x".repeat(500),
            },
        ));
        collector.finalize(false)
    }

    #[test]
    fn text_report_lists_totals_distributions_and_failures() {
        let text = render_text(&summary());

        assert!(text.starts_with("Fuzzing Summary: http\nGenerated: "));
        assert!(text.contains("Total attempts: 2\n"));
        assert!(text.contains("  application-error: 1\n"));
        assert!(text.contains("  divide-by-zero: 1 attempts (success 0, application-error 1"));
        assert!(text.contains("Sample failures (1 retained, cap 2):"));
        assert!(text.contains("  Mutation: divide-by-zero\n"));
        assert!(text.contains("      \"divide_by\": \"0\""));
        let response = text
            .lines()
            .find(|line| line.starts_with("  Response: "))
            .unwrap();
        assert!(response.ends_with("..."));
        assert!(response.len() < RESPONSE_PREVIEW_CHARS + 20);
        assert!(!text.contains("cancelled"));
    }

    #[test]
    fn oversized_inputs_are_elided_in_text() {
        let mut collector = ResultCollector::new("http", 25);
        let mut payload = Payload::new().with_field("name", FieldValue::text("A".repeat(100_000)));
        for i in 0..60 {
            payload = payload.with_field(format!("extra_{i}"), FieldValue::number(i));
        }
        for _ in 0..25 {
            collector.record(Outcome::new(
                MutationKind::PathologicalRepetition,
                payload.clone(),
                Status::ApplicationError,
                ResponseDescriptor::Http {
                    status_code: Some(413),
                    body: String::new(),
                },
            ));
        }

        let text = render_text(&collector.finalize(false));

        assert!(text.len() < 25 * (INPUT_PREVIEW_LINES + 10) * (RESPONSE_PREVIEW_CHARS + 20));
        assert!(text.contains("      \"name\": \"AAAA"));
        assert!(text.contains("    ... 23 more lines\n"));
    }

    #[test]
    fn record_serializes_to_json() {
        let summary = summary();
        let json = to_json(&render_record(&summary)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["target"], "http");
        assert_eq!(value["total_attempts"], 2);
        assert_eq!(value["status_distribution"]["application-error"], 1);
        assert_eq!(value["kind_distribution"]["divide-by-zero"]["application-error"], 1);
        assert_eq!(value["failure_sample"][0]["kind"], "divide-by-zero");
        assert_eq!(value["failure_sample"][0]["payload"]["divide_by"], "0");
        assert!(value["generated_at"].is_string());
    }

    #[test]
    fn combined_totals_per_target() {
        let http = summary();
        let ble = ResultCollector::new("ble", 5).finalize(true);
        let combined = render_combined([&http, &ble]);

        assert_eq!(
            combined["http"],
            TargetTotals {
                total_attempts: 2,
                error_count: 1,
                unique_failing_inputs: 1,
                cancelled: false
            }
        );
        assert!(combined["ble"].cancelled);
        assert_eq!(combined["ble"].total_attempts, 0);
    }
}
