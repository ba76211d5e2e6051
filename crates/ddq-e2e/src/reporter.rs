//! Terminal and JSON rendering of a [`SuiteReport`].

use crate::models::SuiteReport;
use colored::Colorize;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;

#[derive(Serialize)]
struct JsonReport<'a> {
    passed: bool,
    timed_out: bool,
    #[serde(flatten)]
    report: &'a SuiteReport,
}

/// Renders a per-scenario summary table.
pub fn render_summary(report: &SuiteReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", "Backend conformance".bold()));

    for result in &report.results {
        let status = if result.passed {
            "PASS".green().bold()
        } else {
            "FAIL".red().bold()
        };
        out.push_str(&format!(
            "  {} {:<18} {:>8.2?}\n",
            status, result.scenario_id, result.duration
        ));
        if let Some(failure) = &result.failure {
            out.push_str(&format!(
                "       {} {}\n",
                format!("{}:", failure.kind).yellow(),
                failure.message
            ));
        }
    }
    for id in &report.skipped {
        out.push_str(&format!("  {} {}\n", "SKIP".dimmed(), id));
    }

    let total = report.results.len() + report.skipped.len();
    let summary = format!("{}/{} scenarios passed", report.passed_count(), total);
    let summary = if report.all_passed() {
        summary.green()
    } else {
        summary.red()
    };
    out.push_str(&format!("{} in {:.2?}\n", summary, report.duration));
    out
}

pub fn print_summary(report: &SuiteReport) {
    print!("{}", render_summary(report));
}

/// Serialises the report to pretty JSON.
pub fn to_json(report: &SuiteReport, timed_out: bool) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&JsonReport {
        passed: !timed_out && report.all_passed(),
        timed_out,
        report,
    })
}

/// Writes the JSON report to `path`.
pub fn write_json(report: &SuiteReport, timed_out: bool, path: &Path) -> io::Result<()> {
    let json = to_json(report, timed_out)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Failure, FailureKind, TestResult};
    use std::time::Duration;

    fn report() -> SuiteReport {
        let mut report = SuiteReport::new();
        report
            .results
            .push(TestResult::passed("polling", "Polling lifecycle", Duration::from_millis(12)));
        report.results.push(TestResult::failed(
            "dedup",
            "Duplicate sends",
            Failure {
                kind: FailureKind::Assertion,
                message: "duplicate send of a pending message was accepted".to_string(),
            },
            Duration::from_millis(40),
        ));
        report.skipped.push("wrapped-message".to_string());
        report
    }

    #[test]
    fn test_render_summary_lists_every_scenario() {
        colored::control::set_override(false);
        let text = render_summary(&report());

        assert!(text.contains("PASS polling"));
        assert!(text.contains("FAIL dedup"));
        assert!(text.contains("assertion: duplicate send of a pending message was accepted"));
        assert!(text.contains("SKIP wrapped-message"));
        assert!(text.contains("1/3 scenarios passed"));
    }

    #[test]
    fn test_json_report() {
        let json: serde_json::Value = serde_json::from_str(&to_json(&report(), true).unwrap()).unwrap();

        assert_eq!(json["passed"], false);
        assert_eq!(json["timed_out"], true);
        assert_eq!(json["results"][1]["failure"]["kind"], "assertion");
        assert_eq!(json["skipped"][0], "wrapped-message");
        assert!(json["started_at"].is_string());
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        write_json(&report(), false, &path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"scenario_id\": \"polling\""));
    }
}
