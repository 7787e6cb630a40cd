//! Batch reports.
//!
//! [`BatchReport`] aggregates the case outcomes of one suite into
//! `test_report.json` and `test_report.md`; [`BatchSummary`] aggregates the
//! app outcomes of an app batch into `batch_summary.json` and
//! `batch_summary.md`. Both are recomputed from the full outcome list every
//! time, never updated in place.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::Verdict;
use crate::cases::TestCase;
use crate::scheduler::{JobOutcome, JobStatus};
use crate::session::{SessionResult, write_durable};

pub const REPORT_JSON: &str = "test_report.json";
pub const REPORT_MD: &str = "test_report.md";
pub const INTERMEDIATE_JSON: &str = "results_intermediate.json";
pub const SUMMARY_JSON: &str = "batch_summary.json";
pub const SUMMARY_MD: &str = "batch_summary.md";

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Session(#[from] crate::session::SessionError),
}

/// Percentage of `part` in `total`, rounded to two decimals; 0 when empty.
pub fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64 * 10_000.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Completed,
    Timeout,
    Failed,
}

/// One entry of a report's detailed results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseOutcome {
    pub test_case: TestCase,
    pub result: Verdict,
    pub iterations: usize,
    pub timestamp: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub status: CaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CaseOutcome {
    pub fn from_session(test_case: TestCase, session: &SessionResult) -> Self {
        let status = match session.result {
            Verdict::Yes | Verdict::No | Verdict::Partial => CaseStatus::Completed,
            Verdict::Timeout => CaseStatus::Timeout,
            Verdict::Error | Verdict::Unknown => CaseStatus::Failed,
        };
        Self {
            test_case,
            result: session.result,
            iterations: session.iterations,
            timestamp: session.timestamp,
            output_dir: session.artifacts_dir.clone(),
            status,
            error: session.error.clone(),
        }
    }
}

/// Scheduler payload for one case of a suite.
#[derive(Debug, Clone)]
pub struct CaseJob {
    pub test_case: TestCase,
    pub dir: PathBuf,
}

impl JobOutcome<CaseJob> for CaseOutcome {
    fn status(&self) -> JobStatus {
        match self.status {
            CaseStatus::Completed => JobStatus::Completed,
            CaseStatus::Timeout => JobStatus::Timeout,
            CaseStatus::Failed => JobStatus::Error,
        }
    }

    fn timed_out(job: &CaseJob, after: Duration) -> Self {
        Self {
            test_case: job.test_case.clone(),
            result: Verdict::Timeout,
            iterations: 0,
            timestamp: Utc::now(),
            output_dir: job.dir.clone(),
            status: CaseStatus::Timeout,
            error: Some(format!("execution timeout ({}s)", after.as_secs())),
        }
    }

    fn crashed(job: &CaseJob, detail: String) -> Self {
        Self {
            test_case: job.test_case.clone(),
            result: Verdict::Error,
            iterations: 0,
            timestamp: Utc::now(),
            output_dir: job.dir.clone(),
            status: CaseStatus::Failed,
            error: Some(detail),
        }
    }
}

/// Verdict tally. `error` lumps TIMEOUT, ERROR and UNKNOWN together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictCounts {
    pub yes: usize,
    pub partial: usize,
    pub no: usize,
    pub error: usize,
}

impl VerdictCounts {
    pub fn add(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Yes => self.yes += 1,
            Verdict::Partial => self.partial += 1,
            Verdict::No => self.no += 1,
            Verdict::Timeout | Verdict::Error | Verdict::Unknown => self.error += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.yes + self.partial + self.no + self.error
    }
}

impl FromIterator<Verdict> for VerdictCounts {
    fn from_iter<I: IntoIterator<Item = Verdict>>(iter: I) -> Self {
        let mut counts = Self::default();
        for verdict in iter {
            counts.add(verdict);
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub instruction: String,
    pub total_tests: usize,
    pub yes: usize,
    pub partial: usize,
    pub no: usize,
    pub error: usize,
    /// YES share in percent
    pub accuracy: f64,
    /// YES + PARTIAL share in percent
    pub pass_rate: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub summary: ReportSummary,
    pub detailed_results: Vec<CaseOutcome>,
}

impl BatchReport {
    /// Aggregate `outcomes`, which must already be in report order.
    pub fn from_outcomes(instruction: impl Into<String>, outcomes: Vec<CaseOutcome>) -> Self {
        let counts: VerdictCounts = outcomes.iter().map(|o| o.result).collect();
        let total = outcomes.len();
        Self {
            summary: ReportSummary {
                instruction: instruction.into(),
                total_tests: total,
                yes: counts.yes,
                partial: counts.partial,
                no: counts.no,
                error: counts.error,
                accuracy: percentage(counts.yes, total),
                pass_rate: percentage(counts.yes + counts.partial, total),
                timestamp: Utc::now(),
            },
            detailed_results: outcomes,
        }
    }

    pub fn load(dir: &Path) -> Result<Self, ReportError> {
        let raw = fs::read_to_string(dir.join(REPORT_JSON))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn render_markdown(&self) -> String {
        let s = &self.summary;
        let total = s.total_tests;
        let mut md = String::new();
        let _ = writeln!(md, "# Test Report\n");
        let _ = writeln!(md, "## Summary\n");
        let _ = writeln!(md, "**Target**: {}", preview(&s.instruction, 100));
        let _ = writeln!(md, "**Time**: {}", s.timestamp.to_rfc3339());
        let _ = writeln!(md, "**Total tests**: {}\n", total);
        let _ = writeln!(md, "| Result | Count | Share |");
        let _ = writeln!(md, "|--------|-------|-------|");
        for (label, count) in [("YES", s.yes), ("PARTIAL", s.partial), ("NO", s.no), ("ERROR", s.error)] {
            let _ = writeln!(md, "| {} | {} | {:.1}% |", label, count, percentage(count, total));
        }
        let _ = writeln!(md, "\n**Accuracy**: {:.2}% (YES only)", s.accuracy);
        let _ = writeln!(md, "**Pass rate**: {:.2}% (YES + PARTIAL)\n", s.pass_rate);
        let _ = writeln!(md, "## Detailed Results");
        for (i, outcome) in self.detailed_results.iter().enumerate() {
            let tc = &outcome.test_case;
            let _ = writeln!(md, "\n### Test {}: {}\n", i + 1, tc.task);
            let _ = writeln!(md, "- **Result**: {}", outcome.result);
            let _ = writeln!(md, "- **Expected**: {}", tc.expected_result);
            let _ = writeln!(md, "- **Priority**: {}", tc.priority.as_str());
            let _ = writeln!(md, "- **Category**: {}", or_na(&tc.category));
            let _ = writeln!(md, "- **Iterations**: {}", outcome.iterations);
            let _ = writeln!(md, "- **Output**: `{}`", outcome.output_dir.display());
            if let Some(error) = &outcome.error {
                let _ = writeln!(md, "- **Error**: {}", error);
            }
            let _ = writeln!(md, "\n---");
        }
        md
    }

    /// Write `test_report.json` and `test_report.md` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<(), ReportError> {
        write_durable(&dir.join(REPORT_JSON), &serde_json::to_vec_pretty(self)?)?;
        fs::write(dir.join(REPORT_MD), self.render_markdown())?;
        Ok(())
    }
}

/// Snapshot of the outcomes collected so far, in completion order.
pub fn write_intermediate(dir: &Path, outcomes: &[CaseOutcome]) -> Result<(), ReportError> {
    write_durable(&dir.join(INTERMEDIATE_JSON), &serde_json::to_vec_pretty(outcomes)?)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStatus {
    Success,
    CompletedNoReport,
    Failed,
    Timeout,
    Error,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Success => "SUCCESS",
            AppStatus::CompletedNoReport => "COMPLETED_NO_REPORT",
            AppStatus::Failed => "FAILED",
            AppStatus::Timeout => "TIMEOUT",
            AppStatus::Error => "ERROR",
        }
    }
}

/// Result of testing one app in an app batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppOutcome {
    pub index: u32,
    pub filename: String,
    pub status: AppStatus,
    pub message: String,
    pub elapsed: f64,
    pub output_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Summary of the app's suite report, when one was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ReportSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub timeout: usize,
    pub error: usize,
    #[serde(default)]
    pub completed_no_report: usize,
    pub total_tests: usize,
    pub total_yes: usize,
    pub total_partial: usize,
    pub total_no: usize,
    pub timestamp: DateTime<Utc>,
    pub results: Vec<AppOutcome>,
}

impl BatchSummary {
    /// Aggregate app outcomes; results are stored sorted by app index.
    pub fn from_outcomes(mut results: Vec<AppOutcome>) -> Self {
        results.sort_by_key(|r| r.index);
        let count = |status: AppStatus| results.iter().filter(|r| r.status == status).count();
        let reports = || results.iter().filter_map(|r| r.summary.as_ref());
        Self {
            total: results.len(),
            success: count(AppStatus::Success),
            failed: count(AppStatus::Failed),
            timeout: count(AppStatus::Timeout),
            error: count(AppStatus::Error),
            completed_no_report: count(AppStatus::CompletedNoReport),
            total_tests: reports().map(|s| s.total_tests).sum(),
            total_yes: reports().map(|s| s.yes).sum(),
            total_partial: reports().map(|s| s.partial).sum(),
            total_no: reports().map(|s| s.no).sum(),
            timestamp: Utc::now(),
            results,
        }
    }

    pub fn load(dir: &Path) -> Result<Self, ReportError> {
        let raw = fs::read_to_string(dir.join(SUMMARY_JSON))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn render_markdown(&self) -> String {
        let mut md = String::new();
        let _ = writeln!(md, "# Batch Test Report\n");
        let _ = writeln!(md, "## Summary\n");
        let _ = writeln!(md, "**Time**: {}", self.timestamp.to_rfc3339());
        let _ = writeln!(md, "**Apps**: {}\n", self.total);
        let _ = writeln!(md, "| Status | Count | Share |");
        let _ = writeln!(md, "|--------|-------|-------|");
        for (label, count) in [
            ("SUCCESS", self.success),
            ("COMPLETED_NO_REPORT", self.completed_no_report),
            ("FAILED", self.failed),
            ("TIMEOUT", self.timeout),
            ("ERROR", self.error),
        ] {
            let _ = writeln!(md, "| {} | {} | {:.1}% |", label, count, percentage(count, self.total));
        }
        if self.total_tests > 0 {
            let t = self.total_tests;
            let _ = writeln!(md, "\n### Test Cases\n");
            let _ = writeln!(md, "**Total test cases**: {}\n", t);
            let _ = writeln!(md, "| Result | Count | Share |");
            let _ = writeln!(md, "|--------|-------|-------|");
            for (label, count) in [("YES", self.total_yes), ("PARTIAL", self.total_partial), ("NO", self.total_no)] {
                let _ = writeln!(md, "| {} | {} | {:.1}% |", label, count, percentage(count, t));
            }
            let _ = writeln!(md, "\n**Mean accuracy**: {:.1}%", percentage(self.total_yes, t));
            let _ = writeln!(
                md,
                "**Mean pass rate**: {:.1}%",
                percentage(self.total_yes + self.total_partial, t)
            );
        }
        let _ = writeln!(md, "\n## Detailed Results");
        for r in &self.results {
            let _ = writeln!(md, "\n### App {:03}: {}\n", r.index, r.filename);
            let _ = writeln!(md, "- **Status**: {}", r.status.as_str());
            let _ = writeln!(md, "- **Message**: {}", r.message);
            let _ = writeln!(md, "- **Elapsed**: {:.1}s", r.elapsed);
            let _ = writeln!(md, "- **Output**: `{}`", r.output_dir.display());
            let _ = writeln!(md, "\n---");
        }
        md
    }

    pub fn write(&self, dir: &Path) -> Result<(), ReportError> {
        write_durable(&dir.join(SUMMARY_JSON), &serde_json::to_vec_pretty(self)?)?;
        fs::write(dir.join(SUMMARY_MD), self.render_markdown())?;
        Ok(())
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    }
}

fn or_na(text: &str) -> &str {
    if text.trim().is_empty() { "N/A" } else { text }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cases::Priority;
    use pretty_assertions::assert_eq;

    fn case(id: u32) -> TestCase {
        TestCase {
            id,
            task: format!("task {}", id),
            expected_result: "works".to_string(),
            priority: Priority::High,
            category: String::new(),
        }
    }

    fn outcome(id: u32, verdict: Verdict) -> CaseOutcome {
        let session = SessionResult::new("http://x/", "t", "e", "m").verdict(verdict, 3);
        CaseOutcome::from_session(case(id), &session)
    }

    #[test]
    fn test_report_arithmetic() {
        let outcomes = vec![
            outcome(1, Verdict::Yes),
            outcome(2, Verdict::Yes),
            outcome(3, Verdict::Partial),
            outcome(4, Verdict::No),
            outcome(5, Verdict::Timeout),
            outcome(6, Verdict::Unknown),
        ];
        let report = BatchReport::from_outcomes("a todo app", outcomes);
        let s = &report.summary;
        assert_eq!((s.total_tests, s.yes, s.partial, s.no, s.error), (6, 2, 1, 1, 2));
        assert_eq!(s.accuracy, 33.33);
        assert_eq!(s.pass_rate, 50.0);
    }

    #[test]
    fn test_empty_report() {
        let report = BatchReport::from_outcomes("nothing", Vec::new());
        assert_eq!(report.summary.total_tests, 0);
        assert_eq!(report.summary.accuracy, 0.0);
        assert_eq!(report.summary.pass_rate, 0.0);
        assert!(report.render_markdown().contains("| YES | 0 | 0.0% |"));
    }

    #[test]
    fn test_case_status_mapping() {
        assert_eq!(outcome(1, Verdict::No).status, CaseStatus::Completed);
        assert_eq!(outcome(1, Verdict::Timeout).status, CaseStatus::Timeout);
        assert_eq!(outcome(1, Verdict::Error).status, CaseStatus::Failed);
        assert_eq!(JobOutcome::<CaseJob>::status(&outcome(1, Verdict::Unknown)), JobStatus::Error);
    }

    #[test]
    fn test_report_written_and_reloaded() {
        let tmp = tempfile::TempDir::new().unwrap();
        let report = BatchReport::from_outcomes("app", vec![outcome(1, Verdict::Yes)]);
        report.write(tmp.path()).unwrap();
        assert_eq!(BatchReport::load(tmp.path()).unwrap(), report);
        let md = fs::read_to_string(tmp.path().join(REPORT_MD)).unwrap();
        assert!(md.contains("### Test 1: task 1"));
        assert!(md.contains("**Category**: N/A"));
    }

    #[test]
    fn test_batch_summary_totals() {
        let report = BatchReport::from_outcomes("app", vec![outcome(1, Verdict::Yes), outcome(2, Verdict::No)]);
        let app = |index, status, summary| AppOutcome {
            index,
            filename: format!("game_{:03}.html", index),
            status,
            message: String::new(),
            elapsed: 1.0,
            output_dir: PathBuf::from(format!("game_{:03}", index)),
            port: None,
            summary,
        };
        let summary = BatchSummary::from_outcomes(vec![
            app(7, AppStatus::Timeout, None),
            app(2, AppStatus::Success, Some(report.summary.clone())),
            app(3, AppStatus::Success, Some(report.summary.clone())),
        ]);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.success, 2);
        assert_eq!(summary.timeout, 1);
        assert_eq!(summary.total_tests, 4);
        assert_eq!(summary.total_yes, 2);
        assert_eq!(summary.total_no, 2);
        let order: Vec<u32> = summary.results.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![2, 3, 7]);
        assert!(summary.render_markdown().contains("### App 007: game_007.html"));
    }
}
