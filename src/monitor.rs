//! Read-only progress monitor over an output tree.
//!
//! Nothing here writes: progress is reconstructed from `question.txt`,
//! `test_cases.json`, `test_NN/result.json` and the presence of
//! `test_report.json`. A result file that cannot be read counts as a
//! completed `UNKNOWN`. An app directory holding only its question is still
//! generating cases and counts as an unfinished job.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use crate::action::Verdict;
use crate::cases::{CASES_FILE, load_cases};
use crate::report::{BatchSummary, REPORT_JSON, SUMMARY_JSON};
use crate::session::SessionDir;
use crate::suite::QUESTION_FILE;

/// Progress of one suite directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub completed_count: usize,
    pub total_count: usize,
    /// The suite report has been written
    pub is_complete: bool,
    pub verdict_counts: BTreeMap<Verdict, usize>,
}

impl JobProgress {
    pub fn count(&self, verdict: Verdict) -> usize {
        self.verdict_counts.get(&verdict).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    /// Keyed by suite directory name
    pub jobs: BTreeMap<String, JobProgress>,
    /// Present once an app batch has written `batch_summary.json`
    pub summary: Option<BatchSummary>,
}

impl ProgressSnapshot {
    pub fn is_finished(&self) -> bool {
        self.summary.is_some() || (!self.jobs.is_empty() && self.jobs.values().all(|j| j.is_complete))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(s) = &self.summary {
            let _ = writeln!(out, "Batch finished: {} apps", s.total);
            let _ = writeln!(
                out,
                "  SUCCESS: {}  FAILED: {}  TIMEOUT: {}  ERROR: {}",
                s.success, s.failed, s.timeout, s.error
            );
            if s.total_tests > 0 {
                let _ = writeln!(
                    out,
                    "  test cases: {}  YES: {}  PARTIAL: {}  NO: {}",
                    s.total_tests, s.total_yes, s.total_partial, s.total_no
                );
            }
            return out;
        }

        let complete = self.jobs.values().filter(|j| j.is_complete).count();
        let _ = writeln!(out, "Complete: {} / {}", complete, self.jobs.len());
        for (name, job) in &self.jobs {
            let state = if job.is_complete {
                "done".to_string()
            } else if job.total_count == 0 {
                "generating cases".to_string()
            } else {
                format!("running ({}/{})", job.completed_count, job.total_count)
            };
            let _ = write!(out, "  {}: {}", name, state);
            if job.completed_count > 0 {
                let _ = write!(
                    out,
                    " - YES:{} PARTIAL:{} NO:{} ERROR:{}",
                    job.count(Verdict::Yes),
                    job.count(Verdict::Partial),
                    job.count(Verdict::No),
                    job.count(Verdict::Timeout) + job.count(Verdict::Error) + job.count(Verdict::Unknown)
                );
            }
            out.push('\n');
        }
        out
    }
}

fn is_suite_dir(dir: &Path) -> bool {
    if dir.join(CASES_FILE).exists() || dir.join(QUESTION_FILE).exists() {
        return true;
    }
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.file_name().to_string_lossy().starts_with("test_") && e.path().is_dir())
        })
        .unwrap_or(false)
}

/// Progress of a single suite directory.
pub fn suite_progress(dir: &Path) -> JobProgress {
    let total_count = load_cases(&dir.join(CASES_FILE)).map(|c| c.len()).unwrap_or(0);
    let mut progress = JobProgress {
        total_count,
        is_complete: dir.join(REPORT_JSON).exists(),
        ..Default::default()
    };

    let Ok(entries) = fs::read_dir(dir) else {
        return progress;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() || !entry.file_name().to_string_lossy().starts_with("test_") {
            continue;
        }
        let session = SessionDir::new(&path);
        if !session.result_path().exists() {
            continue;
        }
        let verdict = match session.load_result() {
            Ok(Some(result)) => result.result,
            _ => Verdict::Unknown,
        };
        progress.completed_count += 1;
        *progress.verdict_counts.entry(verdict).or_insert(0) += 1;
    }
    progress
}

/// Reconstruct progress under `root`.
///
/// `root` is either an app-batch directory (one suite per subdirectory) or a
/// suite directory itself, reported as a single job. A root that does not
/// exist yet is an empty, unfinished snapshot.
pub fn snapshot(root: &Path) -> io::Result<ProgressSnapshot> {
    let summary = if root.join(SUMMARY_JSON).exists() {
        BatchSummary::load(root).ok()
    } else {
        None
    };

    let mut jobs = BTreeMap::new();
    if is_suite_dir(root) {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.display().to_string());
        jobs.insert(name, suite_progress(root));
    } else {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ProgressSnapshot { jobs, summary }),
            Err(e) => return Err(e),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() && is_suite_dir(&path) {
                jobs.insert(entry.file_name().to_string_lossy().to_string(), suite_progress(&path));
            }
        }
    }
    Ok(ProgressSnapshot { jobs, summary })
}
