//! Pipelines built on the scheduler.
//!
//! A **suite** tests one target: generate (or reload) test cases, run each in
//! its own `test_NN/` session directory, snapshot progress to
//! `results_intermediate.json` after every completion, then write the report.
//!
//! An **app batch** runs a suite for every app in a directory of HTML files,
//! each behind its own static server on a leased port, and writes
//! `batch_summary.*`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{info, warn};

use crate::cases::{CASES_FILE, CaseGenerator, GenerationError, TestCase, load_cases, write_cases};
use crate::report::{
    AppOutcome, AppStatus, BatchReport, BatchSummary, CaseJob, CaseOutcome, ReportError, write_intermediate,
};
use crate::runner::{SessionRequest, SessionRunner};
use crate::scheduler::{BatchScheduler, Job, JobContext, JobOutcome, JobStatus, StaticServer};
use crate::session::SessionDir;
use crate::vlm::DecisionService;

pub const QUESTION_FILE: &str = "question.txt";

#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error("test case generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("report error: {0}")]
    Report(#[from] ReportError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },
}

/// Session directory of the `index`-th case (1-based).
pub fn case_dir(root: &Path, index: usize) -> PathBuf {
    root.join(format!("test_{:02}", index))
}

#[derive(Debug, Clone)]
pub struct SuiteConfig {
    pub url: String,
    /// Natural-language description of the target app
    pub instruction: String,
    pub output_dir: PathBuf,
    /// Reuse `test_cases.json` from the output directory when present
    pub skip_generation: bool,
}

async fn prepare_cases(config: &SuiteConfig, service: &dyn DecisionService) -> Result<Vec<TestCase>, SuiteError> {
    let path = config.output_dir.join(CASES_FILE);
    if config.skip_generation && path.exists() {
        info!(path = %path.display(), "using existing test cases");
        return Ok(load_cases(&path)?);
    }
    let cases = CaseGenerator::new(service).generate(&config.instruction).await?;
    write_cases(&path, &cases)?;
    Ok(cases)
}

/// Outcome already persisted for this case, if its session finished earlier.
fn resumed_outcome(case: &TestCase, dir: &Path) -> Option<CaseOutcome> {
    match SessionDir::new(dir).load_result() {
        Ok(Some(result)) if result.task == case.task => Some(CaseOutcome::from_session(case.clone(), &result)),
        Ok(_) => None,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "ignoring unreadable result, re-running");
            None
        }
    }
}

/// Run a full suite against `config.url` and write its report.
pub async fn run_suite(
    config: &SuiteConfig,
    service: &dyn DecisionService,
    runner: Arc<dyn SessionRunner>,
    scheduler: &BatchScheduler,
) -> Result<BatchReport, SuiteError> {
    fs::create_dir_all(&config.output_dir)?;
    let cases = prepare_cases(config, service).await?;

    let jobs: Vec<Job<CaseJob, CaseOutcome>> = cases
        .into_iter()
        .enumerate()
        .map(|(i, test_case)| {
            let dir = case_dir(&config.output_dir, i + 1);
            let resumed = resumed_outcome(&test_case, &dir);
            Job::new(format!("test_{:02}", i + 1), CaseJob { test_case, dir }).resumed(resumed)
        })
        .collect();
    info!(
        url = %config.url,
        cases = jobs.len(),
        resumed = jobs.iter().filter(|j| j.resumed.is_some()).count(),
        "running suite"
    );

    let url = config.url.clone();
    let worker = move |_ctx: JobContext, job: CaseJob| {
        let runner = Arc::clone(&runner);
        let url = url.clone();
        async move {
            let request = SessionRequest {
                url,
                task: job.test_case.task.clone(),
                expected: job.test_case.expected_result.clone(),
                dir: job.dir.clone(),
                case_id: Some(job.test_case.id),
            };
            let result = runner.run(&request).await;
            CaseOutcome::from_session(job.test_case, &result)
        }
    };

    let mut collected: Vec<CaseOutcome> = Vec::new();
    let output_dir = config.output_dir.clone();
    let mut results = scheduler
        .run_batch(jobs, worker, |job_id, outcome: &CaseOutcome| {
            info!(job = job_id + 1, verdict = %outcome.result, "case finished");
            collected.push(outcome.clone());
            if let Err(e) = write_intermediate(&output_dir, &collected) {
                warn!(error = %e, "failed to write intermediate results");
            }
        })
        .await;

    results.sort_by_key(|(job_id, _)| *job_id);
    let report = BatchReport::from_outcomes(
        config.instruction.clone(),
        results.into_iter().map(|(_, outcome)| outcome).collect(),
    );
    report.write(&config.output_dir)?;
    info!(
        total = report.summary.total_tests,
        accuracy = report.summary.accuracy,
        pass_rate = report.summary.pass_rate,
        "suite finished"
    );
    Ok(report)
}

/// One app of an app batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppTarget {
    pub index: u32,
    pub filename: String,
    pub question: String,
}

impl AppTarget {
    /// File name without extension, used as the output directory name.
    pub fn stem(&self) -> &str {
        self.filename.strip_suffix(".html").unwrap_or(&self.filename)
    }
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    index: u32,
    question: String,
}

/// Trailing number of a file stem: `game_007` -> 7.
fn stem_index(stem: &str) -> Option<u32> {
    let digits: String = stem
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

/// Pair every `*.html` in `apps_dir` with its manifest question.
pub fn discover_apps(apps_dir: &Path, manifest: &Path) -> Result<Vec<AppTarget>, SuiteError> {
    let raw = fs::read_to_string(manifest)?;
    let entries: Vec<ManifestEntry> = serde_json::from_str(&raw).map_err(|e| SuiteError::Manifest {
        path: manifest.to_path_buf(),
        reason: e.to_string(),
    })?;
    let questions: HashMap<u32, String> = entries.into_iter().map(|e| (e.index, e.question)).collect();

    let mut filenames: Vec<String> = fs::read_dir(apps_dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".html"))
        .collect();
    filenames.sort();

    let mut apps = Vec::new();
    for filename in filenames {
        let stem = filename.trim_end_matches(".html");
        let Some(index) = stem_index(stem) else {
            warn!(%filename, "no numeric index in file name, skipping");
            continue;
        };
        match questions.get(&index) {
            Some(question) => apps.push(AppTarget {
                index,
                filename,
                question: question.clone(),
            }),
            None => warn!(%filename, index, "index not in manifest, skipping"),
        }
    }
    Ok(apps)
}

#[derive(Debug, Clone)]
pub struct AppBatchConfig {
    pub apps_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Server command template with a `{port}` placeholder
    pub server_command: String,
    pub ready_timeout: Duration,
    /// Sessions run in parallel inside one app's suite
    pub session_concurrency: usize,
    pub skip_generation: bool,
}

/// Scheduler payload for one app.
#[derive(Debug, Clone)]
pub struct AppJob {
    pub target: AppTarget,
    pub dir: PathBuf,
}

impl AppOutcome {
    fn for_job(job: &AppJob, status: AppStatus, message: String, elapsed: f64) -> Self {
        Self {
            index: job.target.index,
            filename: job.target.filename.clone(),
            status,
            message,
            elapsed,
            output_dir: job.dir.clone(),
            port: None,
            summary: None,
        }
    }
}

impl JobOutcome<AppJob> for AppOutcome {
    fn status(&self) -> JobStatus {
        match self.status {
            AppStatus::Success | AppStatus::CompletedNoReport => JobStatus::Completed,
            AppStatus::Timeout => JobStatus::Timeout,
            AppStatus::Failed | AppStatus::Error => JobStatus::Error,
        }
    }

    fn timed_out(job: &AppJob, after: Duration) -> Self {
        Self::for_job(
            job,
            AppStatus::Timeout,
            format!("timed out after {}s", after.as_secs()),
            after.as_secs_f64(),
        )
    }

    fn crashed(job: &AppJob, detail: String) -> Self {
        Self::for_job(job, AppStatus::Error, detail, 0.0)
    }
}

/// Test every app found by [`discover_apps`] and write `batch_summary.*`.
///
/// `scheduler` should carry a port allocator and the per-app timeout.
pub async fn run_app_batch(
    config: &AppBatchConfig,
    apps: Vec<AppTarget>,
    service: Arc<dyn DecisionService>,
    runner: Arc<dyn SessionRunner>,
    scheduler: &BatchScheduler,
) -> Result<BatchSummary, SuiteError> {
    fs::create_dir_all(&config.output_dir)?;
    let jobs: Vec<Job<AppJob, AppOutcome>> = apps
        .into_iter()
        .map(|target| {
            let dir = config.output_dir.join(target.stem());
            Job::new(target.filename.clone(), AppJob { target, dir })
        })
        .collect();
    info!(apps = jobs.len(), concurrency = scheduler.concurrency(), "running app batch");

    let output_dir = config.output_dir.clone();
    let config = Arc::new(config.clone());
    let worker = move |ctx: JobContext, job: AppJob| {
        let config = Arc::clone(&config);
        let service = Arc::clone(&service);
        let runner = Arc::clone(&runner);
        async move {
            let started = Instant::now();
            let mut outcome = test_app(&config, &job, ctx, service.as_ref(), runner).await;
            outcome.elapsed = started.elapsed().as_secs_f64();
            outcome
        }
    };

    let results = scheduler
        .run_batch(jobs, worker, |_, outcome: &AppOutcome| {
            info!(
                index = outcome.index,
                status = outcome.status.as_str(),
                elapsed_secs = outcome.elapsed,
                "{}",
                outcome.message
            );
        })
        .await;

    let summary = BatchSummary::from_outcomes(results.into_iter().map(|(_, outcome)| outcome).collect());
    summary.write(&output_dir)?;
    Ok(summary)
}

async fn test_app(
    config: &AppBatchConfig,
    job: &AppJob,
    ctx: JobContext,
    service: &dyn DecisionService,
    runner: Arc<dyn SessionRunner>,
) -> AppOutcome {
    let fail = |status, message: String| AppOutcome::for_job(job, status, message, 0.0);

    if let Err(e) = fs::create_dir_all(&job.dir).and_then(|_| fs::write(job.dir.join(QUESTION_FILE), &job.target.question))
    {
        return fail(AppStatus::Error, e.to_string());
    }
    let Some(lease) = ctx.port else {
        return fail(AppStatus::Error, "no port assigned".to_string());
    };
    let port = lease.port();
    let server = match StaticServer::start(&config.server_command, &config.apps_dir, lease, config.ready_timeout).await
    {
        Ok(server) => server,
        Err(e) => return fail(AppStatus::Error, e.to_string()),
    };

    let suite = SuiteConfig {
        url: server.url(&job.target.filename),
        instruction: job.target.question.clone(),
        output_dir: job.dir.clone(),
        skip_generation: config.skip_generation,
    };
    let sessions = BatchScheduler::new(config.session_concurrency);
    let result = run_suite(&suite, service, runner, &sessions).await;
    server.stop().await;

    let mut outcome = match result {
        Ok(_) => match BatchReport::load(&job.dir) {
            Ok(report) => {
                let s = &report.summary;
                let message = format!("completed - YES:{} PARTIAL:{} NO:{}", s.yes, s.partial, s.no);
                let mut outcome = fail(AppStatus::Success, message);
                outcome.summary = Some(report.summary);
                outcome
            }
            Err(_) => fail(AppStatus::CompletedNoReport, "completed without a report file".to_string()),
        },
        Err(e) => fail(AppStatus::Failed, e.to_string()),
    };
    outcome.port = Some(port);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stem_index() {
        assert_eq!(stem_index("game_007"), Some(7));
        assert_eq!(stem_index("app12"), Some(12));
        assert_eq!(stem_index("index"), None);
    }

    #[test]
    fn test_case_dir_two_digits() {
        assert_eq!(case_dir(Path::new("out"), 3), PathBuf::from("out/test_03"));
        assert_eq!(case_dir(Path::new("out"), 10), PathBuf::from("out/test_10"));
    }

    #[test]
    fn test_discover_apps_pairs_manifest() {
        let tmp = TempDir::new().unwrap();
        let apps = tmp.path().join("apps");
        fs::create_dir_all(&apps).unwrap();
        for name in ["game_001.html", "game_002.html", "game_009.html", "readme.txt", "index.html"] {
            fs::write(apps.join(name), "<html></html>").unwrap();
        }
        let manifest = tmp.path().join("manifest.json");
        fs::write(
            &manifest,
            r#"[{"index": 2, "question": "a snake game"}, {"index": 1, "question": "a 2048 clone", "extra": true}]"#,
        )
        .unwrap();

        let found = discover_apps(&apps, &manifest).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].index, 1);
        assert_eq!(found[0].question, "a 2048 clone");
        assert_eq!(found[1].stem(), "game_002");
    }

    #[test]
    fn test_bad_manifest_rejected() {
        let tmp = TempDir::new().unwrap();
        let manifest = tmp.path().join("manifest.json");
        fs::write(&manifest, "{}").unwrap();
        assert!(matches!(
            discover_apps(tmp.path(), &manifest),
            Err(SuiteError::Manifest { .. })
        ));
    }
}
