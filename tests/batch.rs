//! Integration tests for suites over the batch scheduler

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use ui_verdict::action::Verdict;
use ui_verdict::cases::{CASES_FILE, Priority, TestCase, write_cases};
use ui_verdict::conversation::Conversation;
use ui_verdict::report::{BatchReport, CaseOutcome, INTERMEDIATE_JSON, REPORT_MD};
use ui_verdict::runner::{SessionRequest, SessionRunner};
use ui_verdict::scheduler::{BatchScheduler, JobStatus};
use ui_verdict::session::{SessionDir, SessionResult};
use ui_verdict::suite::{SuiteConfig, SuiteError, case_dir, run_suite};
use ui_verdict::vlm::{DecisionService, VlmResult};

/// Answers every generation request with the same reply.
struct Generator(String);

impl Generator {
    fn cases(n: usize) -> Self {
        let cases: Vec<serde_json::Value> = (1..=n)
            .map(|i| {
                serde_json::json!({
                    "id": i,
                    "task": format!("task {}", i),
                    "expected_result": format!("result {}", i),
                    "priority": "Medium",
                    "category": "functional",
                })
            })
            .collect();
        Self(format!("```json\n{}\n```", serde_json::to_string_pretty(&cases).unwrap()))
    }
}

#[async_trait]
impl DecisionService for Generator {
    async fn complete(&self, _conversation: &Conversation) -> VlmResult<String> {
        Ok(self.0.clone())
    }
}

/// Persists a YES for every request and tracks how many run at once.
#[derive(Default)]
struct CountingRunner {
    executed: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl SessionRunner for CountingRunner {
    async fn run(&self, request: &SessionRequest) -> SessionResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.executed.lock().push(request.task.clone());
        let session = SessionDir::new(&request.dir);
        session.init(&request.url, &request.task).unwrap();
        let result = SessionResult::new(&request.url, &request.task, &request.expected, "test-model")
            .verdict(Verdict::Yes, 2)
            .case_id(request.case_id);
        session.write_result(&result).unwrap();
        result
    }
}

fn suite_config(tmp: &TempDir, skip_generation: bool) -> SuiteConfig {
    SuiteConfig {
        url: "http://localhost:9000/game_001.html".to_string(),
        instruction: "A snake game".to_string(),
        output_dir: tmp.path().join("game_001"),
        skip_generation,
    }
}

#[tokio::test]
async fn test_concurrency_bound_holds() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(CountingRunner::default());
    let scheduler = BatchScheduler::new(3);

    let report = run_suite(&suite_config(&tmp, false), &Generator::cases(8), runner.clone(), &scheduler)
        .await
        .unwrap();

    assert_eq!(report.summary.total_tests, 8);
    assert_eq!(runner.executed.lock().len(), 8);
    assert!(runner.peak.load(Ordering::SeqCst) <= 3);
    assert!(scheduler.jobs().peak_running() <= 3);
    assert!(scheduler.jobs().peak_running() >= 2);
    assert!(
        scheduler
            .jobs()
            .snapshot()
            .iter()
            .all(|record| record.status == JobStatus::Completed)
    );
}

#[tokio::test]
async fn test_resume_runs_only_unfinished_cases() {
    let tmp = TempDir::new().unwrap();
    let config = suite_config(&tmp, true);
    fs::create_dir_all(&config.output_dir).unwrap();

    let cases: Vec<TestCase> = (1..=5)
        .map(|id| TestCase {
            id,
            task: format!("task {}", id),
            expected_result: format!("result {}", id),
            priority: Priority::High,
            category: String::new(),
        })
        .collect();
    write_cases(&config.output_dir.join(CASES_FILE), &cases).unwrap();
    for case in &cases[..3] {
        let session = SessionDir::new(case_dir(&config.output_dir, case.id as usize));
        session.init(&config.url, &case.task).unwrap();
        session
            .write_result(
                &SessionResult::new(&config.url, &case.task, &case.expected_result, "m").verdict(Verdict::No, 4),
            )
            .unwrap();
    }

    let runner = Arc::new(CountingRunner::default());
    let scheduler = BatchScheduler::new(2);
    let report = run_suite(&config, &Generator("unused".to_string()), runner.clone(), &scheduler)
        .await
        .unwrap();

    let mut executed = runner.executed.lock().clone();
    executed.sort();
    assert_eq!(executed, vec!["task 4".to_string(), "task 5".to_string()]);

    assert_eq!(report.summary.total_tests, 5);
    assert_eq!(report.summary.no, 3);
    assert_eq!(report.summary.yes, 2);
    assert_eq!(report.summary.accuracy, 40.0);
    let ids: Vec<u32> = report.detailed_results.iter().map(|o| o.test_case.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    let intermediate: Vec<CaseOutcome> =
        serde_json::from_str(&fs::read_to_string(config.output_dir.join(INTERMEDIATE_JSON)).unwrap()).unwrap();
    assert_eq!(intermediate.len(), 5);
    assert!(config.output_dir.join(REPORT_MD).exists());
    assert_eq!(BatchReport::load(&config.output_dir).unwrap().summary.total_tests, 5);
}

#[tokio::test]
async fn test_changed_task_is_rerun() {
    let tmp = TempDir::new().unwrap();
    let config = suite_config(&tmp, false);
    let stale = SessionDir::new(case_dir(&config.output_dir, 1));
    stale.init(&config.url, "an older task").unwrap();
    stale
        .write_result(&SessionResult::new(&config.url, "an older task", "e", "m").verdict(Verdict::No, 1))
        .unwrap();

    let runner = Arc::new(CountingRunner::default());
    let report = run_suite(&config, &Generator::cases(5), runner.clone(), &BatchScheduler::new(5))
        .await
        .unwrap();

    assert_eq!(runner.executed.lock().len(), 5);
    assert_eq!(report.summary.yes, 5);
}

#[tokio::test]
async fn test_generation_failure_produces_nothing() {
    let tmp = TempDir::new().unwrap();
    let config = suite_config(&tmp, false);
    let runner = Arc::new(CountingRunner::default());

    let err = run_suite(
        &config,
        &Generator("I cannot help with that.".to_string()),
        runner.clone(),
        &BatchScheduler::new(2),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SuiteError::Generation(_)));
    assert!(runner.executed.lock().is_empty());
    assert!(!config.output_dir.join(CASES_FILE).exists());
}

#[tokio::test]
async fn test_too_few_cases_is_a_generation_failure() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(CountingRunner::default());

    let err = run_suite(&suite_config(&tmp, false), &Generator::cases(3), runner, &BatchScheduler::new(2))
        .await
        .unwrap_err();

    assert!(matches!(err, SuiteError::Generation(_)));
}
