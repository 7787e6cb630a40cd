//! Session runners: execute one test case in isolation and persist its result.
//!
//! Whatever happens inside a session (verdict, turn budget exhausted, wall
//! clock exceeded, driver failure, panic) the runner returns a
//! [`SessionResult`] and has already written it to `result.json`.
//!
//! - [`InProcessRunner`] drives the agent loop in the current process
//! - [`ProcessRunner`] re-invokes this binary's `eval` subcommand per session

use std::fs::File;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::action::Verdict;
use crate::agent::{AgentConfig, AgentLoop};
use crate::config;
use crate::driver::DriverFactory;
use crate::scheduler::panic_message;
use crate::session::{SessionDir, SessionResult};
use crate::vlm::{DecisionService, VlmConfig};

/// Extra time a child gets beyond its own wall clock to write its result
const CHILD_GRACE: Duration = Duration::from_secs(30);

/// Parameters for one session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub url: String,
    pub task: String,
    pub expected: String,
    /// Artifact directory, created if missing
    pub dir: PathBuf,
    pub case_id: Option<u32>,
}

#[async_trait]
pub trait SessionRunner: Send + Sync {
    /// Run the session to a terminal, persisted result.
    async fn run(&self, request: &SessionRequest) -> SessionResult;
}

/// Write `result` to the session directory; a failed write is logged, never
/// propagated.
fn finalize(session: &SessionDir, mut result: SessionResult) -> SessionResult {
    result.artifacts_dir = session.dir.clone();
    if let Err(e) = session.write_result(&result) {
        error!(session = %session.id, error = %e, "failed to persist result");
    }
    info!(session = %session.id, verdict = %result.result, iterations = result.iterations, "result saved");
    result
}

pub struct InProcessRunner {
    drivers: Arc<dyn DriverFactory>,
    service: Arc<dyn DecisionService>,
    agent: AgentConfig,
    wall_clock: Duration,
    model: String,
}

impl InProcessRunner {
    pub fn new(drivers: Arc<dyn DriverFactory>, service: Arc<dyn DecisionService>, model: impl Into<String>) -> Self {
        Self {
            drivers,
            service,
            agent: AgentConfig::default(),
            wall_clock: Duration::from_secs(config::get().agent.session_timeout),
            model: model.into(),
        }
    }

    pub fn agent(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    pub fn wall_clock(mut self, wall_clock: Duration) -> Self {
        self.wall_clock = wall_clock;
        self
    }

    async fn drive(&self, session: &SessionDir, request: &SessionRequest, base: SessionResult) -> SessionResult {
        let mut driver = match self.drivers.launch().await {
            Ok(driver) => driver,
            Err(e) => return base.verdict(Verdict::Error, 0).error(format!("driver launch failed: {}", e)),
        };

        let run = AgentLoop::new(driver.as_mut(), self.service.as_ref(), session, &self.agent).run(
            &request.url,
            &request.task,
            &request.expected,
        );
        let outcome = tokio::time::timeout(self.wall_clock, AssertUnwindSafe(run).catch_unwind()).await;

        if let Err(e) = driver.close().await {
            warn!(session = %session.id, error = %e, "driver close failed");
        }

        match outcome {
            Ok(Ok(outcome)) => {
                let result = base.verdict(outcome.verdict, outcome.turns_used);
                match outcome.error {
                    Some(error) => result.error(error),
                    None => result,
                }
            }
            Ok(Err(panic)) => {
                let detail = panic_message(panic.as_ref());
                error!(session = %session.id, %detail, "session panicked");
                base.verdict(Verdict::Error, 0).error(format!("session panicked: {}", detail))
            }
            Err(_) => {
                let turns = session.list_screenshots().map(|s| s.len()).unwrap_or(0);
                warn!(session = %session.id, wall_clock_secs = self.wall_clock.as_secs(), "session timed out");
                base.verdict(Verdict::Timeout, turns).error(format!(
                    "session exceeded wall clock of {}s",
                    self.wall_clock.as_secs()
                ))
            }
        }
    }
}

#[async_trait]
impl SessionRunner for InProcessRunner {
    async fn run(&self, request: &SessionRequest) -> SessionResult {
        let session = SessionDir::new(&request.dir);
        let base = SessionResult::new(&request.url, &request.task, &request.expected, &self.model)
            .case_id(request.case_id);
        let result = match session.init(&request.url, &request.task) {
            Ok(()) => self.drive(&session, request, base).await,
            Err(e) => base.verdict(Verdict::Error, 0).error(e.to_string()),
        };
        finalize(&session, result)
    }
}

/// Runs each session as a child `eval` process.
///
/// Credentials travel through the child's environment, never its argv. The
/// child's stdout and stderr go to `session.log`.
pub struct ProcessRunner {
    program: PathBuf,
    service: VlmConfig,
    max_turns: usize,
    wall_clock: Duration,
    headless: bool,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>, service: VlmConfig) -> Self {
        let agent = &config::get().agent;
        Self {
            program: program.into(),
            service,
            max_turns: agent.max_turns,
            wall_clock: Duration::from_secs(agent.session_timeout),
            headless: true,
        }
    }

    /// Runner re-invoking the current executable.
    pub fn current_exe(service: VlmConfig) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, service))
    }

    pub fn max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn wall_clock(mut self, wall_clock: Duration) -> Self {
        self.wall_clock = wall_clock;
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    fn command(&self, request: &SessionRequest, log: File) -> std::io::Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("eval")
            .arg("--url")
            .arg(&request.url)
            .arg("--task")
            .arg(&request.task)
            .arg("--expected")
            .arg(&request.expected)
            .arg("--output-dir")
            .arg(&request.dir)
            .arg("--max-turns")
            .arg(self.max_turns.to_string())
            .arg("--session-timeout")
            .arg(self.wall_clock.as_secs().to_string());
        if let Some(id) = request.case_id {
            cmd.arg("--case-id").arg(id.to_string());
        }
        if !self.headless {
            cmd.arg("--headed");
        }
        cmd.env(config::ENV_API_BASE, &self.service.api_base)
            .env(config::ENV_API_KEY, &self.service.api_key)
            .env(config::ENV_MODEL, &self.service.model)
            .env(config::ENV_MAX_TOKENS, self.service.max_tokens.to_string())
            .env(config::ENV_REQUEST_TIMEOUT, self.service.request_timeout.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl SessionRunner for ProcessRunner {
    async fn run(&self, request: &SessionRequest) -> SessionResult {
        let session = SessionDir::new(&request.dir);
        let base = SessionResult::new(&request.url, &request.task, &request.expected, &self.service.model)
            .case_id(request.case_id);

        if let Err(e) = session.init(&request.url, &request.task) {
            let result = base.verdict(Verdict::Error, 0).error(e.to_string());
            return finalize(&session, result);
        }
        let spawned = File::create(session.log_path())
            .and_then(|log| self.command(request, log))
            .and_then(|mut cmd| cmd.spawn());
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let result = base.verdict(Verdict::Error, 0).error(format!("failed to start session: {}", e));
                return finalize(&session, result);
            }
        };
        info!(session = %session.id, pid = ?child.id(), "session process started");

        let limit = self.wall_clock + CHILD_GRACE;
        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                let result = base.verdict(Verdict::Error, 0).error(format!("failed to wait for session: {}", e));
                return finalize(&session, result);
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(session = %session.id, error = %e, "failed to kill session process");
                }
                let turns = session.list_screenshots().map(|s| s.len()).unwrap_or(0);
                let result = base
                    .verdict(Verdict::Timeout, turns)
                    .error(format!("session process killed after {}s", limit.as_secs()));
                return finalize(&session, result);
            }
        };

        match session.load_result() {
            Ok(Some(result)) if result.task == request.task && result.url == request.url => result,
            Ok(Some(other)) => {
                warn!(session = %session.id, found_task = %other.task, "session result belongs to another task");
                let result = base
                    .verdict(Verdict::Unknown, 0)
                    .error(format!("result file does not match this session (child exited with {})", status));
                finalize(&session, result)
            }
            Ok(None) => {
                warn!(session = %session.id, %status, "session exited without a result");
                let result = base
                    .verdict(Verdict::Unknown, 0)
                    .error(format!("result file not found (child exited with {})", status));
                finalize(&session, result)
            }
            Err(e) => {
                warn!(session = %session.id, error = %e, "unreadable session result");
                finalize(&session, base.verdict(Verdict::Unknown, 0).error(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Pacing;
    use crate::conversation::Conversation;
    use crate::driver::ScriptedPage;
    use crate::vlm::VlmResult;
    use tempfile::TempDir;

    struct Panicking;

    #[async_trait]
    impl DecisionService for Panicking {
        async fn complete(&self, _conversation: &Conversation) -> VlmResult<String> {
            panic!("service exploded");
        }
    }

    /// Gives the same reply every turn.
    struct Always(&'static str);

    #[async_trait]
    impl DecisionService for Always {
        async fn complete(&self, _conversation: &Conversation) -> VlmResult<String> {
            Ok(self.0.to_string())
        }
    }

    fn request(dir: PathBuf) -> SessionRequest {
        SessionRequest {
            url: "http://localhost/".to_string(),
            task: "Press start".to_string(),
            expected: "Game starts".to_string(),
            dir,
            case_id: Some(1),
        }
    }

    #[tokio::test]
    async fn test_panic_persisted_as_error() {
        let tmp = TempDir::new().unwrap();
        let page = ScriptedPage::with_buttons(&["Start"]);
        let runner = InProcessRunner::new(Arc::new(page), Arc::new(Panicking), "test-model")
            .agent(AgentConfig::default().pacing(Pacing::none()));

        let result = runner.run(&request(tmp.path().join("test_01"))).await;
        assert_eq!(result.result, Verdict::Error);
        assert!(result.error.as_deref().unwrap_or("").contains("service exploded"));

        let persisted = SessionDir::new(tmp.path().join("test_01")).load_result().unwrap().unwrap();
        assert_eq!(persisted.result, Verdict::Error);
        assert_eq!(persisted.case_id, Some(1));
    }

    #[tokio::test]
    async fn test_rerun_starts_from_clean_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("test_01");
        let quick = |turns| AgentConfig::default().max_turns(turns).pacing(Pacing::none());

        let waiting = InProcessRunner::new(
            Arc::new(ScriptedPage::with_buttons(&["Start"])),
            Arc::new(Always("Action: Wait")),
            "test-model",
        )
        .agent(quick(4));
        let first = waiting.run(&request(dir.clone())).await;
        assert_eq!(first.result, Verdict::Timeout);
        assert_eq!(SessionDir::new(&dir).list_screenshots().unwrap().len(), 4);

        let answering = InProcessRunner::new(
            Arc::new(ScriptedPage::with_buttons(&["Start"])),
            Arc::new(Always("Action: ANSWER; YES")),
            "test-model",
        )
        .agent(quick(4));
        let second = answering.run(&request(dir.clone())).await;
        assert_eq!(second.result, Verdict::Yes);
        assert_eq!(second.iterations, 1);

        let session = SessionDir::new(&dir);
        assert_eq!(session.list_screenshots().unwrap().len(), 1);
        let transcript = std::fs::read_to_string(session.transcript_path()).unwrap();
        assert_eq!(transcript.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_program_persisted_as_error() {
        let tmp = TempDir::new().unwrap();
        let runner = ProcessRunner::new("/nonexistent/ui-verdict", VlmConfig::new("http://127.0.0.1:1"));
        let result = runner.run(&request(tmp.path().join("test_01"))).await;
        assert_eq!(result.result, Verdict::Error);
        assert!(tmp.path().join("test_01").join("result.json").exists());
    }

    #[tokio::test]
    async fn test_child_without_result_is_unknown() {
        let tmp = TempDir::new().unwrap();
        // `true` ignores its arguments and exits without writing anything
        let runner = ProcessRunner::new("true", VlmConfig::new("http://127.0.0.1:1"));
        let result = runner.run(&request(tmp.path().join("test_01"))).await;
        assert_eq!(result.result, Verdict::Unknown);
        assert!(result.error.unwrap().contains("result file not found"));
        assert!(tmp.path().join("test_01").join("session.log").exists());
    }

    #[tokio::test]
    async fn test_result_from_earlier_run_is_not_reused() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("test_01");
        let earlier = SessionDir::new(&dir);
        earlier.init("http://localhost/", "an older task").unwrap();
        earlier
            .write_result(&SessionResult::new("http://localhost/", "an older task", "e", "m").verdict(Verdict::No, 4))
            .unwrap();

        let runner = ProcessRunner::new("true", VlmConfig::new("http://127.0.0.1:1"));
        let result = runner.run(&request(dir.clone())).await;
        assert_eq!(result.result, Verdict::Unknown);
        assert_eq!(result.task, "Press start");

        let persisted = SessionDir::new(&dir).load_result().unwrap().unwrap();
        assert_eq!(persisted.result, Verdict::Unknown);
        assert_eq!(persisted.task, "Press start");
    }

    #[tokio::test]
    async fn test_result_for_other_task_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("test_01");
        let foreign = SessionResult::new("http://localhost/", "an older task", "e", "m").verdict(Verdict::Yes, 1);
        // Stands in for a child that writes a result for a different task
        let program = tmp.path().join("fake-eval");
        std::fs::write(
            &program,
            format!(
                "#!/bin/sh\nprintf '%s' '{}' > '{}'\n",
                serde_json::to_string(&foreign).unwrap(),
                dir.join("result.json").display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = ProcessRunner::new(program.clone(), VlmConfig::new("http://127.0.0.1:1"));
        let result = runner.run(&request(dir.clone())).await;
        assert_eq!(result.result, Verdict::Unknown);
        assert!(result.error.unwrap().contains("does not match"));

        let persisted = SessionDir::new(&dir).load_result().unwrap().unwrap();
        assert_eq!(persisted.task, "Press start");
    }
}
