//! ui-verdict - functional testing of web UIs with a vision-language-model agent.
//!
//! An agent looks at a labelled screenshot of the page, picks one action
//! (click, type, scroll, key press, wait, back), observes the result and
//! eventually answers `YES`, `NO` or `PARTIAL` to "does the app do what was
//! expected?".
//!
//! This crate provides:
//! - A lenient action grammar for free-form model replies ([`action`])
//! - A bounded multimodal conversation ([`conversation`])
//! - The perceive/decide/act loop ([`agent`]) over a [`driver::UiDriver`]
//! - Test case generation from an app description ([`cases`])
//! - Isolated, resumable sessions with durable results ([`runner`], [`session`])
//! - A concurrency-bounded batch scheduler with port leasing ([`scheduler`])
//! - Suite and app-batch pipelines with reports ([`suite`], [`report`])
//! - A read-only progress monitor ([`monitor`])
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ui_verdict::driver::ChromeLauncher;
//! use ui_verdict::runner::{InProcessRunner, SessionRequest, SessionRunner};
//! use ui_verdict::vlm::{ChatClient, VlmConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ChatClient::new(VlmConfig::default())?;
//! let runner = InProcessRunner::new(Arc::new(ChromeLauncher::default()), Arc::new(client), "gpt-4o");
//! let result = runner
//!     .run(&SessionRequest {
//!         url: "http://localhost:8000/".into(),
//!         task: "Click Start".into(),
//!         expected: "The game board appears".into(),
//!         dir: "./out/test_01".into(),
//!         case_id: None,
//!     })
//!     .await;
//! println!("{}", result.result);
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod agent;
pub mod cases;
pub mod config;
pub mod conversation;
pub mod driver;
pub mod logging;
pub mod monitor;
pub mod report;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod suite;
pub mod vlm;

// Re-export the action grammar
pub use action::{Action, Judgement, Verdict, parse_response};

// Re-export the agent loop
pub use agent::{AgentConfig, AgentLoop, LoopOutcome, Pacing};

// Re-export case generation
pub use cases::{CaseGenerator, GenerationError, Priority, TestCase};

// Re-export runners and session artifacts
pub use runner::{InProcessRunner, ProcessRunner, SessionRequest, SessionRunner};
pub use session::{SessionDir, SessionResult};

// Re-export scheduling and pipelines
pub use report::{BatchReport, BatchSummary};
pub use scheduler::{BatchScheduler, JobStatus, PortAllocator};
pub use suite::{AppBatchConfig, SuiteConfig, run_app_batch, run_suite};

// Re-export decision service client
pub use vlm::{ChatClient, DecisionService, Retrying, VlmConfig, VlmError, VlmResult, check_health};
