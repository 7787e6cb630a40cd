use clap::{Args as ClapArgs, Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ui_verdict::agent::AgentConfig;
use ui_verdict::cases::GENERATION_MAX_TOKENS;
use ui_verdict::config;
use ui_verdict::driver::{ChromeLauncher, ChromeOptions};
use ui_verdict::logging;
use ui_verdict::monitor;
use ui_verdict::retry::RetryPolicy;
use ui_verdict::runner::{InProcessRunner, ProcessRunner, SessionRequest, SessionRunner};
use ui_verdict::scheduler::{BatchScheduler, DEFAULT_SERVER_COMMAND, PortAllocator};
use ui_verdict::suite::{AppBatchConfig, SuiteConfig, discover_apps, run_app_batch, run_suite};
use ui_verdict::vlm::{ChatClient, DecisionService, Retrying, VlmConfig, check_health};

/// Ports handed out to app servers start at `--base-port` and span this many
const PORT_SPAN: u16 = 200;

/// How long an app server gets to start listening
const SERVER_READY_TIMEOUT: Duration = Duration::from_secs(15);

/// ui-verdict - functional testing of web UIs with a vision-language-model agent
#[derive(Parser, Debug)]
#[command(
    name = "ui-verdict",
    about = "Drive a browser with a vision-language model and judge whether a web app does what it should",
    after_help = "ENVIRONMENT VARIABLES:\n\
        UI_VERDICT_API_BASE          Chat-completions base URL\n\
        UI_VERDICT_API_KEY           Bearer credential (falls back to OPENAI_API_KEY)\n\
        UI_VERDICT_MODEL             Model identifier\n\
        UI_VERDICT_MAX_TOKENS        Maximum tokens per reply\n\
        UI_VERDICT_REQUEST_TIMEOUT   Per-request timeout (s)\n\
        UI_VERDICT_RETRY_ATTEMPTS    Attempts per decision call\n\
        UI_VERDICT_RETRY_DELAY       Backoff unit (s)\n\
        UI_VERDICT_MAX_TURNS         Turn budget per session\n\
        UI_VERDICT_HISTORY           Retained conversation turns\n\
        UI_VERDICT_SESSION_TIMEOUT   Session wall clock (s)\n\
        UI_VERDICT_APP_TIMEOUT       Per-app wall clock (s)\n\
        UI_VERDICT_CONCURRENCY       Worker slots per batch\n\
        UI_VERDICT_BASE_PORT         First port handed to app servers\n\
        RUST_LOG                     Log filter (default: warn,ui_verdict=info)"
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Decision-service endpoint and credentials
#[derive(ClapArgs, Debug, Clone)]
struct ServiceArgs {
    /// Chat-completions base URL
    #[arg(long, env = config::ENV_API_BASE, default_value = config::DEFAULT_API_BASE)]
    api_base: String,

    /// Bearer credential
    #[arg(long, env = config::ENV_API_KEY, hide_env_values = true)]
    api_key: Option<String>,

    /// Model identifier
    #[arg(long, env = config::ENV_MODEL, default_value = config::DEFAULT_MODEL)]
    model: String,
}

impl ServiceArgs {
    fn vlm_config(&self) -> VlmConfig {
        let api_key = self
            .api_key
            .clone()
            .unwrap_or_else(|| config::get().service.api_key.clone());
        VlmConfig::new(&self.api_base).api_key(api_key).model(&self.model)
    }

    fn client(&self, config: VlmConfig) -> Result<Retrying<ChatClient>, Box<dyn Error>> {
        Ok(Retrying::new(ChatClient::new(config)?, RetryPolicy::default()))
    }

    async fn warn_if_unreachable(&self) {
        if !check_health(&self.api_base, Duration::from_secs(5)).await {
            eprintln!("Warning: decision service not responding at {}", self.api_base);
            eprintln!("Sessions will end with ERROR until it is reachable.");
        }
    }
}

/// Per-session execution settings
#[derive(ClapArgs, Debug, Clone)]
struct SessionArgs {
    /// Turn budget per session
    #[arg(long, default_value_t = config::get().agent.max_turns)]
    max_turns: usize,

    /// Session wall clock in seconds
    #[arg(long, default_value_t = config::get().agent.session_timeout)]
    session_timeout: u64,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Run sessions inside this process instead of one child process each
    #[arg(long)]
    in_process: bool,
}

impl SessionArgs {
    fn runner(&self, service: &ServiceArgs) -> Result<Arc<dyn SessionRunner>, Box<dyn Error>> {
        let wall_clock = Duration::from_secs(self.session_timeout);
        if self.in_process {
            let client: Arc<dyn DecisionService> = Arc::new(service.client(service.vlm_config())?);
            let drivers = ChromeLauncher::new(ChromeOptions::default().headless(!self.headed));
            let runner = InProcessRunner::new(Arc::new(drivers), client, &service.model)
                .agent(AgentConfig::default().max_turns(self.max_turns))
                .wall_clock(wall_clock);
            Ok(Arc::new(runner))
        } else {
            let runner = ProcessRunner::current_exe(service.vlm_config())?
                .max_turns(self.max_turns)
                .wall_clock(wall_clock)
                .headless(!self.headed);
            Ok(Arc::new(runner))
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate one task against a URL and write result.json
    Eval {
        /// Page to test
        #[arg(short, long)]
        url: String,

        /// Task for the agent to perform
        #[arg(short, long)]
        task: String,

        /// Expected behaviour to judge against
        #[arg(short, long)]
        expected: String,

        /// Session directory for screenshots and the result
        #[arg(short, long, default_value = "./session")]
        output_dir: PathBuf,

        /// Turn budget
        #[arg(long, default_value_t = config::get().agent.max_turns)]
        max_turns: usize,

        /// Wall clock in seconds
        #[arg(long, default_value_t = config::get().agent.session_timeout)]
        session_timeout: u64,

        /// Test case id recorded in the result
        #[arg(long)]
        case_id: Option<u32>,

        /// Show the browser window
        #[arg(long)]
        headed: bool,

        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Generate test cases for a URL and run them all
    Suite {
        /// Page to test
        #[arg(short, long)]
        url: String,

        /// Natural-language description of the app
        #[arg(short, long)]
        instruction: String,

        /// Output directory (test_cases.json, test_NN/, test_report.*)
        #[arg(short, long, default_value = "./suite")]
        output_dir: PathBuf,

        /// Reuse test_cases.json from the output directory
        #[arg(long)]
        skip_generation: bool,

        /// Sessions run in parallel
        #[arg(short, long, default_value_t = config::get().batch.concurrency)]
        concurrency: usize,

        #[command(flatten)]
        session: SessionArgs,

        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Serve and test every app in a directory of HTML files
    Batch {
        /// Directory of *.html apps named with a trailing index (game_007.html)
        #[arg(short, long)]
        apps_dir: PathBuf,

        /// JSON array of {index, question}
        #[arg(short, long)]
        manifest: PathBuf,

        /// Output directory (one suite per app, batch_summary.*)
        #[arg(short, long, default_value = "./batch")]
        output_dir: PathBuf,

        /// Apps tested in parallel
        #[arg(short, long, default_value_t = config::get().batch.concurrency)]
        concurrency: usize,

        /// Sessions run in parallel within one app
        #[arg(long, default_value_t = 1)]
        session_concurrency: usize,

        /// First port handed to app servers
        #[arg(long, default_value_t = config::get().batch.base_port)]
        base_port: u16,

        /// Per-app wall clock in seconds
        #[arg(long, default_value_t = config::get().batch.app_timeout)]
        app_timeout: u64,

        /// Static server command, run in the apps directory; {port} is substituted
        #[arg(long, default_value = DEFAULT_SERVER_COMMAND)]
        server_command: String,

        /// Reuse each app's test_cases.json when present
        #[arg(long)]
        skip_generation: bool,

        #[command(flatten)]
        session: SessionArgs,

        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Show progress of a suite or batch output directory
    Monitor {
        /// Suite or batch output directory
        root: PathBuf,

        /// Print once and exit
        #[arg(long)]
        once: bool,

        /// Seconds between refreshes
        #[arg(short, long, default_value = "30")]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    logging::init();
    let args = Args::parse();

    match args.command {
        Some(Commands::Eval {
            url,
            task,
            expected,
            output_dir,
            max_turns,
            session_timeout,
            case_id,
            headed,
            service,
        }) => {
            let client: Arc<dyn DecisionService> = Arc::new(service.client(service.vlm_config())?);
            let drivers = ChromeLauncher::new(ChromeOptions::default().headless(!headed));
            let runner = InProcessRunner::new(Arc::new(drivers), client, &service.model)
                .agent(AgentConfig::default().max_turns(max_turns))
                .wall_clock(Duration::from_secs(session_timeout));

            let request = SessionRequest {
                url,
                task,
                expected,
                dir: output_dir,
                case_id,
            };
            let result = runner.run(&request).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Some(Commands::Suite {
            url,
            instruction,
            output_dir,
            skip_generation,
            concurrency,
            session,
            service,
        }) => {
            service.warn_if_unreachable().await;
            let generator = service.client(service.vlm_config().max_tokens(GENERATION_MAX_TOKENS))?;
            let runner = session.runner(&service)?;
            let scheduler = BatchScheduler::new(concurrency);

            let config = SuiteConfig {
                url,
                instruction,
                output_dir,
                skip_generation,
            };
            let report = run_suite(&config, &generator, runner, &scheduler).await?;

            let s = &report.summary;
            println!("Suite completed: {} tests", s.total_tests);
            println!("  YES: {}  PARTIAL: {}  NO: {}  ERROR: {}", s.yes, s.partial, s.no, s.error);
            println!("  Accuracy: {:.2}%  Pass rate: {:.2}%", s.accuracy, s.pass_rate);
            println!("\nReport: {}", config.output_dir.display());
        }

        Some(Commands::Batch {
            apps_dir,
            manifest,
            output_dir,
            concurrency,
            session_concurrency,
            base_port,
            app_timeout,
            server_command,
            skip_generation,
            session,
            service,
        }) => {
            let apps = discover_apps(&apps_dir, &manifest)?;
            if apps.is_empty() {
                return Err(format!("no apps in {} match the manifest", apps_dir.display()).into());
            }
            println!("Found {} apps", apps.len());

            service.warn_if_unreachable().await;
            let generator: Arc<dyn DecisionService> =
                Arc::new(service.client(service.vlm_config().max_tokens(GENERATION_MAX_TOKENS))?);
            let runner = session.runner(&service)?;
            let scheduler = BatchScheduler::new(concurrency)
                .job_timeout(Duration::from_secs(app_timeout))
                .ports(PortAllocator::new(base_port, PORT_SPAN));

            let config = AppBatchConfig {
                apps_dir,
                output_dir,
                server_command,
                ready_timeout: SERVER_READY_TIMEOUT,
                session_concurrency,
                skip_generation,
            };
            let summary = run_app_batch(&config, apps, generator, runner, &scheduler).await?;

            println!("Batch completed: {} apps", summary.total);
            println!(
                "  SUCCESS: {}  COMPLETED_NO_REPORT: {}  FAILED: {}  TIMEOUT: {}  ERROR: {}",
                summary.success, summary.completed_no_report, summary.failed, summary.timeout, summary.error
            );
            if summary.total_tests > 0 {
                println!(
                    "  test cases: {}  YES: {}  PARTIAL: {}  NO: {}",
                    summary.total_tests, summary.total_yes, summary.total_partial, summary.total_no
                );
            }
            println!("\nSummary: {}", config.output_dir.display());
        }

        Some(Commands::Monitor { root, once, interval }) => loop {
            let snapshot = monitor::snapshot(&root)?;
            println!("[{}]", chrono::Local::now().format("%H:%M:%S"));
            print!("{}", snapshot.render());
            if once || snapshot.is_finished() {
                break;
            }
            println!();
            tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
        },

        None => {
            println!("ui-verdict - Functional testing of web UIs with a vision-language-model agent");
            println!();
            println!("Usage: ui-verdict <COMMAND>");
            println!();
            println!("Commands:");
            println!("  eval     Evaluate one task against a URL");
            println!("  suite    Generate test cases for a URL and run them all");
            println!("  batch    Serve and test every app in a directory of HTML files");
            println!("  monitor  Show progress of an output directory");
            println!();
            println!("Run with --help for more information.");
        }
    }

    Ok(())
}
