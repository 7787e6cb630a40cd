//! Configuration management with environment variable support.
//!
//! This module provides centralized configuration for ui-verdict, supporting:
//! - Environment variables for all configurable values
//! - Defaults matching the pacing and limits the tool was tuned with
//! - Cached global access via [`get`]
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `UI_VERDICT_API_BASE` | Chat-completions base URL | `http://127.0.0.1:8080/v1` |
//! | `UI_VERDICT_API_KEY` | Bearer credential | (empty) |
//! | `UI_VERDICT_MODEL` | Model identifier | `gpt-4o` |
//! | `UI_VERDICT_MAX_TOKENS` | Maximum tokens per reply | `1000` |
//! | `UI_VERDICT_REQUEST_TIMEOUT` | Per-request timeout in seconds | `120` |
//! | `UI_VERDICT_RETRY_ATTEMPTS` | Attempts per decision call | `3` |
//! | `UI_VERDICT_RETRY_DELAY` | Backoff unit in seconds | `5` |
//! | `UI_VERDICT_MAX_TURNS` | Turn budget per session | `15` |
//! | `UI_VERDICT_HISTORY` | Retained non-system turns | `6` |
//! | `UI_VERDICT_SESSION_TIMEOUT` | Session wall clock in seconds | `300` |
//! | `UI_VERDICT_APP_TIMEOUT` | Per-app wall clock in seconds | `1800` |
//! | `UI_VERDICT_CONCURRENCY` | Worker slots per batch | `5` |
//! | `UI_VERDICT_BASE_PORT` | First port handed to app servers | `9000` |
//!
//! # Example
//!
//! ```bash
//! export UI_VERDICT_API_BASE="https://api.openai.com/v1"
//! export UI_VERDICT_API_KEY="sk-..."
//! export UI_VERDICT_MODEL="gpt-4o-mini"
//! ```

use std::env;
use std::str::FromStr;
use std::sync::OnceLock;

// ============================================================================
// Default Values
// ============================================================================

/// Default chat-completions base URL
pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8080/v1";

/// Default model identifier
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Default max tokens per decision reply
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Default per-request timeout (seconds)
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 120;

/// Default attempts per decision-service call
pub const DEFAULT_RETRY_ATTEMPTS: usize = 3;

/// Default backoff unit (seconds)
pub const DEFAULT_RETRY_DELAY: u64 = 5;

/// Default turn budget per session
pub const DEFAULT_MAX_TURNS: usize = 15;

/// Default number of retained non-system turns
pub const DEFAULT_HISTORY_LIMIT: usize = 6;

/// Default session wall clock (seconds)
pub const DEFAULT_SESSION_TIMEOUT: u64 = 300;

/// Default per-app wall clock in app batches (seconds)
pub const DEFAULT_APP_TIMEOUT: u64 = 1800;

/// Default worker slots
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default first port for app servers
pub const DEFAULT_BASE_PORT: u16 = 9000;

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_API_BASE: &str = "UI_VERDICT_API_BASE";
pub const ENV_API_KEY: &str = "UI_VERDICT_API_KEY";
pub const ENV_MODEL: &str = "UI_VERDICT_MODEL";
pub const ENV_MAX_TOKENS: &str = "UI_VERDICT_MAX_TOKENS";
pub const ENV_REQUEST_TIMEOUT: &str = "UI_VERDICT_REQUEST_TIMEOUT";
pub const ENV_RETRY_ATTEMPTS: &str = "UI_VERDICT_RETRY_ATTEMPTS";
pub const ENV_RETRY_DELAY: &str = "UI_VERDICT_RETRY_DELAY";
pub const ENV_MAX_TURNS: &str = "UI_VERDICT_MAX_TURNS";
pub const ENV_HISTORY_LIMIT: &str = "UI_VERDICT_HISTORY";
pub const ENV_SESSION_TIMEOUT: &str = "UI_VERDICT_SESSION_TIMEOUT";
pub const ENV_APP_TIMEOUT: &str = "UI_VERDICT_APP_TIMEOUT";
pub const ENV_CONCURRENCY: &str = "UI_VERDICT_CONCURRENCY";
pub const ENV_BASE_PORT: &str = "UI_VERDICT_BASE_PORT";

/// Fallback for the credential when the tool-specific variable is unset
pub const ENV_API_KEY_FALLBACK: &str = "OPENAI_API_KEY";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub service: ServiceSettings,
    pub agent: AgentSettings,
    pub batch: BatchSettings,
}

/// Decision-service settings
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    /// Per-request timeout (seconds)
    pub request_timeout: u64,
    pub retry_attempts: usize,
    /// Backoff unit (seconds)
    pub retry_delay: u64,
}

/// Per-session agent settings
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_turns: usize,
    pub history_limit: usize,
    /// Session wall clock (seconds)
    pub session_timeout: u64,
}

/// Batch scheduling settings
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub concurrency: usize,
    /// Per-app wall clock (seconds)
    pub app_timeout: u64,
    pub base_port: u16,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            service: ServiceSettings::from_env(),
            agent: AgentSettings::from_env(),
            batch: BatchSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            service: ServiceSettings::defaults(),
            agent: AgentSettings::defaults(),
            batch: BatchSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServiceSettings {
    pub fn from_env() -> Self {
        Self {
            api_base: env::var(ENV_API_BASE).unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            api_key: env::var(ENV_API_KEY)
                .or_else(|_| env::var(ENV_API_KEY_FALLBACK))
                .unwrap_or_default(),
            model: env::var(ENV_MODEL).unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            max_tokens: env_parse(ENV_MAX_TOKENS, DEFAULT_MAX_TOKENS),
            request_timeout: env_parse(ENV_REQUEST_TIMEOUT, DEFAULT_REQUEST_TIMEOUT),
            retry_attempts: env_parse(ENV_RETRY_ATTEMPTS, DEFAULT_RETRY_ATTEMPTS),
            retry_delay: env_parse(ENV_RETRY_DELAY, DEFAULT_RETRY_DELAY),
        }
    }

    pub fn defaults() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl AgentSettings {
    pub fn from_env() -> Self {
        Self {
            max_turns: env_parse(ENV_MAX_TURNS, DEFAULT_MAX_TURNS),
            history_limit: env_parse(ENV_HISTORY_LIMIT, DEFAULT_HISTORY_LIMIT),
            session_timeout: env_parse(ENV_SESSION_TIMEOUT, DEFAULT_SESSION_TIMEOUT),
        }
    }

    pub fn defaults() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }
}

impl BatchSettings {
    pub fn from_env() -> Self {
        Self {
            concurrency: env_parse(ENV_CONCURRENCY, DEFAULT_CONCURRENCY),
            app_timeout: env_parse(ENV_APP_TIMEOUT, DEFAULT_APP_TIMEOUT),
            base_port: env_parse(ENV_BASE_PORT, DEFAULT_BASE_PORT),
        }
    }

    pub fn defaults() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            app_timeout: DEFAULT_APP_TIMEOUT,
            base_port: DEFAULT_BASE_PORT,
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Read and parse an environment variable, falling back on absence or garbage
fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| parse_setting(&s))
        .unwrap_or(default)
}

fn parse_setting<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setting() {
        assert_eq!(parse_setting::<u64>(" 42 "), Some(42));
        assert_eq!(parse_setting::<usize>("-1"), None);
        assert_eq!(parse_setting::<u16>("not a port"), None);
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::defaults();
        assert_eq!(config.service.api_base, DEFAULT_API_BASE);
        assert_eq!(config.service.retry_attempts, 3);
        assert_eq!(config.agent.max_turns, 15);
        assert_eq!(config.agent.history_limit, 6);
        assert_eq!(config.agent.session_timeout, 300);
        assert_eq!(config.batch.concurrency, 5);
    }
}
