//! Per-session artifact directory.
//!
//! Every session owns one directory holding:
//! - `.session.json` metadata written at init
//! - `screenshot_<turn>.png` for each perceived turn
//! - `turns.jsonl` audit transcript, one line per turn
//! - `result.json` terminal result, written once and durably
//! - `session.log` child-process output when run out of process

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::Verdict;

pub const RESULT_FILE: &str = "result.json";
pub const TRANSCRIPT_FILE: &str = "turns.jsonl";
pub const LOG_FILE: &str = "session.log";
const METADATA_FILE: &str = ".session.json";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SessionError + '_ {
    move |source| SessionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Terminal record of one session, persisted as `result.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub url: String,
    pub task: String,
    pub expected: String,
    pub result: Verdict,
    /// Turns consumed before termination
    pub iterations: usize,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Directory the result was written to; not persisted
    #[serde(skip)]
    pub artifacts_dir: PathBuf,
}

impl SessionResult {
    /// A result with `UNKNOWN` verdict stamped now; fill in with the builders.
    pub fn new(
        url: impl Into<String>,
        task: impl Into<String>,
        expected: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            task: task.into(),
            expected: expected.into(),
            result: Verdict::Unknown,
            iterations: 0,
            model: model.into(),
            timestamp: Utc::now(),
            case_id: None,
            error: None,
            artifacts_dir: PathBuf::new(),
        }
    }

    pub fn verdict(mut self, verdict: Verdict, iterations: usize) -> Self {
        self.result = verdict;
        self.iterations = iterations;
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn case_id(mut self, case_id: Option<u32>) -> Self {
        self.case_id = case_id;
        self
    }
}

/// One line of `turns.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Canonical form of the parsed action, absent for unparsable replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Artifact directory of a single session
#[derive(Debug, Clone)]
pub struct SessionDir {
    /// Directory name, used as the session id
    pub id: String,
    pub dir: PathBuf,
}

impl SessionDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "session".to_string());
        Self { id, dir }
    }

    /// Create the directory, drop artifacts of any earlier run and write
    /// `.session.json`.
    pub fn init(&self, url: &str, task: &str) -> Result<(), SessionError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        self.clear_artifacts()?;
        let metadata = serde_json::json!({
            "id": self.id,
            "created": Utc::now().to_rfc3339(),
            "url": url,
            "task": task,
        });
        let path = self.dir.join(METADATA_FILE);
        let body = serde_json::to_string_pretty(&metadata).map_err(|source| SessionError::Corrupt {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, body).map_err(io_err(&path))
    }

    /// Remove screenshots, the transcript and `result.json`.
    ///
    /// `session.log` is left alone: a parent may already be redirecting a
    /// child's output into it.
    pub fn clear_artifacts(&self) -> Result<(), SessionError> {
        let mut stale = self.list_screenshots()?;
        stale.push(self.transcript_path());
        stale.push(self.result_path());
        for path in stale {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&path)(e)),
            }
        }
        Ok(())
    }

    pub fn screenshot_path(&self, turn: usize) -> PathBuf {
        self.dir.join(format!("screenshot_{}.png", turn))
    }

    pub fn write_screenshot(&self, turn: usize, png: &[u8]) -> Result<PathBuf, SessionError> {
        let path = self.screenshot_path(turn);
        fs::write(&path, png).map_err(io_err(&path))?;
        Ok(path)
    }

    /// Screenshots in turn order.
    pub fn list_screenshots(&self) -> Result<Vec<PathBuf>, SessionError> {
        let mut shots = Vec::new();
        if self.dir.exists() {
            for entry in fs::read_dir(&self.dir).map_err(io_err(&self.dir))? {
                let path = entry.map_err(io_err(&self.dir))?.path();
                if let Some(turn) = screenshot_turn(&path) {
                    shots.push((turn, path));
                }
            }
        }
        shots.sort();
        Ok(shots.into_iter().map(|(_, p)| p).collect())
    }

    pub fn result_path(&self) -> PathBuf {
        self.dir.join(RESULT_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn transcript_path(&self) -> PathBuf {
        self.dir.join(TRANSCRIPT_FILE)
    }

    /// Read `result.json`; `Ok(None)` when it has not been written.
    pub fn load_result(&self) -> Result<Option<SessionResult>, SessionError> {
        let path = self.result_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        let mut result: SessionResult =
            serde_json::from_str(&raw).map_err(|source| SessionError::Corrupt { path, source })?;
        result.artifacts_dir = self.dir.clone();
        Ok(Some(result))
    }

    /// Persist `result.json` via temp file, fsync and rename.
    pub fn write_result(&self, result: &SessionResult) -> Result<(), SessionError> {
        let path = self.result_path();
        let body = serde_json::to_vec_pretty(result).map_err(|source| SessionError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_durable(&path, &body)
    }

    pub fn append_turn(&self, record: &TurnRecord) -> Result<(), SessionError> {
        let path = self.transcript_path();
        let line = serde_json::to_string(record).map_err(|source| SessionError::Corrupt {
            path: path.clone(),
            source,
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        writeln!(file, "{}", line).map_err(io_err(&path))
    }
}

/// Write `bytes` to `path` so that readers see either the old file or the
/// complete new one.
pub fn write_durable(path: &Path, bytes: &[u8]) -> Result<(), SessionError> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(bytes).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
    }
    fs::rename(&tmp, path).map_err(io_err(path))?;
    if let Some(parent) = path.parent() {
        // Directory fsync is not supported everywhere.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn screenshot_turn(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix("screenshot_")?
        .strip_suffix(".png")?
        .parse()
        .ok()
}
