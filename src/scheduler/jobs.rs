//! Shared job table.
//!
//! One [`JobRecord`] per job, indexed by job id. Workers only touch their own
//! entry, and the lock is held for single-entry updates and snapshots only.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Timeout,
    Error,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Timeout | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Timeout => "timeout",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: usize,
    /// Human-readable reference to the job's payload
    pub label: String,
    pub status: JobStatus,
    pub assigned_port: Option<u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Completed by an earlier run and not executed again
    pub resumed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    records: Vec<JobRecord>,
    peak_running: usize,
}

#[derive(Debug, Default)]
pub struct JobTable {
    inner: Mutex<Inner>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table with one pending record per label.
    pub fn reset<I, S>(&self, labels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner.lock();
        inner.peak_running = 0;
        inner.records = labels
            .into_iter()
            .enumerate()
            .map(|(job_id, label)| JobRecord {
                job_id,
                label: label.into(),
                status: JobStatus::Pending,
                assigned_port: None,
                started_at: None,
                finished_at: None,
                resumed: false,
            })
            .collect();
    }

    pub fn mark_running(&self, job_id: usize, port: Option<u16>) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(job_id) {
            record.status = JobStatus::Running;
            record.assigned_port = port;
            record.started_at = Some(Utc::now());
        }
        let running = inner
            .records
            .iter()
            .filter(|r| r.status == JobStatus::Running)
            .count();
        inner.peak_running = inner.peak_running.max(running);
    }

    pub fn finish(&self, job_id: usize, status: JobStatus) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(job_id) {
            record.status = status;
            record.finished_at = Some(Utc::now());
        }
    }

    /// Record a job satisfied by a persisted result.
    pub fn mark_resumed(&self, job_id: usize, status: JobStatus) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(job_id) {
            record.status = status;
            record.resumed = true;
        }
    }

    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.inner.lock().records.clone()
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|r| r.status == JobStatus::Running)
            .count()
    }

    /// Highest number of simultaneously running jobs seen since the last reset.
    pub fn peak_running(&self) -> usize {
        self.inner.lock().peak_running
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let table = JobTable::new();
        table.reset(["a", "b", "c"]);
        assert_eq!(table.len(), 3);

        table.mark_running(0, Some(9000));
        table.mark_running(1, None);
        assert_eq!(table.running_count(), 2);

        table.finish(0, JobStatus::Completed);
        table.mark_resumed(2, JobStatus::Completed);
        assert_eq!(table.running_count(), 1);
        assert_eq!(table.peak_running(), 2);

        let snap = table.snapshot();
        assert_eq!(snap[0].assigned_port, Some(9000));
        assert!(snap[0].finished_at.is_some());
        assert!(snap[2].resumed);
        assert_eq!(snap[2].status, JobStatus::Completed);
    }

    #[test]
    fn test_unknown_job_ignored() {
        let table = JobTable::new();
        table.reset(["only"]);
        table.finish(5, JobStatus::Error);
        assert_eq!(table.snapshot()[0].status, JobStatus::Pending);
    }
}
