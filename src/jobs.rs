use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Background jobs whose live status gates a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobTag {
    FormUploader,
    FormDownloader,
}

impl JobTag {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobTag::FormUploader => "form-uploader",
            JobTag::FormDownloader => "form-downloader",
        }
    }
}

impl fmt::Display for JobTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown job tag: {0}")]
pub struct UnknownJobTag(String);

impl FromStr for JobTag {
    type Err = UnknownJobTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "form-uploader" => Ok(JobTag::FormUploader),
            "form-downloader" => Ok(JobTag::FormDownloader),
            other => Err(UnknownJobTag(other.to_string())),
        }
    }
}

/// Reports whether a background job is running at the instant of the call.
pub trait BackgroundJobRegistry: Send + Sync {
    fn is_running(&self, tag: JobTag) -> bool;
}

/// In-process registry. A job is running for as long as the guard returned
/// by [`JobRegistry::start`] is alive.
#[derive(Clone, Default)]
pub struct JobRegistry {
    running: Arc<Mutex<HashMap<JobTag, usize>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, tag: JobTag) -> JobGuard {
        let mut guard = self.running.lock().unwrap_or_else(|err| err.into_inner());
        *guard.entry(tag).or_insert(0) += 1;
        tracing::debug!(target: "storage_migration", event = "job_started", job = tag.as_str());
        JobGuard {
            tag,
            running: self.running.clone(),
        }
    }
}

impl BackgroundJobRegistry for JobRegistry {
    fn is_running(&self, tag: JobTag) -> bool {
        let guard = self.running.lock().unwrap_or_else(|err| err.into_inner());
        guard.get(&tag).copied().unwrap_or(0) > 0
    }
}

pub struct JobGuard {
    tag: JobTag,
    running: Arc<Mutex<HashMap<JobTag, usize>>>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let mut guard = self.running.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(count) = guard.get_mut(&self.tag) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                guard.remove(&self.tag);
            }
        }
        tracing::debug!(target: "storage_migration", event = "job_finished", job = self.tag.as_str());
    }
}
