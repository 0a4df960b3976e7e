use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

/// Outcome of one `migrate()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationResult {
    Success,
    FormUploaderRunning,
    FormDownloaderRunning,
    NotEnoughSpace,
    MovingFilesFailed,
}

impl MigrationResult {
    pub const fn as_str(self) -> &'static str {
        match self {
            MigrationResult::Success => "SUCCESS",
            MigrationResult::FormUploaderRunning => "FORM_UPLOADER_RUNNING",
            MigrationResult::FormDownloaderRunning => "FORM_DOWNLOADER_RUNNING",
            MigrationResult::NotEnoughSpace => "NOT_ENOUGH_SPACE",
            MigrationResult::MovingFilesFailed => "MOVING_FILES_FAILED",
        }
    }

    pub const fn is_success(self) -> bool {
        matches!(self, MigrationResult::Success)
    }
}

impl fmt::Display for MigrationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    #[default]
    Idle,
    CheckingPreconditions,
    Copying,
    SwitchingRoot,
    Rewriting,
    RollingBack,
    Succeeded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationAttemptState {
    pub in_progress: bool,
    pub last_result: Option<MigrationResult>,
    pub last_attempt_timestamp: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub phase: MigrationPhase,
}

/// Process-wide attempt state. The atomic flag is the only guard against two
/// migrations running at once; it is taken with compare-exchange and released
/// when the returned [`MigrationGuard`] drops.
#[derive(Clone, Default)]
pub struct MigrationStateHandle {
    running: Arc<AtomicBool>,
    inner: Arc<Mutex<MigrationAttemptState>>,
}

impl MigrationStateHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MigrationAttemptState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> MigrationAttemptState {
        let mut state = self.lock().clone();
        state.in_progress = self.is_in_progress();
        state
    }

    pub fn is_in_progress(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> MigrationPhase {
        self.lock().phase
    }

    pub fn last_result(&self) -> Option<MigrationResult> {
        self.lock().last_result
    }

    /// Forget the last result once it has been shown to the user.
    pub fn clear_result(&self) {
        self.lock().last_result = None;
    }

    pub fn try_begin(&self) -> AppResult<MigrationGuard> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::new(
                "MIGRATION/IN_PROGRESS",
                "Storage migration is already running.",
            ));
        }
        {
            let mut state = self.lock();
            state.in_progress = true;
            state.phase = MigrationPhase::CheckingPreconditions;
        }
        Ok(MigrationGuard {
            handle: self.clone(),
        })
    }

    pub(crate) fn set_phase(&self, phase: MigrationPhase) {
        self.lock().phase = phase;
    }

    pub(crate) fn seed_last_attempt(&self, at: Option<DateTime<Utc>>) {
        self.lock().last_attempt_timestamp = at;
    }

    pub(crate) fn record_attempt(&self, at: DateTime<Utc>) {
        self.lock().last_attempt_timestamp = Some(at);
    }
}

pub struct MigrationGuard {
    handle: MigrationStateHandle,
}

impl MigrationGuard {
    /// Record the outcome. The in-progress flag clears when the guard drops.
    pub fn finish(self, result: MigrationResult, finished_at: DateTime<Utc>) {
        let mut state = self.handle.lock();
        state.last_result = Some(result);
        state.last_finished_at = Some(finished_at);
    }
}

impl Drop for MigrationGuard {
    fn drop(&mut self) {
        {
            let mut state = self.handle.lock();
            state.in_progress = false;
            state.phase = MigrationPhase::Idle;
        }
        self.handle.running.store(false, Ordering::SeqCst);
    }
}
