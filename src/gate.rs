use chrono::{DateTime, Duration, Utc};

use crate::state::MigrationAttemptState;

/// Minimum spacing between automatic attempts.
pub const DEFAULT_RETRY_INTERVAL_HOURS: i64 = 24;

/// Decides whether an automatic migration attempt should start now.
///
/// Never mutates state. A manual "migrate now" bypasses the gate and calls
/// the migrator directly.
#[derive(Debug, Clone, Copy)]
pub struct MigrationGate {
    retry_interval: Duration,
}

impl Default for MigrationGate {
    fn default() -> Self {
        Self::new(Duration::hours(DEFAULT_RETRY_INTERVAL_HOURS))
    }
}

impl MigrationGate {
    pub fn new(retry_interval: Duration) -> Self {
        Self { retry_interval }
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn should_auto_migrate(
        &self,
        state: &MigrationAttemptState,
        using_scoped_storage: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if using_scoped_storage {
            return false;
        }
        match state.last_attempt_timestamp {
            None => true,
            Some(last) => now - last >= self.retry_interval,
        }
    }
}
