//! Once-per-day attendance gate for a single stream.

use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate};

use crate::store::StoreError;

/// Persistent attendance log as seen by a stream driver.
///
/// Called from the driver's own thread, so the methods are blocking.
pub trait AttendanceLedger: Send + Sync {
    fn exists_for_date(&self, user: &str, date: NaiveDate) -> Result<bool, StoreError>;

    /// Create a record stamped `at`. Returns `false` if one already existed
    /// for that user and day.
    fn create(&self, user: &str, at: DateTime<Local>) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Pending,
    Created,
    /// Another stream got there first.
    Existed,
    Failed,
}

/// Guards the ledger for one stream: looks today up once at start and lets
/// at most one creation through.
pub struct AttendanceGate {
    ledger: Arc<dyn AttendanceLedger>,
    user: String,
    already_recorded: bool,
    state: GateState,
}

impl AttendanceGate {
    /// Query the ledger for `date`. A failed lookup is logged and treated as
    /// "not yet recorded"; the store's uniqueness constraint still prevents
    /// a duplicate.
    pub fn begin(ledger: Arc<dyn AttendanceLedger>, user: &str, date: NaiveDate) -> Self {
        let already_recorded = match ledger.exists_for_date(user, date) {
            Ok(exists) => exists,
            Err(e) => {
                tracing::error!(user, %date, error = %e, "attendance lookup failed");
                false
            }
        };
        tracing::debug!(user, %date, already_recorded, "attendance gate opened");

        Self {
            ledger,
            user: user.to_string(),
            already_recorded,
            state: GateState::Pending,
        }
    }

    pub fn already_recorded(&self) -> bool {
        self.already_recorded
    }

    /// True once a creation attempt was made, whatever its outcome.
    pub fn attempted(&self) -> bool {
        self.state != GateState::Pending
    }

    pub fn save_failed(&self) -> bool {
        self.state == GateState::Failed
    }

    /// Record attendance at `at`. Only the first call reaches the ledger;
    /// its outcome is kept in the gate and logged here.
    pub fn record(&mut self, at: DateTime<Local>) {
        if self.attempted() {
            tracing::debug!(user = %self.user, state = ?self.state, "attendance already attempted");
            return;
        }

        match self.ledger.create(&self.user, at) {
            Ok(true) => {
                self.state = GateState::Created;
                tracing::info!(user = %self.user, at = %at.to_rfc3339(), "attendance recorded");
            }
            Ok(false) => {
                self.state = GateState::Existed;
                tracing::warn!(
                    user = %self.user,
                    "attendance for today was recorded concurrently by another stream"
                );
            }
            Err(e) => {
                self.state = GateState::Failed;
                tracing::error!(user = %self.user, error = %e, "failed to save attendance");
            }
        }
    }
}
