//! Cooperative cancellation shared by the orchestrator and its workers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

const DEFAULT_REASON: &str = "Abort requested";

/// Snapshot of the abort signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AbortState {
    pub is_set: bool,
    pub reason: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Write-once cancellation flag with reason and timestamp.
///
/// `is_aborted` is a single atomic load so hot loops can poll it per item.
/// The first `abort` call wins; later calls leave reason and timestamp untouched
/// until `reset`.
#[derive(Debug, Default)]
pub struct AbortSignal {
    flag: AtomicBool,
    state: Mutex<AbortState>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal. Returns true if this call set it.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_set {
            return false;
        }

        let reason = reason.into();
        let reason = if reason.trim().is_empty() {
            DEFAULT_REASON.to_string()
        } else {
            reason
        };

        tracing::warn!("Abort requested: {}", reason);

        state.is_set = true;
        state.reason = Some(reason);
        state.timestamp = Some(Utc::now());
        self.flag.store(true, Ordering::Release);
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Reason recorded by the first `abort` call.
    pub fn reason(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reason
            .clone()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .timestamp
    }

    pub fn state(&self) -> AbortState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clear the signal for a new run.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = AbortState::default();
        self.flag.store(false, Ordering::Release);
    }
}
