//! Per-work-class circuit breaker.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Failure state of one work class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitState {
    pub work_class: String,
    pub consecutive_failures: u32,
    pub open: bool,
}

/// What a recorded failure did to the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    /// Still closed, with this many consecutive failures
    Counting(u32),
    /// This failure reached the threshold and opened the circuit
    Tripped,
    /// The circuit was already open
    AlreadyOpen,
}

/// Tracks consecutive failures per work class and opens a class's circuit
/// once the threshold is reached. An open circuit stays open until `reset`.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    circuits: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_open(&self, work_class: &str) -> bool {
        self.circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(work_class)
            .is_some_and(|c| c.open)
    }

    /// Reset the failure count of a closed circuit.
    pub fn record_success(&self, work_class: &str) {
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(circuit) = circuits.get_mut(work_class) {
            if !circuit.open {
                circuit.consecutive_failures = 0;
            }
        }
    }

    pub fn record_failure(&self, work_class: &str) -> CircuitTransition {
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        let circuit = circuits
            .entry(work_class.to_string())
            .or_insert_with(|| CircuitState {
                work_class: work_class.to_string(),
                consecutive_failures: 0,
                open: false,
            });

        if circuit.open {
            return CircuitTransition::AlreadyOpen;
        }

        circuit.consecutive_failures += 1;
        if circuit.consecutive_failures >= self.threshold {
            circuit.open = true;
            tracing::warn!(
                "Circuit opened for work class '{}' after {} consecutive failures",
                work_class,
                circuit.consecutive_failures
            );
            CircuitTransition::Tripped
        } else {
            CircuitTransition::Counting(circuit.consecutive_failures)
        }
    }

    pub fn state(&self, work_class: &str) -> Option<CircuitState> {
        self.circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(work_class)
            .cloned()
    }

    /// All known circuits, sorted by work class.
    pub fn snapshot(&self) -> Vec<CircuitState> {
        let mut states: Vec<_> = self
            .circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        states.sort_by(|a, b| a.work_class.cmp(&b.work_class));
        states
    }

    pub fn open_count(&self) -> usize {
        self.circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.open)
            .count()
    }

    pub fn reset(&self) {
        self.circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
