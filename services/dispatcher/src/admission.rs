use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Stopped,
    Running,
    Restarting,
    Draining,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Draining => "draining",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("admission ceiling reached ({in_flight}/{ceiling})")]
    Saturated { in_flight: usize, ceiling: usize },
    #[error("application is {}", state.as_str())]
    Unavailable { state: Lifecycle },
}

#[derive(Debug)]
struct AdmissionState {
    in_flight: usize,
    ceiling: usize,
    peak_in_flight: usize,
    lifecycle: Lifecycle,
}

/// Per-application concurrency ceiling. Rejects instead of queueing.
///
/// The lifecycle lives under the same mutex as the counter, so a restart
/// that observes `in_flight == 0` also blocks new admissions atomically.
#[derive(Debug)]
pub struct AdmissionGate {
    state: Mutex<AdmissionState>,
    idle: Condvar,
}

impl AdmissionGate {
    pub fn new(ceiling: usize) -> Self {
        Self {
            state: Mutex::new(AdmissionState {
                in_flight: 0,
                ceiling: ceiling.max(1),
                peak_in_flight: 0,
                lifecycle: Lifecycle::Stopped,
            }),
            idle: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> Result<AdmissionPermit<'_>, AdmissionError> {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Running {
            return Err(AdmissionError::Unavailable {
                state: state.lifecycle,
            });
        }
        if state.in_flight >= state.ceiling {
            return Err(AdmissionError::Saturated {
                in_flight: state.in_flight,
                ceiling: state.ceiling,
            });
        }
        state.in_flight += 1;
        state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
        Ok(AdmissionPermit { gate: self })
    }

    fn release(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.in_flight > 0, "admission release without acquire");
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn ceiling(&self) -> usize {
        self.state.lock().ceiling
    }

    pub fn peak_in_flight(&self) -> usize {
        self.state.lock().peak_in_flight
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn open(&self, ceiling: usize) {
        let mut state = self.state.lock();
        state.ceiling = ceiling.max(1);
        state.lifecycle = Lifecycle::Running;
    }

    pub fn begin_drain(&self) -> Lifecycle {
        let mut state = self.state.lock();
        let previous = state.lifecycle;
        if previous != Lifecycle::Stopped {
            state.lifecycle = Lifecycle::Draining;
        }
        previous
    }

    /// Returns true once nothing is in flight, false if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.in_flight > 0 {
            let _ = self
                .idle
                .wait_while_for(&mut state, |state| state.in_flight > 0, timeout);
        }
        state.in_flight == 0
    }

    pub fn mark_stopped(&self) {
        self.state.lock().lifecycle = Lifecycle::Stopped;
    }

    /// One quiesce round: keeps admitting while it waits up to `wait` for
    /// the counter to drain, then flips to `Restarting` under the lock.
    /// On timeout returns the number still in flight.
    pub fn try_begin_restart(&self, wait: Duration) -> Result<(), usize> {
        let mut state = self.state.lock();
        if state.in_flight > 0 {
            let _ = self
                .idle
                .wait_while_for(&mut state, |state| state.in_flight > 0, wait);
        }
        if state.in_flight == 0 {
            state.lifecycle = Lifecycle::Restarting;
            Ok(())
        } else {
            Err(state.in_flight)
        }
    }
}

/// Holds one admission slot; dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit<'a> {
    gate: &'a AdmissionGate,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}
