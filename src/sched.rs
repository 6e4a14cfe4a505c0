//! Cooperative state machine bookkeeping.
//!
//! The monitor hart runs a bare round-robin loop over a fixed table of
//! state machines; one handler call per machine per tick, never blocking.
//! A machine changes state by assigning its `state` field. The scheduler
//! observes the change on the next step and runs the exit callback of the
//! old state followed by the entry callback of the new one before the
//! handler fires again.

/// Bookkeeping core shared by every cooperative state machine
#[derive(Debug)]
pub struct StateMachine<S> {
    /// Current state; handlers assign this to transition
    pub state: S,
    /// State the entry callback last ran for; `None` before the first step
    pub prev_state: Option<S>,
    /// Stamp used by per-state timeout checks
    pub start_time: u64,
    /// Handler invocations since reset
    pub execution_count: u64,
    /// Machine name for the console
    pub name: &'static str,
    /// Emit a transition trace for this machine
    pub debug: bool,
}

impl<S: Copy + PartialEq> StateMachine<S> {
    /// Create a machine parked in `initial`
    pub const fn new(name: &'static str, initial: S) -> Self {
        StateMachine {
            state: initial,
            prev_state: None,
            start_time: 0,
            execution_count: 0,
            name,
            debug: true,
        }
    }

    /// True when the last observed state differs from the current one
    pub fn transition_pending(&self) -> bool {
        self.prev_state != Some(self.state)
    }
}

/// Aggregate scheduler counters
#[derive(Debug, Default, Clone, Copy)]
pub struct SchedStats {
    /// Completed round-robin passes
    pub ticks: u64,
    /// Observed state transitions across all machines
    pub transitions: u64,
}
