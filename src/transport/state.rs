//! Connection state machine
//!
//! Tracks the transport lifecycle and rejects transitions that skip a step.

use std::fmt;
use std::time::{Duration, Instant};

use crate::error::TransportError;

/// Lifecycle states of a `FrameTransport`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// Created, no connection attempted
    Disconnected,
    /// Establishing the connection
    Connecting,
    /// Messages flow in both directions
    Open,
    /// Shutdown in progress
    Closing,
    /// Finished; resources released
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Disconnected => "Disconnected",
            TransportState::Connecting => "Connecting",
            TransportState::Open => "Open",
            TransportState::Closing => "Closing",
            TransportState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

impl TransportState {
    /// Returns true if sends are accepted
    pub fn is_open(&self) -> bool {
        matches!(self, TransportState::Open)
    }

    /// Returns true for the final state
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Closed)
    }

    /// Returns valid transitions from this state
    pub fn valid_transitions(&self) -> &'static [TransportState] {
        match self {
            TransportState::Disconnected => &[TransportState::Connecting, TransportState::Closed],
            TransportState::Connecting => &[
                TransportState::Open,
                TransportState::Closing,
                TransportState::Closed,
            ],
            TransportState::Open => &[TransportState::Closing, TransportState::Closed],
            TransportState::Closing => &[TransportState::Closed],
            TransportState::Closed => &[],
        }
    }
}

/// Record of a state transition
#[derive(Debug, Clone)]
pub struct StateTransition {
    /// Previous state
    pub from: TransportState,
    /// New state
    pub to: TransportState,
    /// When the transition occurred
    pub timestamp: Instant,
}

/// Validated transport lifecycle
#[derive(Debug)]
pub struct TransportStateMachine {
    current: TransportState,
    state_entered_at: Instant,
    history: Vec<StateTransition>,
}

impl Default for TransportStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportStateMachine {
    /// Creates a state machine in `Disconnected`
    pub fn new() -> Self {
        Self {
            current: TransportState::Disconnected,
            state_entered_at: Instant::now(),
            history: Vec::new(),
        }
    }

    /// Returns the current state
    pub fn current(&self) -> TransportState {
        self.current
    }

    /// Returns true if the transition is valid
    pub fn can_transition(&self, to: TransportState) -> bool {
        self.current.valid_transitions().contains(&to)
    }

    /// Attempts to transition to a new state
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` if `to` is not reachable
    pub fn transition(&mut self, to: TransportState) -> Result<(), TransportError> {
        if !self.can_transition(to) {
            return Err(TransportError::InvalidStateTransition {
                from: self.current.to_string(),
                to: to.to_string(),
            });
        }

        let transition = StateTransition {
            from: self.current,
            to,
            timestamp: Instant::now(),
        };
        self.current = to;
        self.state_entered_at = transition.timestamp;
        self.history.push(transition);
        Ok(())
    }

    /// Returns how long we've been in the current state
    pub fn time_in_state(&self) -> Duration {
        self.state_entered_at.elapsed()
    }

    /// Returns the transition history
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }
}
