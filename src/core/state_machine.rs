//! Connection State Machine
//!
//! Validated lifecycle of one logical channel:
//! `Disconnected -> Connecting -> Connected -> Disconnected`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default bound on recorded transitions
pub const DEFAULT_MAX_HISTORY: usize = 100;

/// Connection state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link
    #[default]
    Disconnected,
    /// Transport connect in flight
    Connecting,
    /// Link up and receiving
    Connected,
}

impl ConnectionState {
    /// Check if state is connected
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Why a channel went to `Disconnected`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Device deselected or replaced
    User,
    /// Channel disabled
    Disabled,
    /// Transport reported the link closed
    LinkLost,
    /// Connect attempt failed
    ConnectFailed(String),
    /// Transport rebound
    TransportChanged,
    /// Channel shut down
    Shutdown,
}

/// Rejected state change
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// State transition record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: ConnectionState,
    /// New state
    pub to: ConnectionState,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Set when entering `Disconnected`
    pub reason: Option<DisconnectReason>,
}

/// Connection state machine with bounded history
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
    history: Vec<StateTransition>,
    max_history: usize,
    disconnect_reason: Option<DisconnectReason>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a new state machine
    pub fn new() -> Self {
        Self::with_history(DEFAULT_MAX_HISTORY)
    }

    /// Create with a custom history bound
    pub fn with_history(max_history: usize) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            history: Vec::new(),
            max_history,
            disconnect_reason: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reason for the last move to `Disconnected`
    pub fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        self.disconnect_reason.as_ref()
    }

    /// Get state history, oldest first
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Transition to a new state.
    ///
    /// Returns `Ok(false)` when already in `to`; nothing is recorded then.
    pub fn transition(
        &mut self,
        to: ConnectionState,
        reason: Option<DisconnectReason>,
    ) -> Result<bool, InvalidTransition> {
        if to == self.state {
            return Ok(false);
        }
        if !Self::is_valid_transition(self.state, to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }

        if to == ConnectionState::Disconnected {
            self.disconnect_reason.clone_from(&reason);
        }

        self.history.push(StateTransition {
            from: self.state,
            to,
            timestamp: Utc::now(),
            reason,
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        self.state = to;
        Ok(true)
    }

    fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::{Connected, Connecting, Disconnected};

        matches!(
            (from, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}
