//! Session state machine with legal transition guards.
//!
//! Every session starts at `Created` and ends at `Closed` or `Aborted`.
//! Each `advance()` call validates the edge and records it, so the persisted
//! session carries an auditable transition log.

use std::fmt;
use std::time::Instant;

use chrono::Utc;

use crate::state::{SessionStatus, TransitionRecord};

/// Legal transitions between session states.
///
/// ```text
/// Created → Assigning → Collecting → Resolving → Closed
/// any non-terminal state → Aborted
/// ```
pub fn is_legal_transition(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;

    if to == Aborted && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Created, Assigning) | (Assigning, Collecting) | (Collecting, Resolving) | (Resolving, Closed)
    )
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq)]
pub struct IllegalTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal session transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// Tracks the current state and the log of transitions taken.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    current: SessionStatus,
    started: Instant,
    transitions: Vec<TransitionRecord>,
}

impl SessionStateMachine {
    /// Create a state machine starting at `Created`.
    pub fn new() -> Self {
        Self {
            current: SessionStatus::Created,
            started: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> SessionStatus {
        self.current
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Attempt to advance to the next state.
    pub fn advance(
        &mut self,
        to: SessionStatus,
        reason: Option<&str>,
    ) -> Result<&TransitionRecord, IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            at: Utc::now(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(&self.transitions[self.transitions.len() - 1])
    }

    /// Full transition log.
    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
