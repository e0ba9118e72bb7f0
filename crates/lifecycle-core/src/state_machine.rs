//! Transition tables for job and registration state machines

use crate::error::StateMachineError;
use std::fmt;

/// A state with a fixed transition table
pub trait JobState: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// States reachable from `self` in one step
    fn allowed_transitions(self) -> &'static [Self];

    /// Terminal states have no outgoing transitions
    fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }
}

/// Validates a state transition.
///
/// Illegal transitions return an error; with the `strict-debug` feature they
/// panic instead.
pub fn validate_transition<S: JobState>(from: S, to: S) -> Result<(), StateMachineError> {
    if from.allowed_transitions().contains(&to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal state transition attempted: {from:?} -> {to:?}");

        #[cfg(not(feature = "strict-debug"))]
        Err(StateMachineError::IllegalTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        })
    }
}

/// Tracks the current state of one job execution and the path it took
#[derive(Debug, Clone)]
pub struct StateTracker<S: JobState> {
    history: Vec<S>,
}

impl<S: JobState> StateTracker<S> {
    /// Start in `initial`
    #[must_use]
    pub fn new(initial: S) -> Self {
        Self {
            history: vec![initial],
        }
    }

    /// Current state
    #[must_use]
    pub fn current(&self) -> S {
        // history is never empty
        self.history[self.history.len() - 1]
    }

    /// Every state visited, in order
    #[must_use]
    pub fn history(&self) -> &[S] {
        &self.history
    }

    /// Move to `to` if the table allows it
    pub fn advance(&mut self, to: S) -> Result<(), StateMachineError> {
        validate_transition(self.current(), to)?;
        tracing::debug!(from = ?self.current(), to = ?to, "state transition");
        self.history.push(to);
        Ok(())
    }

    /// Check if the tracker reached a terminal state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.current().is_terminal()
    }

    /// Consume into the visited path
    #[must_use]
    pub fn into_history(self) -> Vec<S> {
        self.history
    }
}
