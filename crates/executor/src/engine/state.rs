//! State vocabulary and append-only state history.
//!
//! Executions, task runs and attempts share the same [`StateType`]
//! vocabulary. A [`State`] pairs the current type with the full history of
//! transitions; the history is never rewritten, only extended.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// State of an execution, a task run or an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Created,
    Running,
    Paused,
    Restarted,
    Killing,
    Success,
    Warning,
    Failed,
    Killed,
    Cancelled,
    Queued,
    Retrying,
    Retried,
    Skipped,
}

impl StateType {
    /// Every state type, in declaration order.
    pub const ALL: [StateType; 14] = [
        Self::Created,
        Self::Running,
        Self::Paused,
        Self::Restarted,
        Self::Killing,
        Self::Success,
        Self::Warning,
        Self::Failed,
        Self::Killed,
        Self::Cancelled,
        Self::Queued,
        Self::Retrying,
        Self::Retried,
        Self::Skipped,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::Warning
                | Self::Failed
                | Self::Killed
                | Self::Cancelled
                | Self::Retried
                | Self::Skipped
        )
    }

    /// Terminal without a failure: the outcome can be consumed downstream.
    pub fn is_terminal_no_fail(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Warning | Self::Retried | Self::Skipped
        )
    }

    pub fn is_failed(self) -> bool {
        self == Self::Failed
    }

    pub fn is_paused(self) -> bool {
        self == Self::Paused
    }

    pub fn is_queued(self) -> bool {
        self == Self::Queued
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Restarted => "RESTARTED",
            Self::Killing => "KILLING",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
            Self::Cancelled => "CANCELLED",
            Self::Queued => "QUEUED",
            Self::Retrying => "RETRYING",
            Self::Retried => "RETRIED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// All terminal state types.
    pub fn terminal_types() -> Vec<StateType> {
        Self::ALL.into_iter().filter(|t| t.is_terminal()).collect()
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == upper)
            .ok_or_else(|| AppError::Parse(format!("Unknown state type: {}", s)))
    }
}

/// One transition in a state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub state: StateType,
    pub date: DateTime<Utc>,
}

/// Current state plus the append-only history that led to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub current: StateType,
    pub histories: Vec<History>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// A fresh state in `CREATED`.
    pub fn new() -> Self {
        Self {
            current: StateType::Created,
            histories: vec![History {
                state: StateType::Created,
                date: Utc::now(),
            }],
        }
    }

    /// Append a transition to `state`.
    ///
    /// Transitioning to the current state is a no-op. Dates never go
    /// backwards even if the wall clock does.
    pub fn with_state(&self, state: StateType) -> State {
        if self.current == state {
            tracing::debug!(state = %state, "State unchanged, already in it");
            return self.clone();
        }

        let now = Utc::now();
        let date = match self.histories.last() {
            Some(last) if last.date > now => last.date,
            _ => now,
        };

        let mut histories = self.histories.clone();
        histories.push(History { state, date });

        State {
            current: state,
            histories,
        }
    }

    /// State type preceding the current one.
    pub fn previous(&self) -> Option<StateType> {
        let len = self.histories.len();
        if len < 2 {
            return None;
        }
        Some(self.histories[len - 2].state)
    }

    /// Date the state settled, for terminal and paused states.
    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        if !self.is_terminal() && !self.is_paused() {
            return None;
        }
        self.histories.last().map(|h| h.date)
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn is_paused(&self) -> bool {
        self.current.is_paused()
    }

    /// `RESTARTED` directly after `KILLING`: the kill settled and the
    /// execution only needs finalizing.
    pub fn is_restarted_after_kill(&self) -> bool {
        self.current == StateType::Restarted && self.previous() == Some(StateType::Killing)
    }

    /// The state types of the history, oldest first.
    pub fn history_types(&self) -> Vec<StateType> {
        self.histories.iter().map(|h| h.state).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_starts_created() {
        let state = State::new();
        assert_eq!(state.current, StateType::Created);
        assert_eq!(state.history_types(), vec![StateType::Created]);
    }

    #[test]
    fn test_with_state_appends() {
        let state = State::new()
            .with_state(StateType::Running)
            .with_state(StateType::Failed);

        assert_eq!(state.current, StateType::Failed);
        assert_eq!(
            state.history_types(),
            vec![StateType::Created, StateType::Running, StateType::Failed]
        );
        assert!(state
            .histories
            .windows(2)
            .all(|w| w[0].date <= w[1].date));
    }

    #[test]
    fn test_with_same_state_is_noop() {
        let state = State::new().with_state(StateType::Running);
        let again = state.with_state(StateType::Running);
        assert_eq!(state, again);
    }

    #[test]
    fn test_terminal_types() {
        assert!(StateType::Success.is_terminal());
        assert!(StateType::Killed.is_terminal());
        assert!(StateType::Skipped.is_terminal());
        assert!(!StateType::Paused.is_terminal());
        assert!(!StateType::Queued.is_terminal());
        assert!(!StateType::Restarted.is_terminal());
        assert_eq!(StateType::terminal_types().len(), 7);
    }

    #[test]
    fn test_restart_markers() {
        let paused = State::new()
            .with_state(StateType::Running)
            .with_state(StateType::Paused)
            .with_state(StateType::Restarted);
        assert!(!paused.is_restarted_after_kill());

        let killed = State::new()
            .with_state(StateType::Running)
            .with_state(StateType::Killing)
            .with_state(StateType::Restarted);
        assert!(killed.is_restarted_after_kill());
    }

    #[test]
    fn test_end_date_only_when_settled() {
        let running = State::new().with_state(StateType::Running);
        assert!(running.end_date().is_none());

        let done = running.with_state(StateType::Success);
        assert!(done.end_date().is_some());
    }

    #[test]
    fn test_state_type_parsing() {
        assert_eq!("success".parse::<StateType>().unwrap(), StateType::Success);
        assert_eq!("KILLING".parse::<StateType>().unwrap(), StateType::Killing);
        assert!("bogus".parse::<StateType>().is_err());
    }

    #[test]
    fn test_state_serialization() {
        let state = State::new().with_state(StateType::Queued);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["current"], "QUEUED");
        assert_eq!(json["histories"][0]["state"], "CREATED");
    }
}
