//! State machine shared by executions and task runs.
//!
//! A [`State`] is an ordered history of [`StateType`] transitions. Transitions
//! only move forward: a terminal state is final unless the run is explicitly
//! restarted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an execution or a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Created,
    Queued,
    Running,
    Paused,
    Restarted,
    Retrying,
    Killing,
    Killed,
    Success,
    Warning,
    Failed,
    Cancelled,
    Skipped,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Restarted => "RESTARTED",
            Self::Retrying => "RETRYING",
            Self::Killing => "KILLING",
            Self::Killed => "KILLED",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Terminal states are never left except through [`StateType::Restarted`].
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::Warning
                | Self::Failed
                | Self::Killed
                | Self::Cancelled
                | Self::Skipped
        )
    }

    pub fn is_running(&self) -> bool {
        !self.is_terminated()
    }

    pub fn is_created(&self) -> bool {
        *self == Self::Created
    }

    pub fn is_failed(&self) -> bool {
        *self == Self::Failed
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Queued => 1,
            Self::Running | Self::Paused | Self::Restarted | Self::Retrying => 2,
            Self::Killing => 3,
            _ => 4,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    ///
    /// Repeating the current state is not a transition, so duplicated updates
    /// are rejected here too.
    pub fn can_transition_to(&self, next: StateType) -> bool {
        if *self == next {
            return false;
        }
        if self.is_terminated() {
            return next == Self::Restarted;
        }
        if next == Self::Restarted {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATED" => Ok(Self::Created),
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "RESTARTED" => Ok(Self::Restarted),
            "RETRYING" => Ok(Self::Retrying),
            "KILLING" => Ok(Self::Killing),
            "KILLED" => Ok(Self::Killed),
            "SUCCESS" => Ok(Self::Success),
            "WARNING" => Ok(Self::Warning),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "SKIPPED" => Ok(Self::Skipped),
            _ => Err(format!("Unknown state: {}", s)),
        }
    }
}

/// One entry of a state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub state: StateType,
    pub date: DateTime<Utc>,
}

/// Current state plus the full ordered history that led to it.
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
    /// A fresh CREATED state stamped now.
    pub fn new() -> Self {
        Self::of(StateType::Created, Utc::now())
    }

    pub fn of(state: StateType, date: DateTime<Utc>) -> Self {
        Self {
            current: state,
            histories: vec![History { state, date }],
        }
    }

    /// Returns a new state with `state` appended at the current time.
    pub fn with_state(&self, state: StateType) -> Self {
        self.with_state_at(state, Utc::now())
    }

    /// Returns a new state with `state` appended at `date`.
    pub fn with_state_at(&self, state: StateType, date: DateTime<Utc>) -> Self {
        let mut histories = self.histories.clone();
        histories.push(History { state, date });
        Self {
            current: state,
            histories,
        }
    }

    /// Whether `next` would be accepted as a forward transition.
    pub fn accepts(&self, next: StateType) -> bool {
        self.current.can_transition_to(next)
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.histories.first().map(|h| h.date)
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        if self.current.is_terminated() {
            self.histories.last().map(|h| h.date)
        } else {
            None
        }
    }

    /// Terminal timestamp minus first timestamp, or `now` minus first while running.
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        let start = match self.start_date() {
            Some(start) => start,
            None => return Duration::zero(),
        };
        self.end_date().unwrap_or(now) - start
    }

    /// Most recent date at which `state` was entered.
    pub fn last_date_of(&self, state: StateType) -> Option<DateTime<Utc>> {
        self.histories
            .iter()
            .rev()
            .find(|h| h.state == state)
            .map(|h| h.date)
    }

    pub fn is_terminated(&self) -> bool {
        self.current.is_terminated()
    }

    pub fn is_running(&self) -> bool {
        self.current.is_running()
    }

    pub fn is_failed(&self) -> bool {
        self.current.is_failed()
    }

    pub fn is_created(&self) -> bool {
        self.current.is_created()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_terminal_states() {
        for state in [
            StateType::Success,
            StateType::Warning,
            StateType::Failed,
            StateType::Killed,
            StateType::Cancelled,
            StateType::Skipped,
        ] {
            assert!(state.is_terminated(), "{} should be terminal", state);
            assert!(!state.is_running());
        }
        assert!(StateType::Killing.is_running());
        assert!(StateType::Queued.is_running());
    }

    #[test]
    fn test_forward_transitions() {
        assert!(StateType::Created.can_transition_to(StateType::Queued));
        assert!(StateType::Queued.can_transition_to(StateType::Running));
        assert!(StateType::Running.can_transition_to(StateType::Retrying));
        assert!(StateType::Retrying.can_transition_to(StateType::Running));
        assert!(StateType::Running.can_transition_to(StateType::Success));
        assert!(StateType::Queued.can_transition_to(StateType::Failed));
        assert!(StateType::Running.can_transition_to(StateType::Killing));
    }

    #[test]
    fn test_backward_and_duplicate_transitions_rejected() {
        assert!(!StateType::Running.can_transition_to(StateType::Running));
        assert!(!StateType::Running.can_transition_to(StateType::Created));
        assert!(!StateType::Running.can_transition_to(StateType::Queued));
        assert!(!StateType::Killing.can_transition_to(StateType::Running));
        assert!(!StateType::Success.can_transition_to(StateType::Running));
        assert!(!StateType::Success.can_transition_to(StateType::Failed));
    }

    #[test]
    fn test_restart_only_from_terminal() {
        assert!(StateType::Failed.can_transition_to(StateType::Restarted));
        assert!(!StateType::Running.can_transition_to(StateType::Restarted));
        assert!(StateType::Restarted.can_transition_to(StateType::Running));
    }

    #[test]
    fn test_history_is_monotonic() {
        let sequence = [
            StateType::Queued,
            StateType::Running,
            StateType::Created,
            StateType::Success,
            StateType::Running,
            StateType::Failed,
        ];

        let mut state = State::new();
        for next in sequence {
            if state.accepts(next) {
                state = state.with_state(next);
            }
        }

        let types: Vec<_> = state.histories.iter().map(|h| h.state).collect();
        assert_eq!(
            types,
            vec![
                StateType::Created,
                StateType::Queued,
                StateType::Running,
                StateType::Success
            ]
        );
    }

    #[test]
    fn test_duration() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let state = State::of(StateType::Created, start)
            .with_state_at(StateType::Running, start + Duration::seconds(2))
            .with_state_at(StateType::Success, start + Duration::seconds(10));

        assert_eq!(state.duration(start + Duration::hours(1)), Duration::seconds(10));

        let running = State::of(StateType::Running, start);
        assert_eq!(running.duration(start + Duration::seconds(5)), Duration::seconds(5));
        assert!(running.end_date().is_none());
    }

    #[test]
    fn test_state_type_from_str() {
        assert_eq!("success".parse::<StateType>(), Ok(StateType::Success));
        assert!("bogus".parse::<StateType>().is_err());
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&StateType::Killing).unwrap();
        assert_eq!(json, "\"KILLING\"");
    }
}
