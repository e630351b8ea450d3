//! State and error types shared by the supervisors.

use std::fmt;

/// Lifecycle of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
}

impl WorkerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the daemon subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatcherState {
    #[default]
    Idle,
    Starting,
    Listening,
}

impl WatcherState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Listening => "listening",
        }
    }
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The worker reported Running but left no connection behind.
    #[error("Worker connection not initialized. This should not happen.")]
    NotInitialized,
    #[error("worker failed to start")]
    WorkerUnavailable,
    #[error("invalid params: {0}")]
    InvalidParams(#[from] serde_json::Error),
    #[error("Couldn't refresh workspace. Please view the logs for more information.")]
    RefreshFailed(#[source] Box<SupervisorError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_render_lowercase() {
        assert_eq!(WorkerState::Stopping.to_string(), "stopping");
        assert_eq!(WatcherState::Listening.to_string(), "listening");
        assert_eq!(WorkerState::default(), WorkerState::Idle);
        assert_eq!(WatcherState::default(), WatcherState::Idle);
    }

    #[test]
    fn refresh_failure_hides_cause_in_message() {
        let err = SupervisorError::RefreshFailed(Box::new(SupervisorError::WorkerUnavailable));
        assert_eq!(
            err.to_string(),
            "Couldn't refresh workspace. Please view the logs for more information."
        );
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("worker failed to start"));
    }
}
