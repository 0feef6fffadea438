use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Observed operational state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Down,
}

impl Status {
    /// Value written to the STATUS metric of a series file.
    ///
    /// The metric records unavailability, so UP maps to 0.
    pub fn sample_bit(self) -> u8 {
        match self {
            Status::Up => 0,
            Status::Down => 1,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Up => write!(f, "up"),
            Status::Down => write!(f, "down"),
        }
    }
}

/// Last known state held by a job. `Unknown` until the first observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    Unknown,
    Up,
    Down,
}

impl From<Status> for ServiceState {
    fn from(status: Status) -> Self {
        match status {
            Status::Up => ServiceState::Up,
            Status::Down => ServiceState::Down,
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Unknown => write!(f, "unknown"),
            ServiceState::Up => write!(f, "up"),
            ServiceState::Down => write!(f, "down"),
        }
    }
}

/// Result of one probe round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: Status,

    /// Banner or version text when up, error description when down
    pub diagnostic: String,
}

impl Outcome {
    pub fn up(diagnostic: impl Into<String>) -> Self {
        Self { status: Status::Up, diagnostic: diagnostic.into() }
    }

    /// A down outcome never carries an empty diagnostic.
    pub fn down(diagnostic: impl Into<String>) -> Self {
        let diagnostic = diagnostic.into();
        let diagnostic = if diagnostic.trim().is_empty() {
            "unspecified failure".to_string()
        } else {
            diagnostic
        };
        Self { status: Status::Down, diagnostic }
    }

    pub fn is_up(&self) -> bool {
        self.status == Status::Up
    }
}

/// Outcome plus the wall-clock time the probe round took
#[derive(Debug, Clone)]
pub struct Observation {
    pub outcome: Outcome,
    pub elapsed: Duration,
    pub timestamp: SystemTime,
}

impl Observation {
    /// Response time to record, absent for down outcomes.
    pub fn response_time(&self) -> Option<Duration> {
        self.outcome.is_up().then_some(self.elapsed)
    }
}

/// State change reported through an [`EventEmitter`](super::emitter::EventEmitter)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Job name
    pub job: String,
    pub host_id: i64,
    pub service_id: Option<i64>,

    /// State held before this observation (`Unknown` for a reported first contact)
    pub prior: ServiceState,
    pub state: Status,
    pub diagnostic: String,
    pub timestamp: SystemTime,
}

/// Convert SystemTime to Unix seconds
pub fn unix_seconds(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_down_diagnostic_never_empty() {
        let outcome = Outcome::down("");
        assert_eq!(outcome.status, Status::Down);
        assert!(!outcome.diagnostic.is_empty());

        let outcome = Outcome::down("connection refused");
        assert_eq!(outcome.diagnostic, "connection refused");
    }

    #[test]
    fn test_response_time_only_when_up() {
        let up = Observation {
            outcome: Outcome::up("banner"),
            elapsed: Duration::from_millis(40),
            timestamp: SystemTime::now(),
        };
        assert_eq!(up.response_time(), Some(Duration::from_millis(40)));

        let down = Observation { outcome: Outcome::down("refused"), ..up };
        assert_eq!(down.response_time(), None);
    }

    #[test]
    fn test_sample_bit() {
        assert_eq!(Status::Up.sample_bit(), 0);
        assert_eq!(Status::Down.sample_bit(), 1);
    }
}
