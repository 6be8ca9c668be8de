//! Device validation: staged tests and sustained polling.

pub mod report;
pub mod target;
pub mod tester;

use serde::Serialize;
use strum::Display;

pub use report::TestResultStore;
pub use target::{RegisterReader, RtuTarget};
#[cfg(feature = "modbus")]
pub use target::TcpTarget;
pub use tester::{ContinuousPollingTester, PollingOutcome, TestResult};

/// Progress of a sustained polling run for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PollingState {
    NotStarted,
    Running,
    Passed,
    Failed,
}

impl PollingState {
    pub fn is_finished(self) -> bool {
        matches!(self, PollingState::Passed | PollingState::Failed)
    }
}
