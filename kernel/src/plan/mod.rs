// Plan State Machine
//
// A plan is one asynchronously executed administrative statement. Its
// status only ever moves forward:
//
//   NEW -> RUNNING -> {SUCCEEDED, FAILED, INTERRUPTED}
//
// plus NEW -> FAILED for statements rejected before they start running.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::admin::ClientError;
use crate::observe::{StateBroadcaster, StateChange};

pub mod engine;
pub mod scripted;

pub use engine::{CancelToken, EngineError, ExecutionContext, StatementEngine};
pub use scripted::ScriptedEngine;

/// Unique, never reused plan identity.
///
/// The high 16 bits hold the id of the node that assigned it and the
/// rest a per-node counter, so ids stay unique across coordinator
/// handovers as long as node ids are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub u64);

impl PlanId {
    const SEQUENCE_BITS: u32 = 48;
    const SEQUENCE_MASK: u64 = (1 << Self::SEQUENCE_BITS) - 1;

    pub fn new(node_id: u16, sequence: u64) -> Self {
        debug_assert!(sequence <= Self::SEQUENCE_MASK, "plan sequence overflow");
        Self(u64::from(node_id) << Self::SEQUENCE_BITS | (sequence & Self::SEQUENCE_MASK))
    }

    pub fn node_id(self) -> u16 {
        (self.0 >> Self::SEQUENCE_BITS) as u16
    }

    pub fn sequence(self) -> u64 {
        self.0 & Self::SEQUENCE_MASK
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id(), self.sequence())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    /// Admitted, not yet picked up by a worker.
    New,

    Running,

    Succeeded,

    Failed,

    /// Stopped after a cancellation request.
    Interrupted,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanStatus::Succeeded | PlanStatus::Failed | PlanStatus::Interrupted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::New => "NEW",
            PlanStatus::Running => "RUNNING",
            PlanStatus::Succeeded => "SUCCEEDED",
            PlanStatus::Failed => "FAILED",
            PlanStatus::Interrupted => "INTERRUPTED",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanEvent {
    Start,
    Complete,
    Fail,
    Interrupt,
    /// Refused before execution, e.g. the statement did not parse.
    Reject,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),
}

#[derive(Debug)]
pub struct PlanStateMachine {
    status: PlanStatus,
}

impl PlanStateMachine {
    pub fn new() -> Self {
        Self {
            status: PlanStatus::New,
        }
    }

    /// Apply a single event, returning the new status.
    pub fn apply(&mut self, event: PlanEvent) -> Result<PlanStatus, StateError> {
        use PlanEvent::*;
        use PlanStatus::*;

        self.status = match (self.status, event) {
            (New, Start) => Running,
            (New, Reject) => Failed,

            (Running, Complete) => Succeeded,
            (Running, Fail) => Failed,
            (Running, Interrupt) => Interrupted,

            (status, event) => {
                return Err(StateError::IllegalTransition(format!(
                    "cannot apply {event:?} while {status}"
                )))
            }
        };

        Ok(self.status)
    }

    pub fn current_status(&self) -> PlanStatus {
        self.status
    }
}

impl Default for PlanStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcaster fanning plan transitions out to monitors.
pub type PlanStateBroadcaster = StateBroadcaster<PlanStateChange>;

/// Broadcast whenever a plan enters a new status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStateChange {
    pub plan_id: PlanId,
    pub statement: String,
    pub status: PlanStatus,
    pub error: Option<ClientError>,
}

impl StateChange for PlanStateChange {
    fn description(&self) -> String {
        match &self.error {
            Some(error) => format!(
                "Plan {} [{}] {}: {}",
                self.plan_id, self.statement, self.status, error.message
            ),
            None => format!("Plan {} [{}] {}", self.plan_id, self.statement, self.status),
        }
    }
}
