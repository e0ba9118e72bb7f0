//! Error types for lifecycle orchestration
//!
//! Provides error handling for:
//! - Precondition failures on job inputs
//! - Illegal state transitions
//! - Event contract violations and bus failures
//! - Shared resource layer calls
//! - Registration store and control plane operations
//! - Job execution (the taxonomy reported on failure events)

use crate::types::RegistrationId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Missing or malformed required input. Fatal, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionFailure {
    /// Tenant id is empty
    #[error("tenant id is empty")]
    EmptyTenantId,

    /// Tenant id contains characters that cannot name tenant resources
    #[error("invalid tenant id '{0}': expected 1-63 chars of [a-z0-9-], not starting or ending with '-'")]
    InvalidTenantId(String),

    /// A required field is empty
    #[error("required field '{0}' is empty")]
    EmptyField(&'static str),

    /// Administrator email is not an address
    #[error("invalid administrator email '{0}'")]
    InvalidEmail(String),

    /// Tier is not one of the offered plans
    #[error("unknown tier '{0}'")]
    UnknownTier(String),
}

/// State machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not present in the transition table
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}

/// Lifecycle event contract violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// Event name outside the enumerated set
    #[error("unknown event name '{0}'")]
    UnknownEventName(String),

    /// Payload lacks a required key
    #[error("{event} payload is missing '{field}'")]
    MissingField { event: String, field: &'static str },

    /// Payload value must not be empty for this event
    #[error("{event} payload has empty '{field}'")]
    EmptyField { event: String, field: &'static str },

    /// Payload value could not be parsed
    #[error("invalid '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Envelope correlation id differs from the payload tenant id
    #[error("correlation id '{correlation_id}' does not match tenant id '{tenant_id}'")]
    CorrelationMismatch {
        correlation_id: String,
        tenant_id: String,
    },
}

/// Event bus errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// Event rejected at the publish boundary
    #[error("event rejected: {0}")]
    Rejected(#[from] EventError),

    /// Bus has been closed
    #[error("event bus closed")]
    Closed,

    /// Transport unavailable
    #[error("event bus unavailable: {0}")]
    Unavailable(String),

    /// Journal hash chain broken at `sequence`
    #[error("journal integrity violation at entry {sequence}")]
    IntegrityViolation { sequence: u64 },
}

/// Shared resource layer errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    /// Resource does not exist
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Resource already exists
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// Request throttled by the provider
    #[error("throttled: {0}")]
    Throttled(String),

    /// Dependency not yet visible (eventual consistency)
    #[error("not ready: {0}")]
    NotReady(String),

    /// Provider unreachable
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Request rejected by the provider
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unexpected provider failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl ResourceError {
    /// Check if the call may succeed when repeated
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Throttled(_) | Self::NotReady(_) | Self::Unavailable(_)
        )
    }

    /// Check if the error reports a missing resource
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Lease errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    /// Another job holds the tenant lease
    #[error("lease for tenant '{tenant_id}' held by {holder}")]
    Held { tenant_id: String, holder: String },

    /// Release attempted with a token that does not own the lease
    #[error("lease for tenant '{tenant_id}' not held by this token")]
    NotHeld { tenant_id: String },
}

/// Stack output lookup errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Output missing from the shared resource layer
    #[error("stack output '{0}' is missing")]
    MissingOutput(String),

    /// Output present but unusable
    #[error("stack output '{key}' is invalid: {reason}")]
    InvalidOutput { key: String, reason: String },
}

/// Registration store errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Registration not found
    #[error("registration {0} not found")]
    NotFound(RegistrationId),

    /// Registration id already recorded
    #[error("registration {0} already exists")]
    AlreadyExists(RegistrationId),

    /// Conditional write lost against a concurrent writer
    #[error("registration {id} changed concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        id: RegistrationId,
        expected: u64,
        found: u64,
    },

    /// Persistence failed
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Snapshot encoding failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Control plane errors
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    /// Registration not found
    #[error("registration {0} not found")]
    NotFound(RegistrationId),

    /// Request conflicts with the registration's current state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Patch carries invalid values
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// Registration store failure
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Status change not allowed from the current status
    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),
}

impl ControlPlaneError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Registry(RegistryError::VersionConflict { .. } | RegistryError::Storage(_))
        )
    }
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Job inputs failed validation
    #[error("precondition failed: {0}")]
    Precondition(#[from] PreconditionFailure),

    /// A downstream resource call kept failing with a transient error
    #[error("step '{step}' failed: {source}")]
    TransientRemote {
        /// Step name
        step: &'static str,
        /// Underlying resource error
        source: ResourceError,
    },

    /// A downstream resource call was rejected outright
    #[error("step '{step}' rejected: {source}")]
    StepRejected {
        /// Step name
        step: &'static str,
        /// Underlying resource error
        source: ResourceError,
    },

    /// Unexpected failure, aborts the job
    #[error("fatal: {0}")]
    Fatal(String),

    /// Another job for the tenant is in flight
    #[error("tenant busy: {0}")]
    LeaseHeld(#[from] LeaseError),

    /// Job context could not be sourced
    #[error("job context unavailable: {0}")]
    Context(#[from] ConfigError),

    /// Internal state machine violation
    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    /// Outcome could not be reported
    #[error("publish failed: {0}")]
    Publish(#[from] BusError),

    /// Wall-clock budget exhausted
    #[error("job timed out after {budget_secs}s")]
    Timeout { budget_secs: u64 },
}

impl JobError {
    /// Failure of `step`, classified by whether `source` is transient
    #[must_use]
    pub fn step(step: &'static str, source: ResourceError) -> Self {
        if source.is_transient() {
            Self::TransientRemote { step, source }
        } else {
            Self::StepRejected { step, source }
        }
    }

    /// Classification reported on failure events
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Precondition(_) => FailureKind::PreconditionFailure,
            Self::TransientRemote { .. } => FailureKind::TransientRemoteFailure,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::StepRejected { .. }
            | Self::Fatal(_)
            | Self::LeaseHeld(_)
            | Self::Context(_)
            | Self::StateMachine(_)
            | Self::Publish(_) => FailureKind::Fatal,
        }
    }

    /// Step the error originated from, if any
    #[must_use]
    pub fn failed_step(&self) -> Option<&'static str> {
        match self {
            Self::TransientRemote { step, .. } | Self::StepRejected { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Check if error is retryable by re-running the whole job
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientRemote { .. } | Self::LeaseHeld(_) | Self::Timeout { .. } | Self::Publish(_)
        )
    }
}

/// Failure classification carried by failure events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Missing or empty required input
    PreconditionFailure,
    /// Downstream resource call failed
    TransientRemoteFailure,
    /// Unexpected failure
    Fatal,
    /// Job budget exhausted
    Timeout,
}

impl FailureKind {
    /// Wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreconditionFailure => "PreconditionFailure",
            Self::TransientRemoteFailure => "TransientRemoteFailure",
            Self::Fatal => "Fatal",
            Self::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PreconditionFailure" => Ok(Self::PreconditionFailure),
            "TransientRemoteFailure" => Ok(Self::TransientRemoteFailure),
            "Fatal" => Ok(Self::Fatal),
            "Timeout" => Ok(Self::Timeout),
            other => Err(EventError::InvalidField {
                field: "errorKind",
                reason: format!("unknown failure kind '{other}'"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_error_transience() {
        assert!(ResourceError::Throttled("slow down".to_string()).is_transient());
        assert!(ResourceError::NotReady("index".to_string()).is_transient());
        assert!(!ResourceError::Validation("bad".to_string()).is_transient());
        assert!(!ResourceError::NotFound {
            kind: "user",
            name: "x".to_string()
        }
        .is_transient());
    }

    #[test]
    fn job_error_kinds() {
        let err = JobError::Precondition(PreconditionFailure::EmptyTenantId);
        assert_eq!(err.kind(), FailureKind::PreconditionFailure);
        assert!(!err.is_retryable());

        let err = JobError::TransientRemote {
            step: "api_key",
            source: ResourceError::Unavailable("down".to_string()),
        };
        assert_eq!(err.kind(), FailureKind::TransientRemoteFailure);
        assert_eq!(err.failed_step(), Some("api_key"));
        assert!(err.is_retryable());

        let err = JobError::step(
            "user_group",
            ResourceError::Validation("bad name".to_string()),
        );
        assert_eq!(err.kind(), FailureKind::Fatal);
        assert_eq!(err.failed_step(), Some("user_group"));
        assert!(!err.is_retryable());

        assert_eq!(JobError::Fatal("boom".to_string()).kind(), FailureKind::Fatal);
    }

    #[test]
    fn failure_kind_round_trips_through_wire_name() {
        for kind in [
            FailureKind::PreconditionFailure,
            FailureKind::TransientRemoteFailure,
            FailureKind::Fatal,
            FailureKind::Timeout,
        ] {
            assert_eq!(kind.as_str().parse::<FailureKind>().unwrap(), kind);
        }
        assert!("Oops".parse::<FailureKind>().is_err());
    }

    #[test]
    fn precondition_display() {
        let err = PreconditionFailure::EmptyField("adminEmail");
        assert!(err.to_string().contains("adminEmail"));
    }
}
