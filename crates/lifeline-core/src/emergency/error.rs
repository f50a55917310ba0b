//! Emergency lifecycle error types.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::state::{AssignmentStatus, EmergencyStatus};

/// A single violated input constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    /// Dotted path of the offending field, e.g. `location.coordinates`.
    pub field: String,
    /// Human-readable description of the constraint.
    pub message: String,
}

impl FieldViolation {
    /// Creates a new violation.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Coarse classification of an [`EmergencyError`].
///
/// Transport layers map kinds onto status codes; the kind set is stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller-fixable bad input.
    Validation,
    /// Unknown emergency or assignment.
    NotFound,
    /// Access gate denial.
    Unauthorized,
    /// Operation not legal in the current status.
    InvalidState,
    /// Concurrent-mutation guard tripped after retries.
    Conflict,
    /// A collaborator (geo index, notification sink) failed.
    Collaborator,
    /// Storage or other internal failure.
    Internal,
}

/// Errors raised by emergency lifecycle operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum EmergencyError {
    /// The input failed validation. Every violated field is listed.
    #[error("validation failed: {}", join_violations(.violations))]
    Validation {
        /// All violated constraints.
        violations: Vec<FieldViolation>,
    },

    /// No emergency with this id exists.
    #[error("emergency not found: {emergency_id}")]
    NotFound {
        /// The requested emergency id.
        emergency_id: String,
    },

    /// The helper has no assignment on this emergency.
    #[error("helper {helper_id} is not assigned to emergency {emergency_id}")]
    AssignmentNotFound {
        /// The emergency id.
        emergency_id: String,
        /// The helper id.
        helper_id: String,
    },

    /// The requester may not access this emergency.
    #[error("requester {requester_id} may not access emergency {emergency_id}")]
    Unauthorized {
        /// The emergency id.
        emergency_id: String,
        /// The denied requester.
        requester_id: String,
    },

    /// The emergency is no longer active.
    #[error("emergency {emergency_id} is already {status}")]
    AlreadyResolved {
        /// The emergency id.
        emergency_id: String,
        /// Its terminal status.
        status: EmergencyStatus,
    },

    /// Accept was attempted on an assignment that is not `requested`.
    #[error("assignment of helper {helper_id} on {emergency_id} is {status}, not requested")]
    AssignmentNotRequested {
        /// The emergency id.
        emergency_id: String,
        /// The helper id.
        helper_id: String,
        /// Current assignment status.
        status: AssignmentStatus,
    },

    /// An assignment transition was attempted from the wrong status.
    #[error(
        "assignment of helper {helper_id} on {emergency_id} is {status}, expected {expected}"
    )]
    InvalidAssignmentState {
        /// The emergency id.
        emergency_id: String,
        /// The helper id.
        helper_id: String,
        /// Current assignment status.
        status: AssignmentStatus,
        /// Statuses the operation requires.
        expected: &'static str,
    },

    /// Concurrent modification persisted after all retries.
    #[error("emergency {emergency_id} was modified concurrently ({attempts} attempts)")]
    Conflict {
        /// The emergency id.
        emergency_id: String,
        /// Number of save attempts made.
        attempts: u32,
    },

    /// A collaborator failed.
    #[error("{collaborator} unavailable: {reason}")]
    Collaborator {
        /// Which collaborator failed.
        collaborator: &'static str,
        /// Failure detail (never shown to end users).
        reason: String,
    },

    /// The record store failed.
    #[error("store failure: {reason}")]
    Store {
        /// Failure detail (never shown to end users).
        reason: String,
    },
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl EmergencyError {
    /// Creates a validation error from a list of violations.
    #[must_use]
    pub fn validation(violations: Vec<FieldViolation>) -> Self {
        Self::Validation { violations }
    }

    /// Creates a validation error for a single field.
    #[must_use]
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            violations: vec![FieldViolation::new(field, message)],
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(emergency_id: impl Into<String>) -> Self {
        Self::NotFound {
            emergency_id: emergency_id.into(),
        }
    }

    /// Creates an unauthorized error.
    #[must_use]
    pub fn unauthorized(emergency_id: impl Into<String>, requester_id: impl Into<String>) -> Self {
        Self::Unauthorized {
            emergency_id: emergency_id.into(),
            requester_id: requester_id.into(),
        }
    }

    /// Creates a collaborator error.
    #[must_use]
    pub fn collaborator(collaborator: &'static str, reason: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            reason: reason.into(),
        }
    }

    /// Creates a store error.
    #[must_use]
    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }

    /// Returns the coarse kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } | Self::AssignmentNotFound { .. } => ErrorKind::NotFound,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::AlreadyResolved { .. }
            | Self::AssignmentNotRequested { .. }
            | Self::InvalidAssignmentState { .. } => ErrorKind::InvalidState,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Collaborator { .. } => ErrorKind::Collaborator,
            Self::Store { .. } => ErrorKind::Internal,
        }
    }

    /// Returns the stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "EMERGENCY_NOT_FOUND",
            Self::AssignmentNotFound { .. } => "ASSIGNMENT_NOT_FOUND",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::AlreadyResolved { .. } => "EMERGENCY_ALREADY_RESOLVED",
            Self::AssignmentNotRequested { .. } => "ASSIGNMENT_NOT_REQUESTED",
            Self::InvalidAssignmentState { .. } => "INVALID_ASSIGNMENT_STATE",
            Self::Conflict { .. } => "CONFLICT",
            Self::Collaborator { .. } => "COLLABORATOR_UNAVAILABLE",
            Self::Store { .. } => "INTERNAL_ERROR",
        }
    }

    /// Returns a message safe to show to end users.
    ///
    /// Collaborator and store details are replaced by generic text.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Collaborator { .. } => "A dependent service is unavailable".to_string(),
            Self::Store { .. } => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Returns the field violations of a validation error.
    #[must_use]
    pub fn violations(&self) -> &[FieldViolation] {
        match self {
            Self::Validation { violations } => violations,
            _ => &[],
        }
    }
}
