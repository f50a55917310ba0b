//! Enumerations of the emergency state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a string does not name a known enum value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    /// Which enumeration was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Every value of the enumeration, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Returns the wire identifier.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Kind of incident being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyType {
    /// Medical emergency.
    Medical,
    /// Traffic or other accident.
    Accident,
    /// Fire.
    Fire,
    /// Crime in progress or just occurred.
    Crime,
    /// Flood, earthquake, storm and similar events.
    NaturalDisaster,
    /// Anything else.
    Other,
}

string_enum!(EmergencyType, "emergency type", {
    Medical => "medical",
    Accident => "accident",
    Fire => "fire",
    Crime => "crime",
    NaturalDisaster => "natural_disaster",
    Other => "other",
});

/// Lifecycle status of an emergency.
///
/// `Active` is the only non-terminal status. No transition leaves a terminal
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyStatus {
    /// Open incident; helpers may be dispatched and respond.
    #[default]
    Active,
    /// Closed through `resolve` (terminal).
    Resolved,
    /// Closed by cancellation (terminal).
    Cancelled,
    /// Closed by the stale-incident sweep (terminal).
    Timeout,
}

string_enum!(EmergencyStatus, "emergency status", {
    Active => "active",
    Resolved => "resolved",
    Cancelled => "cancelled",
    Timeout => "timeout",
});

impl EmergencyStatus {
    /// Returns `true` for `Resolved`, `Cancelled` and `Timeout`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Dispatch priority.
///
/// Ordered from most to least urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Life-threatening.
    Critical,
    /// Urgent.
    High,
    /// Default for unclassified incidents.
    Medium,
    /// Lowest urgency.
    Low,
}

string_enum!(Priority, "priority", {
    Critical => "critical",
    High => "high",
    Medium => "medium",
    Low => "low",
});

impl Priority {
    /// Returns the next more urgent level; `Critical` stays `Critical`.
    #[must_use]
    pub const fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

/// Status of a single helper assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// Helper has been asked to respond.
    #[default]
    Requested,
    /// Helper agreed to respond.
    Accepted,
    /// Helper is on the way.
    Arriving,
    /// Helper is on scene.
    Arrived,
    /// Helper's involvement is over.
    Completed,
}

string_enum!(AssignmentStatus, "assignment status", {
    Requested => "requested",
    Accepted => "accepted",
    Arriving => "arriving",
    Arrived => "arrived",
    Completed => "completed",
});

impl AssignmentStatus {
    /// Returns `true` while the helper is engaged (accepted, arriving or
    /// arrived).
    #[must_use]
    pub const fn is_engaged(&self) -> bool {
        matches!(self, Self::Accepted | Self::Arriving | Self::Arrived)
    }

    /// Returns the valid transitions from this status.
    #[must_use]
    pub const fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Requested => &[Self::Accepted],
            Self::Accepted => &[Self::Arriving, Self::Arrived, Self::Completed],
            Self::Arriving => &[Self::Arrived, Self::Completed],
            Self::Arrived => &[Self::Completed],
            Self::Completed => &[],
        }
    }

    /// Returns `true` if moving to `target` is allowed.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        self.valid_transitions().contains(&target)
    }
}

/// How an emergency was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    /// Help was delivered.
    #[default]
    Completed,
    /// Reporter or operator called it off.
    Cancelled,
    /// Nobody responded in time.
    Timeout,
    /// No helper could be found.
    NoHelpers,
}

string_enum!(ResolutionType, "resolution type", {
    Completed => "completed",
    Cancelled => "cancelled",
    Timeout => "timeout",
    NoHelpers => "no_helpers",
});

/// Kind of actor attributed in the communication log and resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    /// The reporting user (or a guardian).
    User,
    /// A responding helper.
    Helper,
    /// The platform itself, including operators acting as admins.
    System,
}

string_enum!(ActorKind, "actor kind", {
    User => "user",
    Helper => "helper",
    System => "system",
});

/// Type of a communication-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryType {
    /// The incident was raised.
    SosSent,
    /// A helper was asked to respond.
    HelperAssigned,
    /// A helper accepted.
    HelperAccepted,
    /// A helper is on the way.
    HelperArriving,
    /// A helper reached the scene.
    HelperArrived,
    /// The emergency status changed.
    StatusUpdate,
    /// Free-form message from a participant.
    Message,
}

string_enum!(LogEntryType, "log entry type", {
    SosSent => "sos_sent",
    HelperAssigned => "helper_assigned",
    HelperAccepted => "helper_accepted",
    HelperArriving => "helper_arriving",
    HelperArrived => "helper_arrived",
    StatusUpdate => "status_update",
    Message => "message",
});

/// Source of a reported location fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocationProvider {
    /// Satellite fix.
    #[default]
    Gps,
    /// Cell/Wi-Fi triangulation.
    Network,
    /// Entered by hand.
    Manual,
}

string_enum!(LocationProvider, "location provider", {
    Gps => "gps",
    Network => "network",
    Manual => "manual",
});
