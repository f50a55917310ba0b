//! Emergency aggregate.
//!
//! An [`Emergency`] is one incident: where it happened, who reported it,
//! which helpers were asked to respond and how far each got, an append-only
//! communication log, and how it was eventually closed.
//!
//! # State machine
//!
//! ```text
//! Active ──resolve──> Resolved
//!   │
//!   └──expire (stale sweep)──> Timeout
//! ```
//!
//! `Cancelled` is a valid terminal status for stored records but no
//! operation in this crate produces it; cancellation is recorded as a
//! `resolved` emergency whose resolution type is `cancelled`.
//!
//! Per helper:
//!
//! ```text
//! Requested ──> Accepted ──> Arriving ──> Arrived ──> Completed
//!                  └───────────────────────^
//! ```
//!
//! Terminal emergencies reject every mutation except communication-log
//! appends.

mod draft;
mod error;
mod record;
mod state;

pub use draft::{
    EmergencyDraft, LocationInput, MAX_HELPERS_LIMIT, SOS_DESCRIPTION, SOS_TITLE, SettingsInput,
    SosDraft, ValidDraft,
};
pub use error::{EmergencyError, ErrorKind, FieldViolation};
pub use record::{
    Actor, ActorId, AssignResult, Assignment, Emergency, EmergencyContact, EmergencyId,
    EmergencySettings, GeoPoint, Location, LogEntry, MAX_DESCRIPTION_LEN, MAX_TEXT_LEN,
    MAX_TITLE_LEN, MedicalSnapshot, RECORD_TTL_HOURS, Resolution, ResolutionData,
    ResponseMetrics, SYSTEM_ACTOR_ID,
};
pub use state::{
    ActorKind, AssignmentStatus, EmergencyStatus, EmergencyType, LocationProvider, LogEntryType,
    ParseEnumError, Priority, ResolutionType,
};

#[cfg(test)]
mod tests;
