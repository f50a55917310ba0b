//! The `Emergency` aggregate and its sub-entities.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::draft::ValidDraft;
use super::error::{EmergencyError, FieldViolation};
use super::state::{
    ActorKind, AssignmentStatus, EmergencyStatus, EmergencyType, LocationProvider, LogEntryType,
    Priority, ResolutionType,
};
use crate::dispatch::determine_priority;

/// Unique identifier of an emergency.
pub type EmergencyId = String;

/// Identifier of a user, helper or guardian.
pub type ActorId = String;

/// Maximum title length in characters.
pub const MAX_TITLE_LEN: usize = 100;

/// Maximum description length in characters.
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Maximum length of free text (messages, notes, feedback) in characters.
pub const MAX_TEXT_LEN: usize = 500;

/// Records become eligible for garbage collection this long after creation.
pub const RECORD_TTL_HOURS: i64 = 24;

/// Actor id used for system-attributed log entries and resolutions.
pub const SYSTEM_ACTOR_ID: &str = "system";

/// A WGS84 point.
///
/// Serialized as a `[longitude, latitude]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct GeoPoint {
    /// Longitude in degrees, `[-180, 180]`.
    pub longitude: f64,
    /// Latitude in degrees, `[-90, 90]`.
    pub latitude: f64,
}

impl GeoPoint {
    /// Creates a point from longitude and latitude.
    #[must_use]
    pub const fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    /// Returns `true` if both components are finite and within range.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.longitude.is_finite()
            && self.latitude.is_finite()
            && (-180.0..=180.0).contains(&self.longitude)
            && (-90.0..=90.0).contains(&self.latitude)
    }
}

impl From<[f64; 2]> for GeoPoint {
    fn from([longitude, latitude]: [f64; 2]) -> Self {
        Self::new(longitude, latitude)
    }
}

impl From<GeoPoint> for [f64; 2] {
    fn from(point: GeoPoint) -> Self {
        [point.longitude, point.latitude]
    }
}

/// Where the emergency is, as reported at creation. Immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// The point.
    pub coordinates: GeoPoint,
    /// Street address or free-form description.
    pub address: String,
    /// City.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// State or region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Country.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Postal code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    /// Nearby landmark.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmark: Option<String>,
    /// Fix accuracy in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_meters: Option<f64>,
    /// How the fix was obtained.
    #[serde(default)]
    pub provider: LocationProvider,
}

/// A guardian or other emergency contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EmergencyContact {
    /// Display name.
    pub name: String,
    /// Phone number.
    pub phone: String,
    /// Relationship to the reporter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    /// Platform user id, when the contact has an account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<ActorId>,
}

impl EmergencyContact {
    /// Returns the id notifications are addressed to: the platform user id
    /// when known, otherwise the phone number.
    #[must_use]
    pub fn recipient_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.phone)
    }
}

/// Copy of the reporter's medical profile taken when the emergency was
/// raised. Later profile edits do not alter it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MedicalSnapshot {
    /// Blood type, e.g. `O+`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blood_type: Option<String>,
    /// Known allergies.
    pub allergies: Vec<String>,
    /// Chronic conditions.
    pub conditions: Vec<String>,
    /// Current medications.
    pub medications: Vec<String>,
    /// Guardians to notify.
    pub emergency_contacts: Vec<EmergencyContact>,
}

/// Attribution of a log entry or resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Actor id.
    pub id: ActorId,
    /// Actor kind.
    pub kind: ActorKind,
}

impl Actor {
    /// A reporting user.
    #[must_use]
    pub fn user(id: impl Into<ActorId>) -> Self {
        Self {
            id: id.into(),
            kind: ActorKind::User,
        }
    }

    /// A helper.
    #[must_use]
    pub fn helper(id: impl Into<ActorId>) -> Self {
        Self {
            id: id.into(),
            kind: ActorKind::Helper,
        }
    }

    /// The platform itself.
    #[must_use]
    pub fn system() -> Self {
        Self {
            id: SYSTEM_ACTOR_ID.to_string(),
            kind: ActorKind::System,
        }
    }
}

/// One helper's involvement with an emergency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// The helper.
    pub helper_id: ActorId,
    /// Current status.
    pub status: AssignmentStatus,
    /// When the helper was requested.
    pub assigned_at: DateTime<Utc>,
    /// When the helper accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    /// When the helper reached the scene.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrived_at: Option<DateTime<Utc>>,
    /// When the helper's involvement ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Free-form notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Response-time metrics.
///
/// The `total_*` counters are derived from the assignment list; see
/// [`Emergency::recompute_counters`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetrics {
    /// Creation time of the emergency.
    pub sos_triggered_at: DateTime<Utc>,
    /// First helper request.
    pub first_helper_assigned_at: Option<DateTime<Utc>>,
    /// First helper acceptance.
    pub first_helper_accepted_at: Option<DateTime<Utc>>,
    /// First helper arrival.
    pub first_helper_arrived_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Number of assignments.
    pub total_helpers_requested: u32,
    /// Number of assignments past `requested`.
    pub total_helpers_accepted: u32,
    /// Number of assignments currently `arrived`.
    pub total_helpers_arrived: u32,
}

impl ResponseMetrics {
    fn new(sos_triggered_at: DateTime<Utc>) -> Self {
        Self {
            sos_triggered_at,
            first_helper_assigned_at: None,
            first_helper_accepted_at: None,
            first_helper_arrived_at: None,
            resolved_at: None,
            total_helpers_requested: 0,
            total_helpers_accepted: 0,
            total_helpers_arrived: 0,
        }
    }
}

/// An append-only communication-log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Entry type.
    #[serde(rename = "type")]
    pub entry_type: LogEntryType,
    /// Message text.
    pub message: String,
    /// When it was appended.
    pub timestamp: DateTime<Utc>,
    /// Who it is attributed to.
    pub actor: Actor,
}

/// Per-emergency dispatch settings, snapshotted at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmergencySettings {
    /// Dispatch helpers right after an SOS.
    pub auto_assign_helpers: bool,
    /// Maximum helpers requested per dispatch round.
    pub max_helpers: u32,
    /// Base search radius in meters.
    pub search_radius_meters: u32,
    /// Minutes without an acceptance before the stale sweep closes it.
    pub timeout_minutes: u32,
    /// Notify the reporter's guardians on SOS.
    pub notify_guardians: bool,
}

impl Default for EmergencySettings {
    fn default() -> Self {
        Self {
            auto_assign_helpers: true,
            max_helpers: 3,
            search_radius_meters: crate::dispatch::DEFAULT_BASE_RADIUS_METERS,
            timeout_minutes: 30,
            notify_guardians: true,
        }
    }
}

/// Caller-supplied resolution details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolutionData {
    /// Defaults to [`ResolutionType::Completed`].
    pub resolution_type: Option<ResolutionType>,
    /// Notes.
    pub notes: Option<String>,
    /// Rating in `[1, 5]`.
    pub rating: Option<u8>,
    /// Feedback text.
    pub feedback: Option<String>,
}

impl ResolutionData {
    fn violations(&self) -> Vec<FieldViolation> {
        let mut violations = Vec::new();
        if let Some(rating) = self.rating {
            if !(1..=5).contains(&rating) {
                violations.push(FieldViolation::new("rating", "must be between 1 and 5"));
            }
        }
        if self
            .notes
            .as_ref()
            .is_some_and(|n| n.chars().count() > MAX_TEXT_LEN)
        {
            violations.push(FieldViolation::new(
                "notes",
                format!("must be at most {MAX_TEXT_LEN} characters"),
            ));
        }
        if self
            .feedback
            .as_ref()
            .is_some_and(|f| f.chars().count() > MAX_TEXT_LEN)
        {
            violations.push(FieldViolation::new(
                "feedback",
                format!("must be at most {MAX_TEXT_LEN} characters"),
            ));
        }
        violations
    }
}

/// How and by whom an emergency was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// Who closed it.
    pub resolved_by: Actor,
    /// How it was closed.
    pub resolution_type: ResolutionType,
    /// Notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// When it was closed.
    pub resolved_at: DateTime<Utc>,
    /// Rating in `[1, 5]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    /// Feedback text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// Outcome of [`Emergency::assign_helper`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignResult {
    /// The helper's assignment (new or pre-existing).
    pub assignment: Assignment,
    /// `false` when the helper was already assigned and nothing changed.
    pub created: bool,
}

/// One incident and everything that happened to it.
///
/// Mutations go through the methods below, which enforce the state machine:
/// nothing leaves a terminal status, each helper has at most one assignment,
/// the first-response timestamps are set once, and the response counters are
/// recomputed from the assignment list after every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Emergency {
    id: EmergencyId,
    #[serde(rename = "type")]
    kind: EmergencyType,
    status: EmergencyStatus,
    priority: Priority,
    location: Location,
    owner_id: ActorId,
    title: String,
    description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    medical_info: Option<MedicalSnapshot>,
    assigned_helpers: Vec<Assignment>,
    response_metrics: ResponseMetrics,
    communication_log: Vec<LogEntry>,
    settings: EmergencySettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resolution: Option<Resolution>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    version: u64,
}

impl Emergency {
    /// Opens a new active emergency from a validated draft.
    ///
    /// The priority is the draft's explicit priority or, failing that, the
    /// one derived from the type and escalation context. A `sos_sent` entry
    /// attributed to the owner is appended.
    #[must_use]
    pub fn open(
        id: impl Into<EmergencyId>,
        owner_id: impl Into<ActorId>,
        draft: ValidDraft,
        now: DateTime<Utc>,
    ) -> Self {
        let owner_id = owner_id.into();
        let priority = draft
            .priority
            .unwrap_or_else(|| determine_priority(draft.kind, draft.context));
        let mut emergency = Self {
            id: id.into(),
            kind: draft.kind,
            status: EmergencyStatus::Active,
            priority,
            location: draft.location,
            owner_id: owner_id.clone(),
            title: draft.title,
            description: draft.description,
            medical_info: draft.medical_info,
            assigned_helpers: Vec::new(),
            response_metrics: ResponseMetrics::new(now),
            communication_log: Vec::new(),
            settings: draft.settings,
            resolution: None,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::hours(RECORD_TTL_HOURS),
            version: 0,
        };
        let message = format!("SOS alert raised: {}", emergency.title);
        emergency.append_log(LogEntryType::SosSent, message, Actor::user(owner_id), now);
        emergency
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns the id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the incident type.
    #[must_use]
    pub const fn kind(&self) -> EmergencyType {
        self.kind
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub const fn status(&self) -> EmergencyStatus {
        self.status
    }

    /// Returns the dispatch priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns the reported location.
    #[must_use]
    pub const fn location(&self) -> &Location {
        &self.location
    }

    /// Returns the reporter's id.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Returns the title.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Returns the description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the medical snapshot, if one was attached.
    #[must_use]
    pub const fn medical_info(&self) -> Option<&MedicalSnapshot> {
        self.medical_info.as_ref()
    }

    /// Returns the helper assignments in request order.
    #[must_use]
    pub fn assigned_helpers(&self) -> &[Assignment] {
        &self.assigned_helpers
    }

    /// Returns the response metrics.
    #[must_use]
    pub const fn response_metrics(&self) -> &ResponseMetrics {
        &self.response_metrics
    }

    /// Returns the communication log in append order.
    #[must_use]
    pub fn communication_log(&self) -> &[LogEntry] {
        &self.communication_log
    }

    /// Returns the settings snapshot.
    #[must_use]
    pub const fn settings(&self) -> &EmergencySettings {
        &self.settings
    }

    /// Returns the resolution, once terminal.
    #[must_use]
    pub const fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    /// Returns the creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the last modification time.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns the storage expiry time.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns the optimistic-concurrency version. Zero until first persisted.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Returns `true` once the status is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the assignment of `helper_id`, if any.
    #[must_use]
    pub fn assignment(&self, helper_id: &str) -> Option<&Assignment> {
        self.assigned_helpers
            .iter()
            .find(|a| a.helper_id == helper_id)
    }

    /// Returns `true` if `helper_id` has an assignment in any status.
    #[must_use]
    pub fn is_assigned(&self, helper_id: &str) -> bool {
        self.assignment(helper_id).is_some()
    }

    /// Returns the number of engaged helpers (accepted, arriving or arrived).
    #[must_use]
    pub fn active_helpers_count(&self) -> usize {
        self.assigned_helpers
            .iter()
            .filter(|a| a.status.is_engaged())
            .count()
    }

    /// Time from SOS to resolution, or to `now` while unresolved.
    #[must_use]
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        let end = self.response_metrics.resolved_at.unwrap_or(now);
        end - self.response_metrics.sos_triggered_at
    }

    /// Returns `true` if the emergency is active, nobody accepted, and it is
    /// older than its timeout.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == EmergencyStatus::Active
            && self.response_metrics.first_helper_accepted_at.is_none()
            && now - self.response_metrics.sos_triggered_at
                >= Duration::minutes(i64::from(self.settings.timeout_minutes))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    fn ensure_active(&self) -> Result<(), EmergencyError> {
        if self.status.is_terminal() {
            return Err(EmergencyError::AlreadyResolved {
                emergency_id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Appends a communication-log entry.
    ///
    /// Allowed in every status, including terminal ones.
    pub fn append_log(
        &mut self,
        entry_type: LogEntryType,
        message: impl Into<String>,
        actor: Actor,
        now: DateTime<Utc>,
    ) {
        self.communication_log.push(LogEntry {
            entry_type,
            message: message.into(),
            timestamp: now,
            actor,
        });
        self.updated_at = now;
    }

    /// Requests `helper_id`.
    ///
    /// Idempotent: an existing assignment is returned unchanged with
    /// `created == false`.
    ///
    /// # Errors
    ///
    /// Returns `EmergencyError::AlreadyResolved` on a terminal emergency.
    pub fn assign_helper(
        &mut self,
        helper_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AssignResult, EmergencyError> {
        if let Some(existing) = self.assignment(helper_id) {
            return Ok(AssignResult {
                assignment: existing.clone(),
                created: false,
            });
        }
        self.ensure_active()?;

        let assignment = Assignment {
            helper_id: helper_id.to_string(),
            status: AssignmentStatus::Requested,
            assigned_at: now,
            accepted_at: None,
            arrived_at: None,
            completed_at: None,
            notes: None,
        };
        self.assigned_helpers.push(assignment.clone());
        self.response_metrics
            .first_helper_assigned_at
            .get_or_insert(now);
        self.append_log(
            LogEntryType::HelperAssigned,
            format!("Helper {helper_id} requested"),
            Actor::system(),
            now,
        );
        self.recompute_counters();
        Ok(AssignResult {
            assignment,
            created: true,
        })
    }

    /// Moves `helper_id`'s assignment from `requested` to `accepted`.
    ///
    /// Returns `Ok(None)` without changing anything when the helper has no
    /// assignment or it is not `requested`.
    ///
    /// # Errors
    ///
    /// Returns `EmergencyError::AlreadyResolved` on a terminal emergency.
    pub fn accept_helper(
        &mut self,
        helper_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, EmergencyError> {
        self.ensure_active()?;
        let Some(assignment) = self.transition_assignment(
            helper_id,
            &[AssignmentStatus::Requested],
            AssignmentStatus::Accepted,
            now,
        ) else {
            return Ok(None);
        };
        self.response_metrics
            .first_helper_accepted_at
            .get_or_insert(now);
        self.append_log(
            LogEntryType::HelperAccepted,
            format!("Helper {helper_id} accepted the request"),
            Actor::helper(helper_id),
            now,
        );
        self.recompute_counters();
        Ok(Some(assignment))
    }

    /// Moves `helper_id`'s assignment from `accepted` to `arriving`.
    ///
    /// Returns `Ok(None)` without changing anything when the helper has no
    /// assignment or it is not `accepted`.
    ///
    /// # Errors
    ///
    /// Returns `EmergencyError::AlreadyResolved` on a terminal emergency.
    pub fn mark_helper_arriving(
        &mut self,
        helper_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, EmergencyError> {
        self.ensure_active()?;
        let Some(assignment) = self.transition_assignment(
            helper_id,
            &[AssignmentStatus::Accepted],
            AssignmentStatus::Arriving,
            now,
        ) else {
            return Ok(None);
        };
        self.append_log(
            LogEntryType::HelperArriving,
            format!("Helper {helper_id} is on the way"),
            Actor::helper(helper_id),
            now,
        );
        self.recompute_counters();
        Ok(Some(assignment))
    }

    /// Moves `helper_id`'s assignment from `accepted` or `arriving` to
    /// `arrived`.
    ///
    /// Returns `Ok(None)` without changing anything when the helper has no
    /// assignment or it is in another status.
    ///
    /// # Errors
    ///
    /// Returns `EmergencyError::AlreadyResolved` on a terminal emergency.
    pub fn mark_helper_arrived(
        &mut self,
        helper_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, EmergencyError> {
        self.ensure_active()?;
        let Some(assignment) = self.transition_assignment(
            helper_id,
            &[AssignmentStatus::Accepted, AssignmentStatus::Arriving],
            AssignmentStatus::Arrived,
            now,
        ) else {
            return Ok(None);
        };
        self.response_metrics
            .first_helper_arrived_at
            .get_or_insert(now);
        self.append_log(
            LogEntryType::HelperArrived,
            format!("Helper {helper_id} arrived on scene"),
            Actor::helper(helper_id),
            now,
        );
        self.recompute_counters();
        Ok(Some(assignment))
    }

    fn transition_assignment(
        &mut self,
        helper_id: &str,
        from: &[AssignmentStatus],
        to: AssignmentStatus,
        now: DateTime<Utc>,
    ) -> Option<Assignment> {
        let assignment = self
            .assigned_helpers
            .iter_mut()
            .find(|a| a.helper_id == helper_id)?;
        if !from.contains(&assignment.status) || !assignment.status.can_transition_to(to) {
            return None;
        }
        assignment.status = to;
        match to {
            AssignmentStatus::Accepted => assignment.accepted_at = Some(now),
            AssignmentStatus::Arrived => assignment.arrived_at = Some(now),
            AssignmentStatus::Completed => assignment.completed_at = Some(now),
            AssignmentStatus::Requested | AssignmentStatus::Arriving => {},
        }
        Some(assignment.clone())
    }

    /// Closes the emergency.
    ///
    /// The status always becomes [`EmergencyStatus::Resolved`]; the
    /// resolution type (default `completed`) is recorded in the resolution
    /// only.
    ///
    /// # Errors
    ///
    /// Returns `EmergencyError::AlreadyResolved` on a terminal emergency and
    /// `EmergencyError::Validation` for an out-of-range rating or oversized
    /// text.
    pub fn resolve(
        &mut self,
        resolved_by: Actor,
        data: ResolutionData,
        now: DateTime<Utc>,
    ) -> Result<(), EmergencyError> {
        self.ensure_active()?;
        let violations = data.violations();
        if !violations.is_empty() {
            return Err(EmergencyError::validation(violations));
        }

        let resolution_type = data.resolution_type.unwrap_or_default();
        self.status = EmergencyStatus::Resolved;
        self.response_metrics.resolved_at = Some(now);
        self.resolution = Some(Resolution {
            resolved_by: resolved_by.clone(),
            resolution_type,
            notes: data.notes,
            resolved_at: now,
            rating: data.rating,
            feedback: data.feedback,
        });
        self.append_log(
            LogEntryType::StatusUpdate,
            format!("Emergency resolved ({resolution_type})"),
            resolved_by,
            now,
        );
        Ok(())
    }

    /// Closes a stale emergency with status `timeout`, attributed to the
    /// system.
    ///
    /// # Errors
    ///
    /// Returns `EmergencyError::AlreadyResolved` on a terminal emergency.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), EmergencyError> {
        self.ensure_active()?;
        let notes = format!(
            "No helper accepted within {} minutes",
            self.settings.timeout_minutes
        );
        self.status = EmergencyStatus::Timeout;
        self.response_metrics.resolved_at = Some(now);
        self.resolution = Some(Resolution {
            resolved_by: Actor::system(),
            resolution_type: ResolutionType::Timeout,
            notes: Some(notes.clone()),
            resolved_at: now,
            rating: None,
            feedback: None,
        });
        self.append_log(LogEntryType::StatusUpdate, notes, Actor::system(), now);
        Ok(())
    }

    /// Recomputes the response counters from the assignment list.
    pub fn recompute_counters(&mut self) {
        let count = |pred: fn(&Assignment) -> bool| {
            u32::try_from(self.assigned_helpers.iter().filter(|a| pred(a)).count())
                .unwrap_or(u32::MAX)
        };
        let requested = count(|_| true);
        let accepted = count(|a| a.status != AssignmentStatus::Requested);
        let arrived = count(|a| a.status == AssignmentStatus::Arrived);
        self.response_metrics.total_helpers_requested = requested;
        self.response_metrics.total_helpers_accepted = accepted;
        self.response_metrics.total_helpers_arrived = arrived;
    }

    /// Sets the persisted version. Called by store implementations after a
    /// successful write.
    pub const fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
