//! Emergency lifecycle service.
//!
//! Every mutation runs as load, mutate, save on one emergency document:
//!
//! 1. take the per-id lock from [`KeyedLocks`];
//! 2. load the current document and apply the aggregate operation;
//! 3. save it through the store's version compare-and-swap. On a version
//!    conflict the document is reloaded and the operation re-applied, up to
//!    `max_conflict_retries` times, after which `EmergencyError::Conflict` is
//!    returned.
//!
//! Notifications are sent after the save and outside the lock. A failed or
//! timed-out send is logged and counted and never changes the committed
//! state. Store, geo index and notification calls each run under their own
//! timeout.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lifeline_core::access::{Requester, Role, can_access};
use lifeline_core::clock::Clock;
use lifeline_core::config::{DispatchConfig, LifelineConfig, TimeoutsConfig};
use lifeline_core::dispatch::{haversine_distance, minutes_elapsed, severity_score};
use lifeline_core::emergency::{
    AssignResult, Assignment, Emergency, EmergencyDraft, EmergencyError, EmergencySettings,
    EmergencyStatus, GeoPoint, LogEntry, LogEntryType, MAX_TEXT_LEN, ResolutionData, SosDraft,
};
use lifeline_core::geo::GeoIndex;
use lifeline_core::notify::{NotificationEvent, NotificationSink};
use lifeline_core::store::{
    DateRange, EmergencyFilter, EmergencyStatistics, EmergencyStore, Page, StoreError,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::locks::KeyedLocks;
use crate::metrics::LifelineMetrics;

/// Service tuning taken from [`LifelineConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Settings applied to drafts that leave them unset.
    pub emergency_defaults: EmergencySettings,
    /// Radius limits.
    pub dispatch: DispatchConfig,
    /// Per-call I/O budgets.
    pub timeouts: TimeoutsConfig,
    /// Reload-and-reapply attempts after a version conflict.
    pub max_conflict_retries: u32,
}

impl ServiceConfig {
    /// Extracts the service settings from the daemon configuration.
    #[must_use]
    pub const fn from_config(config: &LifelineConfig) -> Self {
        Self {
            emergency_defaults: config.emergency_defaults.settings(),
            dispatch: config.dispatch,
            timeouts: config.timeouts,
            max_conflict_retries: config.concurrency.max_conflict_retries,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_config(&LifelineConfig::default())
    }
}

/// Result of `trigger_sos`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SosOutcome {
    /// The created emergency, including any assignments made by dispatch.
    pub emergency: Emergency,
    /// Notifications accepted by the sink.
    pub notifications_sent: usize,
}

/// An active emergency near a query point.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyEmergency {
    pub emergency: Emergency,
    pub distance_meters: f64,
    pub severity_score: f64,
}

/// What a mutation closure did.
enum Change<T> {
    /// Persist the mutated document.
    Save(T),
    /// Nothing changed; skip the write.
    Keep(T),
}

/// Orchestrates emergency lifecycle operations over the store and the
/// collaborators.
pub struct LifecycleService {
    store: Arc<dyn EmergencyStore>,
    geo: Arc<dyn GeoIndex>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: ServiceConfig,
    metrics: Option<LifelineMetrics>,
    locks: KeyedLocks,
}

impl LifecycleService {
    /// Creates a service without metrics.
    #[must_use]
    pub fn new(
        store: Arc<dyn EmergencyStore>,
        geo: Arc<dyn GeoIndex>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            geo,
            notifier,
            clock,
            config,
            metrics: None,
            locks: KeyedLocks::new(),
        }
    }

    /// Records lifecycle metrics into `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: LifelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the service configuration.
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Returns the clock the service stamps transitions with.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Validates `draft` and persists a new active emergency owned by
    /// `requester`. No helpers are dispatched.
    ///
    /// # Errors
    ///
    /// - `EmergencyError::Validation` listing every violated field
    /// - `EmergencyError::Store` if the record cannot be written
    #[instrument(skip(self, draft, requester), fields(owner_id = %requester.id))]
    pub async fn create_emergency(
        &self,
        draft: EmergencyDraft,
        requester: &Requester,
    ) -> Result<Emergency, EmergencyError> {
        let valid = draft.validate(&requester.id, &self.config.emergency_defaults)?;
        let id = Uuid::new_v4().to_string();
        let emergency = Emergency::open(id, requester.id.clone(), valid, self.clock.now());

        let emergency_id = emergency.id().to_string();
        let store = Arc::clone(&self.store);
        let created = self
            .write(&emergency_id, "create", async move {
                store.create(emergency).await
            })
            .await
            .map_err(store_error)?;

        if let Some(metrics) = &self.metrics {
            metrics.emergency_created(created.kind().as_str());
        }
        info!(
            emergency_id = created.id(),
            kind = %created.kind(),
            priority = %created.priority(),
            "emergency created"
        );
        Ok(created)
    }

    /// Raises a medical, critical SOS for `requester`, dispatches nearby
    /// helpers when auto-assignment is enabled and alerts guardians.
    ///
    /// A dispatch failure after creation is logged; the created emergency is
    /// still returned.
    ///
    /// # Errors
    ///
    /// Fails only if creation fails (see [`Self::create_emergency`]).
    #[instrument(skip(self, sos, requester), fields(owner_id = %requester.id))]
    pub async fn trigger_sos(
        &self,
        sos: SosDraft,
        requester: &Requester,
    ) -> Result<SosOutcome, EmergencyError> {
        let mut emergency = self.create_emergency(sos.into_draft(), requester).await?;
        if let Some(metrics) = &self.metrics {
            metrics.sos_triggered();
        }

        let mut notifications_sent = 0;
        if emergency.settings().auto_assign_helpers {
            let dispatched = self.dispatch(emergency.id()).await;
            match dispatched {
                Ok(outcome) => {
                    notifications_sent += outcome.notifications_sent;
                    if let Some(updated) = outcome.emergency {
                        emergency = updated;
                    }
                },
                Err(e) => warn!(
                    emergency_id = emergency.id(),
                    error = %e,
                    "helper dispatch after SOS failed"
                ),
            }
        }

        if emergency.settings().notify_guardians {
            let guardians: Vec<String> = emergency
                .medical_info()
                .map(|info| {
                    info.emergency_contacts
                        .iter()
                        .map(|c| c.recipient_id().to_string())
                        .collect()
                })
                .unwrap_or_default();
            let payload = event_payload(&emergency, json!({ "ownerId": emergency.owner_id() }));
            notifications_sent += self
                .notify_all(guardians, NotificationEvent::SosAlert, &payload)
                .await;
        }

        info!(
            emergency_id = emergency.id(),
            helpers = emergency.assigned_helpers().len(),
            notifications_sent,
            "SOS triggered"
        );
        Ok(SosOutcome {
            emergency,
            notifications_sent,
        })
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Requests the nearest available helpers for an active emergency.
    ///
    /// Returns one assignment per candidate. A geo index failure or timeout
    /// yields an empty list.
    ///
    /// # Errors
    ///
    /// - `EmergencyError::NotFound` if the emergency does not exist
    /// - `EmergencyError::AlreadyResolved` if it is no longer active
    /// - `EmergencyError::Conflict` / `EmergencyError::Store` on persistence
    ///   failure
    pub async fn assign_nearby_helpers(
        &self,
        emergency_id: &str,
    ) -> Result<Vec<Assignment>, EmergencyError> {
        let outcome = self.dispatch(emergency_id).await?;
        Ok(outcome.assignments)
    }

    #[instrument(skip(self))]
    async fn dispatch(&self, emergency_id: &str) -> Result<DispatchOutcome, EmergencyError> {
        let emergency = self.load(emergency_id).await?;
        if emergency.is_terminal() {
            return Err(EmergencyError::AlreadyResolved {
                emergency_id: emergency_id.to_string(),
                status: emergency.status(),
            });
        }

        let now = self.clock.now();
        let settings = *emergency.settings();
        let radius = self
            .config
            .dispatch
            .policy(settings.search_radius_meters)
            .radius(
                emergency.kind(),
                minutes_elapsed(emergency.response_metrics().sos_triggered_at, now),
            );
        let mut exclude: Vec<String> = emergency
            .assigned_helpers()
            .iter()
            .map(|a| a.helper_id.clone())
            .collect();
        exclude.push(emergency.owner_id().to_string());

        let query = self.geo.find_nearby_helpers(
            emergency.location().coordinates,
            radius,
            &exclude,
            settings.max_helpers as usize,
        );
        let candidates = match tokio::time::timeout(self.config.timeouts.geo(), query).await {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                self.collaborator_failed("geo_index", emergency_id, &e.to_string());
                return Ok(DispatchOutcome::empty());
            },
            Err(_) => {
                let reason = format!("query exceeded {} ms", self.config.timeouts.geo_ms);
                self.collaborator_failed("geo_index", emergency_id, &reason);
                return Ok(DispatchOutcome::empty());
            },
        };
        if candidates.is_empty() {
            debug!(emergency_id, radius, "no helpers in range");
            return Ok(DispatchOutcome::empty());
        }

        let (saved, results) = self
            .mutate(emergency_id, "assign", |emergency, now| {
                let results = candidates
                    .iter()
                    .map(|c| emergency.assign_helper(&c.helper_id, now))
                    .collect::<Result<Vec<AssignResult>, _>>()?;
                if results.iter().any(|r| r.created) {
                    Ok(Change::Save(results))
                } else {
                    Ok(Change::Keep(results))
                }
            })
            .await?;

        let created: Vec<&Assignment> = results
            .iter()
            .filter(|r| r.created)
            .map(|r| &r.assignment)
            .collect();
        if let Some(metrics) = &self.metrics {
            metrics.helpers_assigned(created.len());
        }
        info!(
            emergency_id,
            radius,
            candidates = candidates.len(),
            assigned = created.len(),
            "helpers dispatched"
        );

        let payload = event_payload(&saved, json!({ "radiusMeters": radius }));
        let recipients = created.iter().map(|a| a.helper_id.clone()).collect::<Vec<_>>();
        let notifications_sent = self
            .notify_all(recipients, NotificationEvent::HelperRequested, &payload)
            .await;

        Ok(DispatchOutcome {
            emergency: Some(saved),
            assignments: results.into_iter().map(|r| r.assignment).collect(),
            notifications_sent,
        })
    }

    // =========================================================================
    // Helper transitions
    // =========================================================================

    /// Accepts the request addressed to `requester`, who must be a helper
    /// holding a `requested` assignment.
    ///
    /// # Errors
    ///
    /// - `EmergencyError::NotFound` / `EmergencyError::AssignmentNotFound`
    /// - `EmergencyError::Unauthorized` if the requester is not a helper
    /// - `EmergencyError::AlreadyResolved` if the emergency is terminal
    /// - `EmergencyError::AssignmentNotRequested` if already accepted
    #[instrument(skip(self, requester), fields(helper_id = %requester.id))]
    pub async fn accept_helper_request(
        &self,
        emergency_id: &str,
        requester: &Requester,
    ) -> Result<Assignment, EmergencyError> {
        ensure_helper(emergency_id, requester)?;
        let helper_id = requester.id.as_str();
        let (saved, (assignment, first)) = self
            .mutate(emergency_id, "accept", |emergency, now| {
                let first = emergency.response_metrics().first_helper_accepted_at.is_none();
                match emergency.accept_helper(helper_id, now)? {
                    Some(assignment) => Ok(Change::Save((assignment, first))),
                    None => Err(assignment_error(emergency, helper_id, None)),
                }
            })
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.transition("accepted");
            if first {
                let waited = assignment.accepted_at.map_or(0, |at| {
                    (at - saved.response_metrics().sos_triggered_at).num_milliseconds()
                });
                #[allow(clippy::cast_precision_loss)]
                let seconds = waited.max(0) as f64 / 1000.0;
                metrics.first_accept_latency(saved.kind().as_str(), seconds);
            }
        }
        info!(emergency_id, helper_id, "helper accepted");

        let payload = event_payload(&saved, json!({ "helperId": helper_id }));
        self.notify(saved.owner_id(), NotificationEvent::HelperAccepted, &payload)
            .await;
        Ok(assignment)
    }

    /// Marks `requester`'s accepted assignment as on the way.
    ///
    /// # Errors
    ///
    /// As [`Self::accept_helper_request`], with
    /// `EmergencyError::InvalidAssignmentState` when the assignment is not
    /// `accepted`.
    #[instrument(skip(self, requester), fields(helper_id = %requester.id))]
    pub async fn mark_helper_arriving(
        &self,
        emergency_id: &str,
        requester: &Requester,
    ) -> Result<Assignment, EmergencyError> {
        ensure_helper(emergency_id, requester)?;
        let helper_id = requester.id.as_str();
        let (saved, assignment) = self
            .mutate(emergency_id, "arriving", |emergency, now| {
                match emergency.mark_helper_arriving(helper_id, now)? {
                    Some(assignment) => Ok(Change::Save(assignment)),
                    None => Err(assignment_error(emergency, helper_id, Some("accepted"))),
                }
            })
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.transition("arriving");
        }
        info!(emergency_id, helper_id, "helper on the way");

        let payload = event_payload(&saved, json!({ "helperId": helper_id }));
        self.notify(saved.owner_id(), NotificationEvent::HelperArriving, &payload)
            .await;
        Ok(assignment)
    }

    /// Marks `requester`'s accepted or arriving assignment as arrived.
    ///
    /// # Errors
    ///
    /// As [`Self::accept_helper_request`], with
    /// `EmergencyError::InvalidAssignmentState` when the assignment is
    /// neither `accepted` nor `arriving`.
    #[instrument(skip(self, requester), fields(helper_id = %requester.id))]
    pub async fn mark_helper_arrived(
        &self,
        emergency_id: &str,
        requester: &Requester,
    ) -> Result<Assignment, EmergencyError> {
        ensure_helper(emergency_id, requester)?;
        let helper_id = requester.id.as_str();
        let (saved, assignment) = self
            .mutate(emergency_id, "arrived", |emergency, now| {
                match emergency.mark_helper_arrived(helper_id, now)? {
                    Some(assignment) => Ok(Change::Save(assignment)),
                    None => Err(assignment_error(
                        emergency,
                        helper_id,
                        Some("accepted or arriving"),
                    )),
                }
            })
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.transition("arrived");
        }
        info!(emergency_id, helper_id, "helper arrived");

        let payload = event_payload(&saved, json!({ "helperId": helper_id }));
        self.notify(saved.owner_id(), NotificationEvent::HelperArrived, &payload)
            .await;
        Ok(assignment)
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Resolves an active emergency on behalf of the owner, an assigned
    /// helper or an admin.
    ///
    /// # Errors
    ///
    /// - `EmergencyError::NotFound`
    /// - `EmergencyError::Unauthorized` if the access gate denies
    /// - `EmergencyError::AlreadyResolved` if the emergency is terminal
    /// - `EmergencyError::Validation` for an out-of-range rating
    #[instrument(skip(self, data, requester), fields(requester_id = %requester.id))]
    pub async fn resolve_emergency(
        &self,
        emergency_id: &str,
        data: ResolutionData,
        requester: &Requester,
    ) -> Result<Emergency, EmergencyError> {
        let (saved, ()) = self
            .mutate(emergency_id, "resolve", |emergency, now| {
                if !can_access(emergency, requester) {
                    return Err(EmergencyError::unauthorized(emergency_id, &requester.id));
                }
                emergency.resolve(requester.actor(), data.clone(), now)?;
                Ok(Change::Save(()))
            })
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.transition("resolved");
        }
        let resolution_type = saved.resolution().map(|r| r.resolution_type);
        info!(
            emergency_id,
            resolution_type = ?resolution_type,
            "emergency resolved"
        );

        let payload = event_payload(
            &saved,
            json!({
                "resolvedBy": requester.id,
                "resolutionType": resolution_type,
            }),
        );
        let mut recipients = vec![saved.owner_id().to_string()];
        recipients.extend(saved.assigned_helpers().iter().map(|a| a.helper_id.clone()));
        self.notify_all(recipients, NotificationEvent::EmergencyResolved, &payload)
            .await;
        Ok(saved)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the emergency if `requester` passes the access gate.
    ///
    /// # Errors
    ///
    /// `EmergencyError::NotFound` or `EmergencyError::Unauthorized`.
    pub async fn get_emergency(
        &self,
        emergency_id: &str,
        requester: &Requester,
    ) -> Result<Emergency, EmergencyError> {
        let emergency = self.load(emergency_id).await?;
        if !can_access(&emergency, requester) {
            return Err(EmergencyError::unauthorized(emergency_id, &requester.id));
        }
        Ok(emergency)
    }

    /// Lists the requester's own emergencies, newest first.
    ///
    /// # Errors
    ///
    /// `EmergencyError::Store` on backend failure.
    pub async fn list_my_emergencies(
        &self,
        requester: &Requester,
        filter: EmergencyFilter,
        page: Page,
    ) -> Result<Vec<Emergency>, EmergencyError> {
        self.store_call(self.store.find_by_owner(&requester.id, filter, page))
            .await
            .map_err(store_error)
    }

    /// Active emergencies within `radius_meters` of `point`, nearest first.
    ///
    /// The radius defaults to the configured nearby radius and is capped at
    /// the configured maximum. The requester's own emergencies are left out.
    ///
    /// # Errors
    ///
    /// - `EmergencyError::Validation` for an out-of-range point or a zero
    ///   radius
    /// - `EmergencyError::Store` on backend failure
    pub async fn find_nearby_emergencies(
        &self,
        point: GeoPoint,
        radius_meters: Option<u32>,
        requester: &Requester,
    ) -> Result<Vec<NearbyEmergency>, EmergencyError> {
        if !point.is_valid() {
            return Err(EmergencyError::invalid_field(
                "location",
                "latitude must be within [-90, 90] and longitude within [-180, 180]",
            ));
        }
        let radius = radius_meters.unwrap_or(self.config.dispatch.nearby_default_radius_meters);
        if radius == 0 {
            return Err(EmergencyError::invalid_field("radius", "must be positive"));
        }
        let radius = radius.min(self.config.dispatch.max_radius_meters);

        let now = self.clock.now();
        let found = self
            .store_call(self.store.find_near(point, radius, EmergencyStatus::Active))
            .await
            .map_err(store_error)?;

        let mut nearby: Vec<NearbyEmergency> = found
            .into_iter()
            .filter(|e| e.owner_id() != requester.id)
            .map(|emergency| NearbyEmergency {
                distance_meters: haversine_distance(point, emergency.location().coordinates),
                severity_score: severity_score(&emergency, now),
                emergency,
            })
            .collect();
        nearby.sort_by(|a, b| {
            a.distance_meters
                .total_cmp(&b.distance_meters)
                .then_with(|| a.emergency.id().cmp(b.emergency.id()))
        });
        debug!(radius, count = nearby.len(), "nearby search");
        Ok(nearby)
    }

    /// Aggregate statistics over emergencies created within `range`.
    ///
    /// # Errors
    ///
    /// `EmergencyError::Store` on backend failure.
    pub async fn statistics(
        &self,
        range: Option<DateRange>,
    ) -> Result<EmergencyStatistics, EmergencyError> {
        self.store_call(self.store.aggregate_statistics(range))
            .await
            .map_err(store_error)
    }

    // =========================================================================
    // Communication log and administration
    // =========================================================================

    /// Appends a chat message to the communication log. Allowed on terminal
    /// emergencies.
    ///
    /// # Errors
    ///
    /// - `EmergencyError::Validation` for an empty or oversized message
    /// - `EmergencyError::NotFound` / `EmergencyError::Unauthorized`
    pub async fn add_message(
        &self,
        emergency_id: &str,
        requester: &Requester,
        text: &str,
    ) -> Result<LogEntry, EmergencyError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EmergencyError::invalid_field("message", "must not be empty"));
        }
        if text.chars().count() > MAX_TEXT_LEN {
            return Err(EmergencyError::invalid_field(
                "message",
                format!("must be at most {MAX_TEXT_LEN} characters"),
            ));
        }

        let (saved, ()) = self
            .mutate(emergency_id, "message", |emergency, now| {
                if !can_access(emergency, requester) {
                    return Err(EmergencyError::unauthorized(emergency_id, &requester.id));
                }
                emergency.append_log(LogEntryType::Message, text, requester.actor(), now);
                Ok(Change::Save(()))
            })
            .await?;

        saved
            .communication_log()
            .last()
            .cloned()
            .ok_or_else(|| EmergencyError::store("message not persisted"))
    }

    /// Deletes an emergency. Admins only.
    ///
    /// # Errors
    ///
    /// `EmergencyError::Unauthorized` for non-admins, `EmergencyError::NotFound`
    /// if nothing was deleted.
    pub async fn delete_emergency(
        &self,
        emergency_id: &str,
        requester: &Requester,
    ) -> Result<(), EmergencyError> {
        if !requester.is_admin() {
            return Err(EmergencyError::unauthorized(emergency_id, &requester.id));
        }
        let _guard = self.locks.acquire(emergency_id).await;
        let deleted = self
            .store_call(self.store.delete(emergency_id))
            .await
            .map_err(store_error)?;
        if !deleted {
            return Err(EmergencyError::not_found(emergency_id));
        }
        info!(emergency_id, admin_id = %requester.id, "emergency deleted");
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Moves every stale active emergency to `timeout`.
    ///
    /// An emergency is stale when no helper accepted within its
    /// `timeout_minutes`. Per-record failures are logged and skipped.
    ///
    /// # Errors
    ///
    /// `EmergencyError::Store` if the active set cannot be listed.
    pub async fn expire_stale(&self) -> Result<usize, EmergencyError> {
        let now = self.clock.now();
        let active = self
            .store_call(self.store.list_by_status(EmergencyStatus::Active))
            .await
            .map_err(store_error)?;

        let mut expired = 0;
        for candidate in active.iter().filter(|e| e.is_stale(now)) {
            let id = candidate.id();
            let result = self
                .mutate(id, "expire", |emergency, now| {
                    if !emergency.is_stale(now) {
                        return Ok(Change::Keep(false));
                    }
                    emergency.expire(now)?;
                    Ok(Change::Save(true))
                })
                .await;
            match result {
                Ok((saved, true)) => {
                    expired += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.transition("expired");
                    }
                    info!(emergency_id = id, "emergency timed out");
                    let payload = event_payload(&saved, json!({}));
                    self.notify(saved.owner_id(), NotificationEvent::EmergencyExpired, &payload)
                        .await;
                },
                Ok((_, false)) | Err(EmergencyError::AlreadyResolved { .. }) => {
                    debug!(emergency_id = id, "no longer stale");
                },
                Err(e) => warn!(emergency_id = id, error = %e, "failed to expire emergency"),
            }
        }
        Ok(expired)
    }

    /// Deletes records past their retention time.
    ///
    /// # Errors
    ///
    /// `EmergencyError::Store` on backend failure.
    pub async fn purge_expired(&self) -> Result<u64, EmergencyError> {
        let purged = self
            .store_call(self.store.purge_expired(self.clock.now()))
            .await
            .map_err(store_error)?;
        if purged > 0 {
            info!(purged, "expired records purged");
        }
        Ok(purged)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn store_call<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.config.timeouts.store(), call)
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::backend(format!(
                    "store call exceeded {} ms",
                    self.config.timeouts.store_ms
                )))
            })
    }

    /// Runs a committing store call on its own task.
    ///
    /// Past the store budget the write is not cancelled: a backend may still
    /// commit it, so the caller waits for the real outcome instead of
    /// reporting a failure for a change that landed.
    async fn write<T>(
        &self,
        emergency_id: &str,
        operation: &'static str,
        call: impl Future<Output = Result<T, StoreError>> + Send + 'static,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
    {
        let mut task = tokio::spawn(call);
        let joined = match tokio::time::timeout(self.config.timeouts.store(), &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                if let Some(metrics) = &self.metrics {
                    metrics.collaborator_failed("store");
                }
                warn!(
                    emergency_id,
                    operation,
                    budget_ms = self.config.timeouts.store_ms,
                    "write exceeded store budget, waiting for its outcome"
                );
                task.await
            },
        };
        joined.map_err(|e| StoreError::backend(format!("write task failed: {e}")))?
    }

    async fn load(&self, emergency_id: &str) -> Result<Emergency, EmergencyError> {
        self.store_call(self.store.get(emergency_id))
            .await
            .map_err(store_error)?
            .ok_or_else(|| EmergencyError::not_found(emergency_id))
    }

    /// Load, mutate, save under the per-id lock, re-applying `apply` to a
    /// fresh copy after each version conflict.
    async fn mutate<T, F>(
        &self,
        emergency_id: &str,
        operation: &'static str,
        mut apply: F,
    ) -> Result<(Emergency, T), EmergencyError>
    where
        F: FnMut(&mut Emergency, DateTime<Utc>) -> Result<Change<T>, EmergencyError>,
    {
        let _guard = self.locks.acquire(emergency_id).await;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut emergency = self.load(emergency_id).await?;
            let value = match apply(&mut emergency, self.clock.now())? {
                Change::Keep(value) => return Ok((emergency, value)),
                Change::Save(value) => value,
            };

            let store = Arc::clone(&self.store);
            let save = async move { store.save(emergency).await };
            match self.write(emergency_id, operation, save).await {
                Ok(saved) => return Ok((saved, value)),
                Err(StoreError::Conflict {
                    expected, actual, ..
                }) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.conflict(operation);
                    }
                    warn!(
                        emergency_id,
                        operation,
                        expected,
                        actual,
                        attempts,
                        "version conflict on save"
                    );
                    if attempts > self.config.max_conflict_retries {
                        return Err(EmergencyError::Conflict {
                            emergency_id: emergency_id.to_string(),
                            attempts,
                        });
                    }
                },
                Err(e) => return Err(store_error(e)),
            }
        }
    }

    /// Sends one notification. Returns `true` if the sink accepted it.
    async fn notify(
        &self,
        recipient_id: &str,
        event: NotificationEvent,
        payload: &serde_json::Value,
    ) -> bool {
        let send = self.notifier.notify(recipient_id, event, payload);
        let failure = match tokio::time::timeout(self.config.timeouts.notify(), send).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "send exceeded {} ms",
                self.config.timeouts.notify_ms
            )),
        };
        if let Some(metrics) = &self.metrics {
            metrics.notification(event.as_str(), failure.is_none());
        }
        match failure {
            None => true,
            Some(reason) => {
                warn!(recipient_id, event = %event, reason = %reason, "notification failed");
                false
            },
        }
    }

    async fn notify_all(
        &self,
        recipients: Vec<String>,
        event: NotificationEvent,
        payload: &serde_json::Value,
    ) -> usize {
        let mut sent = 0;
        for recipient in recipients {
            if self.notify(&recipient, event, payload).await {
                sent += 1;
            }
        }
        sent
    }

    fn collaborator_failed(&self, collaborator: &'static str, emergency_id: &str, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.collaborator_failed(collaborator);
        }
        let error = EmergencyError::collaborator(collaborator, reason);
        warn!(emergency_id, error = %error, "collaborator call failed, continuing");
    }
}

struct DispatchOutcome {
    emergency: Option<Emergency>,
    assignments: Vec<Assignment>,
    notifications_sent: usize,
}

impl DispatchOutcome {
    const fn empty() -> Self {
        Self {
            emergency: None,
            assignments: Vec::new(),
            notifications_sent: 0,
        }
    }
}

fn store_error(error: StoreError) -> EmergencyError {
    match error {
        StoreError::NotFound { id } => EmergencyError::not_found(id),
        other => EmergencyError::store(other.to_string()),
    }
}

fn ensure_helper(emergency_id: &str, requester: &Requester) -> Result<(), EmergencyError> {
    if requester.role == Role::Helper {
        Ok(())
    } else {
        Err(EmergencyError::unauthorized(emergency_id, &requester.id))
    }
}

/// Explains why an assignment transition did not apply. `expected` is `None`
/// for acceptance, which has its own error.
fn assignment_error(
    emergency: &Emergency,
    helper_id: &str,
    expected: Option<&'static str>,
) -> EmergencyError {
    let emergency_id = emergency.id().to_string();
    let helper_id = helper_id.to_string();
    match (emergency.assignment(&helper_id), expected) {
        (None, _) => EmergencyError::AssignmentNotFound {
            emergency_id,
            helper_id,
        },
        (Some(assignment), None) => EmergencyError::AssignmentNotRequested {
            emergency_id,
            helper_id,
            status: assignment.status,
        },
        (Some(assignment), Some(expected)) => EmergencyError::InvalidAssignmentState {
            emergency_id,
            helper_id,
            status: assignment.status,
            expected,
        },
    }
}

fn event_payload(emergency: &Emergency, extra: serde_json::Value) -> serde_json::Value {
    let mut payload = json!({
        "emergencyId": emergency.id(),
        "type": emergency.kind(),
        "priority": emergency.priority(),
        "status": emergency.status(),
        "location": emergency.location().coordinates,
    });
    if let (Some(target), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra) {
        target.extend(extra);
    }
    payload
}
