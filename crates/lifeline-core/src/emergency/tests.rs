//! Tests for the emergency aggregate.

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use super::*;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
}

fn open(kind: &str) -> Emergency {
    let draft = EmergencyDraft {
        kind: kind.into(),
        title: "Test emergency".into(),
        description: "Something happened".into(),
        location: LocationInput::at(-122.42, 37.77, "Market St"),
        ..EmergencyDraft::default()
    }
    .validate("owner-1", &EmergencySettings::default())
    .unwrap();
    Emergency::open("em-1", "owner-1", draft, t0())
}

fn assert_counters_consistent(e: &Emergency) {
    let helpers = e.assigned_helpers();
    let m = e.response_metrics();
    assert_eq!(m.total_helpers_requested as usize, helpers.len());
    assert_eq!(
        m.total_helpers_accepted as usize,
        helpers
            .iter()
            .filter(|a| a.status != AssignmentStatus::Requested)
            .count()
    );
    assert_eq!(
        m.total_helpers_arrived as usize,
        helpers
            .iter()
            .filter(|a| a.status == AssignmentStatus::Arrived)
            .count()
    );
}

// =============================================================================
// Creation
// =============================================================================

#[test]
fn test_open_fire_emergency() {
    let e = open("fire");
    assert_eq!(e.status(), EmergencyStatus::Active);
    assert_eq!(e.priority(), Priority::Critical);
    assert_eq!(e.communication_log().len(), 1);
    let entry = &e.communication_log()[0];
    assert_eq!(entry.entry_type, LogEntryType::SosSent);
    assert_eq!(entry.actor, Actor::user("owner-1"));

    let m = e.response_metrics();
    assert_eq!(m.sos_triggered_at, t0());
    assert!(m.first_helper_assigned_at.is_none());
    assert!(m.first_helper_accepted_at.is_none());
    assert!(m.first_helper_arrived_at.is_none());
    assert!(m.resolved_at.is_none());
    assert_eq!(e.expires_at(), t0() + Duration::hours(RECORD_TTL_HOURS));
    assert_eq!(e.version(), 0);
}

#[test]
fn test_explicit_priority_wins() {
    let draft = EmergencyDraft {
        kind: "fire".into(),
        title: "Bonfire".into(),
        description: "Controlled".into(),
        location: LocationInput::at(0.0, 0.0, "Beach"),
        priority: Some("low".into()),
        ..EmergencyDraft::default()
    }
    .validate("owner-1", &EmergencySettings::default())
    .unwrap();
    let e = Emergency::open("em-2", "owner-1", draft, t0());
    assert_eq!(e.priority(), Priority::Low);
}

// =============================================================================
// Assignment
// =============================================================================

#[test]
fn test_assign_is_idempotent() {
    let mut e = open("medical");
    let first = e.assign_helper("h1", t0() + Duration::minutes(1)).unwrap();
    assert!(first.created);
    let again = e.assign_helper("h1", t0() + Duration::minutes(2)).unwrap();
    assert!(!again.created);
    assert_eq!(again.assignment, first.assignment);
    assert_eq!(e.assigned_helpers().len(), 1);
    assert_eq!(
        e.communication_log()
            .iter()
            .filter(|l| l.entry_type == LogEntryType::HelperAssigned)
            .count(),
        1
    );
    assert_eq!(
        e.response_metrics().first_helper_assigned_at,
        Some(t0() + Duration::minutes(1))
    );
    assert_counters_consistent(&e);
}

#[test]
fn test_accept_then_second_accept_is_noop() {
    let mut e = open("medical");
    e.assign_helper("h1", t0()).unwrap();
    let accepted = e.accept_helper("h1", t0() + Duration::minutes(3)).unwrap();
    let accepted = accepted.unwrap();
    assert_eq!(accepted.status, AssignmentStatus::Accepted);
    assert_eq!(accepted.accepted_at, Some(t0() + Duration::minutes(3)));

    let log_len = e.communication_log().len();
    assert!(
        e.accept_helper("h1", t0() + Duration::minutes(4))
            .unwrap()
            .is_none()
    );
    assert_eq!(e.communication_log().len(), log_len);
    assert_eq!(
        e.response_metrics().first_helper_accepted_at,
        Some(t0() + Duration::minutes(3))
    );
}

#[test]
fn test_accept_unknown_helper_fabricates_nothing() {
    let mut e = open("medical");
    assert!(e.accept_helper("ghost", t0()).unwrap().is_none());
    assert!(e.assigned_helpers().is_empty());
    assert!(e.response_metrics().first_helper_accepted_at.is_none());
}

#[test]
fn test_arrival_paths() {
    let mut e = open("accident");
    e.assign_helper("h1", t0()).unwrap();
    e.assign_helper("h2", t0()).unwrap();

    // Arrived straight from requested is rejected.
    assert!(e.mark_helper_arrived("h1", t0()).unwrap().is_none());

    e.accept_helper("h1", t0() + Duration::minutes(1)).unwrap();
    e.accept_helper("h2", t0() + Duration::minutes(1)).unwrap();

    let arriving = e
        .mark_helper_arriving("h1", t0() + Duration::minutes(2))
        .unwrap()
        .unwrap();
    assert_eq!(arriving.status, AssignmentStatus::Arriving);
    assert_eq!(e.active_helpers_count(), 2);

    let arrived = e
        .mark_helper_arrived("h2", t0() + Duration::minutes(5))
        .unwrap()
        .unwrap();
    assert!(arrived.arrived_at.is_some());
    e.mark_helper_arrived("h1", t0() + Duration::minutes(6))
        .unwrap()
        .unwrap();

    assert_eq!(
        e.response_metrics().first_helper_arrived_at,
        Some(t0() + Duration::minutes(5))
    );
    assert_eq!(e.response_metrics().total_helpers_arrived, 2);
    assert_counters_consistent(&e);
}

// =============================================================================
// Terminal transitions
// =============================================================================

#[test]
fn test_resolve_cancelled_keeps_resolved_status() {
    let mut e = open("crime");
    let data = ResolutionData {
        resolution_type: Some(ResolutionType::Cancelled),
        rating: Some(4),
        ..ResolutionData::default()
    };
    let at = t0() + Duration::minutes(12);
    e.resolve(Actor::user("owner-1"), data, at).unwrap();

    assert_eq!(e.status(), EmergencyStatus::Resolved);
    let resolution = e.resolution().unwrap();
    assert_eq!(resolution.resolution_type, ResolutionType::Cancelled);
    assert_eq!(resolution.rating, Some(4));
    assert_eq!(e.response_metrics().resolved_at, Some(at));
    assert_eq!(e.duration(at + Duration::hours(5)), Duration::minutes(12));

    let err = e
        .resolve(Actor::user("owner-1"), ResolutionData::default(), at)
        .unwrap_err();
    assert_eq!(err.code(), "EMERGENCY_ALREADY_RESOLVED");
}

#[test]
fn test_resolve_rejects_bad_rating_without_mutating() {
    let mut e = open("other");
    let data = ResolutionData {
        rating: Some(6),
        ..ResolutionData::default()
    };
    let err = e.resolve(Actor::system(), data, t0()).unwrap_err();
    assert_eq!(err.violations()[0].field, "rating");
    assert_eq!(e.status(), EmergencyStatus::Active);
    assert!(e.resolution().is_none());
}

#[test]
fn test_terminal_rejects_mutations_but_accepts_log() {
    let mut e = open("medical");
    e.assign_helper("h1", t0()).unwrap();
    e.resolve(Actor::system(), ResolutionData::default(), t0())
        .unwrap();

    assert_eq!(
        e.accept_helper("h1", t0()).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(
        e.mark_helper_arrived("h1", t0()).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert!(e.assign_helper("h2", t0()).is_err());
    assert!(e.expire(t0()).is_err());

    let before = e.communication_log().len();
    e.append_log(
        LogEntryType::Message,
        "thank you",
        Actor::user("owner-1"),
        t0(),
    );
    assert_eq!(e.communication_log().len(), before + 1);
}

#[test]
fn test_staleness_and_expiry() {
    let mut e = open("other");
    let timeout = i64::from(e.settings().timeout_minutes);
    assert!(!e.is_stale(t0() + Duration::minutes(timeout - 1)));
    assert!(e.is_stale(t0() + Duration::minutes(timeout)));

    let at = t0() + Duration::minutes(timeout);
    e.expire(at).unwrap();
    assert_eq!(e.status(), EmergencyStatus::Timeout);
    let resolution = e.resolution().unwrap();
    assert_eq!(resolution.resolution_type, ResolutionType::Timeout);
    assert_eq!(resolution.resolved_by, Actor::system());
    assert!(!e.is_stale(at));
}

#[test]
fn test_accepted_emergency_is_not_stale() {
    let mut e = open("other");
    e.assign_helper("h1", t0()).unwrap();
    e.accept_helper("h1", t0()).unwrap();
    assert!(!e.is_stale(t0() + Duration::hours(3)));
}

#[test]
fn test_document_serializes_with_wire_names() {
    let mut e = open("natural_disaster");
    e.assign_helper("h1", t0()).unwrap();
    let json = serde_json::to_value(&e).unwrap();
    assert_eq!(json["type"], "natural_disaster");
    assert_eq!(json["status"], "active");
    assert_eq!(json["location"]["coordinates"][0], -122.42);
    assert_eq!(json["assignedHelpers"][0]["helperId"], "h1");
    assert_eq!(json["responseMetrics"]["totalHelpersRequested"], 1);
    assert_eq!(json["communicationLog"][0]["type"], "sos_sent");

    let back: Emergency = serde_json::from_value(json).unwrap();
    assert_eq!(back.id(), e.id());
    assert_eq!(back.assigned_helpers(), e.assigned_helpers());
    assert_eq!(back.communication_log(), e.communication_log());
    assert_eq!(back.response_metrics(), e.response_metrics());
}

// =============================================================================
// Properties
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Assign(u8),
    Accept(u8),
    Arriving(u8),
    Arrived(u8),
    Resolve,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4).prop_map(Op::Assign),
        (0u8..4).prop_map(Op::Accept),
        (0u8..4).prop_map(Op::Arriving),
        (0u8..4).prop_map(Op::Arrived),
        Just(Op::Resolve),
    ]
}

proptest! {
    #[test]
    fn counters_and_first_timestamps_hold_under_any_sequence(ops in prop::collection::vec(op(), 0..40)) {
        let mut e = open("medical");
        let mut now = t0();
        for op in ops {
            now += Duration::seconds(30);
            let was_terminal = e.is_terminal();
            let log_before = e.communication_log().len();
            let result = match op {
                Op::Assign(h) => e.assign_helper(&format!("h{h}"), now).map(|_| ()),
                Op::Accept(h) => e.accept_helper(&format!("h{h}"), now).map(|_| ()),
                Op::Arriving(h) => e.mark_helper_arriving(&format!("h{h}"), now).map(|_| ()),
                Op::Arrived(h) => e.mark_helper_arrived(&format!("h{h}"), now).map(|_| ()),
                Op::Resolve => e.resolve(Actor::system(), ResolutionData::default(), now),
            };
            if was_terminal {
                prop_assert_eq!(e.communication_log().len(), log_before);
                if !matches!(op, Op::Assign(_)) {
                    prop_assert!(result.is_err());
                }
            }

            assert_counters_consistent(&e);

            let mut ids: Vec<_> = e.assigned_helpers().iter().map(|a| a.helper_id.clone()).collect();
            ids.sort();
            ids.dedup();
            prop_assert_eq!(ids.len(), e.assigned_helpers().len());

            let m = e.response_metrics();
            let chain = [
                Some(m.sos_triggered_at),
                m.first_helper_assigned_at,
                m.first_helper_accepted_at,
                m.first_helper_arrived_at,
            ];
            let set: Vec<_> = chain.iter().flatten().collect();
            prop_assert!(set.windows(2).all(|w| w[0] <= w[1]));
            if let (Some(accepted), Some(resolved)) = (m.first_helper_accepted_at, m.resolved_at) {
                prop_assert!(accepted <= resolved);
            }
        }
    }
}
