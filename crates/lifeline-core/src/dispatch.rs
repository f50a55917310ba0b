//! Pure dispatch policy: priority derivation, search radius, distance and
//! severity scoring.
//!
//! Everything here is deterministic and free of I/O. Time enters only as
//! explicit arguments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::emergency::{Emergency, EmergencyType, GeoPoint, Priority};

/// Default base search radius in meters.
pub const DEFAULT_BASE_RADIUS_METERS: u32 = 5_000;

/// Hard cap on any search radius in meters.
pub const MAX_SEARCH_RADIUS_METERS: u32 = 50_000;

/// Mean Earth radius used by [`haversine_distance`].
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Elapsed minutes per +100% of the base radius.
const RADIUS_GROWTH_MINUTES: f64 = 10.0;

/// Upper bound of the elapsed-time multiplier.
const MAX_TIME_MULTIPLIER: f64 = 3.0;

/// Escalation flags for [`determine_priority`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PriorityContext {
    /// The reporter has raised a similar emergency before.
    pub is_reoccurring: bool,
    /// The situation is deteriorating quickly.
    pub time_sensitive: bool,
}

/// Derives the dispatch priority from the type, escalating one level per
/// set flag, capped at critical.
#[must_use]
pub const fn determine_priority(kind: EmergencyType, context: PriorityContext) -> Priority {
    let mut priority = match kind {
        EmergencyType::Medical
        | EmergencyType::Accident
        | EmergencyType::Fire
        | EmergencyType::NaturalDisaster => Priority::Critical,
        EmergencyType::Crime => Priority::High,
        EmergencyType::Other => Priority::Medium,
    };
    if context.is_reoccurring {
        priority = priority.escalate();
    }
    if context.time_sensitive {
        priority = priority.escalate();
    }
    priority
}

/// Radius multiplier per emergency type.
#[must_use]
pub const fn type_factor(kind: EmergencyType) -> f64 {
    match kind {
        EmergencyType::Medical | EmergencyType::Fire | EmergencyType::NaturalDisaster => 1.5,
        EmergencyType::Accident => 1.4,
        EmergencyType::Crime => 1.2,
        EmergencyType::Other => 1.0,
    }
}

/// Search-radius policy: `base * type_factor * min(1 + minutes / 10, 3)`,
/// capped at `max_meters`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRadiusPolicy {
    /// Base radius in meters.
    pub base_meters: u32,
    /// Cap in meters.
    pub max_meters: u32,
}

impl Default for SearchRadiusPolicy {
    fn default() -> Self {
        Self {
            base_meters: DEFAULT_BASE_RADIUS_METERS,
            max_meters: MAX_SEARCH_RADIUS_METERS,
        }
    }
}

impl SearchRadiusPolicy {
    /// Returns the same policy with a different base.
    #[must_use]
    pub const fn with_base(self, base_meters: u32) -> Self {
        Self {
            base_meters,
            max_meters: self.max_meters,
        }
    }

    /// Computes the radius in meters for `kind` after `minutes_elapsed`.
    ///
    /// Negative or NaN elapsed time counts as zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn radius(&self, kind: EmergencyType, minutes_elapsed: f64) -> u32 {
        let minutes = minutes_elapsed.max(0.0);
        let time_multiplier = (1.0 + minutes / RADIUS_GROWTH_MINUTES).min(MAX_TIME_MULTIPLIER);
        let radius = f64::from(self.base_meters) * type_factor(kind) * time_multiplier;
        // Bounded by max_meters, so the cast cannot overflow.
        radius.min(f64::from(self.max_meters)).round() as u32
    }
}

/// [`SearchRadiusPolicy::radius`] with the default base and cap.
#[must_use]
pub fn calculate_search_radius(kind: EmergencyType, minutes_elapsed: f64) -> u32 {
    SearchRadiusPolicy::default().radius(kind, minutes_elapsed)
}

/// Great-circle distance between two points in meters.
#[must_use]
pub fn haversine_distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

/// Fractional minutes between `since` and `now`, never negative.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn minutes_elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let millis = (now - since).num_milliseconds().max(0);
    millis as f64 / 60_000.0
}

const fn priority_weight(priority: Priority) -> f64 {
    match priority {
        Priority::Critical => 100.0,
        Priority::High => 75.0,
        Priority::Medium => 50.0,
        Priority::Low => 25.0,
    }
}

const fn type_weight(kind: EmergencyType) -> f64 {
    match kind {
        EmergencyType::NaturalDisaster => 25.0,
        EmergencyType::Medical | EmergencyType::Accident | EmergencyType::Fire => 20.0,
        EmergencyType::Crime => 15.0,
        EmergencyType::Other => 0.0,
    }
}

/// Severity score in `[0, 100]` used to rank nearby emergencies.
///
/// Priority weight plus type weight plus a recency bonus of
/// `max(0, 10 - hours_elapsed)`, clamped to 100.
#[must_use]
pub fn severity_score(emergency: &Emergency, now: DateTime<Utc>) -> f64 {
    let hours = minutes_elapsed(emergency.response_metrics().sos_triggered_at, now) / 60.0;
    let recency = (10.0 - hours).max(0.0);
    (priority_weight(emergency.priority()) + type_weight(emergency.kind()) + recency)
        .clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    use super::*;
    use crate::emergency::{EmergencyDraft, EmergencySettings, LocationInput};

    #[test]
    fn base_priorities() {
        let none = PriorityContext::default();
        assert_eq!(
            determine_priority(EmergencyType::Medical, none),
            Priority::Critical
        );
        assert_eq!(
            determine_priority(EmergencyType::NaturalDisaster, none),
            Priority::Critical
        );
        assert_eq!(determine_priority(EmergencyType::Crime, none), Priority::High);
        assert_eq!(determine_priority(EmergencyType::Other, none), Priority::Medium);
    }

    #[test]
    fn flags_escalate_one_level_each() {
        let one = PriorityContext {
            is_reoccurring: true,
            time_sensitive: false,
        };
        let both = PriorityContext {
            is_reoccurring: true,
            time_sensitive: true,
        };
        assert_eq!(determine_priority(EmergencyType::Other, one), Priority::High);
        assert_eq!(
            determine_priority(EmergencyType::Other, both),
            Priority::Critical
        );
        assert_eq!(
            determine_priority(EmergencyType::Crime, both),
            Priority::Critical
        );
    }

    #[test]
    fn radius_boundaries() {
        assert_eq!(calculate_search_radius(EmergencyType::Medical, 0.0), 7_500);
        assert_eq!(calculate_search_radius(EmergencyType::Other, 0.0), 5_000);
        assert_eq!(calculate_search_radius(EmergencyType::Accident, 0.0), 7_000);
        assert_eq!(calculate_search_radius(EmergencyType::Crime, 0.0), 6_000);
        // 10 minutes doubles, 20 minutes saturates at x3.
        assert_eq!(calculate_search_radius(EmergencyType::Other, 10.0), 10_000);
        assert_eq!(calculate_search_radius(EmergencyType::Other, 20.0), 15_000);
        assert_eq!(calculate_search_radius(EmergencyType::Other, 600.0), 15_000);
        assert_eq!(calculate_search_radius(EmergencyType::Other, -5.0), 5_000);
    }

    #[test]
    fn radius_is_capped() {
        let policy = SearchRadiusPolicy::default().with_base(20_000);
        assert_eq!(policy.radius(EmergencyType::Medical, 30.0), 50_000);
    }

    #[test]
    fn haversine_known_distance() {
        // Paris to London, roughly 343.5 km.
        let paris = GeoPoint::new(2.3522, 48.8566);
        let london = GeoPoint::new(-0.1276, 51.5072);
        let d = haversine_distance(paris, london);
        assert!((d - 343_500.0).abs() < 1_500.0, "got {d}");
        assert!(haversine_distance(paris, paris).abs() < f64::EPSILON);
    }

    #[test]
    fn severity_decays_with_age_and_is_clamped() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let draft = EmergencyDraft {
            kind: "natural_disaster".into(),
            title: "Flood".into(),
            description: "River over the banks".into(),
            location: LocationInput::at(0.0, 0.0, "Riverside"),
            ..EmergencyDraft::default()
        }
        .validate("u1", &EmergencySettings::default())
        .unwrap();
        let emergency = Emergency::open("e1", "u1", draft, start);

        assert!((severity_score(&emergency, start) - 100.0).abs() < f64::EPSILON);

        let draft = EmergencyDraft {
            kind: "other".into(),
            title: "Lost pet".into(),
            description: "Dog ran away".into(),
            location: LocationInput::at(0.0, 0.0, "Park"),
            ..EmergencyDraft::default()
        }
        .validate("u1", &EmergencySettings::default())
        .unwrap();
        let emergency = Emergency::open("e2", "u1", draft, start);
        assert!((severity_score(&emergency, start) - 60.0).abs() < f64::EPSILON);
        let later = start + Duration::hours(4);
        assert!((severity_score(&emergency, later) - 56.0).abs() < 1e-9);
        let much_later = start + Duration::hours(48);
        assert!((severity_score(&emergency, much_later) - 50.0).abs() < f64::EPSILON);
    }

    fn any_type() -> impl Strategy<Value = EmergencyType> {
        prop::sample::select(EmergencyType::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn radius_never_exceeds_cap(kind in any_type(), base in 1u32..60_000, minutes in 0.0f64..10_000.0) {
            let policy = SearchRadiusPolicy::default().with_base(base);
            prop_assert!(policy.radius(kind, minutes) <= MAX_SEARCH_RADIUS_METERS);
        }

        #[test]
        fn radius_is_non_decreasing_in_time(kind in any_type(), a in 0.0f64..500.0, b in 0.0f64..500.0) {
            let (early, late) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(calculate_search_radius(kind, early) <= calculate_search_radius(kind, late));
        }

        #[test]
        fn haversine_is_symmetric_and_non_negative(
            lon1 in -180.0f64..=180.0, lat1 in -90.0f64..=90.0,
            lon2 in -180.0f64..=180.0, lat2 in -90.0f64..=90.0,
        ) {
            let a = GeoPoint::new(lon1, lat1);
            let b = GeoPoint::new(lon2, lat2);
            let ab = haversine_distance(a, b);
            prop_assert!(ab >= 0.0);
            prop_assert!((ab - haversine_distance(b, a)).abs() < 1e-6);
            prop_assert!(ab <= std::f64::consts::PI * EARTH_RADIUS_METERS + 1.0);
        }
    }
}
