//! Unvalidated creation input and its validation.
//!
//! Drafts hold the raw wire values (strings for enumerations, a plain
//! coordinate vector) so that validation can report every offending field at
//! once instead of failing on the first deserialization error.

use serde::{Deserialize, Serialize};

use super::error::{EmergencyError, FieldViolation};
use super::record::{
    EmergencySettings, GeoPoint, Location, MAX_DESCRIPTION_LEN, MAX_TITLE_LEN, MedicalSnapshot,
};
use super::state::{EmergencyType, LocationProvider, Priority};
use crate::dispatch::{MAX_SEARCH_RADIUS_METERS, PriorityContext};

/// Upper bound on `settings.maxHelpers`.
pub const MAX_HELPERS_LIMIT: u32 = 20;

/// Default SOS title.
pub const SOS_TITLE: &str = "SOS Emergency Alert";

/// Default SOS description.
pub const SOS_DESCRIPTION: &str = "Emergency SOS triggered";

/// Raw location input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationInput {
    /// `[longitude, latitude]`.
    pub coordinates: Vec<f64>,
    pub address: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
    pub landmark: Option<String>,
    /// Fix accuracy in meters.
    pub accuracy: Option<f64>,
    /// `gps`, `network` or `manual`; defaults to `gps`.
    pub provider: Option<String>,
}

impl LocationInput {
    /// Convenience constructor used by tests and the SOS path.
    #[must_use]
    pub fn at(longitude: f64, latitude: f64, address: impl Into<String>) -> Self {
        Self {
            coordinates: vec![longitude, latitude],
            address: address.into(),
            ..Self::default()
        }
    }

    fn validate(self, violations: &mut Vec<FieldViolation>) -> Option<Location> {
        let point = match self.coordinates.as_slice() {
            &[longitude, latitude] => {
                let mut ok = true;
                if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
                    violations.push(FieldViolation::new(
                        "location.coordinates",
                        "longitude must be between -180 and 180",
                    ));
                    ok = false;
                }
                if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
                    violations.push(FieldViolation::new(
                        "location.coordinates",
                        "latitude must be between -90 and 90",
                    ));
                    ok = false;
                }
                ok.then(|| GeoPoint::new(longitude, latitude))
            },
            _ => {
                violations.push(FieldViolation::new(
                    "location.coordinates",
                    "must be a [longitude, latitude] pair",
                ));
                None
            },
        };

        if self.address.trim().is_empty() {
            violations.push(FieldViolation::new(
                "location.address",
                "must not be empty",
            ));
        }

        let provider = match self.provider.as_deref() {
            None => Some(LocationProvider::default()),
            Some(raw) => match raw.parse::<LocationProvider>() {
                Ok(provider) => Some(provider),
                Err(e) => {
                    violations.push(FieldViolation::new("location.provider", e.to_string()));
                    None
                },
            },
        };

        if self
            .accuracy
            .is_some_and(|a| !a.is_finite() || a < 0.0)
        {
            violations.push(FieldViolation::new(
                "location.accuracy",
                "must be a non-negative number",
            ));
        }

        Some(Location {
            coordinates: point?,
            address: self.address,
            city: self.city,
            state: self.state,
            country: self.country,
            postal_code: self.postal_code,
            landmark: self.landmark,
            accuracy_meters: self.accuracy,
            provider: provider?,
        })
    }
}

/// Partial settings override. Unset fields take the configured defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsInput {
    pub auto_assign_helpers: Option<bool>,
    pub max_helpers: Option<u32>,
    pub search_radius_meters: Option<u32>,
    pub timeout_minutes: Option<u32>,
    pub notify_guardians: Option<bool>,
}

impl SettingsInput {
    fn apply(
        self,
        defaults: &EmergencySettings,
        violations: &mut Vec<FieldViolation>,
    ) -> EmergencySettings {
        let settings = EmergencySettings {
            auto_assign_helpers: self
                .auto_assign_helpers
                .unwrap_or(defaults.auto_assign_helpers),
            max_helpers: self.max_helpers.unwrap_or(defaults.max_helpers),
            search_radius_meters: self
                .search_radius_meters
                .unwrap_or(defaults.search_radius_meters),
            timeout_minutes: self.timeout_minutes.unwrap_or(defaults.timeout_minutes),
            notify_guardians: self.notify_guardians.unwrap_or(defaults.notify_guardians),
        };
        if settings.max_helpers == 0 || settings.max_helpers > MAX_HELPERS_LIMIT {
            violations.push(FieldViolation::new(
                "settings.maxHelpers",
                format!("must be between 1 and {MAX_HELPERS_LIMIT}"),
            ));
        }
        if settings.search_radius_meters == 0
            || settings.search_radius_meters > MAX_SEARCH_RADIUS_METERS
        {
            violations.push(FieldViolation::new(
                "settings.searchRadiusMeters",
                format!("must be between 1 and {MAX_SEARCH_RADIUS_METERS}"),
            ));
        }
        if settings.timeout_minutes == 0 {
            violations.push(FieldViolation::new(
                "settings.timeoutMinutes",
                "must be positive",
            ));
        }
        settings
    }
}

/// Input of `createEmergency`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmergencyDraft {
    /// Emergency type wire name.
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub description: String,
    pub location: LocationInput,
    /// Explicit priority; derived from the type when absent.
    pub priority: Option<String>,
    pub medical_info: Option<MedicalSnapshot>,
    pub settings: SettingsInput,
    /// Escalation flags for priority derivation.
    pub context: PriorityContext,
}

/// A draft that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidDraft {
    pub kind: EmergencyType,
    pub title: String,
    pub description: String,
    pub location: Location,
    pub priority: Option<Priority>,
    pub medical_info: Option<MedicalSnapshot>,
    pub settings: EmergencySettings,
    pub context: PriorityContext,
}

fn check_text(
    field: &'static str,
    value: &str,
    max: usize,
    violations: &mut Vec<FieldViolation>,
) {
    if value.trim().is_empty() {
        violations.push(FieldViolation::new(field, "must not be empty"));
    } else if value.chars().count() > max {
        violations.push(FieldViolation::new(
            field,
            format!("must be at most {max} characters"),
        ));
    }
}

impl EmergencyDraft {
    /// Validates the draft for `owner_id`, applying `defaults` to unset
    /// settings.
    ///
    /// # Errors
    ///
    /// Returns `EmergencyError::Validation` listing every violated field.
    pub fn validate(
        self,
        owner_id: &str,
        defaults: &EmergencySettings,
    ) -> Result<ValidDraft, EmergencyError> {
        let mut violations = Vec::new();

        if owner_id.trim().is_empty() {
            violations.push(FieldViolation::new("ownerId", "must not be empty"));
        }

        let kind = match self.kind.parse::<EmergencyType>() {
            Ok(kind) => Some(kind),
            Err(e) => {
                violations.push(FieldViolation::new("type", e.to_string()));
                None
            },
        };

        check_text("title", &self.title, MAX_TITLE_LEN, &mut violations);
        check_text(
            "description",
            &self.description,
            MAX_DESCRIPTION_LEN,
            &mut violations,
        );

        let location = self.location.validate(&mut violations);

        let priority = match self.priority.as_deref().map(str::parse::<Priority>) {
            None => None,
            Some(Ok(priority)) => Some(priority),
            Some(Err(e)) => {
                violations.push(FieldViolation::new("priority", e.to_string()));
                None
            },
        };

        let settings = self.settings.apply(defaults, &mut violations);

        match (kind, location) {
            (Some(kind), Some(location)) if violations.is_empty() => Ok(ValidDraft {
                kind,
                title: self.title,
                description: self.description,
                location,
                priority,
                medical_info: self.medical_info,
                settings,
                context: self.context,
            }),
            _ => Err(EmergencyError::validation(violations)),
        }
    }
}

/// Input of `triggerSOS`: only the location is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SosDraft {
    pub location: LocationInput,
    pub title: Option<String>,
    pub description: Option<String>,
    pub medical_info: Option<MedicalSnapshot>,
    pub settings: SettingsInput,
}

impl SosDraft {
    /// Expands into a `medical`, `critical` creation draft. A blank title or
    /// description falls back to the stock SOS text.
    #[must_use]
    pub fn into_draft(self) -> EmergencyDraft {
        EmergencyDraft {
            kind: EmergencyType::Medical.as_str().to_string(),
            title: non_blank(self.title).unwrap_or_else(|| SOS_TITLE.to_string()),
            description: non_blank(self.description)
                .unwrap_or_else(|| SOS_DESCRIPTION.to_string()),
            location: self.location,
            priority: Some(Priority::Critical.as_str().to_string()),
            medical_info: self.medical_info,
            settings: self.settings,
            context: PriorityContext::default(),
        }
    }
}

fn non_blank(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> EmergencyDraft {
        EmergencyDraft {
            kind: "fire".into(),
            title: "Kitchen fire".into(),
            description: "Smoke coming from the second floor".into(),
            location: LocationInput::at(-73.98, 40.75, "5th Ave"),
            ..EmergencyDraft::default()
        }
    }

    fn fields(err: &EmergencyError) -> Vec<&str> {
        err.violations().iter().map(|v| v.field.as_str()).collect()
    }

    #[test]
    fn valid_draft_applies_defaults() {
        let valid = draft()
            .validate("u1", &EmergencySettings::default())
            .unwrap();
        assert_eq!(valid.kind, EmergencyType::Fire);
        assert_eq!(valid.priority, None);
        assert_eq!(valid.settings, EmergencySettings::default());
        assert_eq!(valid.location.coordinates, GeoPoint::new(-73.98, 40.75));
        assert_eq!(valid.location.provider, LocationProvider::Gps);
    }

    #[test]
    fn every_violation_is_reported() {
        let bad = EmergencyDraft {
            kind: "earthquake".into(),
            title: "   ".into(),
            description: "x".repeat(MAX_DESCRIPTION_LEN + 1),
            location: LocationInput::at(200.0, -95.0, ""),
            priority: Some("urgent".into()),
            ..EmergencyDraft::default()
        };
        let err = bad.validate("", &EmergencySettings::default()).unwrap_err();
        let fields = fields(&err);
        for expected in [
            "ownerId",
            "type",
            "title",
            "description",
            "location.coordinates",
            "location.address",
            "priority",
        ] {
            assert!(fields.contains(&expected), "missing {expected}: {fields:?}");
        }
        // Both coordinate components are out of range.
        assert_eq!(
            fields
                .iter()
                .filter(|f| **f == "location.coordinates")
                .count(),
            2
        );
    }

    #[test]
    fn coordinates_must_be_a_finite_pair() {
        let mut bad = draft();
        bad.location.coordinates = vec![1.0];
        let err = bad.validate("u1", &EmergencySettings::default()).unwrap_err();
        assert_eq!(fields(&err), vec!["location.coordinates"]);

        let mut bad = draft();
        bad.location.coordinates = vec![f64::NAN, 10.0];
        assert!(bad.validate("u1", &EmergencySettings::default()).is_err());
    }

    #[test]
    fn title_boundary_is_inclusive() {
        let mut ok = draft();
        ok.title = "t".repeat(MAX_TITLE_LEN);
        assert!(ok.validate("u1", &EmergencySettings::default()).is_ok());

        let mut bad = draft();
        bad.title = "t".repeat(MAX_TITLE_LEN + 1);
        assert!(bad.validate("u1", &EmergencySettings::default()).is_err());
    }

    #[test]
    fn settings_overrides_are_bounded() {
        let mut bad = draft();
        bad.settings.max_helpers = Some(0);
        bad.settings.timeout_minutes = Some(0);
        let err = bad.validate("u1", &EmergencySettings::default()).unwrap_err();
        assert_eq!(
            fields(&err),
            vec!["settings.maxHelpers", "settings.timeoutMinutes"]
        );

        let mut ok = draft();
        ok.settings.max_helpers = Some(5);
        ok.settings.auto_assign_helpers = Some(false);
        let valid = ok.validate("u1", &EmergencySettings::default()).unwrap();
        assert_eq!(valid.settings.max_helpers, 5);
        assert!(!valid.settings.auto_assign_helpers);
        assert_eq!(valid.settings.timeout_minutes, 30);
    }

    #[test]
    fn sos_draft_is_medical_and_critical() {
        let sos = SosDraft {
            location: LocationInput::at(0.0, 0.0, "Main St"),
            ..SosDraft::default()
        };
        let valid = sos
            .into_draft()
            .validate("u1", &EmergencySettings::default())
            .unwrap();
        assert_eq!(valid.kind, EmergencyType::Medical);
        assert_eq!(valid.priority, Some(Priority::Critical));
        assert_eq!(valid.title, SOS_TITLE);
        assert_eq!(valid.description, SOS_DESCRIPTION);
    }

    #[test]
    fn sos_draft_blank_text_uses_stock_wording() {
        let sos: SosDraft = serde_json::from_str(
            r#"{"location": {"coordinates": [0.0, 0.0], "address": "Main St"},
                "title": "", "description": "   "}"#,
        )
        .unwrap();
        let valid = sos
            .into_draft()
            .validate("u1", &EmergencySettings::default())
            .unwrap();
        assert_eq!(valid.title, SOS_TITLE);
        assert_eq!(valid.description, SOS_DESCRIPTION);

        let custom = SosDraft {
            location: LocationInput::at(0.0, 0.0, "Main St"),
            title: Some("Chest pain".into()),
            ..SosDraft::default()
        };
        assert_eq!(custom.into_draft().title, "Chest pain");
    }

    #[test]
    fn draft_deserializes_from_camel_case_json() {
        let json = r#"{
            "type": "medical",
            "title": "Fall",
            "description": "Elderly person fell",
            "location": {"coordinates": [2.35, 48.85], "address": "Rue X", "postalCode": "75001"},
            "settings": {"maxHelpers": 2},
            "context": {"timeSensitive": true}
        }"#;
        let draft: EmergencyDraft = serde_json::from_str(json).unwrap();
        assert_eq!(draft.kind, "medical");
        assert_eq!(draft.location.postal_code.as_deref(), Some("75001"));
        assert_eq!(draft.settings.max_helpers, Some(2));
        assert!(draft.context.time_sensitive);
    }
}
