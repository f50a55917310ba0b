//! Access gate.
//!
//! Requester identity arrives from the boundary (the daemon reads it from
//! request headers) and is trusted as given; authentication happens
//! upstream.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::emergency::{Actor, ActorKind, Emergency, ParseEnumError};

/// Platform role of a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// A regular user (reporter or guardian).
    #[default]
    User,
    /// A registered helper.
    Helper,
    /// An operator.
    Admin,
}

impl Role {
    /// Returns the wire identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Helper => "helper",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "helper" => Ok(Self::Helper),
            "admin" => Ok(Self::Admin),
            other => Err(ParseEnumError {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requester {
    /// Requester id.
    pub id: String,
    /// Requester role.
    pub role: Role,
}

impl Requester {
    /// Creates a requester.
    #[must_use]
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// A user requester.
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self::new(id, Role::User)
    }

    /// A helper requester.
    #[must_use]
    pub fn helper(id: impl Into<String>) -> Self {
        Self::new(id, Role::Helper)
    }

    /// An admin requester.
    #[must_use]
    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::Admin)
    }

    /// Returns `true` for admins.
    #[must_use]
    pub const fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }

    /// Log and resolution attribution for this requester.
    ///
    /// Admins act on behalf of the platform and are attributed as `system`
    /// under their own id.
    #[must_use]
    pub fn actor(&self) -> Actor {
        let kind = match self.role {
            Role::User => ActorKind::User,
            Role::Helper => ActorKind::Helper,
            Role::Admin => ActorKind::System,
        };
        Actor {
            id: self.id.clone(),
            kind,
        }
    }
}

/// Returns `true` if `requester` may read or mutate `emergency`.
///
/// Admins always pass; otherwise the requester must be the owner or hold an
/// assignment (in any status).
#[must_use]
pub fn can_access(emergency: &Emergency, requester: &Requester) -> bool {
    requester.is_admin()
        || emergency.owner_id() == requester.id
        || emergency.is_assigned(&requester.id)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::emergency::{EmergencyDraft, EmergencySettings, LocationInput};

    fn emergency() -> Emergency {
        let draft = EmergencyDraft {
            kind: "medical".into(),
            title: "Chest pain".into(),
            description: "Sudden chest pain".into(),
            location: LocationInput::at(10.0, 10.0, "Clinic Rd"),
            ..EmergencyDraft::default()
        }
        .validate("owner", &EmergencySettings::default())
        .unwrap();
        let mut e = Emergency::open("e1", "owner", draft, Utc::now());
        e.assign_helper("assigned", Utc::now()).unwrap();
        e
    }

    #[test]
    fn access_truth_table() {
        let e = emergency();
        let cases = [
            (Requester::admin("anyone"), true),
            (Requester::user("owner"), true),
            (Requester::helper("owner"), true),
            (Requester::helper("assigned"), true),
            (Requester::user("assigned"), true),
            (Requester::helper("stranger"), false),
            (Requester::user("stranger"), false),
        ];
        for (requester, expected) in cases {
            assert_eq!(can_access(&e, &requester), expected, "{requester:?}");
        }
    }

    #[test]
    fn roles_map_onto_actor_kinds() {
        assert_eq!(Requester::user("u").actor().kind, ActorKind::User);
        assert_eq!(Requester::helper("h").actor().kind, ActorKind::Helper);
        let admin = Requester::admin("ops-1").actor();
        assert_eq!(admin.kind, ActorKind::System);
        assert_eq!(admin.id, "ops-1");
    }

    #[test]
    fn role_parses_wire_names() {
        assert_eq!("helper".parse::<Role>().unwrap(), Role::Helper);
        assert!("root".parse::<Role>().is_err());
    }
}
