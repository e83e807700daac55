use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::GtError;

/// Session-name prefix for rig-level and most town-level sessions.
pub const SESSION_PREFIX: &str = "gt-";
/// Alternate town-level prefix, accepted on read only.
pub const HQ_PREFIX: &str = "hq-";

/// Closed set of agent roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Mayor,
    Deacon,
    Boot,
    Witness,
    Refinery,
    Crew,
    Polecat,
    Dog,
    Narrator,
    Mediaforge,
}

/// What kind of lifetime a role's sessions have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeClass {
    TownSingleton,
    RigSingleton,
    PersistentWorker,
    EphemeralWorker,
    EphemeralTriage,
}

/// Who restarts a dead session of this role, if anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartedBy {
    Deacon,
    Boot,
    Nobody,
}

impl Role {
    pub const ALL: [Role; 10] = [
        Role::Mayor,
        Role::Deacon,
        Role::Boot,
        Role::Witness,
        Role::Refinery,
        Role::Crew,
        Role::Polecat,
        Role::Dog,
        Role::Narrator,
        Role::Mediaforge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Mayor => "mayor",
            Role::Deacon => "deacon",
            Role::Boot => "boot",
            Role::Witness => "witness",
            Role::Refinery => "refinery",
            Role::Crew => "crew",
            Role::Polecat => "polecat",
            Role::Dog => "dog",
            Role::Narrator => "narrator",
            Role::Mediaforge => "mediaforge",
        }
    }

    pub fn lifetime(&self) -> LifetimeClass {
        match self {
            Role::Mayor | Role::Deacon | Role::Narrator | Role::Mediaforge => {
                LifetimeClass::TownSingleton
            }
            Role::Witness | Role::Refinery => LifetimeClass::RigSingleton,
            Role::Crew => LifetimeClass::PersistentWorker,
            Role::Polecat => LifetimeClass::EphemeralWorker,
            // Dogs are reusable but live at most a day idle; treated as
            // persistent workers owned by the town rather than a rig.
            Role::Dog => LifetimeClass::PersistentWorker,
            Role::Boot => LifetimeClass::EphemeralTriage,
        }
    }

    pub fn restarted_by(&self) -> RestartedBy {
        match self {
            Role::Mayor | Role::Witness | Role::Refinery | Role::Dog => RestartedBy::Deacon,
            Role::Deacon => RestartedBy::Boot,
            _ => RestartedBy::Nobody,
        }
    }

    /// Town-level roles have no rig component in their session names.
    pub fn is_town_level(&self) -> bool {
        matches!(
            self,
            Role::Mayor
                | Role::Deacon
                | Role::Boot
                | Role::Dog
                | Role::Narrator
                | Role::Mediaforge
        )
    }

    pub fn is_rig_singleton(&self) -> bool {
        matches!(self, Role::Witness | Role::Refinery)
    }

    /// Whether instances of this role carry an individual worker name.
    pub fn needs_worker_name(&self) -> bool {
        matches!(self, Role::Crew | Role::Polecat | Role::Dog)
    }

    /// Roles whose agent records the ledger tracks across their lifetime.
    pub fn is_tracked(&self) -> bool {
        !matches!(self, Role::Boot)
    }

    /// Roles that run unattended and get CI-normalized environments.
    pub fn is_autonomous(&self) -> bool {
        !matches!(self, Role::Crew)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = GtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mayor" => Ok(Role::Mayor),
            "deacon" => Ok(Role::Deacon),
            "boot" => Ok(Role::Boot),
            "witness" => Ok(Role::Witness),
            "refinery" => Ok(Role::Refinery),
            "crew" => Ok(Role::Crew),
            "polecat" => Ok(Role::Polecat),
            "dog" => Ok(Role::Dog),
            "narrator" => Ok(Role::Narrator),
            "mediaforge" => Ok(Role::Mediaforge),
            other => Err(GtError::ValidationFailed {
                message: format!("unknown role '{other}'"),
                suggestion: "mayor|deacon|boot|witness|refinery|crew|polecat|dog".into(),
            }),
        }
    }
}

/// Address of a single agent: role, plus rig and worker name where the role
/// calls for them. The slash-rendered address is the canonical encoding and
/// round-trips exactly; session names do not (see `parse_session_name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId {
    pub role: Role,
    pub rig: Option<String>,
    pub worker: Option<String>,
}

impl AgentId {
    pub fn town(role: Role) -> Self {
        AgentId {
            role,
            rig: None,
            worker: None,
        }
    }

    pub fn rig_singleton(role: Role, rig: impl Into<String>) -> Self {
        AgentId {
            role,
            rig: Some(rig.into()),
            worker: None,
        }
    }

    pub fn worker(role: Role, rig: impl Into<String>, name: impl Into<String>) -> Self {
        AgentId {
            role,
            rig: Some(rig.into()),
            worker: Some(name.into()),
        }
    }

    pub fn dog(name: impl Into<String>) -> Self {
        AgentId {
            role: Role::Dog,
            rig: None,
            worker: Some(name.into()),
        }
    }

    /// Render the canonical address: `role`, `rig/role`, or `rig/role/worker`.
    /// Dogs render as `dog/<name>` (town-level, named).
    pub fn render(&self) -> String {
        match (&self.rig, &self.worker) {
            (None, None) => self.role.to_string(),
            (None, Some(w)) => format!("{}/{w}", self.role),
            (Some(r), None) => format!("{r}/{}", self.role),
            (Some(r), Some(w)) => format!("{r}/{}/{w}", self.role),
        }
    }

    /// Parse a canonical address back into an `AgentId`.
    pub fn parse(addr: &str) -> Result<Self, GtError> {
        let parts: Vec<&str> = addr.split('/').collect();
        match parts.as_slice() {
            [role] => Ok(AgentId::town(role.parse()?)),
            [a, b] => {
                // `rig/role` wins; otherwise `dog/<name>` (town-level, named).
                if let Ok(role) = b.parse::<Role>() {
                    return Ok(AgentId::rig_singleton(role, *a));
                }
                if let Ok(role) = a.parse::<Role>() {
                    if role.is_town_level() && role.needs_worker_name() {
                        return Ok(AgentId {
                            role,
                            rig: None,
                            worker: Some((*b).to_string()),
                        });
                    }
                }
                Err(GtError::ValidationFailed {
                    message: format!("malformed agent address '{addr}'"),
                    suggestion: "role | rig/role | rig/role/worker".into(),
                })
            }
            [rig, role, worker] => Ok(AgentId::worker(role.parse()?, *rig, *worker)),
            _ => Err(GtError::ValidationFailed {
                message: format!("malformed agent address '{addr}'"),
                suggestion: "role | rig/role | rig/role/worker".into(),
            }),
        }
    }

    /// Multiplexer session name for this agent.
    pub fn session_name(&self) -> String {
        match (&self.rig, &self.worker) {
            (None, None) => format!("{SESSION_PREFIX}{}", self.role),
            (None, Some(w)) => format!("{SESSION_PREFIX}{}-{w}", self.role),
            (Some(r), None) => format!("{SESSION_PREFIX}{r}-{}", self.role),
            (Some(r), Some(w)) => format!("{SESSION_PREFIX}{r}-{}-{w}", self.role),
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Parse a multiplexer session name into an `AgentId`.
///
/// Accepts `gt-` and (for town singletons) `hq-` prefixes. Hyphenated rig
/// names make this lossy: when the token after the rig is not a role name,
/// the remainder is read as a legacy polecat (`gt-<rig>-<worker>`), so
/// `gt-foo-bar-witness` parses as polecat `bar-witness` on rig `foo`. The
/// slash address form is the canonical, unambiguous encoding.
pub fn parse_session_name(name: &str) -> Option<AgentId> {
    let rest = name
        .strip_prefix(SESSION_PREFIX)
        .or_else(|| name.strip_prefix(HQ_PREFIX))?;
    let parts: Vec<&str> = rest.split('-').collect();
    if parts.is_empty() || parts[0].is_empty() {
        return None;
    }

    if parts.len() == 1 {
        let role: Role = parts[0].parse().ok()?;
        return Some(AgentId::town(role));
    }

    // Town-level named workers: gt-dog-<name>.
    if let Ok(role) = parts[0].parse::<Role>() {
        if role.is_town_level() && role.needs_worker_name() {
            return Some(AgentId {
                role,
                rig: None,
                worker: Some(parts[1..].join("-")),
            });
        }
    }

    let rig = parts[0].to_string();
    if let Ok(role) = parts[1].parse::<Role>() {
        if parts.len() == 2 {
            return Some(AgentId::rig_singleton(role, rig));
        }
        return Some(AgentId::worker(role, rig, parts[2..].join("-")));
    }

    // Legacy polecat form: gt-<rig>-<worker>.
    Some(AgentId::worker(Role::Polecat, rig, parts[1..].join("-")))
}

/// Validate a rig name: `[a-z][a-z0-9_-]*`.
pub fn validate_rig_name(name: &str) -> Result<(), GtError> {
    let ok = name
        .chars()
        .next()
        .map(|c| c.is_ascii_lowercase())
        .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(GtError::ValidationFailed {
            message: format!("invalid rig name '{name}'"),
            suggestion: sanitize_name(name),
        })
    }
}

/// Validate a worker name: same alphabet as rig names.
pub fn validate_worker_name(name: &str) -> Result<(), GtError> {
    validate_rig_name(name).map_err(|_| GtError::ValidationFailed {
        message: format!("invalid worker name '{name}'"),
        suggestion: sanitize_name(name),
    })
}

/// Best-effort sanitized alternative for an invalid name.
pub fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    while out.starts_with(|c: char| !c.is_ascii_lowercase()) && !out.is_empty() {
        out.remove(0);
    }
    if out.is_empty() {
        out = "rig".into();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip() {
        let cases = [
            AgentId::town(Role::Mayor),
            AgentId::town(Role::Deacon),
            AgentId::rig_singleton(Role::Witness, "demo"),
            AgentId::rig_singleton(Role::Refinery, "demo"),
            AgentId::worker(Role::Polecat, "demo", "nux"),
            AgentId::worker(Role::Crew, "demo", "max"),
            AgentId::dog("rex"),
        ];
        for id in cases {
            let rendered = id.render();
            let parsed = AgentId::parse(&rendered).unwrap();
            assert_eq!(parsed, id, "round-trip failed for {rendered}");
        }
    }

    #[test]
    fn render_forms() {
        assert_eq!(AgentId::town(Role::Mayor).render(), "mayor");
        assert_eq!(
            AgentId::rig_singleton(Role::Witness, "demo").render(),
            "demo/witness"
        );
        assert_eq!(
            AgentId::worker(Role::Polecat, "demo", "nux").render(),
            "demo/polecat/nux"
        );
        assert_eq!(AgentId::dog("rex").render(), "dog/rex");
    }

    #[test]
    fn session_names() {
        assert_eq!(AgentId::town(Role::Mayor).session_name(), "gt-mayor");
        assert_eq!(
            AgentId::rig_singleton(Role::Refinery, "demo").session_name(),
            "gt-demo-refinery"
        );
        assert_eq!(
            AgentId::worker(Role::Polecat, "demo", "nux").session_name(),
            "gt-demo-polecat-nux"
        );
        assert_eq!(AgentId::dog("rex").session_name(), "gt-dog-rex");
    }

    #[test]
    fn parse_session_name_forms() {
        assert_eq!(
            parse_session_name("gt-mayor"),
            Some(AgentId::town(Role::Mayor))
        );
        assert_eq!(
            parse_session_name("hq-deacon"),
            Some(AgentId::town(Role::Deacon))
        );
        assert_eq!(
            parse_session_name("gt-demo-witness"),
            Some(AgentId::rig_singleton(Role::Witness, "demo"))
        );
        assert_eq!(
            parse_session_name("gt-demo-polecat-nux"),
            Some(AgentId::worker(Role::Polecat, "demo", "nux"))
        );
        assert_eq!(parse_session_name("gt-dog-rex"), Some(AgentId::dog("rex")));
        assert_eq!(parse_session_name("other-thing"), None);
    }

    #[test]
    fn legacy_polecat_form() {
        assert_eq!(
            parse_session_name("gt-demo-nux"),
            Some(AgentId::worker(Role::Polecat, "demo", "nux"))
        );
    }

    #[test]
    fn hyphenated_rig_is_lossy_legacy_polecat() {
        // Fixed behavior: `bar` is not a role, so the remainder is a
        // legacy polecat worker name on rig `foo`.
        assert_eq!(
            parse_session_name("gt-foo-bar-witness"),
            Some(AgentId::worker(Role::Polecat, "foo", "bar-witness"))
        );
    }

    #[test]
    fn role_tables() {
        assert_eq!(Role::Mayor.lifetime(), LifetimeClass::TownSingleton);
        assert_eq!(Role::Witness.lifetime(), LifetimeClass::RigSingleton);
        assert_eq!(Role::Polecat.lifetime(), LifetimeClass::EphemeralWorker);
        assert_eq!(Role::Boot.lifetime(), LifetimeClass::EphemeralTriage);
        assert_eq!(Role::Deacon.restarted_by(), RestartedBy::Boot);
        assert_eq!(Role::Witness.restarted_by(), RestartedBy::Deacon);
        assert_eq!(Role::Crew.restarted_by(), RestartedBy::Nobody);
        assert!(!Role::Boot.is_tracked());
        assert!(!Role::Crew.is_autonomous());
    }

    #[test]
    fn name_validation() {
        assert!(validate_rig_name("demo").is_ok());
        assert!(validate_rig_name("demo-2_x").is_ok());
        assert!(validate_rig_name("Demo").is_err());
        assert!(validate_rig_name("9demo").is_err());
        match validate_rig_name("My Rig!") {
            Err(GtError::ValidationFailed { suggestion, .. }) => {
                assert_eq!(suggestion, "my-rig-");
            }
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }
}
