use std::path::{Component, Path, PathBuf};

use crate::errors::GtError;
use crate::identity::Role;

/// Primary workspace marker, relative to the town root.
pub const TOWN_MARKER: &str = "mayor/town.json";
/// Legacy marker, accepted on read.
pub const LEGACY_MARKER: &str = "mayor/rigs.json";

/// A directory is a Town root iff one of the markers exists. A bare
/// `mayor/` directory is not sufficient.
pub fn is_workspace_root(dir: &Path) -> bool {
    dir.join(TOWN_MARKER).exists() || dir.join(LEGACY_MARKER).exists()
}

/// Walk upward from `start` to find the Town root.
///
/// Normally the innermost root wins; when `start` sits inside a `polecats/`
/// or `crew/` subpath we keep walking and take the outermost root, so a
/// worker operating on a checkout that itself contains a Town resolves to
/// the Town that owns the worker.
pub fn find_town_root(start: &Path) -> Result<PathBuf, GtError> {
    let mut roots = Vec::new();
    let mut current = start.to_path_buf();
    loop {
        if is_workspace_root(&current) {
            roots.push(current.clone());
        }
        if !current.pop() {
            break;
        }
    }

    let inside_worker_dir = start.components().any(|c| {
        matches!(c, Component::Normal(n) if n == "polecats" || n == "crew")
    });

    let picked = if inside_worker_dir {
        roots.last()
    } else {
        roots.first()
    };
    picked
        .cloned()
        .ok_or_else(|| GtError::NotInWorkspace(start.to_path_buf()))
}

/// The on-disk Town: path arithmetic only, no I/O beyond marker checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Town {
    root: PathBuf,
}

impl Town {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Town { root: root.into() }
    }

    pub fn find(start: &Path) -> Result<Self, GtError> {
        Ok(Town {
            root: find_town_root(start)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mayor_dir(&self) -> PathBuf {
        self.root.join("mayor")
    }

    pub fn town_json(&self) -> PathBuf {
        self.root.join(TOWN_MARKER)
    }

    pub fn rigs_json(&self) -> PathBuf {
        self.root.join(LEGACY_MARKER)
    }

    pub fn agents_json(&self) -> PathBuf {
        self.mayor_dir().join("settings").join("agents.json")
    }

    /// Deacon state directory (heartbeat file, patrol scratch).
    pub fn deacon_dir(&self) -> PathBuf {
        self.root.join("deacon")
    }

    pub fn deacon_heartbeat(&self) -> PathBuf {
        self.deacon_dir().join("heartbeat.json")
    }

    /// Boot start record, written by the Heartbeat Supervisor at spawn.
    pub fn boot_record(&self) -> PathBuf {
        self.deacon_dir().join("boot-started.json")
    }

    /// Dog workspace directory (town-level, per-name).
    pub fn dog_dir(&self, name: &str) -> PathBuf {
        self.root.join("dogs").join(name)
    }

    pub fn rig(&self, name: &str) -> RigPaths {
        RigPaths {
            name: name.to_string(),
            root: self.root.join(name),
        }
    }
}

/// Paths inside one rig's workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RigPaths {
    name: String,
    root: PathBuf,
}

impl RigPaths {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// External ledger data; opaque to us.
    pub fn beads_dir(&self) -> PathBuf {
        self.root.join(".beads")
    }

    pub fn settings_json(&self) -> PathBuf {
        self.root.join("settings").join("config.json")
    }

    /// Read-only canonical clone for the mayor.
    pub fn mayor_clone(&self) -> PathBuf {
        self.root.join("mayor").join("rig")
    }

    /// Clone used by the refinery session.
    pub fn refinery_clone(&self) -> PathBuf {
        self.root.join("refinery").join("rig")
    }

    /// State dir for the witness session.
    pub fn witness_dir(&self) -> PathBuf {
        self.root.join("witness")
    }

    pub fn crew_dir(&self, name: &str) -> PathBuf {
        self.root.join("crew").join(name)
    }

    pub fn polecats_dir(&self) -> PathBuf {
        self.root.join("polecats")
    }

    pub fn polecat_dir(&self, name: &str) -> PathBuf {
        self.polecats_dir().join(name)
    }

    /// Rig-local activity feed (JSONL).
    pub fn feed_path(&self) -> PathBuf {
        self.root.join(".gt").join("feed.jsonl")
    }
}

/// Role resolved from the current working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CwdRole {
    Town(Role),
    RigSingleton { role: Role, rig: String },
    Worker {
        role: Role,
        rig: Option<String>,
        worker: String,
    },
    Unknown { rig: Option<String> },
}

/// Deterministic mapping from a directory to the role that owns it.
/// Nested paths inherit the role of their ancestor worker directory.
pub fn role_from_cwd(town_root: &Path, cwd: &Path) -> CwdRole {
    let rel = match cwd.strip_prefix(town_root) {
        Ok(r) => r,
        Err(_) => return CwdRole::Unknown { rig: None },
    };
    let comps: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(n) => Some(n.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    match comps.first().map(String::as_str) {
        None => CwdRole::Unknown { rig: None },
        Some("mayor") => CwdRole::Town(Role::Mayor),
        Some("deacon") => CwdRole::Town(Role::Deacon),
        Some("dogs") => match comps.get(1) {
            Some(name) => CwdRole::Worker {
                role: Role::Dog,
                rig: None,
                worker: name.clone(),
            },
            None => CwdRole::Unknown { rig: None },
        },
        Some(rig) => {
            let rig = rig.to_string();
            match (comps.get(1).map(String::as_str), comps.get(2)) {
                (Some("refinery"), Some(sub)) if sub == "rig" => CwdRole::RigSingleton {
                    role: Role::Refinery,
                    rig,
                },
                (Some("mayor"), Some(sub)) if sub == "rig" => CwdRole::Town(Role::Mayor),
                (Some("witness"), _) => CwdRole::RigSingleton {
                    role: Role::Witness,
                    rig,
                },
                (Some("crew"), Some(name)) => CwdRole::Worker {
                    role: Role::Crew,
                    rig: Some(rig),
                    worker: name.clone(),
                },
                (Some("polecats"), Some(name)) => CwdRole::Worker {
                    role: Role::Polecat,
                    rig: Some(rig),
                    worker: name.clone(),
                },
                _ => CwdRole::Unknown { rig: Some(rig) },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn make_town(root: &Path) {
        fs::create_dir_all(root.join("mayor")).unwrap();
        fs::write(root.join(TOWN_MARKER), "{\"name\":\"test\"}").unwrap();
    }

    #[test]
    fn marker_detection() {
        let dir = tempdir().unwrap();
        assert!(!is_workspace_root(dir.path()));
        // A bare mayor/ directory is not a workspace.
        fs::create_dir_all(dir.path().join("mayor")).unwrap();
        assert!(!is_workspace_root(dir.path()));
        fs::write(dir.path().join(TOWN_MARKER), "{}").unwrap();
        assert!(is_workspace_root(dir.path()));
    }

    #[test]
    fn legacy_marker_detection() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("mayor")).unwrap();
        fs::write(dir.path().join(LEGACY_MARKER), "{}").unwrap();
        assert!(is_workspace_root(dir.path()));
    }

    #[test]
    fn find_walks_up() {
        let dir = tempdir().unwrap();
        make_town(dir.path());
        let nested = dir.path().join("demo").join("witness").join("deep");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_town_root(&nested).unwrap(), dir.path());
    }

    #[test]
    fn find_errors_outside_workspace() {
        let dir = tempdir().unwrap();
        match find_town_root(dir.path()) {
            Err(GtError::NotInWorkspace(p)) => assert_eq!(p, dir.path()),
            other => panic!("expected NotInWorkspace, got {other:?}"),
        }
    }

    #[test]
    fn nested_town_inside_polecat_resolves_outermost() {
        let outer = tempdir().unwrap();
        make_town(outer.path());
        let inner = outer
            .path()
            .join("demo")
            .join("polecats")
            .join("nux")
            .join("checkout");
        fs::create_dir_all(&inner).unwrap();
        make_town(&inner);
        let from = inner.join("src");
        fs::create_dir_all(&from).unwrap();
        assert_eq!(find_town_root(&from).unwrap(), outer.path());
    }

    #[test]
    fn nested_town_outside_worker_dirs_resolves_innermost() {
        let outer = tempdir().unwrap();
        make_town(outer.path());
        let inner = outer.path().join("scratch").join("inner");
        fs::create_dir_all(&inner).unwrap();
        make_town(&inner);
        assert_eq!(find_town_root(&inner).unwrap(), inner);
    }

    #[test]
    fn role_mapping_table() {
        let root = Path::new("/town");
        let cases: Vec<(&str, CwdRole)> = vec![
            ("mayor", CwdRole::Town(Role::Mayor)),
            ("mayor/settings", CwdRole::Town(Role::Mayor)),
            (
                "demo/refinery/rig/src",
                CwdRole::RigSingleton {
                    role: Role::Refinery,
                    rig: "demo".into(),
                },
            ),
            (
                "demo/witness",
                CwdRole::RigSingleton {
                    role: Role::Witness,
                    rig: "demo".into(),
                },
            ),
            (
                "demo/crew/max/src/lib",
                CwdRole::Worker {
                    role: Role::Crew,
                    rig: Some("demo".into()),
                    worker: "max".into(),
                },
            ),
            (
                "demo/polecats/nux",
                CwdRole::Worker {
                    role: Role::Polecat,
                    rig: Some("demo".into()),
                    worker: "nux".into(),
                },
            ),
            ("demo/mayor/rig", CwdRole::Town(Role::Mayor)),
            (
                "demo/somewhere",
                CwdRole::Unknown {
                    rig: Some("demo".into()),
                },
            ),
        ];
        for (rel, expected) in cases {
            assert_eq!(role_from_cwd(root, &root.join(rel)), expected, "for {rel}");
        }
    }

    #[test]
    fn rig_paths() {
        let town = Town::at("/town");
        let rig = town.rig("demo");
        assert_eq!(rig.beads_dir(), PathBuf::from("/town/demo/.beads"));
        assert_eq!(
            rig.refinery_clone(),
            PathBuf::from("/town/demo/refinery/rig")
        );
        assert_eq!(
            rig.polecat_dir("nux"),
            PathBuf::from("/town/demo/polecats/nux")
        );
        assert_eq!(rig.feed_path(), PathBuf::from("/town/demo/.gt/feed.jsonl"));
    }
}
