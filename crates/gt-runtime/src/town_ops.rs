use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use gt_core::config::{load_json_or_default, save_json, RigEntry, RigsConfig, TownConfig};
use gt_core::errors::GtError;
use gt_core::identity::validate_rig_name;
use gt_core::issue::{labels, IssueStatus, IssueType};
use gt_core::workspace::Town;

use crate::cancel::CancelToken;
use crate::git::Git;
use crate::ledger::{Ledger, ListFilter, UpdateFields};

/// Dogs idle longer than this are retired by the Deacon's patrol.
pub const DOG_IDLE_TTL_HOURS: i64 = 24;

pub fn dog_expired(last_active: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - last_active > Duration::hours(DOG_IDLE_TTL_HOURS)
}

/// Create a new town at `root`: the marker config plus the fixed
/// directory skeleton. Idempotent on re-run.
pub fn init_town(root: &Path, name: &str) -> Result<Town, GtError> {
    let town = Town::at(root);
    std::fs::create_dir_all(town.mayor_dir())?;
    std::fs::create_dir_all(town.deacon_dir())?;
    if !town.town_json().exists() {
        let config = TownConfig {
            name: name.to_string(),
            default_agent: "claude".into(),
        };
        save_json(&town.town_json(), &config)?;
    }
    if !town.rigs_json().exists() {
        save_json(&town.rigs_json(), &RigsConfig::default())?;
    }
    Ok(town)
}

/// Add a rig: clone + marker directories + registry entry, as one act.
/// A clone failure leaves no registration behind.
pub async fn add_rig(town: &Town, name: &str, git_url: &str) -> Result<(), GtError> {
    validate_rig_name(name)?;

    let mut registry: RigsConfig = load_json_or_default(&town.rigs_json())?;
    if registry.rigs.contains_key(name) {
        return Err(GtError::WorkspaceConflict(format!(
            "rig '{name}' already exists"
        )));
    }
    let paths = town.rig(name);
    if paths.root().exists() {
        return Err(GtError::WorkspaceConflict(format!(
            "directory '{name}' already exists in the town"
        )));
    }

    // Canonical clone first; everything else is cheap and idempotent.
    Git::clone_into(git_url, &paths.mayor_clone()).await?;
    if let Err(e) = Git::clone_into(git_url, &paths.refinery_clone()).await {
        let _ = std::fs::remove_dir_all(paths.root());
        return Err(e);
    }
    std::fs::create_dir_all(paths.witness_dir())?;
    std::fs::create_dir_all(paths.polecats_dir())?;
    std::fs::create_dir_all(paths.root().join("crew"))?;

    registry.rigs.insert(
        name.to_string(),
        RigEntry {
            git_url: git_url.to_string(),
            added_at: Some(Utc::now()),
        },
    );
    save_json(&town.rigs_json(), &registry)?;
    tracing::info!("added rig '{name}' ({git_url})");
    Ok(())
}

/// Convoys: town-level tracking items grouping issues across rigs.
/// Tracked ids are `tracks:` lines in the description.
pub struct Convoys {
    ledger: Ledger,
}

pub fn parse_tracked(description: &str) -> Vec<String> {
    description
        .lines()
        .filter_map(|l| l.trim().strip_prefix("tracks:"))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
pub struct ConvoyStatus {
    pub id: String,
    pub title: String,
    pub total: usize,
    pub closed: usize,
    pub auto_closed: bool,
}

impl Convoys {
    pub fn new(town: &Town) -> Self {
        Convoys {
            ledger: Ledger::new(town.root()),
        }
    }

    pub async fn create(
        &self,
        title: &str,
        tracked: &[String],
        cancel: &CancelToken,
    ) -> Result<String, GtError> {
        let description = tracked
            .iter()
            .map(|id| format!("tracks: {id}"))
            .collect::<Vec<_>>()
            .join("\n");
        self.ledger
            .create(
                IssueType::Epic,
                title,
                &description,
                &[labels::CONVOY.to_string()],
                Some(2),
                cancel,
            )
            .await
    }

    pub async fn list(&self, cancel: &CancelToken) -> Result<Vec<gt_core::issue::Issue>, GtError> {
        let filter = ListFilter {
            labels: vec![labels::CONVOY.to_string()],
            status: Some(IssueStatus::Open),
            ..Default::default()
        };
        self.ledger.list(&filter, cancel).await
    }

    /// Evaluate one convoy; auto-close when every tracked issue is
    /// closed. Tracked issues may live in rig ledgers, so per-issue
    /// lookups go through the rig resolver.
    pub async fn status(
        &self,
        convoy_id: &str,
        resolve: &dyn Fn(&str) -> Ledger,
        cancel: &CancelToken,
    ) -> Result<ConvoyStatus, GtError> {
        let convoy = self.ledger.show(convoy_id, cancel).await?;
        let tracked = parse_tracked(&convoy.description);
        let mut closed = 0usize;
        for id in &tracked {
            let ledger = resolve(id);
            match ledger.show(id, cancel).await {
                Ok(issue) if !issue.is_open() => closed += 1,
                Ok(_) => {}
                Err(GtError::LedgerNotFound(_)) => closed += 1,
                Err(e) => return Err(e),
            }
        }
        let auto_closed = !tracked.is_empty() && closed == tracked.len() && convoy.is_open();
        if auto_closed {
            self.ledger
                .close(convoy_id, Some("all tracked issues closed"), cancel)
                .await?;
        }
        Ok(ConvoyStatus {
            id: convoy.id,
            title: convoy.title,
            total: tracked.len(),
            closed,
            auto_closed,
        })
    }
}

/// Gate types for the async-barrier items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateType {
    Timer,
    ExternalRun,
    ExternalPr,
    Human,
    Mail,
}

impl GateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateType::Timer => "timer",
            GateType::ExternalRun => "external-run",
            GateType::ExternalPr => "external-pr",
            GateType::Human => "human",
            GateType::Mail => "mail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timer" => Some(GateType::Timer),
            "external-run" => Some(GateType::ExternalRun),
            "external-pr" => Some(GateType::ExternalPr),
            "human" => Some(GateType::Human),
            "mail" => Some(GateType::Mail),
            _ => None,
        }
    }

    /// Timer and external gates are closed by the supervisor; human and
    /// mail gates only externally.
    pub fn supervisor_closes(&self) -> bool {
        matches!(
            self,
            GateType::Timer | GateType::ExternalRun | GateType::ExternalPr
        )
    }
}

pub struct Gates {
    ledger: Ledger,
}

impl Gates {
    pub fn new(ledger: Ledger) -> Self {
        Gates { ledger }
    }

    pub async fn create(
        &self,
        gate_type: GateType,
        title: &str,
        due: Option<DateTime<Utc>>,
        cancel: &CancelToken,
    ) -> Result<String, GtError> {
        let mut description = format!("gate_type: {}", gate_type.as_str());
        if let Some(due) = due {
            description.push_str(&format!("\ndue: {}", due.to_rfc3339()));
        }
        self.ledger
            .create(
                IssueType::Task,
                title,
                &description,
                &[labels::GATE.to_string()],
                Some(2),
                cancel,
            )
            .await
    }

    pub async fn close(&self, gate_id: &str, cancel: &CancelToken) -> Result<(), GtError> {
        self.ledger.close(gate_id, Some("gate released"), cancel).await
    }

    pub async fn list_open(&self, cancel: &CancelToken) -> Result<Vec<gt_core::issue::Issue>, GtError> {
        let filter = ListFilter {
            labels: vec![labels::GATE.to_string()],
            status: Some(IssueStatus::Open),
            ..Default::default()
        };
        self.ledger.list(&filter, cancel).await
    }

    /// Patrol duty: close due timer gates. Returns closed ids.
    pub async fn sweep_timers(
        &self,
        now: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, GtError> {
        let mut closed = Vec::new();
        for gate in self.list_open(cancel).await? {
            let Some((gate_type, due)) = parse_gate(&gate.description) else {
                continue;
            };
            if gate_type == GateType::Timer {
                if let Some(due) = due {
                    if due <= now {
                        self.close(&gate.id, cancel).await?;
                        closed.push(gate.id);
                    }
                }
            }
        }
        Ok(closed)
    }
}

pub fn parse_gate(description: &str) -> Option<(GateType, Option<DateTime<Utc>>)> {
    let mut gate_type = None;
    let mut due = None;
    for line in description.lines() {
        if let Some(v) = line.trim().strip_prefix("gate_type:") {
            gate_type = GateType::parse(v.trim());
        } else if let Some(v) = line.trim().strip_prefix("due:") {
            due = DateTime::parse_from_rfc3339(v.trim())
                .ok()
                .map(|t| t.with_timezone(&Utc));
        }
    }
    gate_type.map(|g| (g, due))
}

/// Decisions: requests routed to the Mayor.
pub struct Decisions {
    ledger: Ledger,
}

impl Decisions {
    pub fn new(town: &Town) -> Self {
        Decisions {
            ledger: Ledger::new(town.root()),
        }
    }

    pub async fn request(
        &self,
        title: &str,
        body: &str,
        cancel: &CancelToken,
    ) -> Result<String, GtError> {
        self.ledger
            .create(
                IssueType::Decision,
                title,
                body,
                &[
                    labels::DECISION.to_string(),
                    labels::to_addr("mayor"),
                ],
                Some(1),
                cancel,
            )
            .await
    }

    pub async fn resolve(
        &self,
        decision_id: &str,
        resolution: &str,
        cancel: &CancelToken,
    ) -> Result<(), GtError> {
        let issue = self.ledger.show(decision_id, cancel).await?;
        let description = format!(
            "{}\n\nResolution: {resolution}",
            issue.description.trim_end()
        );
        self.ledger
            .update(
                decision_id,
                &UpdateFields {
                    description: Some(description),
                    ..Default::default()
                },
                cancel,
            )
            .await?;
        self.ledger.close(decision_id, Some(resolution), cancel).await
    }

    pub async fn open(&self, cancel: &CancelToken) -> Result<Vec<gt_core::issue::Issue>, GtError> {
        let filter = ListFilter {
            labels: vec![labels::DECISION.to_string()],
            status: Some(IssueStatus::Open),
            ..Default::default()
        };
        self.ledger.list(&filter, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_is_idempotent() {
        let dir = tempdir().unwrap();
        let town = init_town(dir.path(), "citadel").unwrap();
        assert!(town.town_json().exists());
        // Second run leaves the config alone.
        init_town(dir.path(), "renamed").unwrap();
        let config: TownConfig = gt_core::config::load_json(&town.town_json()).unwrap();
        assert_eq!(config.name, "citadel");
        assert!(gt_core::workspace::is_workspace_root(dir.path()));
    }

    #[test]
    fn tracked_line_parsing() {
        let desc = "Big push.\n\ntracks: demo-1\ntracks: other-9\nnot this";
        assert_eq!(parse_tracked(desc), vec!["demo-1", "other-9"]);
        assert!(parse_tracked("tracks:").is_empty());
    }

    #[test]
    fn gate_parsing() {
        let (gate_type, due) =
            parse_gate("gate_type: timer\ndue: 2026-01-05T12:00:00+00:00").unwrap();
        assert_eq!(gate_type, GateType::Timer);
        assert!(due.is_some());
        assert_eq!(parse_gate("gate_type: human"), Some((GateType::Human, None)));
        assert_eq!(parse_gate("nothing"), None);
    }

    #[test]
    fn gate_closure_ownership() {
        assert!(GateType::Timer.supervisor_closes());
        assert!(GateType::ExternalPr.supervisor_closes());
        assert!(!GateType::Human.supervisor_closes());
        assert!(!GateType::Mail.supervisor_closes());
    }

    #[test]
    fn dog_ttl_boundary() {
        let now = Utc::now();
        assert!(!dog_expired(now - Duration::hours(23), now));
        assert!(dog_expired(now - Duration::hours(25), now));
    }

    #[tokio::test]
    async fn add_rig_rejects_bad_names_and_duplicates() {
        let dir = tempdir().unwrap();
        let town = init_town(dir.path(), "citadel").unwrap();
        let err = add_rig(&town, "Bad Name", "url").await.unwrap_err();
        assert!(matches!(err, GtError::ValidationFailed { .. }));

        // Simulate an existing rig directory.
        std::fs::create_dir_all(town.rig("demo").root()).unwrap();
        let err = add_rig(&town, "demo", "url").await.unwrap_err();
        assert!(matches!(err, GtError::WorkspaceConflict(_)));
    }
}
