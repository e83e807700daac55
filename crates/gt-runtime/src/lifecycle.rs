use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use gt_core::config::RuntimeConfig;
use gt_core::errors::GtError;
use gt_core::identity::{parse_session_name, AgentId, LifetimeClass, Role};
use gt_core::issue::{labels, IssueStatus, IssueType};
use gt_core::workspace::Town;

use crate::cancel::CancelToken;
use crate::git::Git;
use crate::ledger::{Ledger, ListFilter, UpdateFields};
use crate::tmux::{Tmux, READY_TIMEOUT};

/// Agent record state labels in the ledger.
pub const STATE_SPAWNING: &str = "gt:state:spawning";
pub const STATE_RUNNING: &str = "gt:state:running";

/// Observed state of one session. Existence alone is never liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Absent,
    ShellOnly,
    LlmRunning,
    LlmDeadShellAlive,
}

/// Cleanup hint published by an agent during its own `done` sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStatus {
    Clean,
    HasUncommitted,
    HasStash,
    HasUnpushed,
}

impl CleanupStatus {
    pub fn as_label(&self) -> &'static str {
        match self {
            CleanupStatus::Clean => "gt:cleanup:clean",
            CleanupStatus::HasUncommitted => "gt:cleanup:has_uncommitted",
            CleanupStatus::HasStash => "gt:cleanup:has_stash",
            CleanupStatus::HasUnpushed => "gt:cleanup:has_unpushed",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "gt:cleanup:clean" => Some(CleanupStatus::Clean),
            "gt:cleanup:has_uncommitted" => Some(CleanupStatus::HasUncommitted),
            "gt:cleanup:has_stash" => Some(CleanupStatus::HasStash),
            "gt:cleanup:has_unpushed" => Some(CleanupStatus::HasUnpushed),
            _ => None,
        }
    }
}

/// What `nuke` decided to do, before side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NukeDecision {
    Proceed,
    Skip(&'static str),
    Escalate(&'static str),
}

/// Decision table for cleanup. `head_merged` is the ancestry fallback
/// (HEAD reachable from any remote default branch); `None` means it
/// could not be established.
pub fn nuke_decision(hint: Option<CleanupStatus>, head_merged: Option<bool>) -> NukeDecision {
    match hint {
        Some(CleanupStatus::Clean) => NukeDecision::Proceed,
        Some(CleanupStatus::HasUncommitted) => NukeDecision::Skip("uncommitted changes"),
        Some(CleanupStatus::HasStash) => NukeDecision::Skip("stash entries"),
        Some(CleanupStatus::HasUnpushed) => NukeDecision::Escalate("unpushed commits"),
        None => match head_merged {
            Some(true) => NukeDecision::Proceed,
            Some(false) => NukeDecision::Escalate("HEAD not merged to any remote default branch"),
            None => NukeDecision::Escalate("cleanup state unverifiable"),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NukeOutcome {
    Nuked,
    AlreadyAbsent,
    Skipped(String),
    Escalated(String),
    /// The session was created after the zombie was detected; the name
    /// was reused and must not be killed on the old evidence.
    AbortedStaleDetection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    /// Session is up but the agent never became interactive; the record
    /// stays `spawning` and the next patrol reclassifies it.
    LeftSpawning,
}

/// Reconciliation discrepancy classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discrepancy {
    SessionWithoutRecord { session: String },
    RecordWithoutSession { agent: String, record_id: String },
    ShellWithoutLlm { session: String },
    RecordRunningButWorkClosed {
        agent: String,
        record_id: String,
        hook: String,
    },
}

/// Request to start one worker session.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub id: AgentId,
    pub hook: Option<String>,
    pub preset: Option<String>,
    pub prompt: Option<String>,
    pub resume: bool,
}

impl SpawnRequest {
    pub fn new(id: AgentId) -> Self {
        SpawnRequest {
            id,
            hook: None,
            preset: None,
            prompt: None,
            resume: false,
        }
    }
}

/// Starts, classifies, and destroys worker sessions, and reconciles
/// observed sessions against the ledger. Holds no session state of its
/// own: every answer is derived from tmux, disk, and ledger on demand.
pub struct Lifecycle {
    town: Town,
    tmux: Tmux,
}

impl Lifecycle {
    pub fn new(town: Town, tmux: Tmux) -> Self {
        Lifecycle { town, tmux }
    }

    pub fn town(&self) -> &Town {
        &self.town
    }

    pub fn tmux(&self) -> &Tmux {
        &self.tmux
    }

    /// Workspace directory for an agent, per the town layout.
    pub fn workspace_dir(&self, id: &AgentId) -> PathBuf {
        match (id.role, &id.rig, &id.worker) {
            (Role::Mayor, _, _) => self.town.mayor_dir(),
            (Role::Deacon, _, _) | (Role::Boot, _, _) => self.town.deacon_dir(),
            (Role::Dog, _, Some(name)) => self.town.dog_dir(name),
            (Role::Witness, Some(rig), _) => self.town.rig(rig).witness_dir(),
            (Role::Refinery, Some(rig), _) => self.town.rig(rig).refinery_clone(),
            (Role::Crew, Some(rig), Some(name)) => self.town.rig(rig).crew_dir(name),
            (Role::Polecat, Some(rig), Some(name)) => self.town.rig(rig).polecat_dir(name),
            _ => self.town.root().to_path_buf(),
        }
    }

    /// Observed session state. `expect_llm` distinguishes a plain shell
    /// session from one whose LLM died out from under it.
    pub async fn classify(
        &self,
        session: &str,
        runtime: &RuntimeConfig,
        expect_llm: bool,
    ) -> Result<SessionState, GtError> {
        if !self.tmux.has(session).await? {
            return Ok(SessionState::Absent);
        }
        if self.tmux.is_llm_running(session, &runtime.process_names).await? {
            return Ok(SessionState::LlmRunning);
        }
        Ok(if expect_llm {
            SessionState::LlmDeadShellAlive
        } else {
            SessionState::ShellOnly
        })
    }

    fn spawn_env(&self, req: &SpawnRequest, runtime: &RuntimeConfig) -> Vec<(String, String)> {
        let mut env = vec![
            ("GT_ROLE".to_string(), req.id.role.to_string()),
            (
                "GT_RIG".to_string(),
                req.id.rig.clone().unwrap_or_default(),
            ),
            ("GT_HOOK".to_string(), req.hook.clone().unwrap_or_default()),
        ];
        if let Ok(exe) = std::env::current_exe() {
            env.push((
                "GT_BINARY_PATH".to_string(),
                exe.to_string_lossy().into_owned(),
            ));
        }
        if let (Some(var), Some(preset)) = (&runtime.config_dir_env, &req.preset) {
            env.push((var.clone(), preset.clone()));
        }
        if req.id.role.is_autonomous() {
            env.push(("CI".to_string(), "true".to_string()));
            env.push((
                "DEBIAN_FRONTEND".to_string(),
                "noninteractive".to_string(),
            ));
            env.push(("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()));
        }
        env
    }

    fn launch_command(&self, req: &SpawnRequest, runtime: &RuntimeConfig) -> String {
        let mut parts = vec![runtime.command.clone()];
        parts.extend(runtime.args.iter().cloned());
        if req.resume {
            if let Some(flag) = &runtime.resume_flag {
                parts.push(flag.clone());
            }
        }
        parts.join(" ")
    }

    async fn find_agent_record(
        &self,
        ledger: &Ledger,
        addr: &str,
        cancel: &CancelToken,
    ) -> Result<Option<gt_core::issue::Issue>, GtError> {
        let filter = ListFilter {
            issue_type: Some(IssueType::Agent),
            labels: vec![labels::AGENT.to_string()],
            ..Default::default()
        };
        let records = ledger.list(&filter, cancel).await?;
        Ok(records.into_iter().find(|r| r.title == addr))
    }

    /// Ensure an agent record exists for this worker, in `spawning`
    /// state. Returns the record id. Idempotent.
    async fn ensure_agent_record(
        &self,
        ledger: &Ledger,
        req: &SpawnRequest,
        cancel: &CancelToken,
    ) -> Result<String, GtError> {
        let addr = req.id.render();
        if let Some(existing) = self.find_agent_record(ledger, &addr, cancel).await? {
            return Ok(existing.id);
        }
        let description = match &req.hook {
            Some(hook) => format!("hook: {hook}"),
            None => String::new(),
        };
        ledger
            .create(
                IssueType::Agent,
                &addr,
                &description,
                &[labels::AGENT.to_string(), STATE_SPAWNING.to_string()],
                Some(3),
                cancel,
            )
            .await
    }

    /// Start protocol. Every step is individually idempotent; repeating
    /// a `start` whose session exists and whose record is `running` is
    /// a no-op.
    pub async fn start(
        &self,
        req: &SpawnRequest,
        runtime: &RuntimeConfig,
        ledger: &Ledger,
        cancel: &CancelToken,
    ) -> Result<StartOutcome, GtError> {
        let session = req.id.session_name();
        let addr = req.id.render();

        if self.tmux.has(&session).await? {
            let record = self.find_agent_record(ledger, &addr, cancel).await?;
            if record
                .as_ref()
                .map(|r| r.has_label(STATE_RUNNING))
                .unwrap_or(false)
            {
                tracing::debug!("start {addr}: already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
        }

        // 1: resolve or create the workspace (worktree for polecats,
        // plain reuse otherwise).
        let workdir = self.workspace_dir(&req.id);
        if req.id.role == Role::Polecat && !workdir.exists() {
            if let (Some(rig), Some(name)) = (&req.id.rig, &req.id.worker) {
                let canonical = self.town.rig(rig).mayor_clone();
                if canonical.join(".git").exists() {
                    Git::at(&canonical)
                        .worktree_add(&workdir, &format!("polecat/{name}"), "HEAD")
                        .await?;
                }
            }
        }
        std::fs::create_dir_all(&workdir)?;

        // 2: idempotent per-workspace setup.
        std::fs::create_dir_all(workdir.join(".gt").join("mail"))?;

        // 3: agent record (spawning) for tracked roles.
        let record_id = if req.id.role.is_tracked() {
            Some(self.ensure_agent_record(ledger, req, cancel).await?)
        } else {
            None
        };

        // 4: session bound to the workspace, command attached atomically.
        let env = self.spawn_env(req, runtime);
        let command = self.launch_command(req, runtime);
        match self
            .tmux
            .create(&session, &workdir, &env, Some(&command))
            .await
        {
            Ok(()) => {}
            Err(GtError::SessionExists(_)) => {
                tracing::debug!("start {addr}: session already present");
            }
            Err(e) => return Err(e),
        }

        // 5: readiness. A timeout leaves the session alive in
        // `spawning`; the watchdog reclassifies it later.
        let strategy = runtime.ready_strategy();
        match self
            .tmux
            .wait_for_ready(&session, &strategy, READY_TIMEOUT)
            .await
        {
            Ok(()) => {}
            Err(GtError::LlmNotReady(_)) => {
                tracing::warn!("start {addr}: agent not interactive; leaving session in spawning");
                return Ok(StartOutcome::LeftSpawning);
            }
            Err(e) => return Err(e),
        }

        // 6: initial role prompt.
        if let Some(prompt) = &req.prompt {
            self.tmux.send_keys(&session, prompt, true).await?;
        }

        // 7: record flips to running.
        if let Some(record_id) = record_id {
            ledger
                .update(
                    &record_id,
                    &UpdateFields {
                        add_labels: vec![STATE_RUNNING.to_string()],
                        remove_labels: vec![STATE_SPAWNING.to_string()],
                        ..Default::default()
                    },
                    cancel,
                )
                .await?;
        }

        tracing::info!("started {addr} in session {session}");
        Ok(StartOutcome::Started)
    }

    /// Ancestry fallback for cleanup: is the worker's HEAD an ancestor
    /// of any configured remote's default branch?
    async fn head_merged_anywhere(&self, workdir: &PathBuf) -> Option<bool> {
        let git = Git::at(workdir);
        let head = git.head_sha().await.ok()?;
        let remotes = git.remotes().await.ok()?;
        if remotes.is_empty() {
            return Some(false);
        }
        for remote in remotes {
            let default = git.default_branch(&remote).await.ok()?;
            let target = format!("{remote}/{default}");
            if git.is_ancestor(&head, &target).await.ok()? {
                return Some(true);
            }
        }
        Some(false)
    }

    /// Cleanup protocol. `detected_at` is the moment the caller decided
    /// the session was dead; a session created after that timestamp was
    /// reused and is never killed on the old evidence.
    pub async fn nuke(
        &self,
        id: &AgentId,
        hint: Option<CleanupStatus>,
        detected_at: DateTime<Utc>,
        ledger: &Ledger,
        cancel: &CancelToken,
    ) -> Result<NukeOutcome, GtError> {
        let session = id.session_name();
        let addr = id.render();
        let workdir = self.workspace_dir(id);

        let session_alive = self.tmux.has(&session).await?;
        if session_alive {
            let created = self.tmux.session_created(&session).await?;
            if created > detected_at {
                tracing::warn!(
                    "nuke {addr}: session newer than detection ({created} > {detected_at}); aborting"
                );
                return Ok(NukeOutcome::AbortedStaleDetection);
            }
        }

        // Resolve the hint from the agent record when not passed in.
        let record = self.find_agent_record(ledger, &addr, cancel).await?;
        let hint = hint.or_else(|| {
            record
                .as_ref()
                .and_then(|r| r.labels.iter().find_map(|l| CleanupStatus::from_label(l)))
        });

        // The cleanup table guards worker workspaces; singletons are
        // crash-safe and always proceed (the ledger holds their state).
        let is_worker = matches!(
            id.role.lifetime(),
            LifetimeClass::EphemeralWorker | LifetimeClass::PersistentWorker
        );
        if is_worker {
            let head_merged = if hint.is_none() && workdir.join(".git").exists() {
                self.head_merged_anywhere(&workdir).await
            } else {
                None
            };
            match nuke_decision(hint, head_merged) {
                NukeDecision::Skip(reason) => {
                    tracing::info!("nuke {addr}: skipped ({reason})");
                    return Ok(NukeOutcome::Skipped(reason.to_string()));
                }
                NukeDecision::Escalate(reason) => {
                    tracing::warn!("nuke {addr}: escalating ({reason})");
                    return Ok(NukeOutcome::Escalated(reason.to_string()));
                }
                NukeDecision::Proceed => {}
            }
        }

        if session_alive {
            self.tmux.kill(&session).await?;
        }

        // Ephemeral workers give their worktree back.
        if id.role.lifetime() == LifetimeClass::EphemeralWorker {
            if let Some(rig) = &id.rig {
                let canonical = Git::at(self.town.rig(rig).mayor_clone());
                if let Err(e) = canonical.worktree_remove(&workdir, true).await {
                    tracing::warn!("nuke {addr}: worktree remove failed: {e}");
                }
            }
            if workdir.exists() {
                std::fs::remove_dir_all(&workdir)?;
            }
        }

        // Close the record; closing twice is a no-op by ledger contract.
        if let Some(record) = record {
            ledger.close(&record.id, Some("nuked"), cancel).await?;
        }

        tracing::info!("nuked {addr}");
        if session_alive {
            Ok(NukeOutcome::Nuked)
        } else {
            Ok(NukeOutcome::AlreadyAbsent)
        }
    }

    /// Compare live sessions against agent records and report the four
    /// discrepancy classes. Pure observation; mutates nothing.
    pub async fn reconcile(
        &self,
        ledger: &Ledger,
        runtime: &RuntimeConfig,
        cancel: &CancelToken,
    ) -> Result<Vec<Discrepancy>, GtError> {
        let mut out = Vec::new();

        let sessions = self.tmux.list().await?;
        let gt_sessions: Vec<&String> = sessions
            .iter()
            .filter(|s| parse_session_name(s).is_some())
            .collect();

        let filter = ListFilter {
            issue_type: Some(IssueType::Agent),
            labels: vec![labels::AGENT.to_string()],
            status: Some(IssueStatus::Open),
        };
        let records = ledger.list(&filter, cancel).await?;

        for session in &gt_sessions {
            let known = records.iter().any(|r| {
                AgentId::parse(&r.title)
                    .map(|id| id.session_name() == **session)
                    .unwrap_or(false)
            });
            if !known {
                out.push(Discrepancy::SessionWithoutRecord {
                    session: (*session).clone(),
                });
            }
            if self.tmux.has(session).await?
                && !self
                    .tmux
                    .is_llm_running(session, &runtime.process_names)
                    .await?
            {
                out.push(Discrepancy::ShellWithoutLlm {
                    session: (*session).clone(),
                });
            }
        }

        for record in &records {
            let Ok(id) = AgentId::parse(&record.title) else {
                continue;
            };
            let session = id.session_name();
            if !gt_sessions.iter().any(|s| **s == session) {
                out.push(Discrepancy::RecordWithoutSession {
                    agent: record.title.clone(),
                    record_id: record.id.clone(),
                });
                continue;
            }
            if record.has_label(STATE_RUNNING) {
                if let Some(hook) = parse_hook(&record.description) {
                    match ledger.show(&hook, cancel).await {
                        Ok(issue) if !issue.is_open() => {
                            out.push(Discrepancy::RecordRunningButWorkClosed {
                                agent: record.title.clone(),
                                record_id: record.id.clone(),
                                hook,
                            });
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(out)
    }

    /// Compute the cleanup hint for the current worker directory, the
    /// way `gt done` publishes it.
    pub async fn compute_cleanup_status(workdir: &PathBuf) -> CleanupStatus {
        let git = Git::at(workdir);
        let dirty = git
            .status_porcelain()
            .await
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if dirty {
            return CleanupStatus::HasUncommitted;
        }
        if git.stash_count().await.unwrap_or(0) > 0 {
            return CleanupStatus::HasStash;
        }
        // Unpushed: HEAD not reachable from any remote default branch.
        let head = match git.head_sha().await {
            Ok(h) => h,
            Err(_) => return CleanupStatus::Clean,
        };
        let remotes = git.remotes().await.unwrap_or_default();
        for remote in &remotes {
            if let Ok(default) = git.default_branch(remote).await {
                let target = format!("{remote}/{default}");
                if git.is_ancestor(&head, &target).await.unwrap_or(false) {
                    return CleanupStatus::Clean;
                }
            }
        }
        if remotes.is_empty() {
            CleanupStatus::Clean
        } else {
            CleanupStatus::HasUnpushed
        }
    }
}

fn parse_hook(description: &str) -> Option<String> {
    description.lines().find_map(|l| {
        l.trim()
            .strip_prefix("hook:")
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
    })
}

impl FromStr for CleanupStatus {
    type Err = GtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clean" => Ok(CleanupStatus::Clean),
            "has_uncommitted" => Ok(CleanupStatus::HasUncommitted),
            "has_stash" => Ok(CleanupStatus::HasStash),
            "has_unpushed" => Ok(CleanupStatus::HasUnpushed),
            other => Err(GtError::ValidationFailed {
                message: format!("unknown cleanup status '{other}'"),
                suggestion: "clean|has_uncommitted|has_stash|has_unpushed".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nuke_decision_table() {
        assert_eq!(
            nuke_decision(Some(CleanupStatus::Clean), None),
            NukeDecision::Proceed
        );
        assert_eq!(
            nuke_decision(Some(CleanupStatus::HasUncommitted), None),
            NukeDecision::Skip("uncommitted changes")
        );
        assert_eq!(
            nuke_decision(Some(CleanupStatus::HasStash), None),
            NukeDecision::Skip("stash entries")
        );
        assert_eq!(
            nuke_decision(Some(CleanupStatus::HasUnpushed), None),
            NukeDecision::Escalate("unpushed commits")
        );
        // Fallback: ancestry verdict drives the decision.
        assert_eq!(nuke_decision(None, Some(true)), NukeDecision::Proceed);
        assert!(matches!(
            nuke_decision(None, Some(false)),
            NukeDecision::Escalate(_)
        ));
        assert!(matches!(nuke_decision(None, None), NukeDecision::Escalate(_)));
    }

    #[test]
    fn cleanup_status_labels_round_trip() {
        for status in [
            CleanupStatus::Clean,
            CleanupStatus::HasUncommitted,
            CleanupStatus::HasStash,
            CleanupStatus::HasUnpushed,
        ] {
            assert_eq!(CleanupStatus::from_label(status.as_label()), Some(status));
        }
        assert_eq!(CleanupStatus::from_label("gt:agent"), None);
    }

    #[test]
    fn cleanup_status_from_str() {
        assert_eq!(
            "has_unpushed".parse::<CleanupStatus>().unwrap(),
            CleanupStatus::HasUnpushed
        );
        assert!("weird".parse::<CleanupStatus>().is_err());
    }

    #[test]
    fn hook_parsing() {
        assert_eq!(parse_hook("hook: demo-12\nstate: x"), Some("demo-12".into()));
        assert_eq!(parse_hook("no hook here"), None);
        assert_eq!(parse_hook("hook:"), None);
    }

    #[test]
    fn workspace_dirs_by_role() {
        let town = Town::at("/town");
        let lc = Lifecycle::new(town, Tmux::default());
        assert_eq!(
            lc.workspace_dir(&AgentId::worker(Role::Polecat, "demo", "nux")),
            PathBuf::from("/town/demo/polecats/nux")
        );
        assert_eq!(
            lc.workspace_dir(&AgentId::rig_singleton(Role::Refinery, "demo")),
            PathBuf::from("/town/demo/refinery/rig")
        );
        assert_eq!(
            lc.workspace_dir(&AgentId::town(Role::Mayor)),
            PathBuf::from("/town/mayor")
        );
        assert_eq!(
            lc.workspace_dir(&AgentId::dog("rex")),
            PathBuf::from("/town/dogs/rex")
        );
    }
}
