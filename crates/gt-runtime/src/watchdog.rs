use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gt_core::config::RuntimeConfig;
use gt_core::errors::GtError;
use gt_core::identity::{AgentId, Role};
use gt_core::issue::{labels, IssueType};
use gt_core::workspace::Town;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::ledger::{ActivityRecord, Ledger};
use crate::tmux::Tmux;

/// Heartbeat Supervisor tick.
pub const TICK: Duration = Duration::from_secs(180);
/// A Boot older than this is stuck and gets nuked.
pub const BOOT_MAX_AGE_MINS: i64 = 5;
/// Deacon heartbeat age past which the supervisor injects a wake.
pub const DEACON_WAKE_AFTER_MINS: i64 = 30;

/// Deacon heartbeat file contents, written by the Deacon's own tooling;
/// the supervisor only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub at: DateTime<Utc>,
}

impl Heartbeat {
    pub fn touch(path: &Path) -> Result<(), GtError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let hb = Heartbeat { at: Utc::now() };
        let json =
            serde_json::to_string(&hb).map_err(|e| GtError::ConfigParse(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Option<DateTime<Utc>> {
        let data = std::fs::read_to_string(path).ok()?;
        serde_json::from_str::<Heartbeat>(&data).ok().map(|h| h.at)
    }

    /// Age in whole minutes, `None` when the file is missing or bad.
    pub fn age_minutes(path: &Path, now: DateTime<Utc>) -> Option<i64> {
        Self::read(path).map(|at| (now - at).num_minutes())
    }
}

/// Deacon heartbeat freshness buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    VeryStale,
}

pub fn freshness(age_minutes: i64) -> Freshness {
    if age_minutes < 5 {
        Freshness::Fresh
    } else if age_minutes <= 15 {
        Freshness::Stale
    } else {
        Freshness::VeryStale
    }
}

/// What Boot observed about the Deacon on one triage pass.
#[derive(Debug, Clone, Copy)]
pub struct TriageObservation {
    pub session_dead: bool,
    pub error_in_pane: bool,
    /// `None` when no heartbeat file exists yet.
    pub freshness: Option<Freshness>,
    pub mail_waiting: bool,
}

/// Boot's possible actions. There is deliberately no kill variant:
/// restarts belong to the Heartbeat Supervisor alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageAction {
    Nothing,
    Nudge,
    Wake,
    FileDeathWarrant,
    ExitNoAction,
}

/// The triage decision matrix. Pure; Boot executes the result and exits.
pub fn triage(obs: TriageObservation) -> TriageAction {
    if obs.session_dead {
        // The supervisor will respawn the Deacon on its next tick.
        return TriageAction::ExitNoAction;
    }
    if obs.error_in_pane {
        return TriageAction::FileDeathWarrant;
    }
    match obs.freshness {
        Some(Freshness::Fresh) => TriageAction::Nothing,
        Some(Freshness::Stale) => {
            if obs.mail_waiting {
                TriageAction::Nudge
            } else {
                TriageAction::Nothing
            }
        }
        Some(Freshness::VeryStale) | None => TriageAction::Wake,
    }
}

/// Supervisor action for Boot itself on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAction {
    LeaveAlone,
    Spawn,
    NukeAndRespawn,
}

/// Boot liveness: session exists AND an LLM is running AND the start
/// record is young. A session without an LLM is a zombie.
pub fn boot_action(
    session_exists: bool,
    llm_running: bool,
    record_age_minutes: Option<i64>,
) -> BootAction {
    if !session_exists {
        return BootAction::Spawn;
    }
    if !llm_running {
        return BootAction::NukeAndRespawn;
    }
    match record_age_minutes {
        Some(age) if age <= BOOT_MAX_AGE_MINS => BootAction::LeaveAlone,
        _ => BootAction::NukeAndRespawn,
    }
}

/// Supervisor action for the Deacon on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeaconAction {
    LeaveAlone,
    Spawn,
    /// Inject one wake keystroke; never kill.
    Wake,
}

pub fn deacon_action(session_exists: bool, heartbeat_age_minutes: Option<i64>) -> DeaconAction {
    if !session_exists {
        return DeaconAction::Spawn;
    }
    match heartbeat_age_minutes {
        Some(age) if age > DEACON_WAKE_AFTER_MINS => DeaconAction::Wake,
        // Missing heartbeat with a live session: leave it to Boot's
        // triage, which distinguishes stale from very-stale.
        _ => DeaconAction::LeaveAlone,
    }
}

/// Boot start record, written by the supervisor when it spawns Boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootRecord {
    pub started_at: DateTime<Utc>,
}

impl BootRecord {
    pub fn write(path: &Path) -> Result<(), GtError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = BootRecord {
            started_at: Utc::now(),
        };
        let json =
            serde_json::to_string(&record).map_err(|e| GtError::ConfigParse(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn age_minutes(path: &Path, now: DateTime<Utc>) -> Option<i64> {
        let data = std::fs::read_to_string(path).ok()?;
        let record: BootRecord = serde_json::from_str(&data).ok()?;
        Some((now - record.started_at).num_minutes())
    }
}

/// Tier 1: the Heartbeat Supervisor. Pure code — filesystem and
/// multiplexer primitives only, so a wedged LLM or ledger can never
/// hang it. Holds no locks across sleeps.
pub struct HeartbeatSupervisor {
    town: Town,
    tmux: Tmux,
    runtime: RuntimeConfig,
}

impl HeartbeatSupervisor {
    pub fn new(town: Town, tmux: Tmux, runtime: RuntimeConfig) -> Self {
        HeartbeatSupervisor { town, tmux, runtime }
    }

    /// Spawn a session without touching the ledger. Agent records for
    /// supervisor-spawned singletons are reconciled by the patrols.
    async fn spawn_plain(&self, id: &AgentId, prompt: &str) -> Result<(), GtError> {
        let session = id.session_name();
        let workdir = match id.role {
            Role::Boot | Role::Deacon => self.town.deacon_dir(),
            _ => self.town.root().to_path_buf(),
        };
        std::fs::create_dir_all(&workdir)?;
        let env = vec![
            ("GT_ROLE".to_string(), id.role.to_string()),
            ("CI".to_string(), "true".to_string()),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ];
        let mut command = self.runtime.command.clone();
        for arg in &self.runtime.args {
            command.push(' ');
            command.push_str(arg);
        }
        match self.tmux.create(&session, &workdir, &env, Some(&command)).await {
            Ok(()) | Err(GtError::SessionExists(_)) => {}
            Err(e) => return Err(e),
        }
        let strategy = self.runtime.ready_strategy();
        if self
            .tmux
            .wait_for_ready(&session, &strategy, crate::tmux::READY_TIMEOUT)
            .await
            .is_ok()
        {
            self.tmux.send_keys(&session, prompt, true).await?;
        }
        Ok(())
    }

    /// One supervisor tick: Boot first, then the Deacon fallback wake.
    pub async fn tick(&self) -> Result<(), GtError> {
        let now = Utc::now();

        // Boot.
        let boot = AgentId::town(Role::Boot);
        let boot_session = boot.session_name();
        let exists = self.tmux.has(&boot_session).await?;
        let llm = if exists {
            self.tmux
                .is_llm_running(&boot_session, &self.runtime.process_names)
                .await?
        } else {
            false
        };
        let age = BootRecord::age_minutes(&self.town.boot_record(), now);
        match boot_action(exists, llm, age) {
            BootAction::LeaveAlone => {}
            BootAction::NukeAndRespawn => {
                tracing::warn!("boot is a zombie (llm={llm}, age={age:?}m); respawning");
                self.tmux.kill(&boot_session).await?;
                BootRecord::write(&self.town.boot_record())?;
                self.spawn_plain(&boot, BOOT_PROMPT).await?;
            }
            BootAction::Spawn => {
                BootRecord::write(&self.town.boot_record())?;
                self.spawn_plain(&boot, BOOT_PROMPT).await?;
            }
        }

        // Deacon: wake fallback only; killing is reserved for zombies
        // reported through triage, never done on heartbeat age alone.
        let deacon = AgentId::town(Role::Deacon);
        let deacon_session = deacon.session_name();
        let exists = self.tmux.has(&deacon_session).await?;
        let hb_age = Heartbeat::age_minutes(&self.town.deacon_heartbeat(), now);
        match deacon_action(exists, hb_age) {
            DeaconAction::LeaveAlone => {}
            DeaconAction::Wake => {
                tracing::warn!("deacon heartbeat {hb_age:?}m old; injecting wake keystroke");
                self.tmux
                    .send_keys(&deacon_session, "gt prime deacon", true)
                    .await?;
            }
            DeaconAction::Spawn => {
                tracing::info!("deacon session absent; respawning");
                self.spawn_plain(&deacon, DEACON_PROMPT).await?;
            }
        }

        Ok(())
    }

    /// The supervisor loop: a plain sleep between ticks, cancellable.
    pub async fn run(&self, cancel: &CancelToken) {
        loop {
            if let Err(e) = self.tick().await {
                tracing::warn!("heartbeat tick failed: {e}; retrying next tick");
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(TICK) => {}
            }
        }
    }
}

const BOOT_PROMPT: &str = "You are Boot. Run `gt status --triage`, act on the result, then exit.";
const DEACON_PROMPT: &str =
    "You are the Deacon. Run `gt prime deacon` and begin your patrol cycle.";

/// File a death warrant: a structured ledger item requesting a restart.
/// Boot files; the supervisor kills.
pub async fn file_death_warrant(
    ledger: &Ledger,
    target: &AgentId,
    evidence: &str,
    cancel: &CancelToken,
) -> Result<String, GtError> {
    ledger
        .create(
            IssueType::Task,
            &format!("restart {}", target.render()),
            &format!("Death warrant for {}.\n\nEvidence:\n{evidence}", target.render()),
            &[labels::DEATH_WARRANT.to_string()],
            Some(1),
            cancel,
        )
        .await
}

/// Exponential idle backoff for patrol loops, capped at five minutes.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    current: Duration,
    floor: Duration,
    ceiling: Duration,
}

impl Default for IdleBackoff {
    fn default() -> Self {
        IdleBackoff {
            current: Duration::from_secs(15),
            floor: Duration::from_secs(15),
            ceiling: Duration::from_secs(300),
        }
    }
}

impl IdleBackoff {
    /// Delay to sleep now; doubles for next time, up to the ceiling.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.ceiling);
        delay
    }

    /// Activity observed: start over from the floor.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Why a patrol cycle woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Activity,
    Timer,
    Cancelled,
}

/// Block until the next patrol cycle should run: ledger activity wakes
/// immediately, otherwise the idle backoff timer fires. The 3-minute
/// heartbeat remains the safety net above this.
pub async fn wait_for_cycle(
    activity: &mut tokio::sync::mpsc::Receiver<ActivityRecord>,
    backoff: &mut IdleBackoff,
    cancel: &CancelToken,
) -> WakeReason {
    let delay = backoff.next();
    tokio::select! {
        _ = cancel.cancelled() => WakeReason::Cancelled,
        event = activity.recv() => {
            match event {
                Some(_) => {
                    backoff.reset();
                    WakeReason::Activity
                }
                // Stream gone: fall back to pure timer pacing.
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => WakeReason::Cancelled,
                        _ = tokio::time::sleep(delay) => WakeReason::Timer,
                    }
                }
            }
        }
        _ = tokio::time::sleep(delay) => WakeReason::Timer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_buckets() {
        assert_eq!(freshness(0), Freshness::Fresh);
        assert_eq!(freshness(4), Freshness::Fresh);
        assert_eq!(freshness(5), Freshness::Stale);
        assert_eq!(freshness(15), Freshness::Stale);
        assert_eq!(freshness(16), Freshness::VeryStale);
    }

    fn obs() -> TriageObservation {
        TriageObservation {
            session_dead: false,
            error_in_pane: false,
            freshness: Some(Freshness::Fresh),
            mail_waiting: false,
        }
    }

    #[test]
    fn triage_matrix() {
        assert_eq!(triage(obs()), TriageAction::Nothing);
        assert_eq!(
            triage(TriageObservation {
                freshness: Some(Freshness::Stale),
                mail_waiting: true,
                ..obs()
            }),
            TriageAction::Nudge
        );
        assert_eq!(
            triage(TriageObservation {
                freshness: Some(Freshness::Stale),
                ..obs()
            }),
            TriageAction::Nothing
        );
        assert_eq!(
            triage(TriageObservation {
                freshness: Some(Freshness::VeryStale),
                ..obs()
            }),
            TriageAction::Wake
        );
        assert_eq!(
            triage(TriageObservation {
                error_in_pane: true,
                ..obs()
            }),
            TriageAction::FileDeathWarrant
        );
        assert_eq!(
            triage(TriageObservation {
                session_dead: true,
                error_in_pane: true,
                ..obs()
            }),
            TriageAction::ExitNoAction
        );
    }

    #[test]
    fn boot_liveness_test_is_threefold() {
        // Absent: spawn.
        assert_eq!(boot_action(false, false, None), BootAction::Spawn);
        // Shell without LLM: zombie.
        assert_eq!(boot_action(true, false, Some(1)), BootAction::NukeAndRespawn);
        // Live but old start record: stuck.
        assert_eq!(boot_action(true, true, Some(6)), BootAction::NukeAndRespawn);
        // Live, young: leave alone.
        assert_eq!(boot_action(true, true, Some(2)), BootAction::LeaveAlone);
        // No record at all counts as stuck.
        assert_eq!(boot_action(true, true, None), BootAction::NukeAndRespawn);
    }

    #[test]
    fn deacon_wake_threshold() {
        assert_eq!(deacon_action(true, Some(31)), DeaconAction::Wake);
        assert_eq!(deacon_action(true, Some(30)), DeaconAction::LeaveAlone);
        assert_eq!(deacon_action(true, None), DeaconAction::LeaveAlone);
        assert_eq!(deacon_action(false, Some(31)), DeaconAction::Spawn);
    }

    #[test]
    fn heartbeat_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deacon").join("heartbeat.json");
        assert!(Heartbeat::read(&path).is_none());
        Heartbeat::touch(&path).unwrap();
        let age = Heartbeat::age_minutes(&path, Utc::now()).unwrap();
        assert_eq!(age, 0);
    }

    #[test]
    fn idle_backoff_doubles_to_ceiling() {
        let mut backoff = IdleBackoff::default();
        assert_eq!(backoff.next(), Duration::from_secs(15));
        assert_eq!(backoff.next(), Duration::from_secs(30));
        assert_eq!(backoff.next(), Duration::from_secs(60));
        assert_eq!(backoff.next(), Duration::from_secs(120));
        assert_eq!(backoff.next(), Duration::from_secs(240));
        assert_eq!(backoff.next(), Duration::from_secs(300));
        assert_eq!(backoff.next(), Duration::from_secs(300));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_secs(15));
    }
}
