use std::path::PathBuf;

use anyhow::Context as _;
use gt_core::config::{
    load_json, load_json_or_default, AgentPresets, RigSettings, RigsConfig, RuntimeConfig,
    TownConfig,
};
use gt_core::identity::{AgentId, Role};
use gt_core::workspace::{role_from_cwd, CwdRole, Town};
use gt_runtime::cancel::CancelToken;
use gt_runtime::ledger::Ledger;
use gt_runtime::tmux::Tmux;

/// Everything a verb needs, resolved once from the working directory.
pub struct CliContext {
    pub town: Town,
    pub town_config: TownConfig,
    pub tmux: Tmux,
    pub cancel: CancelToken,
    cwd: PathBuf,
}

impl CliContext {
    /// Resolve the enclosing town; exit-code-2 error when outside one.
    pub fn resolve() -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let town = Town::find(&cwd)?;
        let town_config = load_json(&town.town_json()).or_else(|_| {
            // Legacy towns have rigs.json only; synthesize an identity.
            Ok::<_, gt_core::GtError>(TownConfig {
                name: town
                    .root()
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "town".into()),
                default_agent: "claude".into(),
            })
        })?;
        let cancel = CancelToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });
        }
        Ok(CliContext {
            town,
            town_config,
            tmux: Tmux::default(),
            cancel,
            cwd,
        })
    }

    pub fn cwd_role(&self) -> CwdRole {
        role_from_cwd(self.town.root(), &self.cwd)
    }

    /// The agent identity for the current directory, when there is one.
    pub fn self_id(&self) -> Option<AgentId> {
        match self.cwd_role() {
            CwdRole::Town(role) => Some(AgentId::town(role)),
            CwdRole::RigSingleton { role, rig } => Some(AgentId::rig_singleton(role, rig)),
            CwdRole::Worker {
                role,
                rig: Some(rig),
                worker,
            } => Some(AgentId::worker(role, rig, worker)),
            CwdRole::Worker {
                role: Role::Dog,
                rig: None,
                worker,
            } => Some(AgentId::dog(worker)),
            _ => None,
        }
    }

    pub fn registry(&self) -> anyhow::Result<RigsConfig> {
        load_json_or_default(&self.town.rigs_json()).context("reading rig registry")
    }

    /// The rig for an explicit argument, or inferred from the cwd.
    pub fn resolve_rig(&self, explicit: Option<&str>) -> anyhow::Result<String> {
        if let Some(rig) = explicit {
            return Ok(rig.to_string());
        }
        match self.cwd_role() {
            CwdRole::RigSingleton { rig, .. } => Ok(rig),
            CwdRole::Worker { rig: Some(rig), .. } => Ok(rig),
            CwdRole::Unknown { rig: Some(rig) } => Ok(rig),
            _ => {
                let registry = self.registry()?;
                if registry.rigs.len() == 1 {
                    return Ok(registry.rigs.keys().next().cloned().unwrap_or_default());
                }
                anyhow::bail!("cannot infer rig from here; pass --rig")
            }
        }
    }

    pub fn rig_settings(&self, rig: &str) -> anyhow::Result<RigSettings> {
        Ok(load_json_or_default(
            &self.town.rig(rig).settings_json(),
        )?)
    }

    pub fn presets(&self) -> anyhow::Result<AgentPresets> {
        Ok(load_json_or_default(&self.town.agents_json())?)
    }

    /// Runtime config resolution order: rig settings, then the named
    /// preset, then the town default provider.
    pub fn runtime_for(&self, rig: Option<&str>, preset: Option<&str>) -> anyhow::Result<RuntimeConfig> {
        if let Some(rig) = rig {
            let settings = self.rig_settings(rig)?;
            if let Some(runtime) = settings.runtime {
                return Ok(runtime);
            }
        }
        let presets = self.presets()?;
        if let Some(name) = preset {
            if let Some(entry) = presets.presets.get(name) {
                if let Some(runtime) = &entry.runtime {
                    return Ok(runtime.clone());
                }
            }
        }
        if let Some((_, entry)) = presets.default_preset() {
            if let Some(runtime) = &entry.runtime {
                return Ok(runtime.clone());
            }
        }
        Ok(RuntimeConfig::for_provider(&self.town_config.default_agent))
    }

    /// Ledger bound to the town root (mail, convoys, decisions).
    pub fn town_ledger(&self) -> Ledger {
        Ledger::new(self.town.root())
    }

    /// Ledger bound to one rig's namespace.
    pub fn rig_ledger(&self, rig: &str) -> Ledger {
        Ledger::new(self.town.rig(rig).root())
    }

    pub fn lifecycle(&self) -> gt_runtime::lifecycle::Lifecycle {
        gt_runtime::lifecycle::Lifecycle::new(self.town.clone(), self.tmux.clone())
    }

    pub fn bus(&self) -> gt_runtime::mail::MessageBus {
        gt_runtime::mail::MessageBus::new(self.town_ledger(), self.tmux.clone())
    }
}
