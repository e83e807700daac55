use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::GtError;

/// `mayor/town.json` — the primary workspace marker and town identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TownConfig {
    pub name: String,
    #[serde(default = "default_agent")]
    pub default_agent: String,
}

fn default_agent() -> String {
    "claude".into()
}

/// One entry in the rig registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigEntry {
    pub git_url: String,
    #[serde(default)]
    pub added_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// `mayor/rigs.json` — registry of rigs in this town.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RigsConfig {
    #[serde(default)]
    pub rigs: BTreeMap<String, RigEntry>,
}

/// Merge strategy for the refinery. Both converge on the same
/// post-merge bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    #[default]
    RebaseFf,
    Squash,
}

/// Quality gate commands, run in order during `prepare`. Absent gates are
/// skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityGates {
    #[serde(default)]
    pub setup: Option<String>,
    #[serde(default)]
    pub typecheck: Option<String>,
    #[serde(default)]
    pub lint: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
}

impl QualityGates {
    /// Gates in execution order, skipping unconfigured ones.
    pub fn ordered(&self) -> Vec<(&'static str, &str)> {
        [
            ("setup", &self.setup),
            ("typecheck", &self.typecheck),
            ("lint", &self.lint),
            ("build", &self.build),
            ("test", &self.test),
        ]
        .into_iter()
        .filter_map(|(name, cmd)| cmd.as_deref().map(|c| (name, c)))
        .collect()
    }
}

/// `<rig>/settings/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RigSettings {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub gates: QualityGates,
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,
}

impl RigSettings {
    pub fn target_branch(&self) -> &str {
        self.target_branch.as_deref().unwrap_or("main")
    }
}

/// How the adapter decides an LLM session is ready for keystrokes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyStrategy {
    /// Poll the pane for a prompt-prefix substring (whitespace-trimmed).
    PromptPrefix(String),
    /// Fixed delay in milliseconds.
    DelayMs(u64),
}

impl ReadyStrategy {
    /// Empty prefix and zero delay both mean "ready immediately".
    pub fn is_immediate(&self) -> bool {
        match self {
            ReadyStrategy::PromptPrefix(p) => p.is_empty(),
            ReadyStrategy::DelayMs(ms) => *ms == 0,
        }
    }
}

/// How a provider resumes a previous session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStyle {
    Flag,
    Subcommand,
}

/// Runtime section: which LLM provider backs agent sessions and how to
/// launch, detect, and drive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub provider: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Process names that count as "LLM running" in a pane.
    #[serde(default)]
    pub process_names: Vec<String>,
    #[serde(default)]
    pub ready: Option<ReadyStrategy>,
    #[serde(default)]
    pub resume_flag: Option<String>,
    #[serde(default)]
    pub resume_style: Option<ResumeStyle>,
    #[serde(default)]
    pub non_interactive_subcommand: Option<String>,
    #[serde(default)]
    pub non_interactive_output_flag: Option<String>,
    /// Env var naming the provider's config directory, if it has one.
    #[serde(default)]
    pub config_dir_env: Option<String>,
}

impl RuntimeConfig {
    /// Built-in default: the claude provider.
    pub fn claude() -> Self {
        RuntimeConfig {
            provider: "claude".into(),
            command: "claude".into(),
            args: vec!["--dangerously-skip-permissions".into()],
            process_names: vec!["claude".into(), "node".into()],
            ready: Some(ReadyStrategy::PromptPrefix(">".into())),
            resume_flag: Some("--continue".into()),
            resume_style: Some(ResumeStyle::Flag),
            non_interactive_subcommand: Some("-p".into()),
            non_interactive_output_flag: Some("--output-format json".into()),
            config_dir_env: Some("CLAUDE_CONFIG_DIR".into()),
        }
    }

    pub fn for_provider(name: &str) -> Self {
        match name {
            "claude" => Self::claude(),
            other => RuntimeConfig {
                provider: other.into(),
                command: other.into(),
                args: vec![],
                process_names: vec![other.into(), "node".into()],
                ready: Some(ReadyStrategy::DelayMs(3000)),
                resume_flag: None,
                resume_style: None,
                non_interactive_subcommand: None,
                non_interactive_output_flag: None,
                config_dir_env: None,
            },
        }
    }

    pub fn ready_strategy(&self) -> ReadyStrategy {
        self.ready
            .clone()
            .unwrap_or(ReadyStrategy::PromptPrefix(String::new()))
    }
}

/// One named agent preset in `mayor/settings/agents.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPreset {
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,
    /// Provider config dir for this account, exported at spawn.
    #[serde(default)]
    pub config_dir: Option<String>,
    #[serde(default)]
    pub default: bool,
}

/// `mayor/settings/agents.json` — custom agent presets and accounts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPresets {
    #[serde(default)]
    pub presets: BTreeMap<String, AgentPreset>,
}

impl AgentPresets {
    pub fn default_preset(&self) -> Option<(&String, &AgentPreset)> {
        self.presets.iter().find(|(_, p)| p.default)
    }
}

/// Load and parse a JSON config file.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, GtError> {
    if !path.exists() {
        return Err(GtError::ConfigNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| GtError::ConfigParse(format!("{}: {e}", path.display())))
}

/// Load a JSON config file, falling back to `T::default()` when absent.
pub fn load_json_or_default<T>(path: &Path) -> Result<T, GtError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    load_json(path)
}

/// Write a JSON config file, creating parent directories.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), GtError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| GtError::ConfigParse(e.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn town_config_defaults() {
        let cfg: TownConfig = serde_json::from_str(r#"{"name":"citadel"}"#).unwrap();
        assert_eq!(cfg.name, "citadel");
        assert_eq!(cfg.default_agent, "claude");
    }

    #[test]
    fn rigs_config_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mayor").join("rigs.json");
        let mut cfg = RigsConfig::default();
        cfg.rigs.insert(
            "demo".into(),
            RigEntry {
                git_url: "https://example.com/demo.git".into(),
                added_at: None,
            },
        );
        save_json(&path, &cfg).unwrap();
        let loaded: RigsConfig = load_json(&path).unwrap();
        assert_eq!(loaded.rigs["demo"].git_url, "https://example.com/demo.git");
    }

    #[test]
    fn missing_config_is_not_found() {
        let dir = tempdir().unwrap();
        let err = load_json::<TownConfig>(&dir.path().join("town.json")).unwrap_err();
        assert!(matches!(err, GtError::ConfigNotFound(_)));
        let settings: RigSettings =
            load_json_or_default(&dir.path().join("config.json")).unwrap();
        assert!(settings.runtime.is_none());
    }

    #[test]
    fn merge_strategy_wire_format() {
        assert_eq!(
            serde_json::to_string(&MergeStrategy::RebaseFf).unwrap(),
            r#""rebase-ff""#
        );
        assert_eq!(
            serde_json::from_str::<MergeStrategy>(r#""squash""#).unwrap(),
            MergeStrategy::Squash
        );
    }

    #[test]
    fn gates_ordered_skips_unset() {
        let gates = QualityGates {
            setup: None,
            typecheck: Some("cargo check".into()),
            lint: None,
            build: None,
            test: Some("cargo test".into()),
        };
        let ordered = gates.ordered();
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].0, "typecheck");
        assert_eq!(ordered[1].0, "test");
    }

    #[test]
    fn ready_strategy_immediate() {
        assert!(ReadyStrategy::PromptPrefix(String::new()).is_immediate());
        assert!(ReadyStrategy::DelayMs(0).is_immediate());
        assert!(!ReadyStrategy::PromptPrefix(">".into()).is_immediate());
    }

    #[test]
    fn runtime_defaults_for_claude() {
        let rt = RuntimeConfig::for_provider("claude");
        assert_eq!(rt.command, "claude");
        assert!(rt.process_names.contains(&"node".to_string()));
        assert_eq!(rt.config_dir_env.as_deref(), Some("CLAUDE_CONFIG_DIR"));
    }
}
