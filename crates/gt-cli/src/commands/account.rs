use clap::Subcommand;
use gt_core::config::{load_json_or_default, save_json, AgentPreset, AgentPresets, RuntimeConfig};

use crate::context::CliContext;

#[derive(Debug, Subcommand)]
pub enum AccountCommand {
    /// Register an agent account / preset
    Add {
        name: String,
        /// Provider (claude|opencode|codex|gemini|...)
        #[arg(long, default_value = "claude")]
        provider: String,
        /// Provider config directory for this account
        #[arg(long)]
        config_dir: Option<String>,
    },
    /// List registered accounts
    List,
    /// Mark an account as the default
    Default { name: String },
}

pub async fn run(cmd: &AccountCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    let path = ctx.town.agents_json();
    let mut presets: AgentPresets = load_json_or_default(&path)?;
    match cmd {
        AccountCommand::Add {
            name,
            provider,
            config_dir,
        } => {
            presets.presets.insert(
                name.clone(),
                AgentPreset {
                    runtime: Some(RuntimeConfig::for_provider(provider)),
                    config_dir: config_dir.clone(),
                    default: presets.presets.is_empty(),
                },
            );
            save_json(&path, &presets)?;
            println!("Account '{name}' ({provider}) saved.");
            Ok(())
        }
        AccountCommand::List => {
            if presets.presets.is_empty() {
                println!("No accounts registered; the town default provider applies.");
                return Ok(());
            }
            for (name, preset) in &presets.presets {
                let provider = preset
                    .runtime
                    .as_ref()
                    .map(|r| r.provider.as_str())
                    .unwrap_or("-");
                let marker = if preset.default { " (default)" } else { "" };
                println!("{name}\t{provider}{marker}");
            }
            Ok(())
        }
        AccountCommand::Default { name } => {
            if !presets.presets.contains_key(name) {
                anyhow::bail!("no account named '{name}'");
            }
            for (key, preset) in presets.presets.iter_mut() {
                preset.default = key == name;
            }
            save_json(&path, &presets)?;
            println!("Default account is now '{name}'.");
            Ok(())
        }
    }
}
