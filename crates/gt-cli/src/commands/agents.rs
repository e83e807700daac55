use chrono::Utc;
use clap::Subcommand;
use gt_core::identity::{parse_session_name, AgentId};
use gt_runtime::lifecycle::{CleanupStatus, SessionState, SpawnRequest};

use crate::context::CliContext;

#[derive(Debug, Subcommand)]
pub enum AgentsCommand {
    /// List agent sessions and their observed states
    List {
        #[arg(long)]
        rig: Option<String>,
    },
    /// Report session/record discrepancies for a rig
    Reconcile {
        #[arg(long)]
        rig: Option<String>,
    },
    /// Start an agent by address (rig/role/worker)
    Start {
        address: String,
        /// Work item to hook
        #[arg(long)]
        hook: Option<String>,
        /// Agent preset / account name
        #[arg(long)]
        preset: Option<String>,
    },
    /// Kill a worker session and clean up its workspace
    Nuke {
        address: String,
        /// Override the published cleanup status
        #[arg(long)]
        cleanup: Option<String>,
    },
}

pub async fn run(cmd: &AgentsCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    match cmd {
        AgentsCommand::List { rig } => {
            let sessions = ctx.tmux.list().await?;
            for session in sessions {
                let Some(id) = parse_session_name(&session) else {
                    continue;
                };
                if let Some(rig) = rig {
                    if id.rig.as_deref() != Some(rig.as_str()) {
                        continue;
                    }
                }
                let runtime = ctx.runtime_for(id.rig.as_deref(), None)?;
                let state = ctx
                    .lifecycle()
                    .classify(&session, &runtime, true)
                    .await?;
                let marker = match state {
                    SessionState::LlmRunning => "running",
                    SessionState::LlmDeadShellAlive => "ZOMBIE",
                    SessionState::ShellOnly => "shell",
                    SessionState::Absent => "absent",
                };
                println!("{session}\t{}\t{marker}", id.render());
            }
            Ok(())
        }
        AgentsCommand::Reconcile { rig } => {
            let rig = ctx.resolve_rig(rig.as_deref())?;
            let runtime = ctx.runtime_for(Some(&rig), None)?;
            let ledger = ctx.rig_ledger(&rig);
            let discrepancies = ctx
                .lifecycle()
                .reconcile(&ledger, &runtime, &ctx.cancel)
                .await?;
            if discrepancies.is_empty() {
                println!("Sessions and records agree.");
                return Ok(());
            }
            for d in discrepancies {
                println!("{d:?}");
            }
            Ok(())
        }
        AgentsCommand::Start {
            address,
            hook,
            preset,
        } => {
            let id = AgentId::parse(address)?;
            let rig = id.rig.clone();
            let mut req = SpawnRequest::new(id);
            req.hook = hook.clone();
            req.preset = preset.clone();
            let runtime = ctx.runtime_for(rig.as_deref(), preset.as_deref())?;
            let ledger = match &rig {
                Some(rig) => ctx.rig_ledger(rig),
                None => ctx.town_ledger(),
            };
            let outcome = ctx
                .lifecycle()
                .start(&req, &runtime, &ledger, &ctx.cancel)
                .await?;
            println!("{address}: {outcome:?}");
            Ok(())
        }
        AgentsCommand::Nuke { address, cleanup } => {
            let id = AgentId::parse(address)?;
            let hint = match cleanup {
                Some(s) => Some(s.parse::<CleanupStatus>()?),
                None => None,
            };
            let ledger = match &id.rig {
                Some(rig) => ctx.rig_ledger(rig),
                None => ctx.town_ledger(),
            };
            // Detection is "now": the caller observed the zombie before
            // invoking us, and the TOCTOU guard compares against this.
            let outcome = ctx
                .lifecycle()
                .nuke(&id, hint, Utc::now(), &ledger, &ctx.cancel)
                .await?;
            println!("{address}: {outcome:?}");
            Ok(())
        }
    }
}
