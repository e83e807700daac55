use clap::Subcommand;
use gt_core::identity::{AgentId, Role};
use gt_runtime::lifecycle::SpawnRequest;

use crate::context::CliContext;

#[derive(Debug, Subcommand)]
pub enum WitnessCommand {
    /// Start the rig's witness session
    Start {
        #[arg(long)]
        rig: Option<String>,
    },
    /// Stop the rig's witness session
    Stop {
        #[arg(long)]
        rig: Option<String>,
    },
}

pub async fn run(cmd: &WitnessCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    match cmd {
        WitnessCommand::Start { rig } => {
            let rig = ctx.resolve_rig(rig.as_deref())?;
            let id = AgentId::rig_singleton(Role::Witness, rig.clone());
            let mut req = SpawnRequest::new(id);
            req.prompt = Some(
                "You are the witness. Run `gt status --rig` each cycle: reconcile agents, \
                 dispatch stranded work, sweep gates, and sleep with backoff when idle."
                    .into(),
            );
            let runtime = ctx.runtime_for(Some(&rig), None)?;
            let ledger = ctx.rig_ledger(&rig);
            let outcome = ctx
                .lifecycle()
                .start(&req, &runtime, &ledger, &ctx.cancel)
                .await?;
            println!("Witness for '{rig}': {outcome:?}");
            Ok(())
        }
        WitnessCommand::Stop { rig } => {
            let rig = ctx.resolve_rig(rig.as_deref())?;
            let session = AgentId::rig_singleton(Role::Witness, rig.clone()).session_name();
            ctx.tmux.kill(&session).await?;
            println!("Witness for '{rig}' stopped.");
            Ok(())
        }
    }
}
