use clap::Args;
use gt_core::identity::{AgentId, Role};
use gt_runtime::ledger::UpdateFields;

use crate::context::CliContext;

/// Raise an issue to critical priority and alert the mayor.
#[derive(Debug, Args)]
pub struct EscalateCommand {
    /// Issue id
    pub issue: String,
    /// Why this needs attention now
    #[arg(short, long)]
    pub reason: Option<String>,
    #[arg(long)]
    pub rig: Option<String>,
}

pub async fn run(cmd: &EscalateCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    let rig = ctx.resolve_rig(cmd.rig.as_deref())?;
    let ledger = ctx.rig_ledger(&rig);
    ledger
        .update(
            &cmd.issue,
            &UpdateFields {
                priority: Some(0),
                ..Default::default()
            },
            &ctx.cancel,
        )
        .await?;

    let from = ctx
        .self_id()
        .unwrap_or_else(|| AgentId::town(Role::Mayor));
    let reason = cmd.reason.clone().unwrap_or_else(|| "no reason given".into());
    ctx.bus()
        .send(
            &from,
            &AgentId::town(Role::Mayor),
            &format!("ESCALATED {}", cmd.issue),
            &reason,
            &ctx.cancel,
        )
        .await?;
    println!("Escalated {} to priority 0.", cmd.issue);
    Ok(())
}
