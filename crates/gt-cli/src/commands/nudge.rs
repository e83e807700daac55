use clap::Args;
use gt_core::identity::AgentId;

use crate::context::CliContext;

/// Store a message for another agent and best-effort poke its session.
#[derive(Debug, Args)]
pub struct NudgeCommand {
    /// Recipient address
    pub to: String,
    /// Note text
    pub text: String,
}

pub async fn run(cmd: &NudgeCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    let from = ctx
        .self_id()
        .unwrap_or_else(|| AgentId::town(gt_core::identity::Role::Mayor));
    let to = AgentId::parse(&cmd.to)?;
    let id = ctx
        .bus()
        .nudge(&from, &to, &cmd.text, &ctx.cancel)
        .await?;
    println!("Nudged {} ({id}).", to.render());
    Ok(())
}
