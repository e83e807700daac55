use clap::Args;

use crate::context::CliContext;

/// Show the current agent's hooked work item.
#[derive(Debug, Args)]
pub struct HookCommand {
    /// Print full issue details instead of the bare id
    #[arg(long)]
    pub full: bool,
    /// Emit the issue as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(cmd: &HookCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    let hook = std::env::var("GT_HOOK").ok().filter(|h| !h.is_empty());
    let Some(hook) = hook else {
        println!("Nothing hooked.");
        return Ok(());
    };
    if !cmd.full && !cmd.json {
        println!("{hook}");
        return Ok(());
    }
    let rig = ctx.resolve_rig(None)?;
    let issue = ctx.rig_ledger(&rig).show(&hook, &ctx.cancel).await?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&issue)?);
        return Ok(());
    }
    println!("{}\t{}\t{}", issue.id, issue.status.as_str(), issue.title);
    if !issue.description.is_empty() {
        println!("\n{}", issue.description);
    }
    Ok(())
}
