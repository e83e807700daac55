use clap::Args;
use gt_core::schedmeta::SchedulerMetadata;
use gt_runtime::scheduler::Scheduler;

use crate::context::CliContext;

/// Schedule an issue for dispatch to a worker.
///
/// The default formula is always `polecat-work`; slinging a conflict
/// task requires `--formula polecat-conflict-resolve` explicitly.
#[derive(Debug, Args)]
pub struct SlingCommand {
    /// Issue id to schedule
    pub issue: String,
    /// Target rig (inferred from the current directory when omitted)
    #[arg(long)]
    pub rig: Option<String>,
    /// Workflow formula for the worker
    #[arg(long)]
    pub formula: Option<String>,
    /// Formula variables, repeatable (KEY=VALUE)
    #[arg(long = "var")]
    pub vars: Vec<String>,
    /// Extra formula arguments, repeatable
    #[arg(long = "arg")]
    pub args: Vec<String>,
    /// Account preset for the worker's LLM
    #[arg(long)]
    pub account: Option<String>,
    /// Base branch the worker starts from
    #[arg(long)]
    pub base_branch: Option<String>,
    /// Convoy to associate with
    #[arg(long)]
    pub convoy: Option<String>,
    /// Hand the raw bead to the worker instead of a formula rendering
    #[arg(long)]
    pub hook_raw_bead: bool,
}

pub async fn run(cmd: &SlingCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    let rig = ctx.resolve_rig(cmd.rig.as_deref())?;

    let meta = SchedulerMetadata {
        target_rig: rig.clone(),
        formula: cmd.formula.clone().unwrap_or_default(),
        args: cmd.args.clone(),
        vars: cmd.vars.clone(),
        account: cmd.account.clone(),
        base_branch: cmd.base_branch.clone(),
        convoy: cmd.convoy.clone(),
        hook_raw_bead: cmd.hook_raw_bead,
        ..Default::default()
    };

    let scheduler = Scheduler::new(&ctx.town, &rig);
    scheduler.schedule(&cmd.issue, meta, &ctx.cancel).await?;
    println!("Queued {} on rig '{rig}'.", cmd.issue);
    Ok(())
}
