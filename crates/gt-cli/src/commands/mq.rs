use clap::Subcommand;
use gt_core::issue::{labels, IssueType};
use gt_core::mr::MrMetadata;
use gt_runtime::cancel::CancelToken;
use gt_runtime::git::Git;
use gt_runtime::refinery::{Anomaly, Refinery};

use crate::context::CliContext;

#[derive(Debug, Subcommand)]
pub enum MqCommand {
    /// Submit the current branch (or an explicit one) as a merge request
    Submit {
        /// Source branch; defaults to the current branch
        #[arg(long)]
        branch: Option<String>,
        /// Target branch; defaults to the rig's configured target
        #[arg(long)]
        target: Option<String>,
        /// Issue this branch resolves
        #[arg(long)]
        source_issue: Option<String>,
        /// Rig (inferred when omitted)
        #[arg(long)]
        rig: Option<String>,
    },
    /// Show the derived ready queue and anomalies
    List {
        #[arg(long)]
        rig: Option<String>,
    },
    /// Integration branch helpers
    #[command(subcommand)]
    Integration(IntegrationCommand),
}

#[derive(Debug, Subcommand)]
pub enum IntegrationCommand {
    /// Cut an integration branch from the target branch
    Create {
        name: String,
        #[arg(long)]
        rig: Option<String>,
    },
    /// Submit an integration branch for merge
    Land {
        name: String,
        #[arg(long)]
        rig: Option<String>,
    },
}

/// Create the MR ledger item for a branch. Shared by `mq submit` and
/// `gt done`.
pub async fn submit_mr(
    ctx: &CliContext,
    rig: &str,
    source_branch: &str,
    target_branch: &str,
    source_issue: Option<String>,
    worker: &str,
    cancel: &CancelToken,
) -> anyhow::Result<String> {
    let meta = MrMetadata {
        source_branch: source_branch.to_string(),
        target_branch: target_branch.to_string(),
        source_issue,
        worker: worker.to_string(),
        claim: None,
    };
    let ledger = ctx.rig_ledger(rig);
    let id = ledger
        .create(
            IssueType::Task,
            &format!("Merge {source_branch} into {target_branch}"),
            &meta.render(),
            &[labels::MERGE_REQUEST.to_string()],
            Some(2),
            cancel,
        )
        .await?;
    Ok(id)
}

async fn current_branch(ledger_dir: &std::path::Path) -> anyhow::Result<String> {
    let git = Git::at(ledger_dir);
    let out = git.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    if !out.success() {
        anyhow::bail!("not on a branch: {}", out.stderr.trim());
    }
    Ok(out.stdout.trim().to_string())
}

pub async fn run(cmd: &MqCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    match cmd {
        MqCommand::Submit {
            branch,
            target,
            source_issue,
            rig,
        } => {
            let rig = ctx.resolve_rig(rig.as_deref())?;
            let settings = ctx.rig_settings(&rig)?;
            let source = match branch {
                Some(b) => b.clone(),
                None => current_branch(&std::env::current_dir()?).await?,
            };
            let target = target
                .clone()
                .unwrap_or_else(|| settings.target_branch().to_string());
            let worker = ctx
                .self_id()
                .and_then(|id| id.worker)
                .unwrap_or_else(|| "manual".into());
            let id = submit_mr(
                &ctx,
                &rig,
                &source,
                &target,
                source_issue.clone(),
                &worker,
                &ctx.cancel,
            )
            .await?;
            println!("Submitted {id}: {source} -> {target}");
            Ok(())
        }
        MqCommand::List { rig } => {
            let rig = ctx.resolve_rig(rig.as_deref())?;
            let settings = ctx.rig_settings(&rig)?;
            let refinery = Refinery::new(&ctx.town, &rig, settings);
            let list = refinery.ready_list(&ctx.cancel).await?;
            if list.ready.is_empty() && list.anomalies.is_empty() {
                println!("Merge queue is empty.");
                return Ok(());
            }
            for entry in &list.ready {
                println!(
                    "{}\t{} -> {}\t({})",
                    entry.issue.id,
                    entry.meta.source_branch,
                    entry.meta.target_branch,
                    entry.meta.worker
                );
            }
            for anomaly in &list.anomalies {
                match anomaly {
                    Anomaly::StaleClaim { id, holder, minutes } => {
                        println!("[anomaly] {id}: claim by {holder} is {minutes}m old");
                    }
                    Anomaly::MissingMetadata { id } => {
                        println!("[anomaly] {id}: missing metadata section");
                    }
                }
            }
            Ok(())
        }
        MqCommand::Integration(sub) => run_integration(&ctx, sub).await,
    }
}

async fn run_integration(ctx: &CliContext, cmd: &IntegrationCommand) -> anyhow::Result<()> {
    match cmd {
        IntegrationCommand::Create { name, rig } => {
            let rig = ctx.resolve_rig(rig.as_deref())?;
            let settings = ctx.rig_settings(&rig)?;
            let target = settings.target_branch();
            let branch = format!("integration/{name}");
            let git = Git::at(ctx.town.rig(&rig).refinery_clone());
            git.fetch("origin").await?;
            git.checkout_new(&branch, &format!("origin/{target}")).await?;
            git.push("origin", &branch).await?;
            println!("Integration branch {branch} cut from {target}.");
            Ok(())
        }
        IntegrationCommand::Land { name, rig } => {
            let rig = ctx.resolve_rig(rig.as_deref())?;
            let settings = ctx.rig_settings(&rig)?;
            let branch = format!("integration/{name}");
            let id = submit_mr(
                ctx,
                &rig,
                &branch,
                settings.target_branch(),
                None,
                name,
                &ctx.cancel,
            )
            .await?;
            println!("Submitted {id} to land {branch}.");
            Ok(())
        }
    }
}
