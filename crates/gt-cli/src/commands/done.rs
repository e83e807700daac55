use clap::Args;
use gt_core::identity::Role;
use gt_core::issue::IssueType;
use gt_runtime::lifecycle::{CleanupStatus, Lifecycle};
use gt_runtime::mail::WellKnownSubject;

use crate::context::CliContext;

/// Finish the current worker's task: publish the cleanup status, push
/// the branch, submit the merge request, and tell the witness.
#[derive(Debug, Args)]
pub struct DoneCommand {
    /// Skip the merge-request submission (cleanup report only)
    #[arg(long)]
    pub no_mr: bool,
}

pub async fn run(cmd: &DoneCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    let Some(id) = ctx.self_id() else {
        anyhow::bail!(gt_core::GtError::WorkspaceConflict(
            "gt done must run inside a worker directory".into()
        ));
    };
    let Some(rig) = id.rig.clone() else {
        anyhow::bail!(gt_core::GtError::WorkspaceConflict(
            "gt done must run inside a rig worker directory".into()
        ));
    };
    let worker = id.worker.clone().unwrap_or_default();
    let workdir = std::env::current_dir()?;

    // Publish the cleanup status on the agent record so the watchdog's
    // nuke has a hint to act on.
    let status = Lifecycle::compute_cleanup_status(&workdir).await;
    let ledger = ctx.rig_ledger(&rig);
    publish_cleanup(&ctx, &ledger, &id.render(), status).await?;
    println!("Cleanup status: {:?}", status);

    if cmd.no_mr {
        return Ok(());
    }

    let git = gt_runtime::git::Git::at(&workdir);
    let branch_out = git.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    if !branch_out.success() {
        anyhow::bail!("cannot determine current branch");
    }
    let branch = branch_out.stdout.trim().to_string();
    git.push("origin", &branch).await?;

    let hook = std::env::var("GT_HOOK").ok().filter(|h| !h.is_empty());
    let settings = ctx.rig_settings(&rig)?;
    let mr_id = super::mq::submit_mr(
        &ctx,
        &rig,
        &branch,
        settings.target_branch(),
        hook,
        &worker,
        &ctx.cancel,
    )
    .await?;
    println!("Submitted {mr_id} for {branch}.");

    let bus = ctx.bus();
    let witness = gt_core::identity::AgentId::rig_singleton(Role::Witness, rig.clone());
    bus.send(
        &id,
        &witness,
        &WellKnownSubject::MergeReady {
            worker: worker.clone(),
        }
        .render(),
        &format!("{branch} submitted as {mr_id}"),
        &ctx.cancel,
    )
    .await?;
    if id.role == Role::Polecat {
        bus.send(
            &id,
            &witness,
            &WellKnownSubject::PolecatDone.render(),
            &format!("{worker} finished its work item"),
            &ctx.cancel,
        )
        .await?;
    }
    Ok(())
}

async fn publish_cleanup(
    ctx: &CliContext,
    ledger: &gt_runtime::ledger::Ledger,
    addr: &str,
    status: CleanupStatus,
) -> anyhow::Result<()> {
    use gt_core::issue::labels;
    use gt_runtime::ledger::{ListFilter, UpdateFields};

    let filter = ListFilter {
        issue_type: Some(IssueType::Agent),
        labels: vec![labels::AGENT.to_string()],
        ..Default::default()
    };
    let records = ledger.list(&filter, &ctx.cancel).await?;
    if let Some(record) = records.into_iter().find(|r| r.title == addr) {
        let remove: Vec<String> = [
            CleanupStatus::Clean,
            CleanupStatus::HasUncommitted,
            CleanupStatus::HasStash,
            CleanupStatus::HasUnpushed,
        ]
        .iter()
        .map(|s| s.as_label().to_string())
        .filter(|l| record.has_label(l))
        .collect();
        ledger
            .update(
                &record.id,
                &UpdateFields {
                    add_labels: vec![status.as_label().to_string()],
                    remove_labels: remove,
                    ..Default::default()
                },
                &ctx.cancel,
            )
            .await?;
    }
    Ok(())
}
