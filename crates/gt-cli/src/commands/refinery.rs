use clap::Subcommand;
use gt_core::identity::{AgentId, Role};
use gt_runtime::lifecycle::SpawnRequest;
use gt_runtime::refinery::{PrepareOutcome, Refinery, RejectKind};

use crate::context::CliContext;

#[derive(Debug, Subcommand)]
pub enum RefineryCommand {
    /// Start the rig's refinery session
    Start {
        #[arg(long)]
        rig: Option<String>,
    },
    /// Stop the rig's refinery session
    Stop {
        #[arg(long)]
        rig: Option<String>,
    },
    /// Show the derived ready queue
    Ready {
        #[arg(long)]
        rig: Option<String>,
    },
    /// Rebase and gate-check one merge request
    Prepare {
        mr: String,
        #[arg(long)]
        rig: Option<String>,
    },
    /// Prepare and, on success, merge one merge request
    Merge {
        mr: String,
        #[arg(long)]
        rig: Option<String>,
    },
    /// Reject a merge request with a structured reason
    Reject {
        mr: String,
        /// conflict | quality-check | regression
        #[arg(long)]
        kind: String,
        /// Gate name for quality-check / regression rejections
        #[arg(long)]
        gate: Option<String>,
        /// Captured output to attach
        #[arg(long)]
        output: Option<String>,
        #[arg(long)]
        rig: Option<String>,
    },
}

fn refinery_for(ctx: &CliContext, rig: &str) -> anyhow::Result<Refinery> {
    let settings = ctx.rig_settings(rig)?;
    Ok(Refinery::new(&ctx.town, rig, settings))
}

pub async fn run(cmd: &RefineryCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    match cmd {
        RefineryCommand::Start { rig } => {
            let rig = ctx.resolve_rig(rig.as_deref())?;
            let id = AgentId::rig_singleton(Role::Refinery, rig.clone());
            let mut req = SpawnRequest::new(id);
            req.prompt = Some(
                "You are the refinery. Run `gt mq list`, then prepare and merge ready MRs one at a time."
                    .into(),
            );
            let runtime = ctx.runtime_for(Some(&rig), None)?;
            let ledger = ctx.rig_ledger(&rig);
            let outcome = ctx
                .lifecycle()
                .start(&req, &runtime, &ledger, &ctx.cancel)
                .await?;
            println!("Refinery for '{rig}': {outcome:?}");
            Ok(())
        }
        RefineryCommand::Stop { rig } => {
            let rig = ctx.resolve_rig(rig.as_deref())?;
            let session = AgentId::rig_singleton(Role::Refinery, rig.clone()).session_name();
            ctx.tmux.kill(&session).await?;
            println!("Refinery for '{rig}' stopped.");
            Ok(())
        }
        RefineryCommand::Ready { rig } => {
            let rig = ctx.resolve_rig(rig.as_deref())?;
            let refinery = refinery_for(&ctx, &rig)?;
            let list = refinery.ready_list(&ctx.cancel).await?;
            println!("{} ready, {} anomalies", list.ready.len(), list.anomalies.len());
            for entry in &list.ready {
                println!("  {}\t{}", entry.issue.id, entry.meta.source_branch);
            }
            Ok(())
        }
        RefineryCommand::Prepare { mr, rig } => {
            let rig = ctx.resolve_rig(rig.as_deref())?;
            let refinery = refinery_for(&ctx, &rig)?;
            refinery.claim(mr, &ctx.cancel).await?;
            match refinery.prepare(mr, &ctx.bus(), &ctx.cancel).await? {
                PrepareOutcome::Ready(prepared) => {
                    println!("Prepared {mr} at {} ({})", prepared.head_sha, prepared.temp_branch);
                }
                PrepareOutcome::ConflictDetected { task_id } => {
                    println!("Conflict detected; filed {task_id} and blocked {mr}.");
                }
                PrepareOutcome::GateFailed { gate, output } => {
                    println!("Gate '{gate}' failed:\n{output}");
                    println!("Diagnose, then `gt refinery reject {mr} --kind quality-check|regression --gate {gate}`.");
                }
            }
            Ok(())
        }
        RefineryCommand::Merge { mr, rig } => {
            let rig = ctx.resolve_rig(rig.as_deref())?;
            let refinery = refinery_for(&ctx, &rig)?;
            refinery.claim(mr, &ctx.cancel).await?;
            let bus = ctx.bus();
            match refinery.prepare(mr, &bus, &ctx.cancel).await? {
                PrepareOutcome::Ready(prepared) => {
                    refinery.merge(&prepared, &bus, &ctx.cancel).await?;
                    println!("Merged {mr}.");
                }
                PrepareOutcome::ConflictDetected { task_id } => {
                    println!("Conflict detected; filed {task_id}. Not merged.");
                }
                PrepareOutcome::GateFailed { gate, output } => {
                    println!("Gate '{gate}' failed; not merged.\n{output}");
                }
            }
            Ok(())
        }
        RefineryCommand::Reject {
            mr,
            kind,
            gate,
            output,
            rig,
        } => {
            let rig = ctx.resolve_rig(rig.as_deref())?;
            let refinery = refinery_for(&ctx, &rig)?;
            let gate = gate.clone().unwrap_or_else(|| "test".into());
            let output = output.clone().unwrap_or_default();
            let kind = match kind.as_str() {
                "conflict" => RejectKind::Conflict {
                    conflict_sha: String::new(),
                    detail: output,
                },
                "quality-check" => RejectKind::QualityCheck { gate, output },
                "regression" => RejectKind::Regression { gate, output },
                other => anyhow::bail!(gt_core::GtError::ValidationFailed {
                    message: format!("unknown reject kind '{other}'"),
                    suggestion: "conflict|quality-check|regression".into(),
                }),
            };
            let task = refinery.reject(mr, kind, &ctx.bus(), &ctx.cancel).await?;
            match task {
                Some(task_id) => println!("Rejected {mr}; filed {task_id}."),
                None => println!("Rejected {mr}."),
            }
            Ok(())
        }
    }
}
