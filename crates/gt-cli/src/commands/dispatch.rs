use clap::Args;
use gt_runtime::scheduler::{CycleReport, Readiness, Scheduler};
use gt_runtime::watchdog::{wait_for_cycle, IdleBackoff, WakeReason};

use crate::context::CliContext;

/// Run a scheduler cycle: collect queued items, quarantine repeat
/// failures, filter for readiness, and spawn workers under the caps.
#[derive(Debug, Args)]
pub struct DispatchCommand {
    #[arg(long)]
    pub rig: Option<String>,
    /// Max concurrent workers (0 = unbounded)
    #[arg(long, default_value_t = 4)]
    pub capacity: u32,
    /// Max spawns this cycle
    #[arg(long, default_value_t = 2)]
    pub batch: u32,
    /// Dispatch blocked items too
    #[arg(long)]
    pub ignore_blockers: bool,
    /// Keep cycling, woken by ledger activity, idle-backed-off otherwise
    #[arg(long)]
    pub watch: bool,
}

pub async fn run(cmd: &DispatchCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    let rig = ctx.resolve_rig(cmd.rig.as_deref())?;
    let readiness = if cmd.ignore_blockers {
        Readiness::AllReady
    } else {
        Readiness::BlockerAware
    };
    let scheduler = Scheduler::new(&ctx.town, &rig).with_readiness(readiness);
    let runtime = ctx.runtime_for(Some(&rig), None)?;
    let lifecycle = ctx.lifecycle();

    if !cmd.watch {
        let report = scheduler
            .cycle(&lifecycle, &runtime, cmd.capacity, cmd.batch, &ctx.cancel)
            .await?;
        print_report(&report);
        return Ok(());
    }

    // Watch mode: the witness's dispatcher loop. Ledger activity wakes
    // it immediately; otherwise it sleeps with exponential backoff.
    let mut activity = ctx
        .rig_ledger(&rig)
        .activity_follow(ctx.cancel.clone())?;
    let mut backoff = IdleBackoff::default();
    loop {
        match scheduler
            .cycle(&lifecycle, &runtime, cmd.capacity, cmd.batch, &ctx.cancel)
            .await
        {
            Ok(report) => {
                if !report.dispatched.is_empty() {
                    backoff.reset();
                }
                print_report(&report);
            }
            Err(e) => tracing::warn!("dispatch cycle failed: {e}; retrying next cycle"),
        }
        if wait_for_cycle(&mut activity, &mut backoff, &ctx.cancel).await
            == WakeReason::Cancelled
        {
            return Ok(());
        }
    }
}

fn print_report(report: &CycleReport) {
    if let Some(plan) = report.plan {
        println!("plan: dispatch {} ({:?})", plan.dispatch, plan.reason);
    }
    for id in &report.dispatched {
        println!("dispatched {id}");
    }
    for id in &report.failed {
        println!("failed {id} (failure count bumped)");
    }
    for id in &report.quarantined {
        println!("quarantined {id}");
    }
    for id in &report.skipped_unparseable {
        println!("skipped {id} (no metadata block)");
    }
}
