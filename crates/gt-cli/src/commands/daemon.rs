use clap::Args;
use gt_runtime::watchdog::HeartbeatSupervisor;

use crate::context::CliContext;

/// Run the tier-1 Heartbeat Supervisor in the foreground. Pure code:
/// it never calls an LLM, only the filesystem and the multiplexer.
#[derive(Debug, Args)]
pub struct DaemonCommand {
    /// Run one tick and exit (for cron-style hosting)
    #[arg(long)]
    pub once: bool,
}

pub async fn run(cmd: &DaemonCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    let runtime = ctx.runtime_for(None, None)?;
    let supervisor = HeartbeatSupervisor::new(ctx.town.clone(), ctx.tmux.clone(), runtime);

    if cmd.once {
        supervisor.tick().await?;
        return Ok(());
    }
    println!("Heartbeat supervisor running (3m tick). Ctrl-C to stop.");
    supervisor.run(&ctx.cancel).await;
    Ok(())
}
