use std::time::Duration;

use clap::Args;
use gt_core::feed::{FeedTailer, TAIL_POLL_MS};

use crate::context::CliContext;

/// Tail a rig's activity feed.
#[derive(Debug, Args)]
pub struct FeedCommand {
    #[arg(long)]
    pub rig: Option<String>,
    /// Keep following instead of printing the backlog once
    #[arg(short, long)]
    pub follow: bool,
    /// Emit raw JSONL instead of the human layout
    #[arg(long)]
    pub json: bool,
}

pub async fn run(cmd: &FeedCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    let rig = ctx.resolve_rig(cmd.rig.as_deref())?;
    let path = ctx.town.rig(&rig).feed_path();

    let mut tailer = if cmd.follow {
        FeedTailer::from_end(&path)?
    } else {
        FeedTailer::from_offset(&path, 0)
    };

    loop {
        for event in tailer.poll()? {
            if cmd.json {
                println!("{}", serde_json::to_string(&event)?);
            } else {
                println!(
                    "{}  {:<10} {:<20} {} {}",
                    event.time.format("%H:%M:%S"),
                    event.kind,
                    event.actor,
                    event.target,
                    event.message
                );
            }
        }
        if !cmd.follow {
            return Ok(());
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_millis(TAIL_POLL_MS)) => {}
        }
    }
}
