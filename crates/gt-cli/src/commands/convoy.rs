use clap::Subcommand;
use gt_runtime::town_ops::Convoys;

use crate::context::CliContext;

#[derive(Debug, Subcommand)]
pub enum ConvoyCommand {
    /// Create a convoy tracking a set of issues
    Create {
        title: String,
        /// Tracked issue ids
        #[arg(required = true)]
        issues: Vec<String>,
    },
    /// Evaluate one convoy (auto-closes when all tracked issues close)
    Status { id: String },
    /// List open convoys
    List,
}

pub async fn run(cmd: &ConvoyCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    let convoys = Convoys::new(&ctx.town);
    match cmd {
        ConvoyCommand::Create { title, issues } => {
            let id = convoys.create(title, issues, &ctx.cancel).await?;
            println!("Convoy {id} tracking {} issues.", issues.len());
            Ok(())
        }
        ConvoyCommand::Status { id } => {
            // Issue ids are prefixed with their rig's namespace; fall
            // back to the town ledger for anything unrecognized.
            let town = ctx.town.clone();
            let registry = ctx.registry()?;
            let resolve = move |issue_id: &str| {
                for rig in registry.rigs.keys() {
                    if issue_id.starts_with(&format!("{rig}-")) {
                        return gt_runtime::ledger::Ledger::new(town.rig(rig).root());
                    }
                }
                gt_runtime::ledger::Ledger::new(town.root())
            };
            let status = convoys.status(id, &resolve, &ctx.cancel).await?;
            println!(
                "{}: {}/{} closed{}",
                status.title,
                status.closed,
                status.total,
                if status.auto_closed { " — convoy closed" } else { "" }
            );
            Ok(())
        }
        ConvoyCommand::List => {
            let open = convoys.list(&ctx.cancel).await?;
            if open.is_empty() {
                println!("No open convoys.");
                return Ok(());
            }
            for convoy in open {
                println!("{}\t{}", convoy.id, convoy.title);
            }
            Ok(())
        }
    }
}
