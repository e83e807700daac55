use clap::Subcommand;
use gt_runtime::town_ops::Decisions;

use crate::context::CliContext;

#[derive(Debug, Subcommand)]
pub enum DecisionCommand {
    /// Ask the mayor to decide something
    Request {
        /// One-line question
        title: String,
        /// Options and context
        #[arg(short, long, default_value = "")]
        body: String,
    },
    /// Record a resolution and close the decision
    Resolve {
        id: String,
        resolution: String,
    },
    /// List open decisions
    List,
}

pub async fn run(cmd: &DecisionCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    let decisions = Decisions::new(&ctx.town);
    match cmd {
        DecisionCommand::Request { title, body } => {
            let id = decisions.request(title, body, &ctx.cancel).await?;
            println!("Decision {id} requested.");
            Ok(())
        }
        DecisionCommand::Resolve { id, resolution } => {
            decisions.resolve(id, resolution, &ctx.cancel).await?;
            println!("Decision {id} resolved.");
            Ok(())
        }
        DecisionCommand::List => {
            let open = decisions.open(&ctx.cancel).await?;
            if open.is_empty() {
                println!("No open decisions.");
                return Ok(());
            }
            for issue in open {
                println!("{}\t{}", issue.id, issue.title);
            }
            Ok(())
        }
    }
}
