use clap::Subcommand;

use crate::context::CliContext;

#[derive(Debug, Subcommand)]
pub enum RigCommand {
    /// Register a repository as a rig (clone + directory tree + registry)
    Add {
        /// Rig name ([a-z][a-z0-9_-]*)
        name: String,
        /// Git URL of the repository
        git_url: String,
    },
    /// List registered rigs
    List,
}

pub async fn run(cmd: &RigCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    match cmd {
        RigCommand::Add { name, git_url } => {
            gt_runtime::town_ops::add_rig(&ctx.town, name, git_url).await?;
            println!("Rig '{name}' added.");
            println!("Start its services with `gt witness start --rig {name}` and `gt refinery start --rig {name}`.");
            Ok(())
        }
        RigCommand::List => {
            let registry = ctx.registry()?;
            if registry.rigs.is_empty() {
                println!("No rigs registered.");
                return Ok(());
            }
            for (name, entry) in &registry.rigs {
                println!("{name}\t{}", entry.git_url);
            }
            Ok(())
        }
    }
}
