use std::path::PathBuf;

use clap::Args;

#[derive(Debug, Args)]
pub struct InitCommand {
    /// Town name
    pub name: String,
    /// Directory to create the town in (default: current directory)
    #[arg(long)]
    pub path: Option<PathBuf>,
}

pub fn run(cmd: &InitCommand) -> anyhow::Result<()> {
    let root = match &cmd.path {
        Some(p) => p.clone(),
        None => std::env::current_dir()?,
    };
    let town = gt_runtime::town_ops::init_town(&root, &cmd.name)?;
    println!("Town '{}' ready at {}", cmd.name, town.root().display());
    println!("Next: `gt rig add <name> <git-url>`");
    Ok(())
}
