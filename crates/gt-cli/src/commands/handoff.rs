use chrono::Utc;
use clap::Args;
use gt_core::checkpoint::Checkpoint;
use gt_runtime::git::Git;

/// Save context for the next session in this workspace.
#[derive(Debug, Args)]
pub struct HandoffCommand {
    /// Free-form notes for the successor
    #[arg(short, long)]
    pub notes: Option<String>,
}

pub async fn run(cmd: &HandoffCommand) -> anyhow::Result<()> {
    let workdir = std::env::current_dir()?;
    let git = Git::at(&workdir);

    let branch = git
        .run(&["rev-parse", "--abbrev-ref", "HEAD"])
        .await
        .ok()
        .filter(|o| o.success())
        .map(|o| o.stdout.trim().to_string());
    let last_commit = git.head_sha().await.ok();
    let modified_files = git
        .status_porcelain()
        .await
        .map(|s| {
            s.lines()
                .filter_map(|l| l.get(3..).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let checkpoint = Checkpoint {
        hooked_work: std::env::var("GT_HOOK").ok().filter(|h| !h.is_empty()),
        branch,
        last_commit,
        modified_files,
        notes: cmd.notes.clone(),
        timestamp: Utc::now(),
    };
    checkpoint.write(&workdir)?;
    println!("Checkpoint written. The next session picks it up via `gt prime`.");
    Ok(())
}
