use gt_core::workspace::Town;

use crate::context::CliContext;

/// Preflight: tools on PATH, a workspace marker, a reachable ledger.
pub async fn run() -> anyhow::Result<()> {
    let mut problems = 0;

    for (binary, arg) in [("tmux", "-V"), ("git", "--version"), ("bd", "--version")] {
        let ok = tokio::process::Command::new(binary)
            .arg(arg)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if ok {
            println!("[ok] {binary}");
        } else {
            println!("[!!] {binary} missing — run `gt install` for hints");
            problems += 1;
        }
    }

    let cwd = std::env::current_dir()?;
    match Town::find(&cwd) {
        Ok(town) => {
            println!("[ok] town at {}", town.root().display());
            let ctx = CliContext::resolve()?;
            let registry = ctx.registry()?;
            println!("[ok] {} rigs registered", registry.rigs.len());
            for rig in registry.rigs.keys() {
                let paths = ctx.town.rig(rig);
                if !paths.beads_dir().exists() {
                    println!("[!!] rig '{rig}' has no .beads directory — run `bd init` there");
                    problems += 1;
                }
                if !paths.refinery_clone().join(".git").exists() {
                    println!("[!!] rig '{rig}' refinery clone missing");
                    problems += 1;
                }
            }
            match ctx.town_ledger().sync(&ctx.cancel).await {
                Ok(()) => println!("[ok] town ledger reachable"),
                Err(e) => {
                    println!("[!!] town ledger: {e}");
                    problems += 1;
                }
            }
        }
        Err(_) => {
            println!("[--] not inside a town (run `gt init <name>` to create one)");
        }
    }

    if problems > 0 {
        anyhow::bail!("{problems} problems found");
    }
    println!("\nAll clear.");
    Ok(())
}
