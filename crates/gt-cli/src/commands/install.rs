use tokio::process::Command;

async fn have(binary: &str, version_arg: &str) -> bool {
    Command::new(binary)
        .arg(version_arg)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Verify the host has everything the orchestrator shells out to.
pub async fn run() -> anyhow::Result<()> {
    let mut missing = Vec::new();

    for (binary, arg, hint) in [
        ("tmux", "-V", "install tmux 3.2 or newer"),
        ("git", "--version", "install git"),
        ("bd", "--version", "install the beads issue database"),
    ] {
        if have(binary, arg).await {
            println!("[ok] {binary}");
        } else {
            println!("[!!] {binary} not found — {hint}");
            missing.push(binary);
        }
    }

    if missing.is_empty() {
        println!("\nEnvironment ready. Run `gt init <name>` to create a town.");
        Ok(())
    } else {
        anyhow::bail!("missing required tools: {}", missing.join(", "));
    }
}
