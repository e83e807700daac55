use clap::Args;
use gt_core::checkpoint::Checkpoint;
use gt_core::identity::Role;
use gt_runtime::watchdog::Heartbeat;

use crate::context::CliContext;

/// Print the context a fresh agent session needs: who it is, what is
/// hooked, any checkpoint from the predecessor, and waiting mail.
#[derive(Debug, Args)]
pub struct PrimeCommand {
    /// Role name override (e.g. `deacon` when invoked by the supervisor)
    pub role: Option<String>,
}

pub async fn run(cmd: &PrimeCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    let id = match (&cmd.role, ctx.self_id()) {
        (Some(role), _) => gt_core::identity::AgentId::town(role.parse()?),
        (None, Some(id)) => id,
        (None, None) => anyhow::bail!(gt_core::GtError::WorkspaceConflict(
            "cannot determine a role here; run inside an agent directory".into()
        )),
    };
    println!("You are {}.", id.render());

    // The deacon's prime doubles as its heartbeat.
    if id.role == Role::Deacon {
        Heartbeat::touch(&ctx.town.deacon_heartbeat())?;
    }

    if let Ok(hook) = std::env::var("GT_HOOK") {
        if !hook.is_empty() {
            println!("Hooked work: {hook}");
        }
    }

    let workdir = std::env::current_dir()?;
    if let Some(checkpoint) = Checkpoint::read(&workdir)? {
        println!("\nCheckpoint from the previous session ({}):", checkpoint.timestamp);
        if let Some(branch) = &checkpoint.branch {
            println!("  branch: {branch}");
        }
        if let Some(work) = &checkpoint.hooked_work {
            println!("  hooked work: {work}");
        }
        if !checkpoint.modified_files.is_empty() {
            println!("  modified: {}", checkpoint.modified_files.join(", "));
        }
        if let Some(notes) = &checkpoint.notes {
            println!("  notes: {notes}");
        }
    }

    let bus = ctx.bus();
    let inbox = bus.inbox(&id, &ctx.cancel).await?;
    let unread: Vec<_> = inbox.iter().filter(|m| m.unread).collect();
    if unread.is_empty() {
        println!("\nInbox empty.");
    } else {
        println!("\nUnread mail:");
        for message in unread {
            println!(
                "  {}\t{}\t{}",
                message.id,
                message.from.as_deref().unwrap_or("-"),
                message.subject
            );
        }
    }
    Ok(())
}
