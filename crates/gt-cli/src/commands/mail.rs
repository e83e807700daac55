use clap::Subcommand;
use gt_core::identity::AgentId;

use crate::context::CliContext;

#[derive(Debug, Subcommand)]
pub enum MailCommand {
    /// Show the current agent's inbox
    Inbox {
        /// Read another agent's inbox instead
        #[arg(long)]
        of: Option<String>,
    },
    /// Send a message
    Send {
        /// Recipient address (role | rig/role | rig/role/worker)
        to: String,
        /// Subject line
        #[arg(short, long)]
        subject: String,
        /// Message body
        #[arg(short, long, default_value = "")]
        message: String,
    },
    /// Read a message (marks it read)
    Read {
        /// Message id
        id: String,
    },
    /// Archive a message
    Archive {
        /// Message id
        id: String,
    },
}

pub async fn run(cmd: &MailCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    let bus = ctx.bus();
    match cmd {
        MailCommand::Inbox { of } => {
            let recipient = match of {
                Some(addr) => AgentId::parse(addr)?,
                None => ctx.self_id().ok_or_else(|| {
                    anyhow::anyhow!("cannot determine recipient here; pass --of <address>")
                })?,
            };
            let messages = bus.inbox(&recipient, &ctx.cancel).await?;
            if messages.is_empty() {
                println!("Inbox empty.");
                return Ok(());
            }
            for m in messages {
                let marker = if m.unread { "*" } else { " " };
                println!(
                    "{marker} {}\t{}\t{}",
                    m.id,
                    m.from.as_deref().unwrap_or("-"),
                    m.subject
                );
            }
            Ok(())
        }
        MailCommand::Send { to, subject, message } => {
            let from = ctx
                .self_id()
                .unwrap_or_else(|| AgentId::town(gt_core::identity::Role::Mayor));
            let to = AgentId::parse(to)?;
            let id = bus.send(&from, &to, subject, message, &ctx.cancel).await?;
            println!("Sent {id}.");
            Ok(())
        }
        MailCommand::Read { id } => {
            let message = bus.read(id, &ctx.cancel).await?;
            println!("From:    {}", message.from.as_deref().unwrap_or("-"));
            println!("To:      {}", message.to);
            println!("Subject: {}", message.subject);
            if !message.body.is_empty() {
                println!("\n{}", message.body);
            }
            Ok(())
        }
        MailCommand::Archive { id } => {
            bus.archive(id, &ctx.cancel).await?;
            println!("Archived {id}.");
            Ok(())
        }
    }
}
