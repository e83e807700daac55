use chrono::{Duration, Utc};
use clap::Subcommand;
use gt_runtime::town_ops::{GateType, Gates};

use crate::context::CliContext;

#[derive(Debug, Subcommand)]
pub enum GateCommand {
    /// Create a gate blocking downstream work
    Create {
        /// timer | external-run | external-pr | human | mail
        gate_type: String,
        title: String,
        /// Minutes until a timer gate opens
        #[arg(long)]
        after_minutes: Option<i64>,
        #[arg(long)]
        rig: Option<String>,
    },
    /// Close a gate
    Close {
        id: String,
        #[arg(long)]
        rig: Option<String>,
    },
    /// List open gates
    List {
        #[arg(long)]
        rig: Option<String>,
    },
    /// Close due timer gates (patrol duty)
    Sweep {
        #[arg(long)]
        rig: Option<String>,
    },
}

fn gates_for(ctx: &CliContext, rig: Option<&str>) -> anyhow::Result<Gates> {
    let ledger = match rig {
        Some(rig) => ctx.rig_ledger(rig),
        None => ctx.town_ledger(),
    };
    Ok(Gates::new(ledger))
}

pub async fn run(cmd: &GateCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    match cmd {
        GateCommand::Create {
            gate_type,
            title,
            after_minutes,
            rig,
        } => {
            let gate_type = GateType::parse(gate_type).ok_or_else(|| {
                anyhow::anyhow!("unknown gate type '{gate_type}' (timer|external-run|external-pr|human|mail)")
            })?;
            let due = after_minutes.map(|m| Utc::now() + Duration::minutes(m));
            let gates = gates_for(&ctx, rig.as_deref())?;
            let id = gates.create(gate_type, title, due, &ctx.cancel).await?;
            println!("Gate {id} created.");
            Ok(())
        }
        GateCommand::Close { id, rig } => {
            gates_for(&ctx, rig.as_deref())?
                .close(id, &ctx.cancel)
                .await?;
            println!("Gate {id} closed.");
            Ok(())
        }
        GateCommand::List { rig } => {
            let open = gates_for(&ctx, rig.as_deref())?
                .list_open(&ctx.cancel)
                .await?;
            if open.is_empty() {
                println!("No open gates.");
                return Ok(());
            }
            for gate in open {
                println!("{}\t{}", gate.id, gate.title);
            }
            Ok(())
        }
        GateCommand::Sweep { rig } => {
            let closed = gates_for(&ctx, rig.as_deref())?
                .sweep_timers(Utc::now(), &ctx.cancel)
                .await?;
            println!("Closed {} due timer gates.", closed.len());
            Ok(())
        }
    }
}
