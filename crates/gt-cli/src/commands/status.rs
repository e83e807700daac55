use chrono::Utc;
use clap::Args;
use gt_core::identity::{parse_session_name, AgentId, Role};
use gt_runtime::watchdog::{
    file_death_warrant, freshness, triage, Heartbeat, TriageAction, TriageObservation,
};

use crate::context::CliContext;

/// Town status overview. `--triage` is Boot's entry point: observe the
/// Deacon, act per the decision matrix, print the verdict, exit.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Run the Boot triage pass instead of the overview
    #[arg(long)]
    pub triage: bool,
    /// Limit the overview to one rig
    #[arg(long)]
    pub rig: Option<String>,
}

pub async fn run(cmd: &StatusCommand) -> anyhow::Result<()> {
    let ctx = CliContext::resolve()?;
    if cmd.triage {
        return run_triage(&ctx).await;
    }

    // A deacon running `gt status` is alive; refresh its heartbeat.
    if matches!(
        ctx.self_id(),
        Some(AgentId {
            role: Role::Deacon,
            ..
        })
    ) {
        Heartbeat::touch(&ctx.town.deacon_heartbeat())?;
    }

    println!("Town: {}", ctx.town_config.name);

    let sessions = ctx.tmux.list().await?;
    let mut agents: Vec<(String, AgentId)> = sessions
        .iter()
        .filter_map(|s| parse_session_name(s).map(|id| (s.clone(), id)))
        .collect();
    agents.sort_by(|a, b| a.0.cmp(&b.0));
    if agents.is_empty() {
        println!("No agent sessions.");
    } else {
        println!("Sessions:");
        for (session, id) in &agents {
            println!("  {session}\t{}", id.render());
        }
    }

    let hb_age = Heartbeat::age_minutes(&ctx.town.deacon_heartbeat(), Utc::now());
    match hb_age {
        Some(age) => println!("Deacon heartbeat: {age}m old"),
        None => println!("Deacon heartbeat: none"),
    }

    let registry = ctx.registry()?;
    let rigs: Vec<String> = match &cmd.rig {
        Some(rig) => vec![rig.clone()],
        None => registry.rigs.keys().cloned().collect(),
    };
    for rig in rigs {
        let settings = ctx.rig_settings(&rig)?;
        let refinery = gt_runtime::refinery::Refinery::new(&ctx.town, &rig, settings);
        match refinery.ready_list(&ctx.cancel).await {
            Ok(list) => println!(
                "Rig {rig}: {} MRs ready, {} anomalies",
                list.ready.len(),
                list.anomalies.len()
            ),
            Err(e) => println!("Rig {rig}: ledger unavailable ({e})"),
        }

        let runtime = ctx.runtime_for(Some(&rig), None)?;
        let ledger = ctx.rig_ledger(&rig);
        match ctx
            .lifecycle()
            .reconcile(&ledger, &runtime, &ctx.cancel)
            .await
        {
            Ok(discrepancies) if discrepancies.is_empty() => {}
            Ok(discrepancies) => {
                println!("  discrepancies:");
                for d in discrepancies {
                    println!("    {d:?}");
                }
            }
            Err(e) => println!("  reconcile failed: {e}"),
        }
    }
    Ok(())
}

async fn run_triage(ctx: &CliContext) -> anyhow::Result<()> {
    let deacon = AgentId::town(Role::Deacon);
    let session = deacon.session_name();

    let session_dead = !ctx.tmux.has(&session).await?;
    let error_in_pane = if session_dead {
        false
    } else {
        let pane = ctx.tmux.capture_pane(&session, 100).await?;
        pane_shows_error(&pane)
    };
    let hb_age = Heartbeat::age_minutes(&ctx.town.deacon_heartbeat(), Utc::now());
    let mail_waiting = !ctx.bus().inbox(&deacon, &ctx.cancel).await?.is_empty();

    let observation = TriageObservation {
        session_dead,
        error_in_pane,
        freshness: hb_age.map(freshness),
        mail_waiting,
    };
    let action = triage(observation);
    println!("triage: heartbeat {hb_age:?}m, action {action:?}");

    match action {
        TriageAction::Nothing | TriageAction::ExitNoAction => {}
        TriageAction::Nudge => {
            ctx.tmux
                .send_keys(&session, "gt mail inbox", true)
                .await?;
        }
        TriageAction::Wake => {
            // NUDGE plus an interrupt escape.
            ctx.tmux.send_escape(&session).await?;
            ctx.tmux
                .send_keys(&session, "gt prime deacon", true)
                .await?;
        }
        TriageAction::FileDeathWarrant => {
            let pane = ctx.tmux.capture_pane(&session, 40).await?;
            let id =
                file_death_warrant(&ctx.town_ledger(), &deacon, &pane, &ctx.cancel).await?;
            println!("filed death warrant {id}");
        }
    }
    Ok(())
}

fn pane_shows_error(pane: &str) -> bool {
    let tail: Vec<&str> = pane.lines().rev().take(20).collect();
    tail.iter().any(|l| {
        l.contains("Traceback (most recent call last)")
            || l.contains("panicked at")
            || l.contains("FATAL")
            || l.contains("command not found")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_pane_detection() {
        assert!(pane_shows_error("...\nthread 'main' panicked at src/x.rs\n"));
        assert!(pane_shows_error("bash: claude: command not found"));
        assert!(!pane_shows_error("> waiting for input\n"));
    }
}
