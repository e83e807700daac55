mod commands;
mod context;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use gt_core::GtError;

/// gt — Gas Town orchestration CLI
#[derive(Debug, Parser)]
#[command(name = "gt", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new town in the current directory
    Init(commands::init::InitCommand),

    /// Check and prepare the host environment
    Install,

    /// Manage rigs (project workspaces)
    #[command(subcommand)]
    Rig(commands::rig::RigCommand),

    /// Schedule work onto a rig's worker queue
    Sling(commands::sling::SlingCommand),

    /// Finish the current worker's task and submit it for merge
    Done(commands::done::DoneCommand),

    /// Save session context for the next session
    Handoff(commands::handoff::HandoffCommand),

    /// Merge queue management
    #[command(subcommand)]
    Mq(commands::mq::MqCommand),

    /// Refinery (merge pipeline) control
    #[command(subcommand)]
    Refinery(commands::refinery::RefineryCommand),

    /// Witness (per-rig watchdog) control
    #[command(subcommand)]
    Witness(commands::witness::WitnessCommand),

    /// Agent messaging
    #[command(subcommand)]
    Mail(commands::mail::MailCommand),

    /// Poke another agent's session with a note
    Nudge(commands::nudge::NudgeCommand),

    /// Raise an issue's priority and alert the mayor
    Escalate(commands::escalate::EscalateCommand),

    /// Decision requests routed to the mayor
    #[command(subcommand)]
    Decision(commands::decision::DecisionCommand),

    /// Cross-rig tracking convoys
    #[command(subcommand)]
    Convoy(commands::convoy::ConvoyCommand),

    /// Async barrier gates
    #[command(subcommand)]
    Gate(commands::gate::GateCommand),

    /// Agent accounts and presets
    #[command(subcommand)]
    Account(commands::account::AccountCommand),

    /// Inspect, start, reconcile, and nuke agent sessions
    #[command(subcommand)]
    Agents(commands::agents::AgentsCommand),

    /// Run one scheduler dispatch cycle
    Dispatch(commands::dispatch::DispatchCommand),

    /// Show the current agent's hooked work
    Hook(commands::hook::HookCommand),

    /// Print session context for a fresh agent
    Prime(commands::prime::PrimeCommand),

    /// Town status overview (also Boot's triage entry point)
    Status(commands::status::StatusCommand),

    /// Environment preflight
    Doctor,

    /// Run the heartbeat supervisor loop
    Daemon(commands::daemon::DaemonCommand),

    /// Tail a rig's activity feed
    Feed(commands::feed::FeedCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = run(&cli.command).await;

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        let code = err
            .downcast_ref::<GtError>()
            .map(GtError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Init(cmd) => commands::init::run(cmd),
        Command::Install => commands::install::run().await,
        Command::Rig(cmd) => commands::rig::run(cmd).await,
        Command::Sling(cmd) => commands::sling::run(cmd).await,
        Command::Done(cmd) => commands::done::run(cmd).await,
        Command::Handoff(cmd) => commands::handoff::run(cmd).await,
        Command::Mq(cmd) => commands::mq::run(cmd).await,
        Command::Refinery(cmd) => commands::refinery::run(cmd).await,
        Command::Witness(cmd) => commands::witness::run(cmd).await,
        Command::Mail(cmd) => commands::mail::run(cmd).await,
        Command::Nudge(cmd) => commands::nudge::run(cmd).await,
        Command::Escalate(cmd) => commands::escalate::run(cmd).await,
        Command::Decision(cmd) => commands::decision::run(cmd).await,
        Command::Convoy(cmd) => commands::convoy::run(cmd).await,
        Command::Gate(cmd) => commands::gate::run(cmd).await,
        Command::Account(cmd) => commands::account::run(cmd).await,
        Command::Agents(cmd) => commands::agents::run(cmd).await,
        Command::Dispatch(cmd) => commands::dispatch::run(cmd).await,
        Command::Hook(cmd) => commands::hook::run(cmd).await,
        Command::Prime(cmd) => commands::prime::run(cmd).await,
        Command::Status(cmd) => commands::status::run(cmd).await,
        Command::Doctor => commands::doctor::run().await,
        Command::Daemon(cmd) => commands::daemon::run(cmd).await,
        Command::Feed(cmd) => commands::feed::run(cmd).await,
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "gt", &mut std::io::stdout());
            Ok(())
        }
    }
}
