use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use escalate::commands::hook::HookEvent;
use escalate::commands::{
    completions, daemon, escalation, hook, ping, session, start, status, stop, Context,
};
use escalate::daemon::protocol::Stage;
use escalate::logging;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "escalate")]
#[command(about = "Staged, cancellable reminders for agent permission prompts", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.claude/escalation.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Daemon socket path (the lockfile sits next to it)
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Debug-level diagnostics on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Daemon,

    /// Start the daemon in the background if it is not running
    Start,

    /// Stop the running daemon
    Stop,

    /// Show pending escalations and attached sessions
    Status {
        /// Print the raw status report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check whether the daemon answers
    Ping,

    /// Schedule an escalation (replaces any pending one with the same id)
    Add {
        /// Escalation id
        id: String,

        /// Notification message
        message: String,

        /// Stage as DELAY_SECS:PRIORITY; repeat for more (default: configured stages)
        #[arg(long = "stage", value_name = "DELAY:PRIORITY")]
        stages: Vec<Stage>,

        /// Fail instead of starting the daemon when it is not running
        #[arg(long)]
        no_start: bool,
    },

    /// Cancel a pending escalation
    Cancel {
        /// Escalation id
        id: String,
    },

    /// Attach a session to the daemon
    Register {
        /// Session id (generated when omitted)
        #[arg(long)]
        session_id: Option<String>,

        /// PID to watch; the session is dropped once it exits
        #[arg(long)]
        pid: Option<u32>,
    },

    /// Detach a session (the oldest one when no id is given)
    Unregister {
        /// Session id
        #[arg(long)]
        session_id: Option<String>,
    },

    /// Agent hook entry point; reads the hook payload from stdin
    Hook {
        #[arg(value_enum)]
        event: HookEvent,
    },

    /// Generate shell completion script
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        completions::execute(&mut Cli::command(), shell);
        return Ok(());
    }

    // The daemon sets up its own file logging
    if !matches!(cli.command, Commands::Daemon) {
        logging::init_cli(cli.verbose);
    }

    let ctx = Context::load(cli.config.as_deref(), cli.socket.as_deref())?;

    match cli.command {
        Commands::Daemon => daemon::execute(&ctx, cli.verbose),
        Commands::Start => start::execute(&ctx),
        Commands::Stop => stop::execute(&ctx),
        Commands::Status { json } => status::execute(&ctx, json),
        Commands::Ping => ping::execute(&ctx),
        Commands::Add {
            id,
            message,
            stages,
            no_start,
        } => escalation::add(&ctx, &id, &message, stages, no_start),
        Commands::Cancel { id } => escalation::cancel(&ctx, &id),
        Commands::Register { session_id, pid } => {
            session::register(&ctx, session_id.as_deref(), pid)
        }
        Commands::Unregister { session_id } => session::unregister(&ctx, session_id.as_deref()),
        Commands::Hook { event } => hook::execute(&ctx, event),
        Commands::Completions { .. } => Ok(()),
    }
}
