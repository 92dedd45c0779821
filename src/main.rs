use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod agent;
mod bus;
mod config;
mod enforcer;
mod login_gate;
mod notify;
mod platform;
mod tamper;

use enforcer::StateStore;

/// Screen Time Enforcement Agent
///
/// Enforces per-user daily screen-time budgets and allowed-hours windows on
/// a shared computer, with pause/bonus controls, time-extension requests and
/// clock-tamper detection.
#[derive(Parser, Debug)]
#[command(name = "timewarden")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a starter configuration file
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },
    /// Run the enforcement agent (foreground, for systemd)
    Run,
    /// Check whether a user may log in (called from the PAM stack)
    LoginCheck {
        /// Username attempting to log in
        username: String,
    },
    /// Show per-user status from the persisted state
    Status,
    /// Ask for more screen time today
    Request {
        /// User the request is for (defaults to $USER)
        #[arg(long)]
        user: Option<String>,

        /// Minutes requested
        #[arg(long, default_value = "15")]
        minutes: u32,

        /// Why more time is needed
        #[arg(long, default_value = "")]
        reason: String,
    },
}

fn main() {
    let args = Args::parse();

    // The login gate runs inside the PAM conversation: no logging setup, no
    // error exit paths beyond the allow/deny code.
    if let Commands::LoginCheck { username } = &args.command {
        std::process::exit(run_login_check(username));
    }

    init_logging(args.verbose);

    if let Err(e) = run(args) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config_path = args.config.unwrap_or_else(config::get_config_path);

    match args.command {
        Commands::Init { force } => run_init(config_path, force),
        Commands::Run => run_agent(config_path),
        Commands::Status => run_status(config_path),
        Commands::Request {
            user,
            minutes,
            reason,
        } => run_request(user, minutes, reason),
        Commands::LoginCheck { .. } => unreachable!("handled before logging init"),
    }
}

/// Initialize logging
fn init_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

/// Write the starter configuration file
fn run_init(config_path: PathBuf, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}\nUse --force to overwrite",
            config_path.display()
        );
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }

    std::fs::write(&config_path, config::EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

    println!("✓ Created configuration file: {}", config_path.display());
    println!();
    println!("Edit it to list the users you want to control, then start the agent:");
    println!("  sudo timewarden run");

    Ok(())
}

/// Start the enforcement agent
fn run_agent(config_path: PathBuf) -> Result<()> {
    let config = config::load_config(&config_path).with_context(|| {
        format!(
            "Failed to load configuration from {}. Create it or pass --config.",
            config_path.display()
        )
    })?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async { agent::run_agent(config, config_path).await })
}

/// Decide a login attempt; exit code 0 allows, 1 denies
///
/// Deliberately infallible: any internal problem falls back to allow so a
/// broken state file can never lock the whole family out.
fn run_login_check(username: &str) -> i32 {
    let state_path = StateStore::default_path();
    let (allowed, reason) = login_gate::check_login_allowed(&state_path, username);

    if allowed {
        0
    } else {
        // The PAM helper shows stdout to the user at the prompt
        println!("{}", reason);
        1
    }
}

/// Print per-user status from a fresh read of the state file
fn run_status(config_path: PathBuf) -> Result<()> {
    println!("Timewarden Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let store = StateStore::new(StateStore::default_path());
    let users = store.load();

    if users.is_empty() {
        println!("No usage recorded yet (state file: {})", store.path().display());
        return Ok(());
    }

    let config = config::load_config(&config_path).ok();

    for (username, state) in &users {
        let daily_limit = config
            .as_ref()
            .and_then(|c| c.get_user(username))
            .map(|u| u.daily_minutes)
            .unwrap_or(0);

        print!("{}: {} min used", username, state.usage_minutes);
        if daily_limit > 0 {
            print!(" of {}", daily_limit);
        }
        if state.bonus_minutes > 0 {
            print!(" (+{} bonus)", state.bonus_minutes);
        }
        println!();

        if state.blocked {
            println!("  blocked: {}", state.block_reason);
        }
        if state.paused {
            println!("  paused");
        }
        if let Some(request) = &state.pending_request {
            println!(
                "  pending request: {} minutes ({})",
                request.minutes,
                if request.reason.is_empty() {
                    "no reason given"
                } else {
                    request.reason.as_str()
                }
            );
        }
    }

    Ok(())
}

/// Drop a time-extension request for the agent to pick up
fn run_request(user: Option<String>, minutes: u32, reason: String) -> Result<()> {
    let username = match user {
        Some(name) => name,
        None => std::env::var("USER")
            .context("Cannot determine username; pass --user explicitly")?,
    };

    let channel = agent::RequestChannel::new(agent::RequestChannel::default_dir());
    channel.submit(&agent::FileRequest {
        username: username.clone(),
        minutes,
        reason,
    })?;

    println!("Request submitted: {} extra minutes for {}", minutes, username);
    println!("Your parent will be notified.");

    Ok(())
}
