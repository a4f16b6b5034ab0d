//! ircplugd - IRC daemon with Lua plugins.
//!
//! This is the binary entry point. See the `ircplugd` library for the core
//! functionality.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ircplugd::{Config, Daemon, PluginManager};

/// Crate version.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// Run the daemon until a signal or a shutdown request.
fn run_daemon(config_path: Option<PathBuf>) -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let config = Config::load(config_path.as_deref())?;
    let mut daemon = Daemon::new(&config)?;

    log::info!(
        "ircplugd v{} started ({} servers, {} plugins)",
        VERSION,
        config.servers.len(),
        daemon.plugins().names().len()
    );
    daemon.run(&SHUTDOWN_FLAG);
    Ok(())
}

/// Load a plugin in isolation and report its handlers.
fn check_plugin(path: PathBuf) -> Result<()> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .context("Plugin path has no usable file name")?
        .to_string();

    let mut manager = PluginManager::new();
    let result = manager.load(&name, &path);
    let handlers = manager
        .plugin(&name)
        .map(|plugin| {
            plugin
                .bound()
                .iter()
                .map(|kind| kind.handler_name())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    manager.shutdown();
    result?;

    println!("{}: ok", path.display());
    if handlers.is_empty() {
        println!("  no event handlers");
    }
    for handler in handlers {
        println!("  {}", handler);
    }
    Ok(())
}

// CLI
#[derive(Parser)]
#[command(name = "ircplugd")]
#[command(version = VERSION)]
#[command(about = "IRC daemon with sandboxed Lua plugins")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the configured servers and run plugins
    Start {
        /// Path to the config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load a plugin without connecting anywhere and list its handlers
    Check {
        /// Path to the Lua file
        plugin: PathBuf,
    },
    /// Print the effective configuration
    Config {
        /// Path to the config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("IRCPLUGD_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => run_daemon(config)?,
        Commands::Check { plugin } => check_plugin(plugin)?,
        Commands::Config { config } => {
            let path = Config::resolve_path(config.as_deref())?;
            let config = Config::load(config.as_deref())?;
            println!("# {}", path.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
