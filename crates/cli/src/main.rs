use clap::{Parser, Subcommand};
use lib::whitelist::WhitelistStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sbdlink")]
#[command(about = "Iridium SBD <-> Signal bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: SBDLINK_CONFIG_PATH or ~/.sbdlink/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the bridge: RockBLOCK webhook plus the signal-cli receive poller.
    Run {
        /// Config file path (default: SBDLINK_CONFIG_PATH or ~/.sbdlink/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Webhook port (default from config or 8999)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Add a Signal number to the whitelist.
    Allow {
        /// Config file path (default: SBDLINK_CONFIG_PATH or ~/.sbdlink/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Number to allow, e.g. +31612345678
        identity: String,
    },

    /// Show whether a Signal number may use the bridge (or list the whitelist when omitted).
    Check {
        /// Config file path (default: SBDLINK_CONFIG_PATH or ~/.sbdlink/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        identity: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let res = match cli.command {
        Some(Commands::Version) => {
            println!("sbdlink {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Run { config, port }) => run_bridge(config, port).await,
        Some(Commands::Allow { config, identity }) => run_allow(config, identity).await,
        Some(Commands::Check { config, identity }) => run_check(config, identity).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = res {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_bridge(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting bridge on {}:{}",
        config.gateway.bind,
        config.gateway.port
    );
    lib::gateway::run_gateway(config, path).await
}

fn open_whitelist(config_path: Option<PathBuf>) -> anyhow::Result<WhitelistStore> {
    let (config, path) = lib::config::load_config(config_path)?;
    let whitelist_path = lib::config::resolve_whitelist_path(&config, &path);
    Ok(WhitelistStore::new(
        whitelist_path,
        config.whitelist.missing_file,
    ))
}

async fn run_allow(config_path: Option<PathBuf>, identity: String) -> anyhow::Result<()> {
    let identity = identity.trim().to_string();
    if !lib::address::is_valid_identity(&identity) {
        anyhow::bail!("{:?} does not look like a phone number (+<digits>)", identity);
    }
    let store = open_whitelist(config_path)?;
    if !store.add(&identity).await {
        anyhow::bail!("could not write {}", store.path().display());
    }
    println!("{} allowed ({})", identity, store.path().display());
    Ok(())
}

async fn run_check(config_path: Option<PathBuf>, identity: Option<String>) -> anyhow::Result<()> {
    let store = open_whitelist(config_path)?;
    match identity {
        Some(id) => {
            let allowed = store.is_allowed(&id).await;
            println!("{}: {}", id.trim(), if allowed { "allowed" } else { "blocked" });
        }
        None => {
            let entries = store.list().await;
            if !store.path().exists() {
                println!("{} does not exist", store.path().display());
            }
            for e in entries {
                println!("{}", e);
            }
        }
    }
    Ok(())
}
