//! PageRelay server: entry point.

use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use pagerelay::{DedupLedger, FileLedger, RelayConfig};
use pagerelay_server::config::{resolve_addr, resolve_data_dir};
use pagerelay_server::state::AppState;

#[derive(Parser)]
#[command(
    name = "pagerelay-server",
    about = "Relay paginated queries to duplex-connected workers",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and worker endpoint (default).
    Serve {
        /// Listen address (host:port). Defaults to 127.0.0.1:$PORT or 127.0.0.1:3000.
        #[arg(long)]
        addr: Option<String>,

        /// Directory for downloads and record files.
        /// Also reads from PAGERELAY_DATA_DIR.
        #[arg(long)]
        data_dir: Option<String>,

        /// Expected worker heartbeat interval in seconds.
        #[arg(long)]
        heartbeat_secs: Option<u64>,

        /// Per-call timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Print the dedup ledger as JSON.
    SavedList {
        /// Directory holding ledger.jsonl.
        #[arg(long)]
        data_dir: Option<String>,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   pagerelay-server completions bash > ~/.local/share/bash-completion/completions/pagerelay-server
    ///   pagerelay-server completions zsh > ~/.zfunc/_pagerelay-server
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Serve {
        addr: None,
        data_dir: None,
        heartbeat_secs: None,
        timeout_secs: None,
    }) {
        Commands::Serve {
            addr,
            data_dir,
            heartbeat_secs,
            timeout_secs,
        } => {
            let mut config = RelayConfig::from_env();
            if let Some(secs) = heartbeat_secs {
                config.heartbeat_interval = Duration::from_secs(secs.max(1));
            }
            if let Some(secs) = timeout_secs {
                config.request_timeout = Duration::from_secs(secs.max(1));
            }

            let data_dir = resolve_data_dir(data_dir.as_deref());
            let addr = resolve_addr(addr.as_deref());
            tracing::info!(
                "Data dir {}, heartbeat {:?}, request timeout {:?}",
                data_dir.display(),
                config.heartbeat_interval,
                config.request_timeout
            );

            let state = Arc::new(AppState::open(&data_dir, config)?);
            pagerelay_server::serve(&addr, state).await?;
        }

        Commands::SavedList { data_dir } => {
            let data_dir = resolve_data_dir(data_dir.as_deref());
            let ledger = FileLedger::open_in(&data_dir)?;
            let list = serde_json::json!({ "list": ledger.entries() });
            println!("{}", serde_json::to_string_pretty(&list)?);
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "pagerelay-server", &mut std::io::stdout());
        }
    }

    Ok(())
}
