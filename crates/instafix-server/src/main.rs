//! InstaFix daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;

use instafix::{RemoteWorker, WorkerConfig};
use instafix_server::config::Settings;
use instafix_server::{maintenance, services, Services};

#[derive(Parser)]
#[command(
    name = "instafix",
    about = "InstaFix: post acquisition daemon with expiring cache, remote workers and grid collages",
    version
)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, global = true, env = "INSTAFIX_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, global = true, env = "INSTAFIX_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: remote worker listener and maintenance until Ctrl-C (default).
    Serve,

    /// Run as a remote worker for another instance.
    Worker {
        /// Server worker listener (host:port).
        #[arg(long, env = "INSTAFIX_WORKER_SERVER")]
        server: String,

        /// Shared token; falls back to --remote-token.
        #[arg(long, env = "INSTAFIX_WORKER_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Logical streams to open on the connection.
        #[arg(long, default_value_t = 8)]
        streams: u32,
    },

    /// Resolve one post and print it as JSON.
    Fetch {
        /// Post id, e.g. Cabc123.
        post_id: String,
    },

    /// Build the grid collage for a post and write it to a file.
    Grid {
        post_id: String,

        /// Output path for the JPEG.
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Remove expired cache entries and enforce the grid budget once.
    Sweep,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   instafix completions bash > ~/.local/share/bash-completion/completions/instafix
    ///   instafix completions zsh > ~/.zfunc/_instafix
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl-C: {e}");
            return;
        }
        tracing::info!("shutdown requested");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);
    let settings = cli.settings;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let mut services = Services::build(&settings)?;
            match services.start_remote_listener(&settings).await? {
                Some(addr) => tracing::info!("accepting remote workers on {addr}"),
                None => tracing::info!("remote listener disabled"),
            }

            let maintenance = maintenance::spawn(
                Arc::clone(&services.store),
                services.grid.clone(),
                settings.sweep_interval(),
                services.shutdown.child_token(),
            );
            tracing::info!("InstaFix daemon running, data dir {}", settings.data_dir().display());

            cancel_on_ctrl_c(services.shutdown.clone());
            services.shutdown.cancelled().await;
            services.stop().await;
            let _ = maintenance.await;
        }

        Commands::Worker {
            server,
            token,
            streams,
        } => {
            let token = token
                .or_else(|| settings.remote_token.clone())
                .context("worker needs --token or --remote-token")?;
            let mut config = WorkerConfig::new(server, token.into_bytes())?;
            config.streams = streams.max(1);

            let worker = RemoteWorker::new(config, services::local_source(&settings));
            let shutdown = CancellationToken::new();
            cancel_on_ctrl_c(shutdown.clone());
            worker.run(shutdown).await?;
        }

        Commands::Fetch { post_id } => {
            let services = Services::build(&settings)?;
            let record = services
                .coordinator
                .resolve(&post_id)
                .await
                .with_context(|| format!("resolving {post_id}"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Commands::Grid { post_id, out } => {
            let services = Services::build(&settings)?;
            let record = services
                .coordinator
                .resolve(&post_id)
                .await
                .with_context(|| format!("resolving {post_id}"))?;
            let jpeg = services
                .grid
                .build_or_fetch_cached(&post_id, &record.media)
                .await
                .with_context(|| format!("building grid for {post_id}"))?;
            tokio::fs::write(&out, &jpeg)
                .await
                .with_context(|| format!("writing {}", out.display()))?;
            println!("{} ({} bytes)", out.display(), jpeg.len());
        }

        Commands::Sweep => {
            let services = Services::build(&settings)?;
            let report = maintenance::run_once(&services.store, &services.grid).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "instafix", &mut std::io::stdout());
        }
    }

    Ok(())
}
