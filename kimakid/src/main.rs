mod api;
mod discord;
mod dispatcher;
mod opencode;
mod platform;
mod thread_queue;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kimaki_core::{KimakiConfig, load_config};
use kimaki_store::{StatusCounts, Store};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::api::AppState;
use crate::discord::DiscordRest;
use crate::dispatcher::IpcDispatcher;
use crate::opencode::OpencodeRunner;
use crate::platform::{ChatPlatform, LogOnlyPlatform, PendingUploads};
use crate::thread_queue::{ThreadQueue, TurnStats};

const DEFAULT_CONFIG: &str = "config/kimaki.toml";

#[derive(Parser, Debug)]
#[command(name = "kimakid", version, about = "kimaki host daemon: IPC dispatch and thread turns")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the IPC dispatcher, thread queue and HTTP service.
    Serve(ServeArgs),
    /// Print effective kimakid config as JSON.
    PrintConfig(PrintConfigArgs),
    /// Print IPC request counts per status.
    InspectIpc(InspectIpcArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, env = "KIMAKI_CONFIG", default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    #[arg(long)]
    bind: Option<String>,
}

#[derive(clap::Args, Debug)]
struct PrintConfigArgs {
    #[arg(long, env = "KIMAKI_CONFIG", default_value = DEFAULT_CONFIG)]
    config: PathBuf,
}

#[derive(clap::Args, Debug)]
struct InspectIpcArgs {
    #[arg(long, env = "KIMAKI_CONFIG", default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Database to inspect instead of the configured one.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Serialize)]
struct InspectIpcResponse {
    db_path: PathBuf,
    counts: StatusCounts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: std::env::var_os("KIMAKI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG)),
        bind: None,
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
        Command::InspectIpc(args) => inspect_ipc(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn load(path: &Path) -> anyhow::Result<KimakiConfig> {
    load_config(path).with_context(|| format!("failed to load config from {}", path.display()))
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let store = Store::open(&config.storage.db_path)?;
    let uploads = PendingUploads::new();

    let discord = DiscordRest::new(&config.discord, uploads.clone());
    let discord_enabled = config.discord.enabled && discord.is_enabled();
    let platform: Arc<dyn ChatPlatform> = if discord_enabled {
        info!(api_base = %config.discord.api_base, "discord bridge enabled");
        Arc::new(discord)
    } else {
        if config.discord.enabled {
            warn!("discord enabled but DISCORD_BOT_TOKEN is not set, running log-only");
        }
        Arc::new(LogOnlyPlatform::new(
            uploads.clone(),
            Duration::from_millis(config.discord.upload_timeout_ms),
        ))
    };

    let dispatcher = Arc::new(IpcDispatcher::new(
        (&config.ipc).into(),
        Arc::new(store.clone()),
        platform.clone(),
    ));
    dispatcher.start().await?;

    let runner = Arc::new(OpencodeRunner::new(&config.opencode, store.clone()));
    let queue = ThreadQueue::new((&config.threads).into(), runner, platform);
    let turns = TurnStats::track(&queue);

    let bind = config.server.bind.clone();
    let state = AppState {
        started_at: Instant::now(),
        config: Arc::new(config),
        store,
        dispatcher: dispatcher.clone(),
        queue: queue.clone(),
        turns,
        uploads: uploads.clone(),
        discord_enabled,
        message_seq: Arc::new(AtomicU64::new(0)),
    };

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind listener on {bind}"))?;

    info!(bind = %bind, "kimakid listening");
    let served = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly");

    info!("kimakid shutting down");
    queue.shutdown();
    dispatcher.stop().await;
    if !uploads.is_empty() {
        warn!(
            pending = uploads.len(),
            "upload prompts still waiting, their requests are cancelled on next start"
        );
    }
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(err = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(err = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn print_config(args: PrintConfigArgs) -> anyhow::Result<()> {
    let cfg = load(&args.config)?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

fn inspect_ipc(args: InspectIpcArgs) -> anyhow::Result<()> {
    let db_path = match args.db {
        Some(db) => db,
        None => PathBuf::from(load(&args.config)?.storage.db_path),
    };
    let store = Store::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    let response = InspectIpcResponse {
        counts: store.status_counts()?,
        db_path,
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
