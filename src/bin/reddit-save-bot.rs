#![forbid(unsafe_code)]

//! Entry point: parses flags, resolves configuration and runs the webhook
//! server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reddit_save_bot::{
    config::{DEFAULT_CONFIG_PATH, EnvConfig, ServerConfig, read_env_config},
    downloader::{YtDlp, ensure_program_available},
    logging,
    pipeline::{MessagePipeline, PipelineSettings},
    reddit::TokenProvider,
    scratch, server,
    telegram::TelegramApi,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "reddit-save-bot",
    author,
    version,
    about = "Reddit Save Bot is a bot that receives a Telegram message with a Reddit link to a video and sends it back"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the server
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(short = 'p', long = "port", env = "PORT", help = "Port to listen on")]
    port: Option<u16>,
    #[arg(long = "host", env = "HOST", help = "Address to bind")]
    host: Option<String>,
    #[arg(
        short = 't',
        long = "token",
        env = "TELEGRAM_BOT_TOKEN",
        hide_env_values = true,
        help = "Telegram bot token"
    )]
    token: Option<String>,
    #[arg(
        long = "personalID",
        env = "TELEGRAM_PERSONAL_ID",
        help = "Telegram personal ID; when set only this user is served"
    )]
    personal_id: Option<i64>,
    #[arg(long = "redditClientID", env = "REDDIT_CLIENT_ID", help = "Reddit client ID")]
    reddit_client_id: Option<String>,
    #[arg(
        long = "redditClientSecret",
        env = "REDDIT_CLIENT_SECRET",
        hide_env_values = true,
        help = "Reddit client secret"
    )]
    reddit_client_secret: Option<String>,
    #[arg(
        long = "scratch-dir",
        env = "SCRATCH_DIR",
        value_name = "PATH",
        help = "Directory downloads are staged in"
    )]
    scratch_dir: Option<PathBuf>,
    #[arg(
        long = "max-video-bytes",
        env = "MAX_VIDEO_BYTES",
        help = "Largest video that will be sent"
    )]
    max_video_bytes: Option<u64>,
    #[arg(
        long = "downloader",
        env = "DOWNLOADER_PROGRAM",
        value_name = "PROGRAM",
        help = "yt-dlp compatible downloader"
    )]
    downloader: Option<String>,
    #[arg(
        long = "config",
        env = "REDDIT_SAVE_BOT_CONFIG",
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        help = "Path to the env-style config file"
    )]
    config: PathBuf,
}

impl ServeArgs {
    fn overrides(&self) -> EnvConfig {
        EnvConfig {
            port: self.port,
            host: self.host.clone(),
            telegram_token: self.token.clone(),
            personal_id: self.personal_id,
            reddit_client_id: self.reddit_client_id.clone(),
            reddit_client_secret: self.reddit_client_secret.clone(),
            scratch_dir: self.scratch_dir.clone(),
            max_video_bytes: self.max_video_bytes,
            downloader: self.downloader.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Cloud Logging needs the project ID to link lines to request traces.
    let project_lookup = if logging::on_cloud_run() {
        let http = reqwest::Client::new();
        Some(logging::fetch_gcp_project_id(&http, logging::GCP_PROJECT_ID_URL).await)
    } else {
        None
    };
    logging::init_tracing(
        project_lookup
            .as_ref()
            .and_then(|lookup| lookup.as_ref().ok())
            .cloned(),
    );
    if let Some(Err(err)) = &project_lookup {
        error!(cause = %err, "Failed to get GCP project ID");
    }

    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let file = read_env_config(&args.config)?;
    let config = ServerConfig::resolve(args.overrides(), file)?;

    info!(port = config.port, host = %config.host, "Starting server");
    if config.is_public() {
        warn!("Telegram personal ID is not set, bot in public mode");
    }
    if !config.has_reddit_credentials() {
        warn!("Reddit client credentials are not set, downloads will be anonymous");
    }
    if let Err(err) = ensure_program_available(&config.downloader) {
        warn!(error = %err, "Downloader check failed");
    }

    tokio::fs::create_dir_all(&config.scratch_dir)
        .await
        .with_context(|| format!("creating {}", config.scratch_dir.display()))?;
    if let Err(err) = scratch::sweep_stale(&config.scratch_dir) {
        warn!(error = %err, "Failed to sweep scratch directory");
    }

    let http = reqwest::Client::builder()
        .build()
        .context("building HTTP client")?;
    let tokens = TokenProvider::new(
        config.reddit_client_id.clone(),
        config.reddit_client_secret.clone(),
        http.clone(),
    );
    let notifier = TelegramApi::new(&config.telegram_token, http);
    let pipeline = MessagePipeline::new(
        Arc::new(tokens),
        Arc::new(YtDlp::new(config.downloader.clone())),
        Arc::new(notifier),
        PipelineSettings {
            personal_id: config.personal_id,
            scratch_dir: config.scratch_dir.clone(),
            max_video_bytes: config.max_video_bytes,
        },
    );

    server::serve(&config.host, config.port, Arc::new(pipeline)).await
}
