use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use media_proxy::{
    config::Config,
    models::{ContentId, ResolvedMedia},
    services::{
        BilibiliResolver, CredentialStore, SessionManager, SharedCredentials, StaticResolver,
        UpstreamResolver,
    },
};

#[derive(Parser)]
#[command(name = "media-proxy")]
#[command(version = "0.1.0")]
#[command(about = "Serve authenticated upstream video to a local player over loopback HTTP")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a content id (BV… / av…) and serve it until interrupted
    Play {
        content_id: String,
    },
    /// Serve explicit upstream URLs until interrupted
    Serve {
        /// Single combined media URL (passthrough)
        #[arg(long, conflicts_with_all = ["video", "audio"])]
        url: Option<String>,

        /// Video track URL (muxed, requires --audio)
        #[arg(long, requires = "audio")]
        video: Option<String>,

        /// Audio track URL (muxed, requires --video)
        #[arg(long, requires = "video")]
        audio: Option<String>,

        /// Authoritative duration reported alongside the output URL
        #[arg(long)]
        duration_ms: Option<u64>,

        /// Label for the session
        #[arg(long, default_value = "av0")]
        content_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("media_proxy={}", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting media proxy v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    let credentials = Arc::new(SharedCredentials::new(CredentialStore::from_config(
        &config,
    )?));

    let (content, resolver): (ContentId, Arc<dyn UpstreamResolver>) = match cli.command {
        Command::Play { content_id } => (
            ContentId::parse(&content_id)?,
            Arc::new(BilibiliResolver::from_config(&config)?),
        ),
        Command::Serve {
            url,
            video,
            audio,
            duration_ms,
            content_id,
        } => {
            let media = match (url, video, audio) {
                (Some(url), None, None) => ResolvedMedia::combined(url, duration_ms),
                (None, Some(video), Some(audio)) => ResolvedMedia::split(video, audio, duration_ms),
                _ => bail!("serve needs either --url or both --video and --audio"),
            };
            (
                ContentId::parse(&content_id)?,
                Arc::new(StaticResolver::new(media)),
            )
        }
    };

    let manager = SessionManager::new(config, resolver, credentials);
    let handle = match manager.open(&content).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Playback failed for {}: {}", content, e);
            eprintln!("{}", e.user_message());
            return Err(e.into());
        }
    };

    println!("{}", handle.output_url);
    match handle.duration_ms {
        Some(ms) => println!("duration_ms={ms}"),
        None => println!("duration_ms=unknown"),
    }

    let Some(session) = manager.get(&handle.content_id).await else {
        bail!("session for {} ended before it could be watched", content);
    };
    let mut state = session.subscribe_state();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        ended = state.wait_for(|s| s.is_terminal()) => {
            match ended {
                Ok(s) => warn!("Session ended with state {}", *s),
                Err(_) => warn!("Session ended"),
            }
        }
    }

    if let Some(reason) = session.failure_reason() {
        error!("Session failed: {}", reason);
        for line in session.diagnostics() {
            error!("  {}", line);
        }
    }
    manager.stop_all().await;
    info!("All sessions stopped");
    Ok(())
}
