//! chunklift entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use chunklift_client::{Credentials, Session, Transport};
use chunklift_transfer::{UploadEvent, Uploader};

#[derive(Parser)]
#[command(name = "chunklift")]
#[command(about = "Uploads a single large file in deduplicated chunks", version)]
struct Cli {
    /// Username for basic auth
    #[arg(long, env = "CHUNKLIFT_USER")]
    user: String,

    /// Auth token for basic auth
    #[arg(long, env = "CHUNKLIFT_TOKEN", hide_env_values = true)]
    token: String,

    /// Base API URL
    #[arg(long, default_value = "https://transfer.atlassian.com")]
    url: String,

    /// Target resource key
    key: String,

    /// File to upload
    file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting chunklift");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let transport = Transport::new(Credentials {
        user: cli.user,
        token: cli.token,
    })?;
    let session = Session::new(transport, &cli.url, &cli.key);
    let mut uploader = Uploader::new(session);

    let events = uploader
        .take_events()
        .context("event channel already taken")?;
    let bar_task = tokio::spawn(render_progress(events));

    let mime_type = mime_guess::from_path(&cli.file)
        .first_raw()
        .unwrap_or_default();

    uploader
        .run(&cli.file, mime_type)
        .await
        .with_context(|| format!("uploading {}", cli.file.display()))?;

    drop(uploader);
    let _ = bar_task.await;

    println!("Successfully uploaded {} to {}", cli.file.display(), cli.key);
    Ok(())
}

/// Renders a chunk-count progress bar from upload events.
async fn render_progress(mut events: tokio::sync::mpsc::Receiver<UploadEvent>) {
    let mut bar: Option<ProgressBar> = None;
    while let Some(event) = events.recv().await {
        match event {
            UploadEvent::Started { total_chunks } => {
                let b = ProgressBar::new(total_chunks);
                b.set_style(
                    ProgressStyle::with_template(
                        "Uploading: {pos:>4}/{len:4} [{bar:40}] {percent:>3}%",
                    )
                    .expect("static template")
                    .progress_chars("=> "),
                );
                bar = Some(b);
            }
            UploadEvent::ChunkCompleted { .. } => {
                if let Some(b) = &bar {
                    b.inc(1);
                }
            }
            UploadEvent::Finalized => {
                if let Some(b) = &bar {
                    b.finish();
                }
            }
        }
    }
}
