//! Command-line entry point: renders a plan JSON file to a WAV file.
//!
//! ```text
//! MOODSTREAM_API_KEY=... moodstream --plan dusk.json --out dusk.wav
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use moodstream::session::{SessionConfig, WsConnector};
use moodstream::types::{MusicPlan, RenderEvent};
use moodstream::{PlanRenderer, init_tracing};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "moodstream")]
#[command(about = "Render a music plan to a WAV file via the realtime generation service")]
struct Args {
    /// Path to the plan JSON file.
    #[arg(long)]
    plan: PathBuf,

    /// Where to write the rendered WAV file.
    #[arg(long)]
    out: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let plan: MusicPlan = serde_json::from_str(
        &std::fs::read_to_string(&args.plan)
            .with_context(|| format!("failed to read {}", args.plan.display()))?,
    )
    .with_context(|| format!("failed to parse {}", args.plan.display()))?;
    info!(title = %plan.title, stanzas = plan.stanzas.len(), "loaded plan");

    let config = SessionConfig::from_env()?;
    let renderer = PlanRenderer::new(WsConnector::new(config));

    let mut events = renderer.events();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RenderEvent::Progress { current, total, stanza } => {
                    info!(current, total, seconds = stanza.seconds, "rendering stanza");
                }
                RenderEvent::Error(msg) => warn!("render error: {msg}"),
            }
        }
    });

    let wav = renderer.generate(&plan).await?;
    progress.abort();

    std::fs::write(&args.out, &wav)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    info!(bytes = wav.len(), path = %args.out.display(), "wrote rendered plan");
    Ok(())
}
