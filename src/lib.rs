//! moodstream — steerable realtime music streaming.
//!
//! Architecture:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Live engine                          │
//! │  prompts → throttle → WebSocket session → base64     │
//! │  PCM chunks → codec → scheduled cpal playback        │
//! └───────────────────────────┬──────────────────────────┘
//!                             │ same session protocol
//! ┌───────────────────────────▼──────────────────────────┐
//! │                 Plan renderer                        │
//! │  stanza loop → collected PCM, in order → WAV file    │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod engine;
pub mod playback;
pub mod render;
pub mod session;
pub mod throttle;
pub mod types;
pub mod wav;

pub use engine::LiveMusicEngine;
pub use render::PlanRenderer;
pub use session::{MusicSession, SessionConfig, SessionConnector, WsConnector};
pub use types::{
    EngineEvent, MusicGenerationConfig, MusicPlan, PlaybackState, Prompt, RenderEvent, Stanza,
    WeightedPrompt,
};

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "moodstream=info".into()),
        )
        .init();
}
