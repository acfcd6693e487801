//! Realtime session to the music generation service.
//!
//! One logical connection per session: commands go out as JSON over a
//! WebSocket, server pushes come back as JSON frames and are forwarded, in
//! arrival order, through an unbounded channel so slow downstream work
//! (decode, scheduling) never stalls the socket reader.
//!
//! The engine and renderer are generic over [`SessionConnector`] /
//! [`MusicSession`] so tests can inject fakes; [`WsConnector`] is the real
//! implementation.

use crate::types::{FilteredPrompt, MusicGenerationConfig, WeightedPrompt};
use anyhow::{Context, Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const DEFAULT_ENDPOINT: &str = "wss://api.moodstream.dev/v1/music:stream";
const DEFAULT_MODEL: &str = "models/realtime-music-1";

/// Connection settings for the generation service.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

impl SessionConfig {
    /// Read settings from `MOODSTREAM_API_KEY` (required),
    /// `MOODSTREAM_ENDPOINT` and `MOODSTREAM_MODEL` (optional).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = get("MOODSTREAM_API_KEY")
            .context("MOODSTREAM_API_KEY is not set")?;
        Ok(Self {
            endpoint: get("MOODSTREAM_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.into()),
            api_key,
            model: get("MOODSTREAM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
        })
    }
}

// ─── Wire protocol ──────────────────────────────────────────────────

#[derive(Serialize)]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Serialize)]
struct Setup<'a> {
    model: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContentMessage<'a> {
    client_content: ClientContent<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContent<'a> {
    weighted_prompts: &'a [WeightedPrompt],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigMessage<'a> {
    music_generation_config: &'a MusicGenerationConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaybackControlMessage {
    playback_control: PlaybackControl,
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum PlaybackControl {
    Play,
    Pause,
    Stop,
}

/// One inbound server frame. Fields are mutually exclusive in practice but
/// the parser tolerates combined frames by emitting each part in order.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    filtered_prompt: Option<FilteredPrompt>,
    #[serde(default)]
    server_content: Option<ServerContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    audio_chunks: Vec<AudioChunk>,
}

#[derive(Debug, Deserialize)]
struct AudioChunk {
    data: String,
}

/// A server push, translated from the wire and delivered in arrival order.
/// `Error` and `Closed` are terminal; the channel ends after them.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    SetupComplete,
    FilteredPrompt(FilteredPrompt),
    /// Base64 PCM payloads, in the order the server sent them.
    AudioChunks(Vec<String>),
    Error(String),
    Closed { code: Option<u16>, reason: Option<String> },
}

// ─── Session boundary ───────────────────────────────────────────────

/// Commands available on an open session. Calling any of these after the
/// transport dropped returns an error.
pub trait MusicSession: Send + Sync + 'static {
    fn set_weighted_prompts(
        &self,
        prompts: Vec<WeightedPrompt>,
    ) -> impl Future<Output = Result<()>> + Send;
    fn set_music_generation_config(
        &self,
        config: &MusicGenerationConfig,
    ) -> impl Future<Output = Result<()>> + Send;
    fn play(&self) -> impl Future<Output = Result<()>> + Send;
    fn pause(&self) -> impl Future<Output = Result<()>> + Send;
    fn stop(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Opens sessions on demand. A failed connect leaves the connector usable
/// for a later retry.
pub trait SessionConnector: Send + Sync + 'static {
    type Session: MusicSession;

    fn connect(
        &self,
    ) -> impl Future<Output = Result<(Self::Session, mpsc::UnboundedReceiver<ServerMessage>)>> + Send;
}

// ─── WebSocket implementation ───────────────────────────────────────

/// Live WebSocket session. Dropping it closes the connection.
pub struct WsSession {
    outbound: mpsc::UnboundedSender<Message>,
}

impl WsSession {
    fn send_json<T: Serialize>(&self, payload: &T) -> Result<()> {
        let text = serde_json::to_string(payload).context("failed to encode command")?;
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| anyhow!("session is closed"))
    }
}

impl MusicSession for WsSession {
    async fn set_weighted_prompts(&self, prompts: Vec<WeightedPrompt>) -> Result<()> {
        self.send_json(&ClientContentMessage {
            client_content: ClientContent { weighted_prompts: &prompts },
        })
    }

    async fn set_music_generation_config(&self, config: &MusicGenerationConfig) -> Result<()> {
        self.send_json(&ConfigMessage { music_generation_config: config })
    }

    async fn play(&self) -> Result<()> {
        self.send_json(&PlaybackControlMessage { playback_control: PlaybackControl::Play })
    }

    async fn pause(&self) -> Result<()> {
        self.send_json(&PlaybackControlMessage { playback_control: PlaybackControl::Pause })
    }

    async fn stop(&self) -> Result<()> {
        self.send_json(&PlaybackControlMessage { playback_control: PlaybackControl::Stop })
    }
}

/// Connector for the real service.
#[derive(Debug, Clone)]
pub struct WsConnector {
    config: SessionConfig,
}

impl WsConnector {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

impl SessionConnector for WsConnector {
    type Session = WsSession;

    async fn connect(&self) -> Result<(WsSession, mpsc::UnboundedReceiver<ServerMessage>)> {
        let url = format!("{}?key={}", self.config.endpoint, self.config.api_key);
        let (ws, _) = connect_async(&url)
            .await
            .with_context(|| format!("failed to connect to {}", self.config.endpoint))?;
        info!(endpoint = %self.config.endpoint, model = %self.config.model, "session connected");

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

        // Writer task owns the sink half; ends when the session is dropped.
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = ws_tx.send(msg).await {
                    warn!("session send failed: {e}");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        // Reader task translates frames until error or close. The pong
        // sender is weak: only the session handle keeps the outbound
        // channel open, so dropping the session ends the writer and closes
        // the socket.
        let pong_tx = outbound.downgrade();
        tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(Message::Text(text)) => forward_frame(text.as_str(), &inbound),
                    Ok(Message::Binary(bytes)) => {
                        if let Ok(text) = std::str::from_utf8(&bytes) {
                            forward_frame(text, &inbound);
                        } else {
                            debug!("ignoring non-UTF-8 binary frame");
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if let Some(tx) = pong_tx.upgrade() {
                            let _ = tx.send(Message::Pong(payload));
                        }
                    }
                    Ok(Message::Close(close)) => {
                        let (code, reason) = match close {
                            Some(c) => (Some(u16::from(c.code)), Some(c.reason.to_string())),
                            None => (None, None),
                        };
                        let _ = inbound.send(ServerMessage::Closed { code, reason });
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = inbound.send(ServerMessage::Error(format!(
                            "session transport error: {e}"
                        )));
                        break;
                    }
                }
            }
            debug!("session reader ended");
        });

        let session = WsSession { outbound };
        session.send_json(&SetupMessage { setup: Setup { model: &self.config.model } })?;
        Ok((session, inbound_rx))
    }
}

/// Parse one inbound frame and forward its parts in order. Frames that are
/// not protocol messages are logged and dropped.
fn forward_frame(text: &str, inbound: &mpsc::UnboundedSender<ServerMessage>) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("ignoring unrecognized frame: {e}");
            return;
        }
    };
    if frame.setup_complete.is_some() {
        let _ = inbound.send(ServerMessage::SetupComplete);
    }
    if let Some(filtered) = frame.filtered_prompt {
        warn!(text = %filtered.text, "prompt filtered by service");
        let _ = inbound.send(ServerMessage::FilteredPrompt(filtered));
    }
    if let Some(content) = frame.server_content {
        if !content.audio_chunks.is_empty() {
            let chunks = content.audio_chunks.into_iter().map(|c| c.data).collect();
            let _ = inbound.send(ServerMessage::AudioChunks(chunks));
        }
    }
}
