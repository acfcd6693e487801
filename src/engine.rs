//! Live playback engine.
//!
//! Owns the realtime session and the output sink: holds the current prompt
//! snapshot, pushes throttled prompt updates, decodes incoming chunks and
//! schedules them gaplessly with a look-ahead buffer, and tracks the
//! playback state machine:
//!
//! ```text
//! stopped ──play()──▶ loading ──horizon filled──▶ playing
//!    ▲                   ▲  ▲                        │
//!    │                   │  └──────underrun──────────┤
//!    └──stop()/error─────┴────────pause()──▶ paused ─┘
//! ```
//!
//! All state lives behind one async mutex; a generation counter fences the
//! horizon timer and the per-session message loop so nothing torn down can
//! resurrect stale state.

use crate::codec;
use crate::playback::{AudioSink, CpalSink, SinkFactory};
use crate::session::{MusicSession, ServerMessage, SessionConnector};
use crate::throttle::Throttle;
use crate::types::{
    CHANNELS, EngineEvent, FilteredPrompt, MusicGenerationConfig, PlaybackState, Prompt,
    PromptMap, SAMPLE_RATE, WeightedPrompt,
};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{info, warn};

/// Audio buffered ahead of the output clock before playback is reported as
/// started; absorbs network jitter.
pub const BUFFER_HORIZON_SECS: f64 = 2.0;
/// Length of the gain ramps around play/pause/stop.
const GAIN_RAMP_SECS: f64 = 0.1;
/// Minimum spacing between prompt pushes to the service.
const PROMPT_PUSH_INTERVAL: Duration = Duration::from_millis(200);
/// How long a replaced sink is kept alive so its fade-out can finish.
const SINK_LINGER: Duration = Duration::from_millis(200);

pub struct LiveMusicEngine<C: SessionConnector> {
    inner: Arc<Inner<C>>,
}

struct Inner<C: SessionConnector> {
    connector: C,
    sink_factory: SinkFactory,
    events: broadcast::Sender<EngineEvent>,
    /// Throttled wire push; coalesces bursts of prompt edits to the latest.
    prompt_push: Throttle<Vec<WeightedPrompt>, Result<(), String>>,
    state: Mutex<EngineState<C::Session>>,
}

struct EngineState<S> {
    playback: PlaybackState,
    prompts: PromptMap,
    /// Prompt texts the service rejected; grows for the session's lifetime.
    filtered: HashSet<String>,
    config: MusicGenerationConfig,
    session: Option<Arc<S>>,
    /// Bumped on every connect and teardown; stale timers and message
    /// loops compare against it and bail.
    generation: u64,
    sink: Box<dyn AudioSink>,
    /// Scheduling cursor: absolute sink-clock time the next chunk starts at.
    /// `None` until the first chunk after a (re)start anchors it.
    next_start: Option<f64>,
}

impl<C: SessionConnector> LiveMusicEngine<C> {
    /// Must be called from within a tokio runtime (spawns the throttle
    /// worker).
    pub fn new(connector: C, sink_factory: SinkFactory) -> Result<Self> {
        let sink = sink_factory().context("failed to open initial output sink")?;
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<C>>| {
            let weak = weak.clone();
            let prompt_push = Throttle::new(PROMPT_PUSH_INTERVAL, move |prompts| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else { return Ok(()) };
                    let session = inner.state.lock().await.session.clone();
                    match session {
                        Some(s) => s
                            .set_weighted_prompts(prompts)
                            .await
                            .map_err(|e| format!("failed to push prompts: {e:#}")),
                        // Session went away between edit and fire; play()
                        // re-pushes the snapshot on reconnect.
                        None => Ok(()),
                    }
                }
            });
            Inner {
                connector,
                sink_factory,
                events,
                prompt_push,
                state: Mutex::new(EngineState {
                    playback: PlaybackState::Stopped,
                    prompts: Arc::new(HashMap::new()),
                    filtered: HashSet::new(),
                    config: MusicGenerationConfig::default(),
                    session: None,
                    generation: 0,
                    sink,
                    next_start: None,
                }),
            }
        });
        Ok(Self { inner })
    }

    /// Engine wired to the default audio output device.
    pub fn with_default_output(connector: C) -> Result<Self> {
        Self::new(
            connector,
            Box::new(|| Ok(Box::new(CpalSink::open()?) as Box<dyn AudioSink>)),
        )
    }

    /// Subscribe to state changes, filtered prompts, and errors.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub async fn playback_state(&self) -> PlaybackState {
        self.inner.state.lock().await.playback
    }

    /// Replace the prompt snapshot. An empty active set (all weights zero or
    /// everything filtered) raises an error event and forces a pause; the
    /// service needs at least one live prompt at all times.
    pub async fn set_weighted_prompts(&self, prompts: Vec<Prompt>) -> Result<()> {
        let snapshot: PromptMap =
            Arc::new(prompts.into_iter().map(|p| (p.prompt_id.clone(), p)).collect());
        let (active, has_session) = {
            let mut st = self.inner.state.lock().await;
            st.prompts = snapshot;
            (active_prompts(&st), st.session.is_some())
        };
        if active.is_empty() {
            self.inner
                .emit(EngineEvent::Error("there needs to be one active prompt to play".into()));
            self.pause().await?;
            return Ok(());
        }
        if has_session {
            // Lock released above: the throttle worker takes it when it fires.
            if let Err(msg) = self.inner.prompt_push.call(active).await {
                self.inner.emit(EngineEvent::Error(msg));
                self.pause().await?;
            }
        }
        Ok(())
    }

    /// Update the generation config, pushing it immediately if a session is
    /// open.
    pub async fn set_music_generation_config(&self, config: MusicGenerationConfig) -> Result<()> {
        let session = {
            let mut st = self.inner.state.lock().await;
            st.config = config.clone();
            st.session.clone()
        };
        if let Some(session) = session {
            if let Err(e) = session.set_music_generation_config(&config).await {
                self.inner.emit(EngineEvent::Error(format!("failed to push config: {e:#}")));
                self.pause().await?;
            }
        }
        Ok(())
    }

    /// Start (or resume) live playback: connect on demand, push the current
    /// prompts, and wait for the buffer horizon to fill.
    pub async fn play(&self) -> Result<()> {
        let mut st = self.inner.state.lock().await;
        if matches!(st.playback, PlaybackState::Playing | PlaybackState::Loading) {
            return Ok(());
        }
        let active = active_prompts(&st);
        if active.is_empty() {
            drop(st);
            self.inner
                .emit(EngineEvent::Error("there needs to be one active prompt to play".into()));
            self.pause().await?;
            return Ok(());
        }
        self.inner.set_state(&mut st, PlaybackState::Loading);

        if st.session.is_none() {
            // Concurrent callers queue on the state lock and find the
            // session the first one created, rather than racing connects.
            match self.inner.connector.connect().await {
                Ok((session, rx)) => {
                    st.session = Some(Arc::new(session));
                    st.generation += 1;
                    tokio::spawn(message_loop(
                        Arc::downgrade(&self.inner),
                        st.generation,
                        rx,
                    ));
                }
                Err(e) => {
                    let msg = format!("connection error: {e:#}");
                    self.inner.emit(EngineEvent::Error(msg));
                    self.inner.set_state(&mut st, PlaybackState::Stopped);
                    return Err(e).context("failed to connect session");
                }
            }
        }
        let session = st.session.clone().context("session missing after connect")?;

        if let Err(e) = session.set_weighted_prompts(active).await {
            drop(st);
            self.inner.emit(EngineEvent::Error(format!("failed to push prompts: {e:#}")));
            self.pause().await?;
            return Ok(());
        }
        if st.config != MusicGenerationConfig::default() {
            if let Err(e) = session.set_music_generation_config(&st.config).await {
                warn!("failed to push config on play: {e:#}");
            }
        }

        st.next_start = None;
        st.sink.set_gain(0.0);
        if let Err(e) = st.sink.resume() {
            // Never stay in loading with a sink that cannot play.
            self.inner.set_state(&mut st, PlaybackState::Stopped);
            return Err(e).context("failed to resume output sink");
        }
        st.sink.ramp_gain(1.0, GAIN_RAMP_SECS);

        if let Err(e) = session.play().await {
            drop(st);
            self.inner.emit(EngineEvent::Error(format!("failed to start playback: {e:#}")));
            self.pause().await?;
        }
        Ok(())
    }

    /// Pause playback. The ramping-out sink is replaced with a fresh one so
    /// no stale ramp can leak into the next resume.
    pub async fn pause(&self) -> Result<()> {
        let mut st = self.inner.state.lock().await;
        if st.playback == PlaybackState::Stopped {
            return Ok(());
        }
        if let Some(session) = st.session.clone() {
            if let Err(e) = session.pause().await {
                warn!("pause command failed: {e:#}");
            }
        }
        st.sink.ramp_gain(0.0, GAIN_RAMP_SECS);
        st.next_start = None;
        match (self.inner.sink_factory)() {
            Ok(fresh) => {
                let old = std::mem::replace(&mut st.sink, fresh);
                // Keep the old sink alive until its fade-out finishes.
                tokio::spawn(async move {
                    tokio::time::sleep(SINK_LINGER).await;
                    drop(old);
                });
                self.inner.set_state(&mut st, PlaybackState::Paused);
                Ok(())
            }
            Err(e) => {
                // The session is already paused; report paused with the
                // ramped-down sink rather than staying in the old state.
                self.inner.set_state(&mut st, PlaybackState::Paused);
                Err(e).context("failed to open fresh output sink")
            }
        }
    }

    /// Stop playback and discard the session; the next `play()` reconnects.
    pub async fn stop(&self) -> Result<()> {
        let mut st = self.inner.state.lock().await;
        if let Some(session) = st.session.take() {
            if let Err(e) = session.stop().await {
                warn!("stop command failed: {e:#}");
            }
        }
        st.generation += 1;
        // Deterministic gain before ramping so the fade always starts from
        // a known value.
        st.sink.set_gain(1.0);
        st.sink.ramp_gain(0.0, GAIN_RAMP_SECS);
        st.next_start = None;
        self.inner.set_state(&mut st, PlaybackState::Stopped);
        Ok(())
    }

    /// Convenience toggle: playing pauses, paused/stopped plays, and an
    /// in-flight loading state is treated as cancellable.
    pub async fn play_pause(&self) -> Result<()> {
        let playback = self.inner.state.lock().await.playback;
        match playback {
            PlaybackState::Playing => self.pause().await,
            PlaybackState::Loading => self.stop().await,
            PlaybackState::Paused | PlaybackState::Stopped => self.play().await,
        }
    }
}

impl<C: SessionConnector> Inner<C> {
    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, st: &mut EngineState<C::Session>, playback: PlaybackState) {
        if st.playback != playback {
            info!(?playback, "playback state changed");
            st.playback = playback;
            self.emit(EngineEvent::StateChanged(playback));
        }
    }
}

/// The subset of the snapshot worth sending: nonzero weight, not filtered.
fn active_prompts<S>(st: &EngineState<S>) -> Vec<WeightedPrompt> {
    let mut active: Vec<WeightedPrompt> = st
        .prompts
        .values()
        .filter(|p| p.weight != 0.0 && !st.filtered.contains(&p.text))
        .map(WeightedPrompt::from)
        .collect();
    // HashMap iteration order is arbitrary; keep pushes deterministic.
    active.sort_by(|a, b| a.text.cmp(&b.text));
    active
}

/// Per-session task: drains server pushes in arrival order. Ends when the
/// channel closes; everything it does is fenced by `generation`.
async fn message_loop<C: SessionConnector>(
    inner: Weak<Inner<C>>,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(msg) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        match msg {
            ServerMessage::SetupComplete => info!("session setup complete"),
            ServerMessage::FilteredPrompt(filtered) => handle_filtered(&inner, filtered).await,
            ServerMessage::AudioChunks(chunks) => {
                handle_chunks(&inner, generation, chunks).await
            }
            ServerMessage::Error(msg) => {
                handle_fatal(&inner, generation, msg).await;
                return;
            }
            ServerMessage::Closed { code, reason } => {
                let msg = format!(
                    "connection closed ({}): {}",
                    code.map_or_else(|| "no code".into(), |c| c.to_string()),
                    reason.unwrap_or_else(|| "no reason given".into()),
                );
                handle_fatal(&inner, generation, msg).await;
                return;
            }
        }
    }
    // Channel ended without a close frame: transport dropped out from under
    // us, unless this generation was already torn down on purpose.
    if let Some(inner) = inner.upgrade() {
        handle_fatal(&inner, generation, "session ended unexpectedly".into()).await;
    }
}

async fn handle_filtered<C: SessionConnector>(inner: &Arc<Inner<C>>, filtered: FilteredPrompt) {
    let mut st = inner.state.lock().await;
    // Monotonic and idempotent; re-filtering the same text changes nothing.
    st.filtered.insert(filtered.text.clone());
    drop(st);
    inner.emit(EngineEvent::FilteredPrompt(filtered));
}

async fn handle_chunks<C: SessionConnector>(
    inner: &Arc<Inner<C>>,
    generation: u64,
    chunks: Vec<String>,
) {
    let mut st = inner.state.lock().await;
    if st.generation != generation || st.session.is_none() {
        return;
    }
    if matches!(st.playback, PlaybackState::Paused | PlaybackState::Stopped) {
        // The service keeps generating briefly after a pause; replaying
        // that audio on resume would be stale.
        return;
    }
    for data in chunks {
        let bytes = match codec::decode_base64(&data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("dropping undecodable chunk: {e:#}");
                continue;
            }
        };
        let audio = codec::decode_audio_data(&bytes, SAMPLE_RATE, CHANNELS as usize);
        if audio.frames() == 0 {
            continue;
        }
        let now = st.sink.now();
        let start = match st.next_start {
            None => {
                // First chunk after a (re)start: anchor one horizon ahead
                // and arm the timer that reports playback as started.
                let horizon = Duration::from_secs_f64(BUFFER_HORIZON_SECS);
                tokio::spawn(horizon_timer(Arc::downgrade(inner), generation, horizon));
                now + BUFFER_HORIZON_SECS
            }
            Some(t) if t < now => {
                // Underrun: playback caught up with the cursor. Drop this
                // chunk and re-anchor on the next one.
                warn!("buffer underrun, resetting scheduling cursor");
                st.next_start = None;
                inner.set_state(&mut st, PlaybackState::Loading);
                continue;
            }
            Some(t) => t,
        };
        if let Err(e) = st.sink.schedule(&audio, start) {
            warn!("failed to schedule chunk: {e:#}");
            continue;
        }
        st.next_start = Some(start + audio.duration());
    }
}

/// Flips loading → playing once the look-ahead buffer has filled.
async fn horizon_timer<C: SessionConnector>(
    inner: Weak<Inner<C>>,
    generation: u64,
    horizon: Duration,
) {
    tokio::time::sleep(horizon).await;
    let Some(inner) = inner.upgrade() else { return };
    let mut st = inner.state.lock().await;
    if st.generation == generation && st.playback == PlaybackState::Loading {
        inner.set_state(&mut st, PlaybackState::Playing);
    }
}

/// Transport error or close: surface it and force a clean stop rather than
/// leaving `playing` with a dead session.
async fn handle_fatal<C: SessionConnector>(inner: &Arc<Inner<C>>, generation: u64, msg: String) {
    let mut st = inner.state.lock().await;
    if st.generation != generation {
        return;
    }
    inner.emit(EngineEvent::Error(msg));
    st.session = None;
    st.generation += 1;
    st.next_start = None;
    st.sink.set_gain(0.0);
    inner.set_state(&mut st, PlaybackState::Stopped);
}
