//! Offline plan renderer.
//!
//! Drives the same session protocol as the live engine, but unattended: each
//! stanza's prompts (and optional config) are pushed, held for its wall-clock
//! duration while incoming PCM is collected in arrival order, and the
//! concatenated audio is packaged as a single WAV file.
//!
//! ```text
//! plan ──▶ [stanza 1] hold ──▶ [stanza 2] hold ──▶ ... ──▶ stop + drain
//!              │                   │                            │
//!              └───────────── PCM bytes, in order ──────────────┴──▶ WAV
//! ```
//!
//! A tempo or scale change at a stanza boundary resets the generation
//! context (pause, short gap, play) so the service does not smear the old
//! groove into the new one.

use crate::session::{MusicSession, ServerMessage, SessionConnector};
use crate::types::{CHANNELS, MusicGenerationConfig, MusicPlan, RenderEvent, SAMPLE_RATE};
use crate::wav;
use anyhow::{Context, Result, bail, ensure};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

/// Silence inserted at a context-reset boundary so the service starts the new
/// section from a clean state.
const CONTEXT_RESET_GAP: Duration = Duration::from_millis(200);
/// How long trailing chunks are collected after the final stop.
const DRAIN_WINDOW: Duration = Duration::from_secs(1);

pub struct PlanRenderer<C: SessionConnector> {
    connector: C,
    events: broadcast::Sender<RenderEvent>,
    busy: AtomicBool,
    cancel: watch::Sender<bool>,
}

impl<C: SessionConnector> PlanRenderer<C> {
    pub fn new(connector: C) -> Self {
        let (events, _) = broadcast::channel(16);
        let (cancel, _) = watch::channel(false);
        Self { connector, events, busy: AtomicBool::new(false), cancel }
    }

    /// Per-stanza progress and error notifications.
    pub fn events(&self) -> broadcast::Receiver<RenderEvent> {
        self.events.subscribe()
    }

    /// Abort the in-flight render, if any. Safe to call at any point and any
    /// number of times; the pending `generate()` returns a cancellation
    /// error and discards its audio.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Render the whole plan to an in-memory WAV file. At most one render
    /// runs at a time; a second call while one is in flight is rejected
    /// without touching the running one.
    pub async fn generate(&self, plan: &MusicPlan) -> Result<Vec<u8>> {
        ensure!(!plan.stanzas.is_empty(), "plan '{}' has no stanzas", plan.title);
        for (i, stanza) in plan.stanzas.iter().enumerate() {
            ensure!(
                stanza.seconds > 0.0,
                "stanza {} of plan '{}' has a non-positive duration",
                i + 1,
                plan.title,
            );
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            bail!("a render is already in progress");
        }
        let _guard = BusyGuard(&self.busy);
        // A cancel left over from before this run does not apply to it.
        self.cancel.send_replace(false);
        let mut cancel_rx = self.cancel.subscribe();

        let result = self.run(plan, &mut cancel_rx).await;
        if let Err(e) = &result {
            let _ = self.events.send(RenderEvent::Error(format!("{e:#}")));
        }
        result
    }

    async fn run(
        &self,
        plan: &MusicPlan,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<Vec<u8>> {
        let (session, mut rx) =
            self.connector.connect().await.context("failed to connect render session")?;
        let total = plan.stanzas.len();
        let mut pcm: Vec<u8> = Vec::new();
        let mut effective = MusicGenerationConfig::default();

        for (i, stanza) in plan.stanzas.iter().enumerate() {
            info!(stanza = i + 1, total, plan = %plan.title, "rendering stanza");
            let _ = self.events.send(RenderEvent::Progress {
                current: i + 1,
                total,
                stanza: stanza.clone(),
            });

            session
                .set_weighted_prompts(stanza.prompts.clone())
                .await
                .context("prompt push failed")?;
            if let Some(config) = &stanza.config {
                session
                    .set_music_generation_config(config)
                    .await
                    .context("config push failed")?;
                effective = config.clone();
            }
            if i == 0 {
                session.play().await.context("play command failed")?;
            }

            hold(Duration::from_secs_f64(stanza.seconds), &mut rx, &mut pcm, cancel_rx)
                .await?;

            // A tempo or scale change in the next stanza needs a clean
            // generation context; an in-place switch smears audibly.
            let reset = plan.stanzas.get(i + 1).is_some_and(|next| {
                next.config
                    .as_ref()
                    .is_some_and(|c| c.bpm != effective.bpm || c.scale != effective.scale)
            });
            if reset {
                session.pause().await.context("pause at context reset failed")?;
                hold(CONTEXT_RESET_GAP, &mut rx, &mut pcm, cancel_rx).await?;
                session.play().await.context("play after context reset failed")?;
            }
        }

        if let Err(e) = session.stop().await {
            warn!("stop at end of render failed: {e:#}");
        }
        drain(&mut rx, &mut pcm, cancel_rx).await?;

        wav::package_wav(&pcm, SAMPLE_RATE, CHANNELS)
    }
}

/// Resets the busy flag when the render ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Wait out `duration` while collecting whatever the session sends.
async fn hold(
    duration: Duration,
    rx: &mut mpsc::UnboundedReceiver<ServerMessage>,
    pcm: &mut Vec<u8>,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    if *cancel_rx.borrow_and_update() {
        bail!("render cancelled");
    }
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return Ok(()),
            changed = cancel_rx.changed() => {
                if changed.is_ok() && *cancel_rx.borrow_and_update() {
                    bail!("render cancelled");
                }
            }
            msg = rx.recv() => match msg {
                Some(ServerMessage::AudioChunks(chunks)) => append_chunks(pcm, chunks),
                Some(ServerMessage::FilteredPrompt(f)) => {
                    warn!(text = %f.text, reason = ?f.filtered_reason, "prompt filtered during render");
                }
                Some(ServerMessage::SetupComplete) => {}
                Some(ServerMessage::Error(msg)) => bail!("session error during render: {msg}"),
                Some(ServerMessage::Closed { .. }) => bail!("connection closed during render"),
                None => bail!("session ended during render"),
            },
        }
    }
}

/// Collect trailing chunks after the final stop, bounded by [`DRAIN_WINDOW`].
/// A cancel during the drain still aborts the render.
async fn drain(
    rx: &mut mpsc::UnboundedReceiver<ServerMessage>,
    pcm: &mut Vec<u8>,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    if *cancel_rx.borrow_and_update() {
        bail!("render cancelled");
    }
    let deadline = tokio::time::sleep(DRAIN_WINDOW);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return Ok(()),
            changed = cancel_rx.changed() => {
                if changed.is_ok() && *cancel_rx.borrow_and_update() {
                    bail!("render cancelled");
                }
            }
            msg = rx.recv() => match msg {
                Some(ServerMessage::AudioChunks(chunks)) => append_chunks(pcm, chunks),
                Some(_) => {}
                None => return Ok(()),
            },
        }
    }
}

fn append_chunks(pcm: &mut Vec<u8>, chunks: Vec<String>) {
    let frame = CHANNELS as usize * 2;
    for data in chunks {
        match crate::codec::decode_base64(&data) {
            Ok(mut bytes) => {
                // Partial trailing frames never make it into the file.
                bytes.truncate(bytes.len() / frame * frame);
                pcm.extend_from_slice(&bytes);
            }
            Err(e) => warn!("dropping undecodable chunk: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Stanza, WeightedPrompt};
    use anyhow::Result;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::time::advance;

    #[derive(Default)]
    struct Hub {
        commands: StdMutex<Vec<String>>,
        server_tx: StdMutex<Option<mpsc::UnboundedSender<ServerMessage>>>,
    }

    impl Hub {
        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        fn push_chunks(&self, chunks: Vec<String>) {
            self.server_tx
                .lock()
                .unwrap()
                .as_ref()
                .expect("no session connected")
                .send(ServerMessage::AudioChunks(chunks))
                .unwrap();
        }
    }

    struct FakeSession {
        hub: Arc<Hub>,
    }

    impl MusicSession for FakeSession {
        async fn set_weighted_prompts(&self, prompts: Vec<WeightedPrompt>) -> Result<()> {
            let texts: Vec<&str> = prompts.iter().map(|p| p.text.as_str()).collect();
            self.hub.commands.lock().unwrap().push(format!("prompts:{}", texts.join(",")));
            Ok(())
        }
        async fn set_music_generation_config(&self, cfg: &MusicGenerationConfig) -> Result<()> {
            self.hub
                .commands
                .lock()
                .unwrap()
                .push(format!("config:bpm={:?},scale={:?}", cfg.bpm, cfg.scale));
            Ok(())
        }
        async fn play(&self) -> Result<()> {
            self.hub.commands.lock().unwrap().push("play".into());
            Ok(())
        }
        async fn pause(&self) -> Result<()> {
            self.hub.commands.lock().unwrap().push("pause".into());
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.hub.commands.lock().unwrap().push("stop".into());
            Ok(())
        }
    }

    struct FakeConnector {
        hub: Arc<Hub>,
    }

    impl SessionConnector for FakeConnector {
        type Session = FakeSession;
        async fn connect(
            &self,
        ) -> Result<(FakeSession, mpsc::UnboundedReceiver<ServerMessage>)> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.hub.server_tx.lock().unwrap() = Some(tx);
            Ok((FakeSession { hub: self.hub.clone() }, rx))
        }
    }

    fn renderer() -> (Arc<PlanRenderer<FakeConnector>>, Arc<Hub>) {
        let hub = Arc::new(Hub::default());
        (Arc::new(PlanRenderer::new(FakeConnector { hub: hub.clone() })), hub)
    }

    fn stanza(text: &str, seconds: f64, bpm: Option<u16>) -> Stanza {
        Stanza {
            prompts: vec![WeightedPrompt { text: text.into(), weight: 1.0 }],
            seconds,
            config: bpm.map(|bpm| MusicGenerationConfig { bpm: Some(bpm), ..Default::default() }),
        }
    }

    fn chunk_b64(frames: usize) -> String {
        data_encoding::BASE64.encode(&vec![0u8; frames * CHANNELS as usize * 2])
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn two_stanza_plan_renders_one_wav() {
        let (renderer, hub) = renderer();
        let mut events = renderer.events();
        let plan = MusicPlan {
            title: "Dusk".into(),
            stanzas: vec![stanza("calm", 1.0, None), stanza("tense", 1.0, Some(140))],
        };

        let task = tokio::spawn({
            let renderer = renderer.clone();
            async move { renderer.generate(&plan).await }
        });
        settle().await;
        hub.push_chunks(vec![chunk_b64(480), chunk_b64(480)]);
        settle().await;

        // Timers auto-advance under the paused clock; the render runs to
        // completion on its own.
        let wav = task.await.unwrap().unwrap();
        assert_eq!(wav.len(), 44 + 2 * 480 * CHANNELS as usize * 2);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");

        // The tempo change at the second stanza resets the context at the
        // boundary: pause, short gap, play, then the new prompts and config.
        assert_eq!(
            hub.commands(),
            vec![
                "prompts:calm",
                "play",
                "pause",
                "play",
                "prompts:tense",
                "config:bpm=Some(140),scale=None",
                "stop",
            ],
        );

        let progress: Vec<(usize, usize)> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|ev| match ev {
                RenderEvent::Progress { current, total, .. } => Some((current, total)),
                RenderEvent::Error(_) => None,
            })
            .collect();
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn same_tempo_and_scale_skip_the_context_reset() {
        let (renderer, hub) = renderer();
        let plan = MusicPlan {
            title: "Steady".into(),
            stanzas: vec![stanza("calm", 0.5, Some(120)), stanza("warm", 0.5, Some(120))],
        };
        renderer.generate(&plan).await.unwrap();
        let commands = hub.commands();
        assert!(!commands.contains(&"pause".to_string()));
        // Only the opening play; the second stanza continues the stream.
        assert_eq!(commands.iter().filter(|c| *c == "play").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_generate_while_busy_is_rejected() {
        let (renderer, hub) = renderer();
        let plan = MusicPlan { title: "Long".into(), stanzas: vec![stanza("calm", 30.0, None)] };

        let task = tokio::spawn({
            let renderer = renderer.clone();
            let plan = plan.clone();
            async move { renderer.generate(&plan).await }
        });
        settle().await;

        let err = renderer.generate(&plan).await.unwrap_err();
        assert!(err.to_string().contains("already in progress"));
        // The running render was not disturbed by the rejection.
        assert_eq!(hub.commands(), vec!["prompts:calm", "play"]);

        renderer.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_the_drain_window_aborts() {
        let (renderer, hub) = renderer();
        let plan = MusicPlan { title: "Tail".into(), stanzas: vec![stanza("calm", 0.5, None)] };

        let task = tokio::spawn({
            let renderer = renderer.clone();
            async move { renderer.generate(&plan).await }
        });
        settle().await;
        // Finish the only stanza; the render is now inside the drain.
        advance(Duration::from_millis(500)).await;
        settle().await;
        assert!(hub.commands().contains(&"stop".to_string()));

        renderer.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_and_does_not_poison_the_next_run() {
        let (renderer, _hub) = renderer();
        // No render in flight; these are no-ops.
        renderer.cancel();
        renderer.cancel();

        let plan = MusicPlan { title: "Short".into(), stanzas: vec![stanza("calm", 0.1, None)] };
        let wav = renderer.generate(&plan).await.unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_plan_is_rejected_before_connecting() {
        let (renderer, hub) = renderer();
        let plan = MusicPlan { title: "Empty".into(), stanzas: vec![] };
        assert!(renderer.generate(&plan).await.is_err());
        assert!(hub.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn non_positive_stanza_duration_is_rejected() {
        let (renderer, _hub) = renderer();
        let plan = MusicPlan { title: "Zero".into(), stanzas: vec![stanza("calm", 0.0, None)] };
        let err = renderer.generate(&plan).await.unwrap_err();
        assert!(err.to_string().contains("non-positive"));
    }

    #[tokio::test(start_paused = true)]
    async fn odd_trailing_bytes_are_truncated_to_whole_frames() {
        let mut pcm = Vec::new();
        // One whole frame plus two stray bytes.
        let bytes = vec![0u8; CHANNELS as usize * 2 + 2];
        append_chunks(&mut pcm, vec![data_encoding::BASE64.encode(&bytes)]);
        assert_eq!(pcm.len(), CHANNELS as usize * 2);
    }
}
