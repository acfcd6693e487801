//! Shared data model: prompts, playback state, generation config, plans,
//! and the event variants broadcast by the engine and renderer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Output format every received chunk is assumed to be in.
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u16 = 2;

/// A caller-owned mood prompt. `prompt_id` is stable across weight edits;
/// `color` is UI metadata and never sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub prompt_id: String,
    pub text: String,
    /// Influence of this prompt on the generated audio, 0.0..=2.0.
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Immutable snapshot of the full prompt set, replaced wholesale on every
/// update so in-flight work always sees a consistent view.
pub type PromptMap = Arc<HashMap<String, Prompt>>;

/// Wire form of a prompt: text and weight only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedPrompt {
    pub text: String,
    pub weight: f64,
}

impl From<&Prompt> for WeightedPrompt {
    fn from(p: &Prompt) -> Self {
        Self { text: p.text.clone(), weight: p.weight }
    }
}

/// Generation parameters pushed to the service. All fields optional;
/// `None` leaves the service default in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MusicGenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpm: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute_bass: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute_drums: Option<bool>,
}

/// Live playback state. Exactly one value at any time; every transition is
/// broadcast as [`EngineEvent::StateChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Stopped,
    Loading,
    Playing,
    Paused,
}

/// One ordered section of an offline render plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stanza {
    pub prompts: Vec<WeightedPrompt>,
    /// How long this section is held, in wall-clock seconds. Must be > 0.
    pub seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<MusicGenerationConfig>,
}

/// An offline render plan: ordered stanzas consumed strictly in order.
/// Immutable once generation starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicPlan {
    pub title: String,
    pub stanzas: Vec<Stanza>,
}

/// A prompt the service rejected, with the reason it gave.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredPrompt {
    pub text: String,
    #[serde(default)]
    pub filtered_reason: Option<String>,
}

/// Events broadcast by the live engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(PlaybackState),
    FilteredPrompt(FilteredPrompt),
    Error(String),
}

/// Events broadcast by the plan renderer.
#[derive(Debug, Clone)]
pub enum RenderEvent {
    /// About to generate stanza `current` of `total` (1-based).
    Progress { current: usize, total: usize, stanza: Stanza },
    Error(String),
}
