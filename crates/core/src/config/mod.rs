use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Chaining, Phrasing, Result, Tempo, VoiceKind};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub audio: AudioConfig,
    pub voice: VoiceConfig,
    pub catalog: CatalogConfig,
}

impl AppConfig {
    /// Reads a JSON config file. Missing sections and fields keep their
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Settings the sequencing engine starts with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub bpm: Tempo,
    pub volume: f32,
    pub beat_sound: bool,
    pub phrasing: Phrasing,
    /// Beats before the end of a move at which the next one is called.
    pub lookahead_beats: u32,
    pub chaining: Chaining,
    /// Seed for move selection; a fresh random sequence when absent.
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bpm: Tempo::default(),
            volume: 0.5,
            beat_sound: true,
            phrasing: Phrasing::default(),
            lookahead_beats: 2,
            chaining: Chaining::default(),
            seed: None,
        }
    }
}

/// Configuration specific to the beat tone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub tone_ms: u64,
    pub normal_hz: f32,
    pub accent_hz: f32,
    pub output: ToneOutput,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            tone_ms: 100,
            normal_hz: 800.0,
            accent_hz: 1200.0,
            output: ToneOutput::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToneOutput {
    #[default]
    None,
    /// The default output device.
    Device,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub preferred_voice: Option<String>,
    pub callout_prefix: String,
    pub backend: VoiceKind,
    /// Speech program to run for the command backend.
    pub command: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            preferred_voice: Some("Google US English".to_string()),
            callout_prefix: "Next move: ".to_string(),
            backend: VoiceKind::default(),
            command: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub path: Option<PathBuf>,
}
