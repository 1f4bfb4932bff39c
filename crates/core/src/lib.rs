//! Core library for the Move Caller practice aid.
//!
//! Move Caller announces partner-dance moves on a steady pulse so a solo
//! dancer can drill transitions. Each module owns one piece of that loop:
//! the move catalog, the beat clock, the click tone, the spoken callouts, the
//! sequencing engine that ties them together, and the session task that
//! drives the engine from a single cooperative context.

pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod tone;
pub mod voice;

pub use catalog::{CatalogReport, Move, MoveCatalog, TagSet};
pub use clock::{BeatClock, Tempo, MAX_BPM, MIN_BPM};
pub use config::{AppConfig, AudioConfig, CatalogConfig, EngineConfig, ToneOutput, VoiceConfig};
pub use engine::{Chaining, EngineSnapshot, EngineState, SequenceEngine};
pub use error::{CallerError, Result};
pub use session::{Session, SessionHandle};
pub use tone::{render_tone, NullSink, Phrasing, Tone, ToneEmitter, ToneSink};
pub use voice::{Announcer, CommandVoice, LogVoice, VoiceBackend, VoiceKind, VoiceListing};
