use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{AudioConfig, ToneOutput};
use crate::Result;

#[cfg(feature = "device")]
mod device;
mod worker;
#[cfg(feature = "device")]
pub use device::DeviceSink;

/// Gain the envelope decays to by the end of the tone.
const ENVELOPE_FLOOR: f32 = 0.001;

/// Which beats of the phrase receive the accent tone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phrasing {
    /// Accent the last beat of every four.
    #[default]
    FourCount,
    /// Accent beats 4 and 8 of every eight.
    EightCount,
}

impl Phrasing {
    pub fn is_accent(self, beat: u64) -> bool {
        match self {
            Self::FourCount => beat % 4 == 3,
            Self::EightCount => matches!(beat % 8, 3 | 7),
        }
    }
}

/// A single click, described independently of any output rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub beat: u64,
    pub frequency: f32,
    pub volume: f32,
    pub duration: Duration,
}

impl Tone {
    /// Renders the click as mono samples: a sine at the carrier whose gain
    /// starts at `volume` and decays exponentially to the envelope floor.
    pub fn render(&self, sample_rate: u32) -> Vec<f32> {
        render_tone(self.frequency, self.volume, sample_rate, self.duration)
    }
}

pub fn render_tone(frequency: f32, volume: f32, sample_rate: u32, duration: Duration) -> Vec<f32> {
    let volume = volume.clamp(0.0, 1.0);
    if volume <= 0.0 || sample_rate == 0 {
        return Vec::new();
    }

    let rate = sample_rate as f32;
    let length = (duration.as_secs_f32() * rate).round() as usize;
    let ratio = (ENVELOPE_FLOOR / volume).min(1.0);
    (0..length)
        .map(|n| {
            let progress = n as f32 / length as f32;
            let gain = volume * ratio.powf(progress);
            gain * (2.0 * PI * frequency * n as f32 / rate).sin()
        })
        .collect()
}

/// Destination for rendered clicks.
pub trait ToneSink: Send + Sync {
    /// Starts playback of the tone without waiting for it to finish.
    fn play(&self, tone: &Tone) -> Result<()>;
}

/// Discards every tone.
#[derive(Debug, Default)]
pub struct NullSink;

impl ToneSink for NullSink {
    fn play(&self, tone: &Tone) -> Result<()> {
        debug!(beat = tone.beat, frequency = tone.frequency, "tone");
        Ok(())
    }
}

/// Builds the sink selected in the audio config. Falls back to
/// [`NullSink`] when the requested output is not compiled in.
pub fn sink_for(output: ToneOutput) -> Box<dyn ToneSink> {
    match output {
        ToneOutput::None => Box::new(NullSink),
        #[cfg(feature = "device")]
        ToneOutput::Device => match DeviceSink::new() {
            Ok(sink) => Box::new(sink),
            Err(err) => {
                warn!(%err, "could not start tone output, beat tones are muted");
                Box::new(NullSink)
            }
        },
        #[cfg(not(feature = "device"))]
        ToneOutput::Device => {
            warn!("built without the `device` feature, beat tones are muted");
            Box::new(NullSink)
        }
    }
}

/// Turns beat indices into clicks, with a higher pitch on accent beats.
pub struct ToneEmitter {
    phrasing: Phrasing,
    normal_hz: f32,
    accent_hz: f32,
    duration: Duration,
    sink: Box<dyn ToneSink>,
    failing: AtomicBool,
}

impl ToneEmitter {
    pub fn new(config: &AudioConfig, phrasing: Phrasing, sink: Box<dyn ToneSink>) -> Self {
        Self {
            phrasing,
            normal_hz: config.normal_hz,
            accent_hz: config.accent_hz,
            duration: Duration::from_millis(config.tone_ms),
            sink,
            failing: AtomicBool::new(false),
        }
    }

    pub fn phrasing(&self) -> Phrasing {
        self.phrasing
    }

    pub fn frequency(&self, beat: u64) -> f32 {
        if self.phrasing.is_accent(beat) {
            self.accent_hz
        } else {
            self.normal_hz
        }
    }

    /// Plays one click for `beat`. Silent for zero volume; sink failures are
    /// logged and otherwise ignored.
    pub fn emit(&self, beat: u64, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        if volume <= 0.0 {
            return;
        }

        let tone = Tone {
            beat,
            frequency: self.frequency(beat),
            volume,
            duration: self.duration,
        };
        match self.sink.play(&tone) {
            Ok(()) => self.failing.store(false, Ordering::Relaxed),
            Err(err) => {
                if self.failing.swap(true, Ordering::Relaxed) {
                    debug!(beat, %err, "tone output still unavailable");
                } else {
                    warn!(beat, %err, "tone output unavailable, continuing silently");
                }
            }
        }
    }
}

impl std::fmt::Debug for ToneEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToneEmitter")
            .field("phrasing", &self.phrasing)
            .field("normal_hz", &self.normal_hz)
            .field("accent_hz", &self.accent_hz)
            .field("duration", &self.duration)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::CallerError;

    /// Sink that keeps every tone it is handed.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub tones: Arc<Mutex<Vec<(tokio::time::Instant, Tone)>>>,
    }

    impl ToneSink for RecordingSink {
        fn play(&self, tone: &Tone) -> Result<()> {
            self.tones
                .lock()
                .unwrap()
                .push((tokio::time::Instant::now(), *tone));
            Ok(())
        }
    }

    struct BrokenSink;

    impl ToneSink for BrokenSink {
        fn play(&self, _tone: &Tone) -> Result<()> {
            Err(CallerError::AudioUnavailable("no device".into()))
        }
    }

    #[test]
    fn accent_rule_is_deterministic() {
        for beat in 0..64u64 {
            assert_eq!(Phrasing::FourCount.is_accent(beat), beat % 4 == 3);
            assert_eq!(
                Phrasing::EightCount.is_accent(beat),
                beat % 8 == 3 || beat % 8 == 7
            );
        }
    }

    #[test]
    fn accent_beats_use_the_higher_pitch() {
        let emitter = ToneEmitter::new(&AudioConfig::default(), Phrasing::FourCount, Box::new(NullSink));
        for beat in 0..32u64 {
            let expected = if beat % 4 == 3 { 1200.0 } else { 800.0 };
            assert_eq!(emitter.frequency(beat), expected);
        }
    }

    #[test]
    fn emits_through_the_sink() {
        let sink = RecordingSink::default();
        let emitter = ToneEmitter::new(&AudioConfig::default(), Phrasing::FourCount, Box::new(sink.clone()));

        emitter.emit(2, 0.5);
        emitter.emit(3, 2.0);

        let tones = sink.tones.lock().unwrap();
        assert_eq!(tones.len(), 2);
        assert_eq!(tones[0].1.frequency, 800.0);
        assert_eq!(tones[1].1.frequency, 1200.0);
        assert_eq!(tones[1].1.volume, 1.0);
        assert_eq!(tones[1].1.duration, Duration::from_millis(100));
    }

    #[test]
    fn zero_volume_is_silent() {
        let sink = RecordingSink::default();
        let emitter = ToneEmitter::new(&AudioConfig::default(), Phrasing::FourCount, Box::new(sink.clone()));

        emitter.emit(0, 0.0);
        emitter.emit(1, -1.0);

        assert!(sink.tones.lock().unwrap().is_empty());
        assert!(render_tone(800.0, 0.0, 48_000, Duration::from_millis(100)).is_empty());
    }

    #[test]
    fn failing_sink_does_not_propagate() {
        let emitter = ToneEmitter::new(&AudioConfig::default(), Phrasing::FourCount, Box::new(BrokenSink));
        emitter.emit(0, 0.5);
        emitter.emit(1, 0.5);
    }

    #[test]
    fn rendered_click_decays() {
        let samples = render_tone(800.0, 0.8, 8_000, Duration::from_millis(100));
        assert_eq!(samples.len(), 800);

        let peak = |range: &[f32]| range.iter().fold(0.0_f32, |acc, s| acc.max(s.abs()));
        let head = peak(&samples[..100]);
        let tail = peak(&samples[700..]);
        assert!(head <= 0.8 + f32::EPSILON);
        assert!(head > 0.3);
        assert!(tail < 0.01);
    }
}
