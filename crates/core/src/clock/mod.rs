use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::{CallerError, Result};

pub const MIN_BPM: u32 = 1;
pub const MAX_BPM: u32 = 400;

/// Beats per minute, always within `MIN_BPM..=MAX_BPM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u32")]
pub struct Tempo(u32);

impl Tempo {
    /// Validates `bpm`, rejecting anything outside `MIN_BPM..=MAX_BPM` with
    /// [`CallerError::InvalidTempo`].
    pub fn new(bpm: i64) -> Result<Self> {
        match u32::try_from(bpm) {
            Ok(bpm) if (MIN_BPM..=MAX_BPM).contains(&bpm) => Ok(Self(bpm)),
            _ => Err(CallerError::InvalidTempo(bpm)),
        }
    }

    /// Beats per minute.
    pub fn bpm(self) -> u32 {
        self.0
    }

    /// Length of one beat, `60000 / bpm` milliseconds.
    pub fn period(self) -> Duration {
        Duration::from_nanos(60_000_000_000 / u64::from(self.0))
    }
}

impl Default for Tempo {
    fn default() -> Self {
        Self(80)
    }
}

impl TryFrom<i64> for Tempo {
    type Error = CallerError;

    fn try_from(bpm: i64) -> Result<Self> {
        Self::new(bpm)
    }
}

impl From<Tempo> for u32 {
    fn from(tempo: Tempo) -> Self {
        tempo.0
    }
}

impl FromStr for Tempo {
    type Err = CallerError;

    fn from_str(s: &str) -> Result<Self> {
        let bpm: i64 = s
            .trim()
            .parse()
            .map_err(|_| CallerError::msg(format!("tempo `{s}` is not a whole number")))?;
        Self::new(bpm)
    }
}

impl fmt::Display for Tempo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bpm", self.0)
    }
}

/// Periodic beat source driven by the tokio timer.
///
/// Beat 0 fires at the start instant and beat `k` at `start + k * period`.
/// Late ticks are skipped rather than bunched, so at most one tick is
/// delivered per period boundary. Beat numbers come from elapsed time, so a
/// stalled consumer sees a jump in the index rather than a shifted grid.
#[derive(Debug, Default)]
pub struct BeatClock {
    interval: Option<Interval>,
    period: Duration,
    /// Instant at which `anchor_beat` is due.
    anchor: Option<Instant>,
    anchor_beat: u64,
    next_beat: u64,
}

impl BeatClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts ticking now with the given period, resetting the beat counter.
    /// Returns the instant of beat 0.
    pub fn start(&mut self, period: Duration) -> Instant {
        let now = Instant::now();
        self.interval = Some(skipping_interval(now, period));
        self.period = period;
        self.anchor = Some(now);
        self.anchor_beat = 0;
        self.next_beat = 0;
        now
    }

    /// Halts future ticks. Safe to call when not running.
    pub fn stop(&mut self) {
        self.interval = None;
        self.anchor = None;
        self.anchor_beat = 0;
        self.next_beat = 0;
    }

    /// Changes the period from the next tick onward. The fraction of the
    /// current period already elapsed is not compensated for.
    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
        if let Some(interval) = self.interval.as_mut() {
            let first = Instant::now() + period;
            *interval = skipping_interval(first, period);
            self.anchor = Some(first);
            self.anchor_beat = self.next_beat;
        }
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Current beat length.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Waits for the next beat and returns its index. Pends forever while
    /// stopped. Cancel safe.
    pub async fn tick(&mut self) -> u64 {
        let Some(interval) = self.interval.as_mut() else {
            return std::future::pending().await;
        };
        interval.tick().await;

        let beat = self.beat_at(Instant::now()).max(self.next_beat);
        self.next_beat = beat + 1;
        beat
    }

    /// Index of the beat whose slot contains `at`.
    fn beat_at(&self, at: Instant) -> u64 {
        let Some(anchor) = self.anchor else {
            return self.next_beat;
        };
        let elapsed = at.saturating_duration_since(anchor).as_nanos();
        let period = self.period.as_nanos().max(1);
        self.anchor_beat + (elapsed / period) as u64
    }
}

fn skipping_interval(start: Instant, period: Duration) -> Interval {
    let mut interval = time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_is_sixty_thousand_over_bpm() {
        for bpm in [1, 7, 60, 80, 120, 128, 333, 400] {
            let tempo = Tempo::new(bpm).unwrap();
            let millis = tempo.period().as_secs_f64() * 1000.0;
            assert!((millis - 60_000.0 / bpm as f64).abs() < 1e-6, "bpm {bpm}");
        }
        assert_eq!(Tempo::new(120).unwrap().period(), Duration::from_millis(500));
    }

    #[test]
    fn rejects_invalid_tempo() {
        assert!(matches!(Tempo::new(0), Err(CallerError::InvalidTempo(0))));
        assert!(matches!(Tempo::new(-5), Err(CallerError::InvalidTempo(-5))));
        assert!(Tempo::new(401).is_err());
        assert!("fast".parse::<Tempo>().is_err());
        assert_eq!(" 96 ".parse::<Tempo>().unwrap().bpm(), 96);
    }

    #[test]
    fn deserializes_through_validation() {
        let tempo: Tempo = serde_json::from_str("100").unwrap();
        assert_eq!(tempo.bpm(), 100);
        assert!(serde_json::from_str::<Tempo>("0").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_on_a_strict_period_from_zero() {
        let mut clock = BeatClock::new();
        let period = Tempo::new(120).unwrap().period();
        let start = clock.start(period);

        for expected in 0..8u64 {
            let beat = clock.tick().await;
            assert_eq!(beat, expected);
            assert_eq!(Instant::now() - start, period * expected as u32);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn beats_keep_their_slot_after_a_stall() {
        let mut clock = BeatClock::new();
        let start = clock.start(Duration::from_millis(500));
        assert_eq!(clock.tick().await, 0);

        time::sleep(Duration::from_millis(1700)).await;

        // The late tick belongs to the slot starting at 1.5s.
        assert_eq!(clock.tick().await, 3);
        assert_eq!(Instant::now() - start, Duration::from_millis(1700));
        assert_eq!(clock.tick().await, 4);
        assert_eq!(Instant::now() - start, Duration::from_millis(2000));
        assert_eq!(clock.tick().await, 5);
        assert_eq!(Instant::now() - start, Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_silences_ticks() {
        let mut clock = BeatClock::new();
        clock.stop();
        clock.start(Duration::from_millis(500));
        clock.tick().await;
        clock.stop();
        clock.stop();

        assert!(!clock.is_running());
        let silent = time::timeout(Duration::from_secs(5), clock.tick()).await;
        assert!(silent.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn period_change_applies_from_next_tick() {
        let mut clock = BeatClock::new();
        clock.start(Duration::from_millis(500));
        assert_eq!(clock.tick().await, 0);

        let changed_at = Instant::now();
        clock.set_period(Duration::from_millis(250));
        assert_eq!(clock.tick().await, 1);
        assert_eq!(Instant::now() - changed_at, Duration::from_millis(250));
        assert_eq!(clock.tick().await, 2);
        assert_eq!(Instant::now() - changed_at, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resets_the_counter() {
        let mut clock = BeatClock::new();
        clock.start(Duration::from_millis(100));
        clock.tick().await;
        clock.tick().await;

        clock.start(Duration::from_millis(100));
        assert_eq!(clock.tick().await, 0);
    }
}
