use std::collections::VecDeque;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::{Announcer, BeatClock, CallerError, Move, MoveCatalog, Result, Tempo, ToneEmitter};

/// How the next move is chosen once the current one has been running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chaining {
    /// Uniformly from the whole catalog.
    Random,
    /// Uniformly from the moves entered from the current move's exit frame,
    /// or the whole catalog when none are.
    #[default]
    EntryExit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    #[default]
    Idle,
    Running,
}

/// Observable engine state, for display only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub beat: u64,
    pub current_move: Option<Arc<Move>>,
    pub next_move: Option<Arc<Move>>,
    pub tempo: Tempo,
    pub volume: f32,
    pub beat_sound_enabled: bool,
}

impl EngineSnapshot {
    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Pick and announce the next move.
    Callout,
    /// Promote the next move to current.
    Handoff,
}

/// Per-move work queued at a fixed instant. Only runs if `epoch` still
/// matches the engine's.
#[derive(Debug, Clone, Copy)]
struct Deferred {
    due: Instant,
    epoch: u64,
    action: Action,
}

/// The move-sequencing state machine.
///
/// Owns the beat clock and the queue of per-move actions. Whoever drives the
/// engine waits on [`SequenceEngine::wait_for_beat`] and
/// [`SequenceEngine::next_deadline`] and feeds the results back through
/// [`SequenceEngine::on_tick`] and [`SequenceEngine::run_due`], all from a
/// single task.
pub struct SequenceEngine {
    catalog: MoveCatalog,
    clock: BeatClock,
    tone: ToneEmitter,
    announcer: Announcer,
    rng: StdRng,
    chaining: Chaining,
    lookahead_beats: u32,
    tempo: Tempo,
    volume: f32,
    beat_sound: bool,
    state: EngineState,
    beat: u64,
    current: Option<Arc<Move>>,
    next: Option<Arc<Move>>,
    epoch: u64,
    pending: VecDeque<Deferred>,
}

impl SequenceEngine {
    pub fn new(
        catalog: MoveCatalog,
        config: &EngineConfig,
        tone: ToneEmitter,
        announcer: Announcer,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            catalog,
            clock: BeatClock::new(),
            tone,
            announcer,
            rng,
            chaining: config.chaining,
            lookahead_beats: config.lookahead_beats,
            tempo: config.bpm,
            volume: config.volume.clamp(0.0, 1.0),
            beat_sound: config.beat_sound,
            state: EngineState::Idle,
            beat: 0,
            current: None,
            next: None,
            epoch: 0,
            pending: VecDeque::new(),
        }
    }

    /// Starts sequencing at the configured tempo. Restarts when already
    /// running. Fails and stays idle with an empty catalog.
    pub fn start(&mut self) -> Result<()> {
        if self.catalog.is_empty() {
            warn!("refusing to start without any moves");
            return Err(CallerError::EmptyCatalog);
        }
        if self.state == EngineState::Running {
            self.stop();
        }

        let first = self
            .catalog
            .pick_random(&mut self.rng, None)
            .ok_or(CallerError::EmptyCatalog)?;

        self.epoch += 1;
        self.pending.clear();
        let started_at = self.clock.start(self.tempo.period());
        self.state = EngineState::Running;
        self.beat = 0;
        self.next = None;
        info!(tempo = %self.tempo, first = first.name(), "started");
        self.current = Some(first);
        self.schedule_current(started_at);
        Ok(())
    }

    /// Cancels the clock and every pending callout or handoff, and clears
    /// the move state. Idempotent.
    pub fn stop(&mut self) {
        self.epoch += 1;
        self.pending.clear();
        self.clock.stop();
        self.beat = 0;
        self.current = None;
        self.next = None;
        if self.state == EngineState::Running {
            self.state = EngineState::Idle;
            info!("stopped");
        }
    }

    /// Waits for the next beat of the clock. Pends forever while idle.
    pub async fn wait_for_beat(&mut self) -> u64 {
        self.clock.tick().await
    }

    /// Handles one clock tick.
    pub fn on_tick(&mut self, beat: u64) {
        if self.state != EngineState::Running {
            return;
        }
        self.beat = beat;
        debug!(beat, "tick");
        if self.beat_sound {
            self.tone.emit(beat, self.volume);
        }
    }

    /// Instant of the earliest pending per-move action.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.front().map(|deferred| deferred.due)
    }

    /// Runs every per-move action due at or before `now`.
    pub fn run_due(&mut self, now: Instant) {
        while let Some(deferred) = self.pending.front().copied() {
            if deferred.due > now {
                break;
            }
            self.pending.pop_front();
            if deferred.epoch != self.epoch {
                debug!(action = ?deferred.action, "dropping stale action");
                continue;
            }
            match deferred.action {
                Action::Callout => self.call_next(),
                Action::Handoff => self.hand_off(deferred.due),
            }
        }
    }

    /// Takes effect on the next start.
    pub fn set_tempo(&mut self, tempo: Tempo) {
        if self.state == EngineState::Running && tempo != self.tempo {
            debug!(%tempo, "tempo change applies on next start");
        }
        self.tempo = tempo;
    }

    /// Clamped to `[0, 1]`; applies from the next tick.
    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        if !volume.is_finite() {
            return Err(CallerError::InvalidVolume(volume));
        }
        self.volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn set_beat_sound_enabled(&mut self, enabled: bool) {
        self.beat_sound = enabled;
    }

    /// Whether the engine is idle or running.
    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running
    }

    /// Index of the last beat ticked since start, 0 while idle.
    pub fn beat(&self) -> u64 {
        self.beat
    }

    /// The move being danced, `None` while idle.
    pub fn current_move(&self) -> Option<&Arc<Move>> {
        self.current.as_ref()
    }

    /// The move already called out, until the handoff promotes it.
    pub fn next_move(&self) -> Option<&Arc<Move>> {
        self.next.as_ref()
    }

    /// Moves the engine picks from.
    pub fn catalog(&self) -> &MoveCatalog {
        &self.catalog
    }

    /// Copies the observable state for publishing.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.state,
            beat: self.beat,
            current_move: self.current.clone(),
            next_move: self.next.clone(),
            tempo: self.tempo,
            volume: self.volume,
            beat_sound_enabled: self.beat_sound,
        }
    }

    /// Queues the callout and handoff for the current move, which began at
    /// `started_at`. The callout never lands before the move starts.
    fn schedule_current(&mut self, started_at: Instant) {
        let Some(current) = self.current.as_ref() else {
            return;
        };
        let period = self.clock.period();
        let beats = current.beats();
        let callout_offset = beats.saturating_sub(self.lookahead_beats);

        debug!(
            move_id = current.id(),
            beats,
            callout_offset,
            "scheduling move"
        );
        self.pending.push_back(Deferred {
            due: started_at + period * callout_offset,
            epoch: self.epoch,
            action: Action::Callout,
        });
        self.pending.push_back(Deferred {
            due: started_at + period * beats,
            epoch: self.epoch,
            action: Action::Handoff,
        });
    }

    fn pick_next(&mut self) -> Option<Arc<Move>> {
        let after = match self.chaining {
            Chaining::Random => None,
            Chaining::EntryExit => self.current.as_ref().map(|mv| mv.exit()),
        };
        self.catalog.pick_random(&mut self.rng, after)
    }

    fn call_next(&mut self) {
        let Some(next) = self.pick_next() else {
            return;
        };
        info!(beat = self.beat, next = next.name(), "calling next move");
        self.announcer.announce(&next);
        self.next = Some(next);
    }

    /// Phase-locked: the new move starts at the instant the handoff was due,
    /// not when it happened to run.
    fn hand_off(&mut self, at: Instant) {
        let next = match self.next.take() {
            Some(next) => next,
            None => match self.pick_next() {
                Some(next) => next,
                None => return,
            },
        };
        debug!(beat = self.beat, current = next.name(), "handing off");
        self.current = Some(next);
        self.schedule_current(at);
    }
}

impl std::fmt::Debug for SequenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceEngine")
            .field("state", &self.state)
            .field("beat", &self.beat)
            .field("tempo", &self.tempo)
            .field("epoch", &self.epoch)
            .field("pending", &self.pending.len())
            .finish()
    }
}
