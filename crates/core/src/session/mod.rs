use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::{CallerError, EngineSnapshot, Result, SequenceEngine, Tempo};

const COMMAND_BUFFER: usize = 16;

#[derive(Debug)]
enum Command {
    Start,
    Stop,
    SetTempo(Tempo),
    SetVolume(f32),
    SetBeatSound(bool),
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<()>>,
}

/// Cloneable command surface for a running session.
///
/// Every command resolves only after the driver task has applied it, so once
/// [`SessionHandle::stop`] returns no further tick, callout or handoff runs.
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<EngineSnapshot>,
}

impl SessionHandle {
    /// Starts sequencing, or restarts it at the current tempo when already
    /// running. Fails with [`CallerError::EmptyCatalog`] when there is
    /// nothing to call.
    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    /// Stops sequencing. Once this returns nothing further is played or
    /// spoken until the next start.
    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    /// Rejects out-of-range tempos before they reach the engine.
    pub async fn set_tempo(&self, bpm: i64) -> Result<()> {
        let tempo = Tempo::new(bpm)?;
        self.send(Command::SetTempo(tempo)).await
    }

    /// Sets the tone volume, clamped to `[0, 1]`. Rejects NaN and infinities.
    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        self.send(Command::SetVolume(volume)).await
    }

    pub async fn set_beat_sound_enabled(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetBeatSound(enabled)).await
    }

    /// Latest published engine state.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver notified whenever the engine state changes.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.state.clone()
    }

    async fn send(&self, command: Command) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request { command, reply })
            .await
            .map_err(|_| CallerError::SessionClosed)?;
        response.await.map_err(|_| CallerError::SessionClosed)?
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").finish()
    }
}

/// A sequencing engine driven by its own task.
#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    driver: JoinHandle<()>,
}

impl Session {
    /// Spawns the driver task on the current runtime. The engine is stopped
    /// and the task ends once every handle has been dropped.
    pub fn spawn(engine: SequenceEngine) -> Self {
        let (requests, commands) = mpsc::channel(COMMAND_BUFFER);
        let (publisher, state) = watch::channel(engine.snapshot());
        let driver = tokio::spawn(drive(engine, commands, publisher));

        Self {
            handle: SessionHandle { requests, state },
            driver,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Drops this handle and waits for the driver to wind down.
    pub async fn shutdown(self) {
        let Self { handle, driver } = self;
        drop(handle);
        if let Err(err) = driver.await {
            debug!(%err, "session driver ended abnormally");
        }
    }
}

/// Single cooperative loop: beat ticks, per-move actions and commands are all
/// handled here, one at a time.
async fn drive(
    mut engine: SequenceEngine,
    mut commands: mpsc::Receiver<Request>,
    publisher: watch::Sender<EngineSnapshot>,
) {
    loop {
        let deadline = engine.next_deadline();
        tokio::select! {
            biased;

            beat = engine.wait_for_beat() => engine.on_tick(beat),
            _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                engine.run_due(Instant::now());
            }
            request = commands.recv() => {
                let Some(Request { command, reply }) = request else {
                    break;
                };
                let _ = reply.send(apply(&mut engine, command));
            }
        }
        publish(&publisher, &engine);
    }

    engine.stop();
    publish(&publisher, &engine);
    info!("session closed");
}

fn apply(engine: &mut SequenceEngine, command: Command) -> Result<()> {
    debug!(?command, "session command");
    match command {
        Command::Start => engine.start(),
        Command::Stop => {
            engine.stop();
            Ok(())
        }
        Command::SetTempo(tempo) => {
            engine.set_tempo(tempo);
            Ok(())
        }
        Command::SetVolume(volume) => engine.set_volume(volume),
        Command::SetBeatSound(enabled) => {
            engine.set_beat_sound_enabled(enabled);
            Ok(())
        }
    }
}

fn publish(publisher: &watch::Sender<EngineSnapshot>, engine: &SequenceEngine) {
    let snapshot = engine.snapshot();
    publisher.send_if_modified(|current| {
        if *current == snapshot {
            false
        } else {
            *current = snapshot;
            true
        }
    });
}
