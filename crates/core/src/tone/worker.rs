#![cfg_attr(not(feature = "device"), allow(dead_code))]

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::Tone;
use crate::{CallerError, Result};

/// Extra time a tone's output is kept open after the tone ends.
const DRAIN: Duration = Duration::from_millis(50);

/// Output backend driven from the worker thread. It never leaves that thread,
/// so it does not need to be `Send`.
pub(crate) trait Playback {
    /// Held while the tone sounds and dropped once it is over.
    type Handle;

    /// Starts the tone without waiting for it to finish.
    fn open(&mut self, tone: &Tone) -> Result<Self::Handle>;
}

type Failure = Arc<Mutex<Option<String>>>;

/// Owns one playback thread fed through a channel. Submitting never waits on
/// the output; a failure on the thread is returned by the next submit.
#[derive(Debug)]
pub(crate) struct ToneWorker {
    tones: Sender<Tone>,
    failure: Failure,
}

impl ToneWorker {
    /// Spawns the thread and builds the playback on it with `factory`.
    pub(crate) fn spawn<P, F>(name: &str, factory: F) -> Result<Self>
    where
        P: Playback,
        F: FnOnce() -> Result<P> + Send + 'static,
    {
        let (tones, queued) = mpsc::channel();
        let failure = Failure::default();
        let reported = Arc::clone(&failure);
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(factory, queued, reported))?;
        Ok(Self { tones, failure })
    }

    pub(crate) fn submit(&self, tone: Tone) -> Result<()> {
        let pending = self
            .failure
            .lock()
            .map_err(|_| CallerError::msg("tone failure slot poisoned"))?
            .take();
        self.tones
            .send(tone)
            .map_err(|_| CallerError::AudioUnavailable("tone thread exited".into()))?;
        match pending {
            Some(reason) => Err(CallerError::AudioUnavailable(reason)),
            None => Ok(()),
        }
    }
}

fn describe(err: CallerError) -> String {
    match err {
        CallerError::AudioUnavailable(reason) => reason,
        other => other.to_string(),
    }
}

fn record(failure: &Failure, reason: String) {
    if let Ok(mut slot) = failure.lock() {
        *slot = Some(reason);
    }
}

fn run<P, F>(factory: F, queued: Receiver<Tone>, failure: Failure)
where
    P: Playback,
    F: FnOnce() -> Result<P>,
{
    let mut playback = match factory() {
        Ok(playback) => playback,
        Err(err) => {
            let reason = describe(err);
            record(&failure, reason.clone());
            while queued.recv().is_ok() {
                record(&failure, reason.clone());
            }
            return;
        }
    };

    let mut sounding: Vec<(Instant, P::Handle)> = Vec::new();
    loop {
        let now = Instant::now();
        sounding.retain(|(until, _)| *until > now);

        let next = match sounding.iter().map(|(until, _)| *until).min() {
            Some(until) => queued.recv_timeout(until.saturating_duration_since(now)),
            None => queued.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match next {
            Ok(tone) => match playback.open(&tone) {
                Ok(handle) => sounding.push((Instant::now() + tone.duration + DRAIN, handle)),
                Err(err) => record(&failure, describe(err)),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("tone thread finished");
}
