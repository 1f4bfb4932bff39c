use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::VoiceConfig;
use crate::{CallerError, Move, Result};

/// Pending result of [`VoiceBackend::list_voices`].
pub type VoiceListing<'a> = Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>>;

/// Host text-to-speech capability.
pub trait VoiceBackend: Send + Sync {
    /// Names of the voices the host can speak with. May take a while, so it is
    /// only awaited while building an [`Announcer`], never per callout.
    fn list_voices(&self) -> VoiceListing<'_>;

    /// Queues `text` for speaking without waiting for playback. `None` uses
    /// the host default voice.
    fn speak(&self, text: &str, voice: Option<&str>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceKind {
    /// Write callouts to the log.
    #[default]
    Log,
    /// Speak callouts through an external speech program.
    Command,
}

/// Writes callouts as log events. Always available.
#[derive(Debug, Default)]
pub struct LogVoice;

impl VoiceBackend for LogVoice {
    fn list_voices(&self) -> VoiceListing<'_> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn speak(&self, text: &str, voice: Option<&str>) -> Result<()> {
        info!(voice, "{text}");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    /// `espeak` and `espeak-ng`.
    Espeak,
    /// macOS `say`.
    Say,
}

const SPEECH_PROGRAMS: &[&str] = &["espeak-ng", "espeak", "say"];

/// Speaks through an external speech program, one process per callout.
#[derive(Debug, Clone)]
pub struct CommandVoice {
    program: PathBuf,
    dialect: Dialect,
}

impl CommandVoice {
    /// Locates `program` on the PATH, or the first known speech program when
    /// none is given.
    pub fn detect(program: Option<&str>) -> Result<Self> {
        let candidates: Vec<&str> = match program {
            Some(program) => vec![program],
            None => SPEECH_PROGRAMS.to_vec(),
        };

        for name in candidates {
            if let Ok(path) = which::which(name) {
                let dialect = if path.file_stem().is_some_and(|stem| stem == "say") {
                    Dialect::Say
                } else {
                    Dialect::Espeak
                };
                debug!(?path, ?dialect, "found speech program");
                return Ok(Self {
                    program: path,
                    dialect,
                });
            }
        }

        Err(CallerError::SpeechUnavailable(format!(
            "no speech program found (tried {})",
            program.map_or_else(|| SPEECH_PROGRAMS.join(", "), str::to_string)
        )))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl CommandVoice {
    async fn query_voices(&self) -> Result<Vec<String>> {
        let args: &[&str] = match self.dialect {
            Dialect::Espeak => &["--voices"],
            Dialect::Say => &["-v", "?"],
        };
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(CallerError::SpeechUnavailable(format!(
                "{} exited with {}",
                self.program.display(),
                output.status
            )));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(match self.dialect {
            Dialect::Espeak => parse_espeak_voices(&listing),
            Dialect::Say => parse_say_voices(&listing),
        })
    }
}

impl VoiceBackend for CommandVoice {
    fn list_voices(&self) -> VoiceListing<'_> {
        Box::pin(self.query_voices())
    }

    /// Spawns the speech program and returns at once. The child is left to
    /// the runtime, which reaps it once it exits.
    fn speak(&self, text: &str, voice: Option<&str>) -> Result<()> {
        let mut command = Command::new(&self.program);
        if let Some(voice) = voice {
            command.args(["-v", voice]);
        }
        command
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| CallerError::SpeechUnavailable(err.to_string()))?;
        Ok(())
    }
}

/// Parses `espeak --voices`: a header row, then columns
/// `Pty Language Age/Gender VoiceName File Other`.
fn parse_espeak_voices(listing: &str) -> Vec<String> {
    listing
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(3))
        .map(str::to_string)
        .collect()
}

/// Parses `say -v ?`: `Name   locale    # sample sentence`, where the name
/// may contain spaces.
fn parse_say_voices(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let head = line.split('#').next()?;
            let mut words: Vec<&str> = head.split_whitespace().collect();
            words.pop()?;
            (!words.is_empty()).then(|| words.join(" "))
        })
        .collect()
}

/// Builds the backend selected in the voice config, falling back to
/// [`LogVoice`] when no speech program can be found.
pub fn backend_for(config: &VoiceConfig) -> Box<dyn VoiceBackend> {
    match config.backend {
        VoiceKind::Log => Box::new(LogVoice),
        VoiceKind::Command => match CommandVoice::detect(config.command.as_deref()) {
            Ok(voice) => Box::new(voice),
            Err(err) => {
                warn!(%err, "falling back to logged callouts");
                Box::new(LogVoice)
            }
        },
    }
}

/// Speaks move callouts, preferring a configured voice when the host has it.
///
/// The preferred voice is looked up by [`Announcer::resolve_voice`]. Until
/// that has run, callouts use the host default voice; speaking never waits on
/// the lookup.
pub struct Announcer {
    backend: Box<dyn VoiceBackend>,
    preferred_voice: Option<String>,
    resolved_voice: OnceCell<Option<String>>,
    prefix: String,
}

impl Announcer {
    /// Creates an announcer whose voice is not yet resolved.
    pub fn new(backend: Box<dyn VoiceBackend>, preferred_voice: Option<String>) -> Self {
        Self {
            backend,
            preferred_voice,
            resolved_voice: OnceCell::new(),
            prefix: VoiceConfig::default().callout_prefix,
        }
    }

    /// Builds an announcer from the voice config and resolves its voice, so
    /// the first callout already uses it.
    pub async fn from_config(config: &VoiceConfig, backend: Box<dyn VoiceBackend>) -> Self {
        let announcer =
            Self::new(backend, config.preferred_voice.clone()).with_prefix(config.callout_prefix.clone());
        announcer.resolve_voice().await;
        announcer
    }

    /// Text spoken before the move name.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Asks the backend for its voices once and picks the preferred one if it
    /// is listed. Later calls return the first answer.
    pub async fn resolve_voice(&self) -> Option<&str> {
        self.resolved_voice
            .get_or_init(|| self.lookup_voice())
            .await
            .as_deref()
    }

    async fn lookup_voice(&self) -> Option<String> {
        let preferred = self.preferred_voice.as_ref()?;
        match self.backend.list_voices().await {
            Ok(voices) if voices.iter().any(|voice| voice == preferred) => Some(preferred.clone()),
            Ok(_) => {
                debug!(voice = %preferred, "preferred voice not available, using default");
                None
            }
            Err(err) => {
                warn!(%err, "could not list voices, using default");
                None
            }
        }
    }

    /// The voice callouts use, `None` for the host default. Stays `None`
    /// until [`Announcer::resolve_voice`] has completed.
    pub fn voice(&self) -> Option<&str> {
        self.resolved_voice.get().and_then(Option::as_deref)
    }

    /// Calls out `mv` by its canonical name.
    pub fn announce(&self, mv: &Move) {
        self.speak(&format!("{}{}", self.prefix, mv.name()));
    }

    /// Queues `text` for speaking. Backend failures are logged, never raised.
    pub fn speak(&self, text: &str) {
        if let Err(err) = self.backend.speak(text, self.voice()) {
            warn!(%err, text, "callout could not be spoken");
        }
    }
}

impl std::fmt::Debug for Announcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Announcer")
            .field("preferred_voice", &self.preferred_voice)
            .field("prefix", &self.prefix)
            .finish()
    }
}
