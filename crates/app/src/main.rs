use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use move_caller_core::{
    tone, voice, AppConfig, Announcer, CallerError, EngineSnapshot, MoveCatalog, Phrasing,
    SequenceEngine, Session, SessionHandle, Tempo, ToneEmitter, ToneOutput, VoiceKind,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> move_caller_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Practice(args) => run_practice(args).await,
        Commands::Moves { catalog, config } => run_moves(catalog, config).await,
        Commands::Check { path } => run_check(&path),
    }
}

async fn run_practice(args: PracticeArgs) -> move_caller_core::Result<()> {
    let config = args.apply(load_config(args.config.as_deref())?);
    tracing::info!(tempo = %config.engine.bpm, "starting practice");

    let catalog = load_catalog(args.catalog.as_ref().or(config.catalog.path.as_ref())).await;
    let tone = ToneEmitter::new(
        &config.audio,
        config.engine.phrasing,
        tone::sink_for(config.audio.output),
    );
    let announcer = Announcer::from_config(&config.voice, voice::backend_for(&config.voice)).await;
    let engine = SequenceEngine::new(catalog, &config.engine, tone, announcer);

    let session = Session::spawn(engine);
    let handle = session.handle();
    handle.start().await?;
    println!("commands: start, stop, bpm <n>, volume <0-1>, beat on|off, status, quit");

    let reporter = tokio::spawn(report_moves(handle.subscribe()));
    let limit = async {
        match args.seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        result = read_commands(&handle, args.seconds.is_some()) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(())
        }
        _ = limit => {
            tracing::info!("practice time is up");
            Ok(())
        }
    };

    handle.stop().await?;
    reporter.abort();
    drop(handle);
    session.shutdown().await;
    outcome
}

async fn run_moves(catalog: Option<PathBuf>, config: Option<PathBuf>) -> move_caller_core::Result<()> {
    let config = load_config(config.as_deref())?;
    let catalog = load_catalog(catalog.as_ref().or(config.catalog.path.as_ref())).await;

    for mv in catalog.moves() {
        println!(
            "{:<20} {:>2} beats  {:<32} {:?} -> {:?}",
            mv.id(),
            mv.beats(),
            mv.names().join(" / "),
            mv.entry(),
            mv.exit()
        );
    }
    Ok(())
}

fn run_check(path: &Path) -> move_caller_core::Result<()> {
    let text = std::fs::read_to_string(path)?;
    let report = MoveCatalog::inspect(&text)?;

    for problem in &report.problems {
        println!("error: {problem}");
    }
    if !report.problems.is_empty() {
        return Err(CallerError::msg(format!(
            "{} of {} entries in {} are invalid",
            report.problems.len(),
            report.problems.len() + report.moves.len(),
            path.display()
        )));
    }
    if report.moves.is_empty() {
        return Err(CallerError::EmptyCatalog);
    }

    println!("{}: {} moves ok", path.display(), report.moves.len());
    Ok(())
}

fn load_config(path: Option<&Path>) -> move_caller_core::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path),
        None => Ok(AppConfig::default()),
    }
}

async fn load_catalog(path: Option<&PathBuf>) -> MoveCatalog {
    match path {
        Some(path) => MoveCatalog::load(path).await,
        None => {
            tracing::info!("no move catalog given, using default move");
            MoveCatalog::fallback()
        }
    }
}

/// Applies stdin commands until `quit` or end of input. With a time limit
/// in place, end of input leaves the session running.
async fn read_commands(handle: &SessionHandle, keep_running: bool) -> move_caller_core::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let command = match ControlCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };

        let result = match command {
            ControlCommand::Start => handle.start().await,
            ControlCommand::Stop => handle.stop().await,
            ControlCommand::Tempo(bpm) => handle.set_tempo(bpm).await,
            ControlCommand::Volume(volume) => handle.set_volume(volume).await,
            ControlCommand::Beat(enabled) => handle.set_beat_sound_enabled(enabled).await,
            ControlCommand::Status => {
                println!("{}", describe(&handle.snapshot()));
                Ok(())
            }
            ControlCommand::Quit => return Ok(()),
        };
        if let Err(err) = result {
            println!("error: {err}");
        }
    }

    if keep_running {
        std::future::pending::<()>().await;
    }
    Ok(())
}

/// Prints the current and next move whenever either changes.
async fn report_moves(mut updates: watch::Receiver<EngineSnapshot>) {
    let mut shown: (Option<String>, Option<String>) = (None, None);

    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();
        let ids = (
            snapshot.current_move.as_ref().map(|mv| mv.id().to_string()),
            snapshot.next_move.as_ref().map(|mv| mv.id().to_string()),
        );
        if ids != shown {
            println!("{}", describe(&snapshot));
            shown = ids;
        }
    }
}

fn describe(snapshot: &EngineSnapshot) -> String {
    if !snapshot.is_running() {
        return format!(
            "stopped ({}, volume {:.0}%)",
            snapshot.tempo,
            snapshot.volume * 100.0
        );
    }

    let name = |mv: &Option<std::sync::Arc<move_caller_core::Move>>| {
        mv.as_ref()
            .map_or_else(|| "-".to_string(), |mv| mv.name().to_string())
    };
    format!(
        "beat {:>4}  now: {:<24} next: {}",
        snapshot.beat,
        name(&snapshot.current_move),
        name(&snapshot.next_move)
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ControlCommand {
    Start,
    Stop,
    Tempo(i64),
    Volume(f32),
    Beat(bool),
    Status,
    Quit,
}

impl ControlCommand {
    /// Parses one input line. Blank lines yield `None`.
    fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let argument = words.next();

        let command = match (verb.to_ascii_lowercase().as_str(), argument) {
            ("start", None) => Self::Start,
            ("stop", None) => Self::Stop,
            ("status", None) => Self::Status,
            ("quit" | "exit", None) => Self::Quit,
            ("bpm" | "tempo", Some(value)) => Self::Tempo(
                value
                    .parse()
                    .map_err(|_| format!("`{value}` is not a whole number of beats per minute"))?,
            ),
            ("volume" | "vol", Some(value)) => Self::Volume(
                value
                    .parse()
                    .map_err(|_| format!("`{value}` is not a volume between 0 and 1"))?,
            ),
            ("beat", Some("on")) => Self::Beat(true),
            ("beat", Some("off")) => Self::Beat(false),
            _ => return Err(format!("unknown command `{}`", line.trim())),
        };
        Ok(Some(command))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Calls out dance moves on the beat", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a practice session that clicks the beat and calls the next move.
    Practice(PracticeArgs),
    /// List the moves in a catalog.
    Moves {
        /// Moves document to load.
        #[arg(short, long)]
        catalog: Option<PathBuf>,
        /// JSON config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate a moves document and report every invalid entry.
    Check {
        /// Moves document to validate.
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct PracticeArgs {
    /// Moves document to load.
    #[arg(short, long)]
    catalog: Option<PathBuf>,
    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Tempo in beats per minute.
    #[arg(short, long)]
    bpm: Option<Tempo>,
    /// Click volume between 0 and 1.
    #[arg(short, long)]
    volume: Option<f32>,
    /// Do not click on each beat.
    #[arg(long)]
    no_beat: bool,
    /// Which beats get the accent click.
    #[arg(long, value_enum)]
    phrasing: Option<PhrasingArg>,
    /// Stop after this many seconds.
    #[arg(long)]
    seconds: Option<u64>,
    /// Seed for a reproducible move sequence.
    #[arg(long)]
    seed: Option<u64>,
    /// How callouts are voiced.
    #[arg(long, value_enum)]
    voice: Option<VoiceArg>,
    /// Play clicks on the default output device.
    #[arg(long)]
    device: bool,
}

impl PracticeArgs {
    /// Layers command line flags over the loaded config.
    fn apply(&self, mut config: AppConfig) -> AppConfig {
        if let Some(bpm) = self.bpm {
            config.engine.bpm = bpm;
        }
        if let Some(volume) = self.volume {
            config.engine.volume = volume.clamp(0.0, 1.0);
        }
        if self.no_beat {
            config.engine.beat_sound = false;
        }
        if let Some(phrasing) = self.phrasing {
            config.engine.phrasing = phrasing.into();
        }
        if let Some(seed) = self.seed {
            config.engine.seed = Some(seed);
        }
        if let Some(voice) = self.voice {
            config.voice.backend = voice.into();
        }
        if self.device {
            config.audio.output = ToneOutput::Device;
        }
        config
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum PhrasingArg {
    Four,
    Eight,
}

impl From<PhrasingArg> for Phrasing {
    fn from(value: PhrasingArg) -> Self {
        match value {
            PhrasingArg::Four => Phrasing::FourCount,
            PhrasingArg::Eight => Phrasing::EightCount,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum VoiceArg {
    Log,
    Command,
}

impl From<VoiceArg> for VoiceKind {
    fn from(value: VoiceArg) -> Self {
        match value {
            VoiceArg::Log => VoiceKind::Log,
            VoiceArg::Command => VoiceKind::Command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_control_commands() {
        assert_eq!(ControlCommand::parse("start"), Ok(Some(ControlCommand::Start)));
        assert_eq!(ControlCommand::parse("  STOP "), Ok(Some(ControlCommand::Stop)));
        assert_eq!(ControlCommand::parse("bpm 96"), Ok(Some(ControlCommand::Tempo(96))));
        assert_eq!(ControlCommand::parse("volume 0.25"), Ok(Some(ControlCommand::Volume(0.25))));
        assert_eq!(ControlCommand::parse("beat off"), Ok(Some(ControlCommand::Beat(false))));
        assert_eq!(ControlCommand::parse(""), Ok(None));
        assert!(ControlCommand::parse("bpm fast").is_err());
        assert!(ControlCommand::parse("beat maybe").is_err());
        assert!(ControlCommand::parse("dance").is_err());
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "move-caller", "practice", "--bpm", "110", "--volume", "2", "--no-beat",
            "--phrasing", "eight", "--voice", "command",
        ]);
        let Commands::Practice(args) = cli.command else {
            panic!("expected practice");
        };

        let config = args.apply(AppConfig::default());
        assert_eq!(config.engine.bpm.bpm(), 110);
        assert_eq!(config.engine.volume, 1.0);
        assert!(!config.engine.beat_sound);
        assert_eq!(config.engine.phrasing, Phrasing::EightCount);
        assert_eq!(config.voice.backend, VoiceKind::Command);
        assert_eq!(config.audio.output, ToneOutput::None);
    }

    #[test]
    fn rejects_zero_bpm_flag() {
        assert!(Cli::try_parse_from(["move-caller", "practice", "--bpm", "0"]).is_err());
    }

    #[test]
    fn check_reports_invalid_documents() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        std::fs::write(&good, include_str!("../../../data/moves.json")).unwrap();
        std::fs::write(
            &bad,
            r#"{ "moves": [ { "id": "x", "names": [], "beats": 4, "entry": "open", "exit": "open" } ] }"#,
        )
        .unwrap();

        assert!(run_check(&good).is_ok());
        assert!(run_check(&bad).is_err());
    }
}
