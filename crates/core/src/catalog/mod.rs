use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{CallerError, Result};

/// Connective-state tags describing the frame a move starts or ends in.
pub type TagSet = BTreeSet<String>;

/// A single entry or a list of entries, as accepted for `entry` and `exit`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TagSpec {
    One(String),
    Many(Vec<String>),
}

impl From<TagSpec> for TagSet {
    fn from(spec: TagSpec) -> Self {
        match spec {
            TagSpec::One(tag) => std::iter::once(tag).collect(),
            TagSpec::Many(tags) => tags.into_iter().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMove {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    beats: i64,
    #[serde(default)]
    entry: Option<TagSpec>,
    #[serde(default)]
    exit: Option<TagSpec>,
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    moves: Vec<RawMove>,
}

/// A dance move that can be called out. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Move {
    id: String,
    names: Vec<String>,
    beats: u32,
    entry: TagSet,
    exit: TagSet,
}

impl Move {
    /// Builds a validated move. `names` must hold at least one non-blank
    /// name and `beats` must be positive.
    pub fn new<I, S>(
        id: impl Into<String>,
        names: Vec<String>,
        beats: u32,
        entry: I,
        exit: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CallerError::invalid_move(id, "id must not be empty"));
        }
        if names.is_empty() || names.iter().any(|name| name.trim().is_empty()) {
            return Err(CallerError::invalid_move(id, "names must be non-empty"));
        }
        if beats == 0 {
            return Err(CallerError::invalid_move(id, "beats must be positive"));
        }

        Ok(Self {
            id,
            names,
            beats,
            entry: entry.into_iter().map(Into::into).collect(),
            exit: exit.into_iter().map(Into::into).collect(),
        })
    }

    /// The move used whenever no catalog can be loaded.
    pub fn sugar_push() -> Self {
        Self {
            id: "sugar-push".to_string(),
            names: vec!["Sugar Push".to_string()],
            beats: 6,
            entry: std::iter::once("open".to_string()).collect(),
            exit: std::iter::once("open".to_string()).collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Canonical display name.
    pub fn name(&self) -> &str {
        self.names.first().map_or(self.id.as_str(), String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Length of the move in beats.
    pub fn beats(&self) -> u32 {
        self.beats
    }

    pub fn entry(&self) -> &TagSet {
        &self.entry
    }

    pub fn exit(&self) -> &TagSet {
        &self.exit
    }

    /// Returns true when `next` starts in a frame this move ends in.
    pub fn chains_into(&self, next: &Move) -> bool {
        !self.exit.is_disjoint(&next.entry)
    }

    fn from_raw(raw: RawMove) -> Result<Self> {
        let beats = u32::try_from(raw.beats)
            .ok()
            .filter(|beats| *beats > 0)
            .ok_or_else(|| {
                CallerError::invalid_move(
                    raw.id.clone(),
                    format!("beats must be a positive integer, got {}", raw.beats),
                )
            })?;
        let entry: TagSet = raw.entry.map(Into::into).unwrap_or_default();
        let exit: TagSet = raw.exit.map(Into::into).unwrap_or_default();
        Self::new(raw.id, raw.names, beats, entry, exit)
    }
}

/// Outcome of validating a moves document entry by entry.
#[derive(Debug, Default)]
pub struct CatalogReport {
    pub moves: Vec<Move>,
    pub problems: Vec<CallerError>,
}

/// Ordered set of known moves. Non-empty whenever it was produced by
/// [`MoveCatalog::load`] or [`MoveCatalog::from_str_or_default`].
#[derive(Debug, Clone, Default)]
pub struct MoveCatalog {
    moves: Vec<Arc<Move>>,
}

impl MoveCatalog {
    /// Wraps the given moves as-is. An empty list yields an empty catalog,
    /// which the engine refuses to start with.
    pub fn from_moves(moves: Vec<Move>) -> Self {
        Self {
            moves: moves.into_iter().map(Arc::new).collect(),
        }
    }

    /// A catalog holding only the built-in default move.
    pub fn fallback() -> Self {
        Self::from_moves(vec![Move::sugar_push()])
    }

    /// Validates every entry of a moves document. Malformed JSON is an error;
    /// invalid or duplicate entries are collected as problems and skipped.
    pub fn inspect(text: &str) -> Result<CatalogReport> {
        let document: CatalogDocument = serde_json::from_str(text)?;
        let mut report = CatalogReport::default();
        let mut seen = HashSet::new();

        for raw in document.moves {
            let mv = match Move::from_raw(raw) {
                Ok(mv) => mv,
                Err(err) => {
                    report.problems.push(err);
                    continue;
                }
            };
            if !seen.insert(mv.id.clone()) {
                report
                    .problems
                    .push(CallerError::invalid_move(mv.id, "duplicate id"));
                continue;
            }
            report.moves.push(mv);
        }

        Ok(report)
    }

    /// Strict parse: any invalid entry or an empty result is an error.
    pub fn parse(text: &str) -> Result<Vec<Move>> {
        let mut report = Self::inspect(text)?;
        if !report.problems.is_empty() {
            return Err(report.problems.swap_remove(0));
        }
        if report.moves.is_empty() {
            return Err(CallerError::EmptyCatalog);
        }
        Ok(report.moves)
    }

    /// Recovering parse: invalid entries are dropped and logged, and the
    /// default move is substituted when nothing usable remains.
    pub fn from_str_or_default(text: &str) -> Self {
        let report = match Self::inspect(text) {
            Ok(report) => report,
            Err(err) => {
                warn!(%err, "could not parse move catalog, using default move");
                return Self::fallback();
            }
        };

        for problem in &report.problems {
            warn!(%problem, "skipping catalog entry");
        }
        if report.moves.is_empty() {
            warn!("move catalog has no usable moves, using default move");
            return Self::fallback();
        }

        Self::from_moves(report.moves)
    }

    /// Reads and parses the moves document at `path`. Never fails: read and
    /// parse errors fall back to the default move.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let catalog = match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::from_str_or_default(&text),
            Err(err) => {
                warn!(?path, %err, "could not read move catalog, using default move");
                Self::fallback()
            }
        };
        info!(?path, moves = catalog.len(), "loaded move catalog");
        catalog
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn moves(&self) -> &[Arc<Move>] {
        &self.moves
    }

    /// Picks a move uniformly at random. When `after` is given, only moves
    /// whose entry tags intersect it are candidates, unless none qualify, in
    /// which case the whole catalog is used. Returns `None` only for an
    /// empty catalog.
    pub fn pick_random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        after: Option<&TagSet>,
    ) -> Option<Arc<Move>> {
        if let Some(exit) = after {
            let candidates: Vec<&Arc<Move>> = self
                .moves
                .iter()
                .filter(|mv| !mv.entry.is_disjoint(exit))
                .collect();
            if let Some(mv) = candidates.choose(rng) {
                return Some(Arc::clone(mv));
            }
            debug!(?exit, "no move chains from exit tags, picking from whole catalog");
        }

        self.moves.choose(rng).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    const DOCUMENT: &str = r#"{
        "moves": [
            { "id": "pass", "names": ["Left Side Pass", "Pass"], "beats": 6, "entry": "open", "exit": "open" },
            { "id": "whip", "names": ["Whip"], "beats": 8, "entry": ["open", "closed"], "exit": ["open"] },
            { "id": "tuck", "names": ["Tuck Turn"], "beats": 6, "entry": "closed", "exit": "open" },
            { "id": "throw", "names": ["Throwout"], "beats": 6, "entry": "closed", "exit": "open" }
        ]
    }"#;

    fn tags(items: &[&str]) -> TagSet {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn parses_single_and_list_tags() {
        let moves = MoveCatalog::parse(DOCUMENT).unwrap();

        assert_eq!(moves.len(), 4);
        assert_eq!(moves[0].name(), "Left Side Pass");
        assert_eq!(moves[0].entry(), &tags(&["open"]));
        assert_eq!(moves[1].entry(), &tags(&["closed", "open"]));
        assert_eq!(moves[1].beats(), 8);
    }

    #[test]
    fn bundled_catalog_is_valid() {
        let moves = MoveCatalog::parse(include_str!("../../../../data/moves.json")).unwrap();
        assert_eq!(moves.len(), 9);
        assert!(moves.iter().any(|mv| mv.beats() <= 2));
    }

    #[test]
    fn skips_invalid_entries_and_reports_them() {
        let text = r#"{ "moves": [
            { "id": "ok", "names": ["Ok"], "beats": 4, "entry": "open", "exit": "open" },
            { "id": "nameless", "names": [], "beats": 4, "entry": "open", "exit": "open" },
            { "id": "zero", "names": ["Zero"], "beats": 0, "entry": "open", "exit": "open" },
            { "id": "negative", "names": ["Neg"], "beats": -2, "entry": "open", "exit": "open" },
            { "id": "ok", "names": ["Again"], "beats": 4, "entry": "open", "exit": "open" }
        ] }"#;

        let report = MoveCatalog::inspect(text).unwrap();
        assert_eq!(report.moves.len(), 1);
        assert_eq!(report.problems.len(), 4);

        let err = MoveCatalog::parse(text).unwrap_err();
        assert!(format!("{err}").contains("nameless"));

        let catalog = MoveCatalog::from_str_or_default(text);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.moves()[0].id(), "ok");
    }

    #[test]
    fn falls_back_to_default_move() {
        for text in ["not json", r#"{ "moves": [] }"#, r#"{ "moves": [ { "id": "x", "names": [], "beats": 2 } ] }"#] {
            let catalog = MoveCatalog::from_str_or_default(text);
            assert_eq!(catalog.len(), 1);
            let mv = &catalog.moves()[0];
            assert_eq!(**mv, Move::sugar_push());
            assert_eq!(mv.beats(), 6);
        }

        assert!(matches!(
            MoveCatalog::parse(r#"{ "moves": [] }"#),
            Err(CallerError::EmptyCatalog)
        ));
    }

    #[tokio::test]
    async fn loads_from_file_or_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moves.json");
        std::fs::write(&path, DOCUMENT).unwrap();

        let catalog = MoveCatalog::load(&path).await;
        assert_eq!(catalog.len(), 4);

        let missing = MoveCatalog::load(dir.path().join("missing.json")).await;
        assert_eq!(missing.len(), 1);
        assert_eq!(missing.moves()[0].id(), "sugar-push");
    }

    #[test]
    fn rejects_invalid_moves_at_construction() {
        assert!(Move::new("a", vec![], 4, ["open"], ["open"]).is_err());
        assert!(Move::new("a", vec!["A".into()], 0, ["open"], ["open"]).is_err());
        assert!(Move::new("", vec!["A".into()], 4, ["open"], ["open"]).is_err());
        assert!(Move::new("a", vec!["A".into()], 4, ["open"], ["open"]).is_ok());
    }

    #[test]
    fn empty_catalog_picks_nothing() {
        let catalog = MoveCatalog::from_moves(Vec::new());
        let mut rng = StdRng::seed_from_u64(1);
        assert!(catalog.pick_random(&mut rng, None).is_none());
    }

    #[test]
    fn picks_uniformly_over_many_draws() {
        let catalog = MoveCatalog::from_moves(MoveCatalog::parse(DOCUMENT).unwrap());
        let mut rng = StdRng::seed_from_u64(7);
        let draws = 10_000;
        let mut counts: HashMap<String, usize> = HashMap::new();

        for _ in 0..draws {
            let mv = catalog.pick_random(&mut rng, None).expect("catalog is not empty");
            *counts.entry(mv.id().to_string()).or_default() += 1;
        }

        assert_eq!(counts.len(), catalog.len());
        let expected = draws as f64 / catalog.len() as f64;
        let chi_square: f64 = counts
            .values()
            .map(|&observed| (observed as f64 - expected).powi(2) / expected)
            .sum();
        // 3 degrees of freedom, p = 0.0001.
        assert!(chi_square < 21.1, "chi-square {chi_square} too large");
    }

    #[test]
    fn restricts_to_moves_entered_from_exit_tags() {
        let catalog = MoveCatalog::from_moves(MoveCatalog::parse(DOCUMENT).unwrap());
        let mut rng = StdRng::seed_from_u64(3);
        let closed = tags(&["closed"]);

        for _ in 0..200 {
            let mv = catalog.pick_random(&mut rng, Some(&closed)).unwrap();
            assert!(mv.entry().contains("closed"), "picked {}", mv.id());
        }
    }

    #[test]
    fn falls_back_to_whole_catalog_when_nothing_chains() {
        let catalog = MoveCatalog::from_moves(MoveCatalog::parse(DOCUMENT).unwrap());
        let mut rng = StdRng::seed_from_u64(11);
        let nowhere = tags(&["sweetheart"]);
        let mut seen = HashSet::new();

        for _ in 0..500 {
            let mv = catalog.pick_random(&mut rng, Some(&nowhere)).unwrap();
            seen.insert(mv.id().to_string());
        }

        assert_eq!(seen.len(), catalog.len());
    }

    #[test]
    fn chains_into_checks_tag_overlap() {
        let moves = MoveCatalog::parse(DOCUMENT).unwrap();
        assert!(moves[0].chains_into(&moves[1]));
        assert!(!moves[0].chains_into(&moves[2]));
    }
}
