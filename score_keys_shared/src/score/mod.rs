//! Score readers.
//!
//! Each file format has a [`ScoreParser`] that turns raw bytes into a
//! [`RawScore`]: notes positioned in quarter-note beats plus the tempo and
//! meter events found in the file. [`resolve`] then applies the read options
//! and produces a [`Song`] in the requested duration unit, independent of the
//! format it came from.

pub mod midi;
pub mod musicxml;

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{KeysError, Result};
use crate::tempo::{TempoChange, TempoMap};
use crate::types::{
    round_time, DurationUnit, NoteEvent, PartInfo, Song, SongMetadata, TimeSignature,
    TimeSignatureChange, TIME_EPSILON,
};

pub const SUPPORTED_EXTENSIONS: &[&str] = &["mid", "midi", "mxl", "musicxml", "xml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreFormat {
    Midi,
    MusicXml,
    CompressedMusicXml,
}

impl ScoreFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mid" | "midi" => Some(ScoreFormat::Midi),
            "musicxml" | "xml" => Some(ScoreFormat::MusicXml),
            "mxl" => Some(ScoreFormat::CompressedMusicXml),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        Self::from_extension(ext).ok_or_else(|| {
            KeysError::UnsupportedFormat(if ext.is_empty() {
                path.display().to_string()
            } else {
                format!(".{}", ext)
            })
        })
    }
}

impl fmt::Display for ScoreFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreFormat::Midi => write!(f, "MIDI"),
            ScoreFormat::MusicXml => write!(f, "MusicXML"),
            ScoreFormat::CompressedMusicXml => write!(f, "MusicXML (compressed)"),
        }
    }
}

pub fn is_score_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(ScoreFormat::from_extension)
        .is_some()
}

/// A note as found in the source, timed in quarter-note beats.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNote {
    pub key: i32,
    pub start: f64,
    pub duration: f64,
    pub part: usize,
    pub percussion: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawPart {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawScore {
    pub notes: Vec<RawNote>,
    pub tempo_changes: Vec<TempoChange>,
    pub time_signatures: Vec<TimeSignatureChange>,
    pub parts: Vec<RawPart>,
}

impl RawScore {
    /// Per-part note counts and pitch ranges, parts without notes left out.
    pub fn part_summary(&self) -> Vec<PartInfo> {
        let mut infos = Vec::new();
        for (index, part) in self.parts.iter().enumerate() {
            let keys: Vec<i32> = self
                .notes
                .iter()
                .filter(|n| n.part == index)
                .map(|n| n.key)
                .collect();
            let (Some(lo), Some(hi)) = (keys.iter().min(), keys.iter().max()) else {
                continue;
            };
            infos.push(PartInfo {
                index,
                name: part.name.clone(),
                note_count: keys.len(),
                pitch_range: ((*lo).clamp(0, 127) as u8, (*hi).clamp(0, 127) as u8),
            });
        }
        infos
    }
}

/// Turns the bytes of one score format into a [`RawScore`].
pub trait ScoreParser {
    fn parse(&self, source_name: &str, bytes: &[u8]) -> Result<RawScore>;
}

pub fn parser_for(format: ScoreFormat) -> Box<dyn ScoreParser> {
    match format {
        ScoreFormat::Midi => Box::new(midi::MidiParser),
        ScoreFormat::MusicXml => Box::new(musicxml::MusicXmlParser),
        ScoreFormat::CompressedMusicXml => Box::new(musicxml::CompressedMusicXmlParser),
    }
}

/// How start times and durations are expressed in the resulting song.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DurationMode {
    /// Beats for a constant tempo, seconds when the tempo changes.
    #[default]
    Auto,
    Beats,
    Seconds,
}

impl DurationMode {
    pub fn resolve(self, map: &TempoMap) -> DurationUnit {
        match self {
            DurationMode::Beats => DurationUnit::Beats,
            DurationMode::Seconds => DurationUnit::Seconds,
            DurationMode::Auto if map.is_constant() => DurationUnit::Beats,
            DurationMode::Auto => DurationUnit::Seconds,
        }
    }
}

impl fmt::Display for DurationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationMode::Auto => write!(f, "auto"),
            DurationMode::Beats => write!(f, "beats"),
            DurationMode::Seconds => write!(f, "seconds"),
        }
    }
}

impl FromStr for DurationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(DurationMode::Auto),
            other => other
                .parse::<DurationUnit>()
                .map(|unit| match unit {
                    DurationUnit::Beats => DurationMode::Beats,
                    DurationUnit::Seconds => DurationMode::Seconds,
                })
                .map_err(|_| format!("unknown duration mode '{}' (auto, beats, seconds)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadOptions {
    pub duration_mode: DurationMode,
    /// Replaces the file's tempo map with a constant tempo.
    pub tempo_override: Option<f64>,
    /// Replaces the file's meter, dropping its meter changes.
    pub time_signature_override: Option<TimeSignature>,
    /// Notes shorter than this, in the output unit, are dropped.
    pub min_duration: f64,
    /// Keep only parts whose name contains this text (case-insensitive).
    pub part_filter: Option<String>,
    pub skip_percussion: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            duration_mode: DurationMode::Auto,
            tempo_override: None,
            time_signature_override: None,
            min_duration: 0.0,
            part_filter: None,
            skip_percussion: true,
        }
    }
}

/// Reads the raw score at `path`, choosing the parser by extension.
pub fn read_raw(path: &Path) -> Result<RawScore> {
    let format = ScoreFormat::from_path(path)?;
    let bytes = fs::read(path)?;
    let source_name = source_name(path);
    debug!("reading {} as {} ({} bytes)", source_name, format, bytes.len());
    parser_for(format).parse(&source_name, &bytes)
}

/// Reads and resolves the score at `path`.
pub fn read_score(path: &Path, options: &ReadOptions) -> Result<Song> {
    let raw = read_raw(path)?;
    resolve(&source_name(path), raw, options)
}

/// Reads and resolves a score already held in memory.
pub fn read_score_bytes(
    source_name: &str,
    format: ScoreFormat,
    bytes: &[u8],
    options: &ReadOptions,
) -> Result<Song> {
    let raw = parser_for(format).parse(source_name, bytes)?;
    resolve(source_name, raw, options)
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Applies part and percussion filters, picks the duration unit and builds
/// the chord-grouped song.
pub fn resolve(source_name: &str, raw: RawScore, options: &ReadOptions) -> Result<Song> {
    let selected = select_parts(&raw, options.part_filter.as_deref());
    let mut notes: Vec<&RawNote> = raw
        .notes
        .iter()
        .filter(|n| selected.contains(&n.part))
        .collect();
    if options.skip_percussion {
        let before = notes.len();
        notes.retain(|n| !n.percussion);
        if notes.len() < before {
            debug!("{}: skipped {} percussion note(s)", source_name, before - notes.len());
        }
    }
    if notes.is_empty() {
        return Err(KeysError::malformed(source_name, "no extractable note events"));
    }

    let map = match options.tempo_override {
        Some(bpm) if bpm.is_finite() && bpm > 0.0 => TempoMap::constant(bpm),
        Some(bpm) => {
            return Err(KeysError::InvalidConfig(format!(
                "tempo override must be positive, got {}",
                bpm
            )))
        }
        None => TempoMap::new(raw.tempo_changes.clone()),
    };
    let unit = options.duration_mode.resolve(&map);

    let mut events = Vec::with_capacity(notes.len());
    let mut dropped = 0usize;
    for note in notes {
        let (start, duration) = match unit {
            DurationUnit::Beats => (round_time(note.start), round_time(note.duration)),
            DurationUnit::Seconds => (
                round_time(map.to_seconds(note.start)),
                round_time(map.span_seconds(note.start, note.duration)),
            ),
        };
        if duration < TIME_EPSILON || duration < options.min_duration {
            dropped += 1;
            continue;
        }
        events.push(NoteEvent::from_midi(note.key, start.max(0.0), duration, note.part as u32));
    }
    if dropped > 0 {
        debug!("{}: dropped {} note(s) below the minimum duration", source_name, dropped);
    }
    if events.is_empty() {
        return Err(KeysError::malformed(source_name, "no extractable note events"));
    }

    let (time_signature, time_signature_changes) = match options.time_signature_override {
        Some(signature) => (signature, Vec::new()),
        None => split_time_signatures(&raw.time_signatures),
    };
    let metadata = SongMetadata {
        source_filename: source_name.to_string(),
        tempo_bpm: map.initial_bpm(),
        time_signature,
        unit,
        tempo_changes: map.changes().iter().skip(1).copied().collect(),
        time_signature_changes,
    };
    let song = Song::from_notes(metadata, events);
    info!(
        "{}: {} note(s) in {} event(s), {} BPM, unit {}",
        source_name,
        song.note_count(),
        song.events().len(),
        song.metadata.tempo_bpm,
        unit
    );
    Ok(song)
}

fn select_parts(raw: &RawScore, filter: Option<&str>) -> Vec<usize> {
    let all: Vec<usize> = (0..raw.parts.len().max(1 + max_part(raw))).collect();
    let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) else {
        return all;
    };
    let needle = filter.to_lowercase();
    let matching: Vec<usize> = raw
        .parts
        .iter()
        .enumerate()
        .filter(|(_, p)| p.name.to_lowercase().contains(&needle))
        .map(|(i, _)| i)
        .collect();
    if matching.is_empty() {
        warn!("no part matches '{}', using all parts", filter);
        all
    } else {
        debug!("part filter '{}' selected parts {:?}", filter, matching);
        matching
    }
}

fn max_part(raw: &RawScore) -> usize {
    raw.notes.iter().map(|n| n.part).max().unwrap_or(0)
}

/// Signature in force at beat 0 and the later changes, with repeats removed.
fn split_time_signatures(
    changes: &[TimeSignatureChange],
) -> (TimeSignature, Vec<TimeSignatureChange>) {
    let mut sorted = changes.to_vec();
    sorted.sort_by(|a, b| a.beat.total_cmp(&b.beat));

    let mut initial = TimeSignature::default();
    let mut later: Vec<TimeSignatureChange> = Vec::new();
    for change in sorted {
        if change.beat <= TIME_EPSILON {
            initial = change.signature;
            continue;
        }
        let current = later.last().map_or(initial, |c| c.signature);
        if current == change.signature {
            continue;
        }
        match later.last_mut() {
            Some(last) if (last.beat - change.beat).abs() < TIME_EPSILON => *last = change,
            _ => later.push(TimeSignatureChange {
                beat: round_time(change.beat),
                signature: change.signature,
            }),
        }
    }
    (initial, later)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SongEvent;

    fn raw_note(key: i32, start: f64, duration: f64, part: usize) -> RawNote {
        RawNote {
            key,
            start,
            duration,
            part,
            percussion: false,
        }
    }

    fn two_part_score() -> RawScore {
        RawScore {
            notes: vec![
                raw_note(60, 0.0, 1.0, 0),
                raw_note(64, 0.0, 1.0, 1),
                raw_note(48, 1.0, 0.5, 1),
            ],
            tempo_changes: vec![TempoChange { beat: 0.0, bpm: 90.0 }],
            time_signatures: vec![TimeSignatureChange {
                beat: 0.0,
                signature: TimeSignature {
                    numerator: 3,
                    denominator: 4,
                },
            }],
            parts: vec![
                RawPart {
                    name: "Piano RH".to_string(),
                },
                RawPart {
                    name: "Bass".to_string(),
                },
            ],
        }
    }

    #[test]
    fn extensions_pick_formats() {
        assert_eq!(
            ScoreFormat::from_path(Path::new("a/b.MID")).unwrap(),
            ScoreFormat::Midi
        );
        assert_eq!(
            ScoreFormat::from_path(Path::new("x.musicxml")).unwrap(),
            ScoreFormat::MusicXml
        );
        assert_eq!(
            ScoreFormat::from_path(Path::new("x.mxl")).unwrap(),
            ScoreFormat::CompressedMusicXml
        );
        assert!(matches!(
            ScoreFormat::from_path(Path::new("notes.pdf")),
            Err(KeysError::UnsupportedFormat(ext)) if ext == ".pdf"
        ));
        assert!(!is_score_file(Path::new("song.txt")));
    }

    #[test]
    fn constant_tempo_resolves_to_beats() {
        let song = resolve("two.mid", two_part_score(), &ReadOptions::default()).unwrap();
        assert_eq!(song.metadata.unit, DurationUnit::Beats);
        assert_eq!(song.metadata.tempo_bpm, 90.0);
        assert_eq!(song.metadata.time_signature.to_string(), "3/4");
        assert_eq!(song.events().len(), 2);
        match &song.events()[0] {
            SongEvent::Chord(c) => assert_eq!(c.len(), 2),
            other => panic!("expected chord, got {:?}", other),
        }
    }

    #[test]
    fn tempo_change_resolves_to_seconds() {
        let mut raw = two_part_score();
        raw.tempo_changes.push(TempoChange { beat: 1.0, bpm: 60.0 });
        let song = resolve("two.mid", raw, &ReadOptions::default()).unwrap();
        assert_eq!(song.metadata.unit, DurationUnit::Seconds);
        assert_eq!(song.metadata.tempo_changes.len(), 1);
        // 1 beat at 90 BPM
        assert_eq!(song.events()[1].start(), 0.667);
        assert_eq!(song.events()[1].duration(), 0.5);
    }

    #[test]
    fn time_signature_override_replaces_meter() {
        let mut raw = two_part_score();
        raw.time_signatures.push(TimeSignatureChange {
            beat: 4.0,
            signature: TimeSignature {
                numerator: 2,
                denominator: 4,
            },
        });
        let options = ReadOptions {
            time_signature_override: Some("6/8".parse().unwrap()),
            ..ReadOptions::default()
        };
        let song = resolve("two.mid", raw, &options).unwrap();
        assert_eq!(song.metadata.time_signature.to_string(), "6/8");
        assert!(song.metadata.time_signature_changes.is_empty());
    }

    #[test]
    fn tempo_override_wins() {
        let mut raw = two_part_score();
        raw.tempo_changes.push(TempoChange { beat: 1.0, bpm: 60.0 });
        let options = ReadOptions {
            tempo_override: Some(150.0),
            ..ReadOptions::default()
        };
        let song = resolve("two.mid", raw, &options).unwrap();
        assert_eq!(song.metadata.unit, DurationUnit::Beats);
        assert_eq!(song.metadata.tempo_bpm, 150.0);
        assert!(song.metadata.tempo_changes.is_empty());
    }

    #[test]
    fn part_filter_and_fallback() {
        let options = ReadOptions {
            part_filter: Some("piano".to_string()),
            ..ReadOptions::default()
        };
        let song = resolve("two.mid", two_part_score(), &options).unwrap();
        assert_eq!(song.note_count(), 1);

        let options = ReadOptions {
            part_filter: Some("violin".to_string()),
            ..ReadOptions::default()
        };
        let song = resolve("two.mid", two_part_score(), &options).unwrap();
        assert_eq!(song.note_count(), 3);
    }

    #[test]
    fn min_duration_drops_short_notes() {
        let options = ReadOptions {
            min_duration: 0.75,
            ..ReadOptions::default()
        };
        let song = resolve("two.mid", two_part_score(), &options).unwrap();
        assert_eq!(song.note_count(), 2);
    }

    #[test]
    fn percussion_only_score_is_malformed() {
        let raw = RawScore {
            notes: vec![RawNote {
                percussion: true,
                ..raw_note(38, 0.0, 1.0, 0)
            }],
            ..RawScore::default()
        };
        let err = resolve("drums.mid", raw.clone(), &ReadOptions::default()).unwrap_err();
        assert!(matches!(err, KeysError::MalformedScore { .. }));

        let keep = ReadOptions {
            skip_percussion: false,
            ..ReadOptions::default()
        };
        assert_eq!(resolve("drums.mid", raw, &keep).unwrap().note_count(), 1);
    }

    #[test]
    fn repeated_time_signatures_collapse() {
        let ts = |beat: f64, n: u8| TimeSignatureChange {
            beat,
            signature: TimeSignature {
                numerator: n,
                denominator: 4,
            },
        };
        let (initial, later) =
            split_time_signatures(&[ts(0.0, 4), ts(0.0, 4), ts(8.0, 3), ts(8.0, 3), ts(11.0, 3)]);
        assert_eq!(initial.numerator, 4);
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].beat, 8.0);
    }

    #[test]
    fn duration_mode_parses() {
        assert_eq!("Auto".parse::<DurationMode>().unwrap(), DurationMode::Auto);
        assert_eq!("seconds".parse::<DurationMode>().unwrap(), DurationMode::Seconds);
        assert!("bars".parse::<DurationMode>().is_err());
    }
}
