//! Song data model shared by the readers, the normalizer, the text format and
//! the player.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KeysError, Result};
use crate::tempo::{TempoChange, TempoMap, DEFAULT_BPM};

/// Times and durations are kept to three decimals of their unit.
pub const TIME_PRECISION: f64 = 1000.0;

/// Anything shorter than this after rounding is treated as zero.
pub const TIME_EPSILON: f64 = 0.0005;

pub fn round_time(value: f64) -> f64 {
    (value * TIME_PRECISION).round() / TIME_PRECISION
}

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// A single sounding pitch. Created by a score reader or the song parser and
/// never mutated afterwards; transformations build new events.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteEvent {
    /// Chromatic pitch class, 0 = C .. 11 = B.
    pub pitch_class: u8,
    /// Standard octave number, 4 is the octave of middle C.
    pub octave: i8,
    pub start: f64,
    pub duration: f64,
    pub voice: u32,
}

impl NoteEvent {
    pub fn new(pitch_class: u8, octave: i8, start: f64, duration: f64, voice: u32) -> Self {
        NoteEvent {
            pitch_class: pitch_class % 12,
            octave,
            start,
            duration,
            voice,
        }
    }

    /// Build from a MIDI key number (60 = C4).
    pub fn from_midi(key: i32, start: f64, duration: f64, voice: u32) -> Self {
        NoteEvent {
            pitch_class: key.rem_euclid(12) as u8,
            octave: (key.div_euclid(12) - 1) as i8,
            start,
            duration,
            voice,
        }
    }

    /// MIDI key number; may fall outside 0..=127 for folded-out pitches.
    pub fn midi_key(&self) -> i32 {
        (self.octave as i32 + 1) * 12 + self.pitch_class as i32
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    pub fn with_octave(&self, octave: i8) -> Self {
        NoteEvent {
            octave,
            ..self.clone()
        }
    }

    pub fn with_timing(&self, start: f64, duration: f64) -> Self {
        NoteEvent {
            start,
            duration,
            ..self.clone()
        }
    }

    /// Same sounding pitch, ignoring timing and voice.
    pub fn same_pitch(&self, other: &NoteEvent) -> bool {
        self.pitch_class == other.pitch_class && self.octave == other.octave
    }

    pub fn name(&self) -> String {
        format!("{}{}", NOTE_NAMES[self.pitch_class as usize], self.octave)
    }
}

/// Notes struck together. All members share a bit-identical start and
/// duration; the group is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ChordGroup {
    start: f64,
    duration: f64,
    notes: Vec<NoteEvent>,
}

impl ChordGroup {
    /// Returns `None` for an empty set or when members disagree on timing.
    pub fn new(notes: Vec<NoteEvent>) -> Option<Self> {
        let first = notes.first()?;
        let (start, duration) = (first.start, first.duration);
        let aligned = notes.iter().all(|n| {
            n.start.to_bits() == start.to_bits() && n.duration.to_bits() == duration.to_bits()
        });
        if !aligned {
            return None;
        }
        Some(Self::rebuild(start, duration, notes))
    }

    /// Stamps the timing onto every note, sorts by pitch and drops repeated
    /// pitches. Callers guarantee `notes` is non-empty.
    pub(crate) fn rebuild(start: f64, duration: f64, notes: Vec<NoteEvent>) -> Self {
        let mut notes: Vec<NoteEvent> = notes
            .into_iter()
            .map(|n| n.with_timing(start, duration))
            .collect();
        notes.sort_by_key(|n| n.midi_key());
        notes.dedup_by(|a, b| a.same_pitch(b));
        ChordGroup {
            start,
            duration,
            notes,
        }
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn notes(&self) -> &[NoteEvent] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestEvent {
    pub start: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SongEvent {
    Chord(ChordGroup),
    Rest(RestEvent),
}

impl SongEvent {
    pub fn start(&self) -> f64 {
        match self {
            SongEvent::Chord(c) => c.start(),
            SongEvent::Rest(r) => r.start,
        }
    }

    pub fn duration(&self) -> f64 {
        match self {
            SongEvent::Chord(c) => c.duration(),
            SongEvent::Rest(r) => r.duration,
        }
    }

    pub fn end(&self) -> f64 {
        self.start() + self.duration()
    }

    pub fn is_rest(&self) -> bool {
        matches!(self, SongEvent::Rest(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    #[default]
    Beats,
    Seconds,
}

impl fmt::Display for DurationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationUnit::Beats => write!(f, "beats"),
            DurationUnit::Seconds => write!(f, "seconds"),
        }
    }
}

impl FromStr for DurationUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beats" | "beat" => Ok(DurationUnit::Beats),
            "seconds" | "second" | "secs" | "s" => Ok(DurationUnit::Seconds),
            other => Err(format!("unknown duration unit '{}'", other)),
        }
    }
}

/// Written and read as `N/D`, also in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeSignature {
    pub numerator: u8,
    pub denominator: u8,
}

impl TryFrom<String> for TimeSignature {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeSignature> for String {
    fn from(signature: TimeSignature) -> String {
        signature.to_string()
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        TimeSignature {
            numerator: 4,
            denominator: 4,
        }
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl FromStr for TimeSignature {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (num, den) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("time signature '{}' must look like N/D", s.trim()))?;
        let numerator: u8 = num
            .trim()
            .parse()
            .map_err(|_| format!("bad time signature numerator '{}'", num.trim()))?;
        let denominator: u8 = den
            .trim()
            .parse()
            .map_err(|_| format!("bad time signature denominator '{}'", den.trim()))?;
        if numerator == 0 || denominator == 0 {
            return Err(format!("time signature '{}' must be positive", s.trim()));
        }
        Ok(TimeSignature {
            numerator,
            denominator,
        })
    }
}

/// A meter change at a beat position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSignatureChange {
    pub beat: f64,
    pub signature: TimeSignature,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SongMetadata {
    pub source_filename: String,
    /// Initial tempo in quarter notes per minute.
    pub tempo_bpm: f64,
    pub time_signature: TimeSignature,
    /// Unit of every start and duration in the song.
    pub unit: DurationUnit,
    /// Tempo changes after the initial one, positioned in beats.
    pub tempo_changes: Vec<TempoChange>,
    pub time_signature_changes: Vec<TimeSignatureChange>,
}

impl Default for SongMetadata {
    fn default() -> Self {
        SongMetadata {
            source_filename: String::new(),
            tempo_bpm: DEFAULT_BPM,
            time_signature: TimeSignature::default(),
            unit: DurationUnit::Beats,
            tempo_changes: Vec::new(),
            time_signature_changes: Vec::new(),
        }
    }
}

impl SongMetadata {
    pub fn tempo_map(&self) -> TempoMap {
        let mut changes = vec![TempoChange {
            beat: 0.0,
            bpm: self.tempo_bpm,
        }];
        changes.extend(self.tempo_changes.iter().copied());
        TempoMap::new(changes)
    }
}

/// Metadata plus events ordered by start time.
#[derive(Debug, Clone, PartialEq)]
pub struct Song {
    pub metadata: SongMetadata,
    events: Vec<SongEvent>,
}

impl Song {
    pub fn new(metadata: SongMetadata, mut events: Vec<SongEvent>) -> Self {
        events.sort_by(|a, b| a.start().total_cmp(&b.start()));
        Song { metadata, events }
    }

    /// Groups notes with identical start and duration into chords.
    pub fn from_notes(metadata: SongMetadata, notes: Vec<NoteEvent>) -> Self {
        Song::new(metadata, group_notes(notes))
    }

    pub fn events(&self) -> &[SongEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<SongEvent> {
        self.events
    }

    pub fn notes(&self) -> impl Iterator<Item = &NoteEvent> {
        self.events.iter().flat_map(|e| match e {
            SongEvent::Chord(c) => c.notes().iter(),
            SongEvent::Rest(_) => [].iter(),
        })
    }

    pub fn note_count(&self) -> usize {
        self.notes().count()
    }

    pub fn chord_count(&self) -> usize {
        self.events.iter().filter(|e| !e.is_rest()).count()
    }

    /// End of the last event.
    pub fn end(&self) -> f64 {
        self.events.iter().map(SongEvent::end).fold(0.0, f64::max)
    }

    /// Lowest and highest octave of any note.
    pub fn octave_range(&self) -> Option<(i8, i8)> {
        let mut octaves = self.notes().map(|n| n.octave);
        let first = octaves.next()?;
        Some(octaves.fold((first, first), |(lo, hi), o| (lo.min(o), hi.max(o))))
    }

    /// Median MIDI key over all notes, averaging the middle pair.
    pub fn median_key(&self) -> Option<f64> {
        let mut keys: Vec<i32> = self.notes().map(NoteEvent::midi_key).collect();
        if keys.is_empty() {
            return None;
        }
        keys.sort_unstable();
        let mid = keys.len() / 2;
        if keys.len() % 2 == 0 {
            Some((keys[mid - 1] + keys[mid]) as f64 / 2.0)
        } else {
            Some(keys[mid] as f64)
        }
    }

    /// New song with every note replaced by `f(note)`. Timing is kept, so the
    /// event structure is unchanged; chords drop pitches that collapse onto
    /// each other.
    pub fn map_notes<F>(&self, f: F) -> Song
    where
        F: Fn(&NoteEvent) -> NoteEvent,
    {
        let events = self
            .events
            .iter()
            .map(|e| match e {
                SongEvent::Chord(c) => SongEvent::Chord(ChordGroup::rebuild(
                    c.start(),
                    c.duration(),
                    c.notes().iter().map(&f).collect(),
                )),
                SongEvent::Rest(r) => SongEvent::Rest(*r),
            })
            .collect();
        Song {
            metadata: self.metadata.clone(),
            events,
        }
    }

    pub fn with_events(&self, events: Vec<SongEvent>) -> Song {
        Song::new(self.metadata.clone(), events)
    }
}

/// Sorts notes by (start, duration) and merges runs with bit-identical timing
/// into chord groups.
pub fn group_notes(mut notes: Vec<NoteEvent>) -> Vec<SongEvent> {
    notes.sort_by(|a, b| {
        a.start
            .total_cmp(&b.start)
            .then(a.duration.total_cmp(&b.duration))
            .then(a.midi_key().cmp(&b.midi_key()))
    });
    let mut events = Vec::new();
    let mut run: Vec<NoteEvent> = Vec::new();
    for note in notes {
        let same_timing = run.first().map_or(false, |head| {
            head.start.to_bits() == note.start.to_bits()
                && head.duration.to_bits() == note.duration.to_bits()
        });
        if !same_timing && !run.is_empty() {
            let group = std::mem::take(&mut run);
            events.extend(ChordGroup::new(group).map(SongEvent::Chord));
        }
        run.push(note);
    }
    if !run.is_empty() {
        events.extend(ChordGroup::new(run).map(SongEvent::Chord));
    }
    events
}

/// Keyboard row, written as octave digit 1..3 in song files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Band {
    Low,
    Middle,
    High,
}

impl Band {
    pub const ALL: [Band; 3] = [Band::Low, Band::Middle, Band::High];

    pub fn from_digit(digit: u8) -> Option<Band> {
        match digit {
            1 => Some(Band::Low),
            2 => Some(Band::Middle),
            3 => Some(Band::High),
            _ => None,
        }
    }

    pub fn digit(self) -> u8 {
        self.index() as u8 + 1
    }

    pub fn index(self) -> usize {
        match self {
            Band::Low => 0,
            Band::Middle => 1,
            Band::High => 2,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Band::Low => write!(f, "Low"),
            Band::Middle => write!(f, "Middle"),
            Band::High => write!(f, "High"),
        }
    }
}

/// Which absolute octave each keyboard band plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OctaveBands {
    pub low: i8,
    pub middle: i8,
    pub high: i8,
}

impl Default for OctaveBands {
    fn default() -> Self {
        OctaveBands {
            low: 3,
            middle: 4,
            high: 5,
        }
    }
}

impl OctaveBands {
    pub fn validate(&self) -> Result<()> {
        if self.low < self.middle && self.middle < self.high {
            Ok(())
        } else {
            Err(KeysError::InvalidConfig(format!(
                "octave bands must be strictly ascending, got low={} middle={} high={}",
                self.low, self.middle, self.high
            )))
        }
    }

    pub fn octaves(&self) -> [i8; 3] {
        [self.low, self.middle, self.high]
    }

    pub fn octave_of(&self, band: Band) -> i8 {
        self.octaves()[band.index()]
    }

    pub fn band_of(&self, octave: i8) -> Option<Band> {
        Band::ALL
            .into_iter()
            .find(|band| self.octave_of(*band) == octave)
    }

    pub fn contains(&self, octave: i8) -> bool {
        self.band_of(octave).is_some()
    }
}

/// Note digit 1..7 (C..B) plus an optional sharp, as written in song files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleDegree {
    pub digit: u8,
    pub sharp: bool,
}

const NATURAL_PITCH_CLASSES: [u8; 7] = [0, 2, 4, 5, 7, 9, 11];

impl ScaleDegree {
    pub fn new(digit: u8, sharp: bool) -> Option<Self> {
        (1..=7).contains(&digit).then_some(ScaleDegree { digit, sharp })
    }

    /// Sharps are spelled on the natural below, so C# is `#1`, never a flat.
    pub fn from_pitch_class(pitch_class: u8) -> Self {
        let pc = pitch_class % 12;
        match NATURAL_PITCH_CLASSES.iter().position(|&n| n == pc) {
            Some(i) => ScaleDegree {
                digit: i as u8 + 1,
                sharp: false,
            },
            None => {
                let below = NATURAL_PITCH_CLASSES
                    .iter()
                    .rposition(|&n| n < pc)
                    .unwrap_or(0);
                ScaleDegree {
                    digit: below as u8 + 1,
                    sharp: true,
                }
            }
        }
    }

    /// Pitch class and octave carry; `#7` (B#) carries into the next octave.
    pub fn pitch(&self) -> (u8, i8) {
        let natural = NATURAL_PITCH_CLASSES[(self.digit.clamp(1, 7) - 1) as usize];
        let pc = natural + self.sharp as u8;
        if pc >= 12 {
            (pc - 12, 1)
        } else {
            (pc, 0)
        }
    }
}

impl fmt::Display for ScaleDegree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sharp {
            write!(f, "#")?;
        }
        write!(f, "{}", self.digit)
    }
}

/// Summary of one part/track of a source score.
#[derive(Debug, Clone, PartialEq)]
pub struct PartInfo {
    pub index: usize,
    pub name: String,
    pub note_count: usize,
    pub pitch_range: (u8, u8),
}
