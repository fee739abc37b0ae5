//! Line-oriented song text format.
//!
//! ```text
//! # Source: minuet.mid
//! # Tempo: 120
//! # Time Signature: 3/4
//! # Unit: beats
//! # ---
//! 1-2+3-2:0.5
//! #4-2:0.5
//! R:1
//! ```
//!
//! Each line is a chord (`+`-joined tokens) or a rest, followed by `:` and a
//! duration. A token is an optional `#`, a note digit 1-7 (C..B), `-` and a
//! band digit 1-3. Lines starting with `#` not followed by a digit are
//! comments; the header comments carry the song metadata. Events are
//! sequential: each one starts where the previous one ended.

use std::fmt::Write as _;

use log::{debug, warn};

use crate::error::{KeysError, Result};
use crate::tempo::{retime, TempoChange};
use crate::types::{
    round_time, Band, ChordGroup, DurationUnit, NoteEvent, OctaveBands, RestEvent, ScaleDegree,
    Song, SongEvent, SongMetadata, TimeSignature, TimeSignatureChange, TIME_EPSILON,
};

const HEADER_END: &str = "# ---";

/// Longest duration a single line may carry, in either unit.
pub const MAX_DURATION: f64 = 86_400.0;

/// Renders `song` in `unit`, converting through its tempo map when the song
/// was built in the other unit. Gaps between events become rest lines.
///
/// Events that start before the previous one ends are written after it, which
/// moves their start time; this is logged as a warning.
///
/// Fails with [`KeysError::UnmappedNote`] if any note lies outside `bands`.
pub fn serialize_song(song: &Song, bands: &OctaveBands, unit: DurationUnit) -> Result<String> {
    let (text, shifted) = render(song, bands, unit)?;
    if shifted > 0 {
        warn!(
            "{} overlapping event(s) written after the previous one, their start times moved",
            shifted
        );
    }
    Ok(text)
}

/// Song text plus the number of events whose start had to move.
fn render(song: &Song, bands: &OctaveBands, unit: DurationUnit) -> Result<(String, usize)> {
    let song = retime(song, unit);
    let mut out = String::new();
    write_header(&mut out, &song.metadata);

    let mut cursor = 0.0;
    let mut lines = 0usize;
    let mut shifted = 0usize;
    for event in song.events() {
        let duration = round_time(event.duration());
        if duration < TIME_EPSILON {
            debug!("skipping zero-length event at {:.3}", event.start());
            continue;
        }
        let gap = round_time(event.start() - cursor);
        if gap >= TIME_EPSILON {
            let _ = writeln!(out, "R:{}", format_number(gap));
            cursor = round_time(cursor + gap);
        } else if gap <= -TIME_EPSILON {
            debug!(
                "event at {:.3} overlaps the previous one, moved to {:.3}",
                event.start(),
                cursor
            );
            shifted += 1;
        }
        match event {
            SongEvent::Chord(chord) => {
                let tokens = chord
                    .notes()
                    .iter()
                    .map(|n| note_token(n, bands))
                    .collect::<Result<Vec<_>>>()?;
                let _ = writeln!(out, "{}:{}", tokens.join("+"), format_number(duration));
            }
            SongEvent::Rest(_) => {
                let _ = writeln!(out, "R:{}", format_number(duration));
            }
        }
        cursor = round_time(cursor + duration);
        lines += 1;
    }
    debug!("serialized {} event line(s) in {}", lines, unit);
    Ok((out, shifted))
}

fn write_header(out: &mut String, metadata: &SongMetadata) {
    if !metadata.source_filename.is_empty() {
        let _ = writeln!(out, "# Source: {}", metadata.source_filename);
    }
    let _ = writeln!(out, "# Tempo: {}", format_number(metadata.tempo_bpm));
    let _ = writeln!(out, "# Time Signature: {}", metadata.time_signature);
    let _ = writeln!(out, "# Unit: {}", metadata.unit);
    for change in &metadata.tempo_changes {
        let _ = writeln!(
            out,
            "# Tempo {:.3}: {} BPM",
            change.beat,
            format_number(change.bpm)
        );
    }
    for change in &metadata.time_signature_changes {
        let _ = writeln!(out, "# TimeSignature {:.3}: {}", change.beat, change.signature);
    }
    let _ = writeln!(out, "{}", HEADER_END);
}

/// `#1-2` style token for a note inside the band table.
pub fn note_token(note: &NoteEvent, bands: &OctaveBands) -> Result<String> {
    let band = bands.band_of(note.octave).ok_or_else(|| {
        KeysError::unmapped(
            note.name(),
            format!("octave {} is not one of the configured bands", note.octave),
        )
    })?;
    Ok(format!(
        "{}-{}",
        ScaleDegree::from_pitch_class(note.pitch_class),
        band.digit()
    ))
}

/// Three decimals at most, trailing zeros dropped.
fn format_number(value: f64) -> String {
    let rounded = round_time(value);
    if rounded == 0.0 {
        "0".to_string()
    } else {
        format!("{}", rounded)
    }
}

/// Parses song text. Events start where the previous one ended. Missing
/// header values default to 120 BPM, 4/4 and seconds. A leading byte order
/// mark is ignored.
pub fn parse_song(text: &str, bands: &OctaveBands) -> Result<Song> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut metadata = SongMetadata {
        unit: DurationUnit::Seconds,
        ..SongMetadata::default()
    };
    let mut events = Vec::new();
    let mut cursor = 0.0;
    let mut line_count = 0;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        line_count = line_no;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if is_comment(line) {
            read_header_line(line, &mut metadata);
            continue;
        }

        let (body, duration_text) = line
            .rsplit_once(':')
            .ok_or_else(|| KeysError::song_format(line_no, "missing ':' before the duration"))?;
        let duration = parse_duration(duration_text, line_no)?;
        let body = body.trim();

        if body.eq_ignore_ascii_case("r") {
            events.push(SongEvent::Rest(RestEvent {
                start: cursor,
                duration,
            }));
        } else {
            let notes = body
                .split('+')
                .map(|token| parse_token(token.trim(), line_no, bands, cursor, duration))
                .collect::<Result<Vec<_>>>()?;
            events.push(SongEvent::Chord(ChordGroup::rebuild(cursor, duration, notes)));
        }
        cursor = round_time(cursor + duration);
    }

    if !events.iter().any(|e| !e.is_rest()) {
        return Err(KeysError::song_format(
            line_count.max(1),
            "no playable notes found",
        ));
    }
    Ok(Song::new(metadata, events))
}

fn is_comment(line: &str) -> bool {
    let mut chars = line.chars();
    chars.next() == Some('#') && !chars.next().map_or(false, |c| c.is_ascii_digit())
}

fn parse_duration(text: &str, line_no: usize) -> Result<f64> {
    let text = text.trim();
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() && value > MAX_DURATION => Err(KeysError::song_format(
            line_no,
            format!("duration '{}' is longer than {}", text, MAX_DURATION),
        )),
        Ok(value) if value.is_finite() && value > 0.0 => Ok(value),
        Ok(_) => Err(KeysError::song_format(
            line_no,
            format!("duration must be positive, got '{}'", text),
        )),
        Err(_) => Err(KeysError::song_format(
            line_no,
            format!("duration '{}' is not a number", text),
        )),
    }
}

fn parse_token(
    token: &str,
    line_no: usize,
    bands: &OctaveBands,
    start: f64,
    duration: f64,
) -> Result<NoteEvent> {
    let (sharp, rest) = match token.strip_prefix('#') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let malformed = || KeysError::song_format(line_no, format!("malformed chord token '{}'", token));
    let (digit_text, band_text) = rest.split_once('-').ok_or_else(malformed)?;
    let digit_text = digit_text.trim();
    let band_text = band_text.trim();
    if digit_text.len() != 1 || band_text.len() != 1 {
        return Err(malformed());
    }

    let degree = digit_text
        .parse::<u8>()
        .ok()
        .and_then(|d| ScaleDegree::new(d, sharp))
        .ok_or_else(|| {
            KeysError::song_format(line_no, format!("unknown note digit '{}'", digit_text))
        })?;
    let band = band_text
        .parse::<u8>()
        .ok()
        .and_then(Band::from_digit)
        .ok_or_else(|| {
            KeysError::song_format(line_no, format!("unknown octave digit '{}'", band_text))
        })?;

    let (pitch_class, carry) = degree.pitch();
    let octave = bands.octave_of(band) + carry;
    Ok(NoteEvent::new(pitch_class, octave, start, duration, 0))
}

fn read_header_line(line: &str, metadata: &mut SongMetadata) {
    let body = line.trim_start_matches('#').trim();
    let Some((key, value)) = body.split_once(':') else {
        return;
    };
    let (key, value) = (key.trim(), value.trim());

    match key {
        "Source" => metadata.source_filename = value.to_string(),
        "Tempo" => match parse_bpm(value) {
            Some(bpm) => metadata.tempo_bpm = bpm,
            None => warn!("ignoring tempo header '{}'", value),
        },
        "Time Signature" => match value.parse::<TimeSignature>() {
            Ok(ts) => metadata.time_signature = ts,
            Err(e) => warn!("ignoring time signature header: {}", e),
        },
        "Unit" => match value.parse::<DurationUnit>() {
            Ok(unit) => metadata.unit = unit,
            Err(e) => warn!("ignoring unit header: {}", e),
        },
        _ => {
            if let Some(beat) = key.strip_prefix("TimeSignature ") {
                if let (Ok(beat), Ok(signature)) =
                    (beat.trim().parse::<f64>(), value.parse::<TimeSignature>())
                {
                    metadata
                        .time_signature_changes
                        .push(TimeSignatureChange { beat, signature });
                }
            } else if let Some(beat) = key.strip_prefix("Tempo ") {
                if let (Ok(beat), Some(bpm)) = (beat.trim().parse::<f64>(), parse_bpm(value)) {
                    metadata.tempo_changes.push(TempoChange { beat, bpm });
                }
            }
        }
    }
}

fn parse_bpm(value: &str) -> Option<f64> {
    let number = value.trim().trim_end_matches("BPM").trim();
    number
        .parse::<f64>()
        .ok()
        .filter(|bpm| bpm.is_finite() && *bpm > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use float_cmp::approx_eq;

    fn bands() -> OctaveBands {
        OctaveBands::default()
    }

    fn notes_of(event: &SongEvent) -> Vec<(u8, i8)> {
        match event {
            SongEvent::Chord(c) => c.notes().iter().map(|n| (n.pitch_class, n.octave)).collect(),
            SongEvent::Rest(_) => Vec::new(),
        }
    }

    fn body_lines(text: &str) -> Vec<&str> {
        text.lines().filter(|l| !is_comment(l)).collect()
    }

    #[test]
    fn identical_timing_shares_a_line() {
        let song = Song::from_notes(
            SongMetadata::default(),
            vec![
                NoteEvent::from_midi(60, 1.0, 0.5, 0),
                NoteEvent::from_midi(64, 1.0, 0.5, 1),
            ],
        );
        let text = serialize_song(&song, &bands(), DurationUnit::Beats).unwrap();
        assert_eq!(body_lines(&text), vec!["R:1", "1-2+3-2:0.5"]);
    }

    #[test]
    fn different_duration_gets_its_own_line() {
        let song = Song::from_notes(
            SongMetadata::default(),
            vec![
                NoteEvent::from_midi(60, 1.0, 0.5, 0),
                NoteEvent::from_midi(64, 1.0, 0.5, 0),
                NoteEvent::from_midi(67, 1.0, 0.6, 0),
            ],
        );
        let text = serialize_song(&song, &bands(), DurationUnit::Beats).unwrap();
        assert_eq!(body_lines(&text), vec!["R:1", "1-2+3-2:0.5", "5-2:0.6"]);
    }

    #[test]
    fn parses_notes_sharps_and_rests_in_order() {
        let song = parse_song("1-2:0.5\n#1-2:0.3\nR:0.2", &bands()).unwrap();
        let events = song.events();
        assert_eq!(events.len(), 3);
        assert_eq!(notes_of(&events[0]), vec![(0, 4)]);
        assert_eq!(events[0].duration(), 0.5);
        assert_eq!(notes_of(&events[1]), vec![(1, 4)]);
        assert_eq!(events[1].start(), 0.5);
        assert_eq!(events[1].duration(), 0.3);
        assert!(events[2].is_rest());
        assert_eq!(events[2].start(), 0.8);
        assert_eq!(events[2].duration(), 0.2);
        assert_eq!(song.metadata.unit, DurationUnit::Seconds);
        assert_eq!(song.metadata.tempo_bpm, 120.0);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = "# Unit: beats\n\n# a note about the piece\n5-1 + 1-3 : 1\nr:0.5\n";
        let song = parse_song(text, &bands()).unwrap();
        assert_eq!(song.events().len(), 2);
        assert_eq!(notes_of(&song.events()[0]), vec![(7, 3), (0, 5)]);
        assert_eq!(song.metadata.unit, DurationUnit::Beats);
    }

    #[test]
    fn only_comments_is_an_error() {
        match parse_song("# one\n# two\n\n", &bands()) {
            Err(KeysError::SongFormat { message, .. }) => {
                assert_eq!(message, "no playable notes found")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse_song("R:1\n", &bands()).is_err());
    }

    #[test]
    fn bad_lines_report_their_line_number() {
        let cases = [
            ("1-2:0.5\n9-2:0.5", 2, "unknown note digit '9'"),
            ("1-4:0.5", 1, "unknown octave digit '4'"),
            ("1-2:0", 1, "duration must be positive, got '0'"),
            ("1-2:-1", 1, "duration must be positive, got '-1'"),
            ("1-2:fast", 1, "duration 'fast' is not a number"),
            ("\n\n12:0.5", 3, "malformed chord token '12'"),
            ("1-2", 1, "missing ':' before the duration"),
            (
                "1-2:1\n1-2:100000000000000000000",
                2,
                "duration '100000000000000000000' is longer than 86400",
            ),
        ];
        for (text, line, message) in cases {
            match parse_song(text, &bands()) {
                Err(KeysError::SongFormat { line: l, message: m }) => {
                    assert_eq!((l, m.as_str()), (line, message), "input {:?}", text)
                }
                other => panic!("input {:?}: unexpected {:?}", text, other),
            }
        }
    }

    #[test]
    fn byte_order_mark_is_ignored() {
        let song = parse_song("\u{feff}1-2:0.5\n3-2:0.5\n", &bands()).unwrap();
        assert_eq!(song.events().len(), 2);
        assert_eq!(notes_of(&song.events()[0]), vec![(0, 4)]);

        let song = parse_song("\u{feff}# Unit: beats\n1-2:1\n", &bands()).unwrap();
        assert_eq!(song.metadata.unit, DurationUnit::Beats);
    }

    #[test]
    fn overlapping_events_are_counted_when_moved() {
        let overlapping = Song::from_notes(
            SongMetadata {
                unit: DurationUnit::Beats,
                ..SongMetadata::default()
            },
            vec![
                NoteEvent::from_midi(60, 0.0, 2.0, 0),
                NoteEvent::from_midi(64, 1.0, 2.0, 0),
            ],
        );
        let (text, shifted) = render(&overlapping, &bands(), DurationUnit::Beats).unwrap();
        assert_eq!(shifted, 1);
        assert_eq!(body_lines(&text), vec!["1-2:2", "3-2:2"]);

        let parsed = parse_song(&text, &bands()).unwrap();
        let starts: Vec<f64> = parsed.events().iter().map(SongEvent::start).collect();
        assert_eq!(starts, vec![0.0, 2.0]);

        let sequential = parse_song("1-2:1\nR:1\n3-2:1\n", &bands()).unwrap();
        let (_, shifted) = render(&sequential, &bands(), DurationUnit::Seconds).unwrap();
        assert_eq!(shifted, 0);
    }

    #[test]
    fn enharmonic_sharps() {
        let song = parse_song("#3-1:1\n#7-2:1", &bands()).unwrap();
        assert_eq!(notes_of(&song.events()[0]), vec![(5, 3)]);
        assert_eq!(notes_of(&song.events()[1]), vec![(0, 5)]);
    }

    #[test]
    fn header_round_trips() {
        let metadata = SongMetadata {
            source_filename: "waltz.mid".to_string(),
            tempo_bpm: 96.0,
            time_signature: TimeSignature {
                numerator: 3,
                denominator: 4,
            },
            unit: DurationUnit::Beats,
            tempo_changes: vec![TempoChange { beat: 12.0, bpm: 72.0 }],
            time_signature_changes: vec![TimeSignatureChange {
                beat: 24.0,
                signature: TimeSignature {
                    numerator: 4,
                    denominator: 4,
                },
            }],
        };
        let song = Song::from_notes(metadata.clone(), vec![NoteEvent::from_midi(62, 0.0, 1.0, 0)]);
        let text = serialize_song(&song, &bands(), DurationUnit::Beats).unwrap();
        assert!(text.contains("# Tempo 12.000: 72 BPM"));
        assert!(text.contains("# TimeSignature 24.000: 4/4"));
        let parsed = parse_song(&text, &bands()).unwrap();
        assert_eq!(parsed.metadata, metadata);
    }

    #[test]
    fn out_of_band_note_fails_serialization() {
        let song = Song::from_notes(
            SongMetadata::default(),
            vec![NoteEvent::from_midi(96, 0.0, 1.0, 0)],
        );
        let err = serialize_song(&song, &bands(), DurationUnit::Beats).unwrap_err();
        assert!(matches!(err, KeysError::UnmappedNote { .. }));
    }

    #[test]
    fn normalized_song_survives_a_round_trip() {
        let raw = Song::from_notes(
            SongMetadata::default(),
            vec![
                NoteEvent::from_midi(36, 0.0, 0.5, 0),
                NoteEvent::from_midi(61, 0.0, 0.5, 1),
                NoteEvent::from_midi(90, 0.75, 0.25, 0),
                NoteEvent::from_midi(70, 1.0, 1.333, 0),
            ],
        );
        let normalized = normalize(&raw, &bands()).unwrap().song;
        let text = serialize_song(&normalized, &bands(), DurationUnit::Beats).unwrap();
        let parsed = parse_song(&text, &bands()).unwrap();

        let chords = |song: &Song| -> Vec<(f64, f64, Vec<(u8, i8)>)> {
            song.events()
                .iter()
                .filter(|e| !e.is_rest())
                .map(|e| (e.start(), e.duration(), notes_of(e)))
                .collect()
        };
        let (want, got) = (chords(&normalized), chords(&parsed));
        assert_eq!(want.len(), got.len());
        for (w, g) in want.iter().zip(got.iter()) {
            assert!(approx_eq!(f64, w.0, g.0, epsilon = 1e-3));
            assert!(approx_eq!(f64, w.1, g.1, epsilon = 1e-3));
            assert_eq!(w.2, g.2);
        }
    }
}
