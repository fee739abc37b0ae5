//! Standard MIDI File reader.
//!
//! Every track becomes a part. Notes pair first-in first-out per channel and
//! key, so overlapping repeats of a pitch close in the order they opened.
//! Tempo and meter meta events are collected from all tracks.

use std::collections::{HashMap, VecDeque};

use log::{debug, trace, warn};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

use super::{RawNote, RawPart, RawScore, ScoreParser};
use crate::error::{KeysError, Result};
use crate::tempo::{TempoChange, DEFAULT_BPM};
use crate::types::{TimeSignature, TimeSignatureChange};

/// Channel 10 in General MIDI numbering.
pub const PERCUSSION_CHANNEL: u8 = 9;

#[derive(Debug, Clone, Copy, Default)]
pub struct MidiParser;

/// Converts absolute ticks to quarter-note beats.
#[derive(Debug, Clone, Copy)]
enum TickScale {
    Metrical { ticks_per_q: f64 },
    /// SMPTE ticks are wall-clock; they are read at the default tempo.
    Timecode { ticks_per_sec: f64 },
}

impl TickScale {
    fn beats(self, ticks: u64) -> f64 {
        match self {
            TickScale::Metrical { ticks_per_q } => ticks as f64 / ticks_per_q,
            TickScale::Timecode { ticks_per_sec } => {
                ticks as f64 / ticks_per_sec * DEFAULT_BPM / 60.0
            }
        }
    }
}

impl ScoreParser for MidiParser {
    fn parse(&self, source_name: &str, bytes: &[u8]) -> Result<RawScore> {
        let smf = Smf::parse(bytes)
            .map_err(|e| KeysError::malformed(source_name, format!("invalid MIDI data: {}", e)))?;
        if smf.tracks.is_empty() {
            return Err(KeysError::malformed(source_name, "MIDI file has no tracks"));
        }

        let scale = match smf.header.timing {
            Timing::Metrical(t) if t.as_int() > 0 => TickScale::Metrical {
                ticks_per_q: t.as_int() as f64,
            },
            Timing::Metrical(_) => {
                return Err(KeysError::malformed(source_name, "zero ticks per quarter note"))
            }
            Timing::Timecode(fps, subframes) => {
                warn!(
                    "{}: SMPTE timing ({} fps x {}), reading at {} BPM",
                    source_name,
                    fps.as_f32(),
                    subframes,
                    DEFAULT_BPM
                );
                TickScale::Timecode {
                    ticks_per_sec: (fps.as_f32() as f64 * subframes.max(1) as f64).max(1.0),
                }
            }
        };
        let metrical = matches!(scale, TickScale::Metrical { .. });

        let mut raw = RawScore::default();
        for (index, track) in smf.tracks.iter().enumerate() {
            let mut open: HashMap<(u8, u8), VecDeque<u64>> = HashMap::new();
            let mut abs_time = 0u64;
            let mut name: Option<String> = None;
            let mut program: Option<u8> = None;
            let mut closed = 0usize;

            for event in track.iter() {
                abs_time += event.delta.as_int() as u64;
                match event.kind {
                    TrackEventKind::Midi { channel, message } => {
                        let ch = channel.as_int();
                        match message {
                            MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                                open.entry((ch, key.as_int()))
                                    .or_default()
                                    .push_back(abs_time);
                            }
                            MidiMessage::NoteOff { key, .. } | MidiMessage::NoteOn { key, .. } => {
                                let started = open
                                    .get_mut(&(ch, key.as_int()))
                                    .and_then(VecDeque::pop_front);
                                if let Some(start) = started {
                                    push_note(&mut raw, scale, index, ch, key.as_int(), start, abs_time);
                                    closed += 1;
                                }
                            }
                            MidiMessage::ProgramChange { program: p } => {
                                program = Some(p.as_int());
                            }
                            _ => {}
                        }
                    }
                    TrackEventKind::Meta(MetaMessage::Tempo(tempo)) if metrical => {
                        let micros = tempo.as_int().max(1) as f64;
                        let bpm = 60_000_000.0 / micros;
                        trace!(
                            "{}: track {} tick {}: tempo {} us/qn ({:.2} BPM)",
                            source_name,
                            index,
                            abs_time,
                            tempo.as_int(),
                            bpm
                        );
                        raw.tempo_changes.push(TempoChange {
                            beat: scale.beats(abs_time),
                            bpm,
                        });
                    }
                    TrackEventKind::Meta(MetaMessage::TimeSignature(num, den_pow, _, _)) => {
                        if num > 0 && den_pow < 8 {
                            raw.time_signatures.push(TimeSignatureChange {
                                beat: scale.beats(abs_time),
                                signature: TimeSignature {
                                    numerator: num,
                                    denominator: 1u8 << den_pow,
                                },
                            });
                        }
                    }
                    TrackEventKind::Meta(MetaMessage::TrackName(bytes)) => {
                        let text = String::from_utf8_lossy(bytes).trim().to_string();
                        if !text.is_empty() {
                            name = Some(text);
                        }
                    }
                    _ => {}
                }
            }

            // notes still sounding end with the track
            let mut hanging: Vec<((u8, u8), u64)> = open
                .into_iter()
                .flat_map(|(id, starts)| starts.into_iter().map(move |s| (id, s)))
                .collect();
            hanging.sort();
            if !hanging.is_empty() {
                debug!(
                    "{}: track {} closes {} hanging note(s) at end of track",
                    source_name,
                    index,
                    hanging.len()
                );
            }
            for ((ch, key), start) in hanging {
                push_note(&mut raw, scale, index, ch, key, start, abs_time);
                closed += 1;
            }

            let name = name.unwrap_or_else(|| match program.and_then(program_family) {
                Some(family) => format!("Track {} ({})", index, family),
                None => format!("Track {}", index),
            });
            debug!("{}: track {} '{}' has {} note(s)", source_name, index, name, closed);
            raw.parts.push(RawPart { name });
        }
        Ok(raw)
    }
}

fn push_note(
    raw: &mut RawScore,
    scale: TickScale,
    part: usize,
    channel: u8,
    key: u8,
    start: u64,
    end: u64,
) {
    let start_beats = scale.beats(start);
    let duration = scale.beats(end.saturating_sub(start));
    if duration <= 0.0 {
        return;
    }
    raw.notes.push(RawNote {
        key: key as i32,
        start: start_beats,
        duration,
        part,
        percussion: channel == PERCUSSION_CHANNEL,
    });
}

/// General MIDI instrument family of a program number.
pub fn program_family(program: u8) -> Option<&'static str> {
    let family = match program {
        0..=7 => "Piano",
        8..=15 => "Chromatic Percussion",
        16..=23 => "Organ",
        24..=31 => "Guitar",
        32..=39 => "Bass",
        40..=47 => "Strings",
        48..=55 => "Ensemble",
        56..=63 => "Brass",
        64..=71 => "Reed",
        72..=79 => "Pipe",
        80..=87 => "Synth Lead",
        88..=95 => "Synth Pad",
        96..=103 => "Synth Effects",
        104..=111 => "Ethnic",
        112..=119 => "Percussive",
        120..=127 => "Sound Effects",
        _ => return None,
    };
    Some(family)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::{resolve, ReadOptions};
    use crate::types::{DurationUnit, SongEvent};
    use midly::{Format, Header, TrackEvent};

    fn ev(delta: u32, kind: TrackEventKind<'static>) -> TrackEvent<'static> {
        TrackEvent {
            delta: delta.into(),
            kind,
        }
    }

    fn note_on(channel: u8, key: u8, vel: u8) -> TrackEventKind<'static> {
        TrackEventKind::Midi {
            channel: channel.into(),
            message: MidiMessage::NoteOn {
                key: key.into(),
                vel: vel.into(),
            },
        }
    }

    fn note_off(channel: u8, key: u8) -> TrackEventKind<'static> {
        TrackEventKind::Midi {
            channel: channel.into(),
            message: MidiMessage::NoteOff {
                key: key.into(),
                vel: 0u8.into(),
            },
        }
    }

    fn end() -> TrackEvent<'static> {
        ev(0, TrackEventKind::Meta(MetaMessage::EndOfTrack))
    }

    fn encode(tracks: Vec<Vec<TrackEvent<'static>>>) -> Vec<u8> {
        let smf = Smf {
            header: Header::new(Format::Parallel, Timing::Metrical(480u16.into())),
            tracks,
        };
        let mut bytes = Vec::new();
        smf.write_std(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn chord_tempo_and_meter() {
        let conductor = vec![
            ev(0, TrackEventKind::Meta(MetaMessage::Tempo(600_000u32.into()))),
            ev(0, TrackEventKind::Meta(MetaMessage::TimeSignature(3, 2, 24, 8))),
            end(),
        ];
        let melody = vec![
            ev(0, TrackEventKind::Meta(MetaMessage::TrackName(b"Melody"))),
            ev(0, note_on(0, 60, 90)),
            ev(0, note_on(0, 64, 90)),
            ev(480, note_off(0, 60)),
            ev(0, note_on(0, 64, 0)),
            ev(0, note_on(0, 67, 90)),
            ev(240, note_off(0, 67)),
            end(),
        ];
        let raw = MidiParser.parse("waltz.mid", &encode(vec![conductor, melody])).unwrap();
        assert_eq!(raw.notes.len(), 3);
        assert_eq!(raw.parts[1].name, "Melody");
        assert_eq!(raw.tempo_changes[0].bpm, 100.0);

        let song = resolve("waltz.mid", raw, &ReadOptions::default()).unwrap();
        assert_eq!(song.metadata.tempo_bpm, 100.0);
        assert_eq!(song.metadata.time_signature.to_string(), "3/4");
        assert_eq!(song.metadata.unit, DurationUnit::Beats);
        match &song.events()[0] {
            SongEvent::Chord(c) => {
                assert_eq!(c.len(), 2);
                assert_eq!(c.duration(), 1.0);
            }
            other => panic!("expected chord, got {:?}", other),
        }
        assert_eq!(song.events()[1].start(), 1.0);
        assert_eq!(song.events()[1].duration(), 0.5);
    }

    #[test]
    fn overlapping_repeats_pair_in_order() {
        let track = vec![
            ev(0, note_on(0, 62, 80)),
            ev(240, note_on(0, 62, 80)),
            ev(240, note_off(0, 62)),
            ev(480, note_off(0, 62)),
            end(),
        ];
        let raw = MidiParser.parse("rep.mid", &encode(vec![track])).unwrap();
        let mut spans: Vec<(f64, f64)> = raw.notes.iter().map(|n| (n.start, n.duration)).collect();
        spans.sort_by(|a, b| a.0.total_cmp(&b.0));
        assert_eq!(spans, vec![(0.0, 1.0), (0.5, 1.5)]);
    }

    #[test]
    fn hanging_notes_close_at_track_end() {
        let track = vec![
            ev(0, TrackEventKind::Midi {
                channel: 0u8.into(),
                message: MidiMessage::ProgramChange {
                    program: 33u8.into(),
                },
            }),
            ev(0, note_on(0, 40, 80)),
            ev(960, end().kind),
        ];
        let raw = MidiParser.parse("bass.mid", &encode(vec![track])).unwrap();
        assert_eq!(raw.notes.len(), 1);
        assert_eq!(raw.notes[0].duration, 2.0);
        assert_eq!(raw.parts[0].name, "Track 0 (Bass)");
    }

    #[test]
    fn percussion_channel_is_flagged() {
        let track = vec![
            ev(0, note_on(9, 36, 100)),
            ev(0, note_on(0, 60, 100)),
            ev(480, note_off(9, 36)),
            ev(0, note_off(0, 60)),
            end(),
        ];
        let raw = MidiParser.parse("beat.mid", &encode(vec![track])).unwrap();
        let drums: Vec<bool> = raw.notes.iter().map(|n| n.percussion).collect();
        assert_eq!(drums.iter().filter(|d| **d).count(), 1);
        let song = resolve("beat.mid", raw, &ReadOptions::default()).unwrap();
        assert_eq!(song.note_count(), 1);
    }

    #[test]
    fn garbage_is_malformed() {
        let err = MidiParser.parse("junk.mid", b"not a midi file").unwrap_err();
        assert!(matches!(err, KeysError::MalformedScore { .. }));
    }

    #[test]
    fn tracks_without_notes_fail_resolution() {
        let raw = MidiParser.parse("empty.mid", &encode(vec![vec![end()]])).unwrap();
        let err = resolve("empty.mid", raw, &ReadOptions::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Malformed score 'empty.mid': no extractable note events"
        );
    }
}
