//! Piecewise-constant tempo map and beat/second conversion.

use crate::types::{round_time, ChordGroup, DurationUnit, RestEvent, Song, SongEvent};

pub const DEFAULT_BPM: f64 = 120.0;

/// Tempo in quarter notes per minute, effective from `beat` onwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoChange {
    pub beat: f64,
    pub bpm: f64,
}

/// Sorted tempo changes. The first change is always at beat 0.
#[derive(Debug, Clone, PartialEq)]
pub struct TempoMap {
    changes: Vec<TempoChange>,
}

impl Default for TempoMap {
    fn default() -> Self {
        TempoMap::constant(DEFAULT_BPM)
    }
}

impl TempoMap {
    /// Drops non-positive tempos, keeps the last change given for a beat and
    /// the first of a run of equal tempos. Without a change at beat 0 the map
    /// starts at 120 BPM.
    pub fn new(mut changes: Vec<TempoChange>) -> Self {
        changes.retain(|c| c.bpm.is_finite() && c.bpm > 0.0 && c.beat.is_finite());
        changes.sort_by(|a, b| a.beat.total_cmp(&b.beat));

        let mut merged: Vec<TempoChange> = Vec::with_capacity(changes.len() + 1);
        for change in changes {
            let change = TempoChange {
                beat: round_time(change.beat.max(0.0)),
                bpm: change.bpm,
            };
            match merged.last_mut() {
                Some(last) if last.beat == change.beat => *last = change,
                _ => merged.push(change),
            }
        }
        if merged.first().map_or(true, |c| c.beat > 0.0) {
            merged.insert(
                0,
                TempoChange {
                    beat: 0.0,
                    bpm: DEFAULT_BPM,
                },
            );
        }
        merged.dedup_by(|later, earlier| later.bpm == earlier.bpm);
        TempoMap { changes: merged }
    }

    pub fn constant(bpm: f64) -> Self {
        TempoMap::new(vec![TempoChange { beat: 0.0, bpm }])
    }

    pub fn changes(&self) -> &[TempoChange] {
        &self.changes
    }

    pub fn initial_bpm(&self) -> f64 {
        self.changes.first().map_or(DEFAULT_BPM, |c| c.bpm)
    }

    pub fn is_constant(&self) -> bool {
        self.changes.len() <= 1
    }

    pub fn bpm_at(&self, beat: f64) -> f64 {
        self.changes
            .iter()
            .take_while(|c| c.beat <= beat)
            .last()
            .map_or(DEFAULT_BPM, |c| c.bpm)
    }

    pub fn to_seconds(&self, beat: f64) -> f64 {
        let mut seconds = 0.0;
        for (i, change) in self.changes.iter().enumerate() {
            let segment_end = self.changes.get(i + 1).map_or(f64::INFINITY, |n| n.beat);
            let spb = 60.0 / change.bpm;
            if beat <= segment_end {
                return seconds + (beat - change.beat) * spb;
            }
            seconds += (segment_end - change.beat) * spb;
        }
        seconds
    }

    pub fn to_beats(&self, seconds: f64) -> f64 {
        let mut elapsed = 0.0;
        for (i, change) in self.changes.iter().enumerate() {
            let spb = 60.0 / change.bpm;
            let segment_secs = self
                .changes
                .get(i + 1)
                .map_or(f64::INFINITY, |n| (n.beat - change.beat) * spb);
            if seconds <= elapsed + segment_secs {
                return change.beat + (seconds - elapsed) / spb;
            }
            elapsed += segment_secs;
        }
        0.0
    }

    /// Seconds spanned by `duration` beats starting at `start` beats.
    pub fn span_seconds(&self, start: f64, duration: f64) -> f64 {
        self.to_seconds(start + duration) - self.to_seconds(start)
    }
}

/// Re-expresses every start and duration of `song` in `unit`, converting
/// through the song's tempo map. Values are rounded to three decimals.
pub fn retime(song: &Song, unit: DurationUnit) -> Song {
    retime_with(song, unit, &song.metadata.tempo_map())
}

/// Like [`retime`] but with an explicit tempo map, for tempo overrides.
pub fn retime_with(song: &Song, unit: DurationUnit, map: &TempoMap) -> Song {
    let from = song.metadata.unit;
    if from == unit {
        return song.clone();
    }
    let convert = |start: f64, duration: f64| -> (f64, f64) {
        let (s, e) = match unit {
            DurationUnit::Seconds => (map.to_seconds(start), map.to_seconds(start + duration)),
            DurationUnit::Beats => (map.to_beats(start), map.to_beats(start + duration)),
        };
        (round_time(s), round_time(e - s))
    };
    let events = song
        .events()
        .iter()
        .map(|event| match event {
            SongEvent::Chord(c) => {
                let (start, duration) = convert(c.start(), c.duration());
                SongEvent::Chord(ChordGroup::rebuild(start, duration, c.notes().to_vec()))
            }
            SongEvent::Rest(r) => {
                let (start, duration) = convert(r.start, r.duration);
                SongEvent::Rest(RestEvent { start, duration })
            }
        })
        .collect();
    let mut metadata = song.metadata.clone();
    metadata.unit = unit;
    Song::new(metadata, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NoteEvent, SongMetadata};
    use float_cmp::approx_eq;

    fn slowing_map() -> TempoMap {
        TempoMap::new(vec![
            TempoChange { beat: 0.0, bpm: 120.0 },
            TempoChange { beat: 4.0, bpm: 60.0 },
        ])
    }

    #[test]
    fn beats_to_seconds_through_a_change() {
        let map = slowing_map();
        let starts: Vec<f64> = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
            .iter()
            .map(|b| map.to_seconds(*b))
            .collect();
        let expected = [0.0, 0.5, 1.0, 1.5, 2.0, 3.0, 4.0];
        for (got, want) in starts.iter().zip(expected.iter()) {
            assert!(approx_eq!(f64, *got, *want, epsilon = 1e-9), "{} != {}", got, want);
        }
        assert!(approx_eq!(f64, map.to_beats(4.0), 6.0, epsilon = 1e-9));
        assert!(approx_eq!(f64, map.to_beats(1.0), 2.0, epsilon = 1e-9));
    }

    #[test]
    fn missing_initial_tempo_defaults() {
        let map = TempoMap::new(vec![TempoChange { beat: 8.0, bpm: 90.0 }]);
        assert_eq!(map.initial_bpm(), DEFAULT_BPM);
        assert_eq!(map.changes().len(), 2);
        assert_eq!(map.bpm_at(9.0), 90.0);
    }

    #[test]
    fn repeated_tempos_collapse() {
        let map = TempoMap::new(vec![
            TempoChange { beat: 0.0, bpm: 100.0 },
            TempoChange { beat: 0.0, bpm: 100.0 },
            TempoChange { beat: 16.0, bpm: 100.0 },
            TempoChange { beat: 3.0, bpm: -4.0 },
        ]);
        assert!(map.is_constant());
        assert_eq!(map.initial_bpm(), 100.0);
    }

    #[test]
    fn retime_song_to_seconds() {
        let metadata = SongMetadata {
            tempo_bpm: 120.0,
            tempo_changes: vec![TempoChange { beat: 4.0, bpm: 60.0 }],
            ..SongMetadata::default()
        };
        let notes = vec![
            NoteEvent::from_midi(60, 3.0, 2.0, 0),
            NoteEvent::from_midi(64, 3.0, 2.0, 0),
        ];
        let song = Song::from_notes(metadata, notes);
        let secs = retime(&song, DurationUnit::Seconds);
        assert_eq!(secs.metadata.unit, DurationUnit::Seconds);
        let event = &secs.events()[0];
        assert!(approx_eq!(f64, event.start(), 1.5, epsilon = 1e-9));
        assert!(approx_eq!(f64, event.duration(), 1.5, epsilon = 1e-9));
        assert_eq!(secs.note_count(), 2);
    }
}
