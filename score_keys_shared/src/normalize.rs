//! Octave normalization.
//!
//! Brings every note of a song into one of the three configured octave bands
//! by whole-octave shifts. Songs with a narrow range are transposed as a
//! whole so relative pitch survives; wide songs are folded note by note.
//!
//! Ties are broken toward the band closest to the song's median pitch and
//! then downward.

use std::fmt;

use log::debug;

use crate::error::Result;
use crate::types::{NoteEvent, OctaveBands, Song};

/// Songs whose octave span is at most this are transposed as a whole.
pub const MAX_TRANSPOSE_SPAN: i8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Every note was already inside a band.
    Unchanged,
    /// The whole song moved by `octaves`; `folded` notes still needed folding.
    Transposed { octaves: i8, folded: usize },
    /// Out-of-range notes were folded independently.
    Folded { moved: usize },
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Unchanged => write!(f, "unchanged"),
            Strategy::Transposed { octaves, folded: 0 } => {
                write!(f, "transposed {:+} octave(s)", octaves)
            }
            Strategy::Transposed { octaves, folded } => {
                write!(f, "transposed {:+} octave(s), folded {} note(s)", octaves, folded)
            }
            Strategy::Folded { moved } => write!(f, "folded {} note(s)", moved),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub song: Song,
    pub strategy: Strategy,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    bands: OctaveBands,
    max_transpose_span: i8,
}

impl Normalizer {
    pub fn new(bands: OctaveBands) -> Result<Self> {
        bands.validate()?;
        Ok(Normalizer {
            bands,
            max_transpose_span: MAX_TRANSPOSE_SPAN,
        })
    }

    pub fn with_max_transpose_span(mut self, span: i8) -> Self {
        self.max_transpose_span = span.max(0);
        self
    }

    pub fn bands(&self) -> &OctaveBands {
        &self.bands
    }

    pub fn normalize(&self, song: &Song) -> Normalized {
        let Some((min_oct, max_oct)) = song.octave_range() else {
            return self.unchanged(song);
        };
        if song.notes().all(|n| self.bands.contains(n.octave)) {
            return self.unchanged(song);
        }
        let median = median_octave(song);
        let span = max_oct - min_oct;

        if span <= self.max_transpose_span {
            let shift = self.transposition(min_oct, max_oct, median, song);
            let shifted = song.map_notes(|n| n.with_octave(n.octave.saturating_add(shift)));
            let shifted_median = median.map(|m| m + shift as f64);
            let folded = shifted
                .notes()
                .filter(|n| !self.bands.contains(n.octave))
                .count();
            let song = if folded > 0 {
                shifted.map_notes(|n| self.fold(n, shifted_median))
            } else {
                shifted
            };
            debug!(
                "normalize: span {} octave(s), shift {:+}, folded {}",
                span, shift, folded
            );
            return Normalized {
                song,
                strategy: Strategy::Transposed {
                    octaves: shift,
                    folded,
                },
            };
        }

        let moved = song
            .notes()
            .filter(|n| !self.bands.contains(n.octave))
            .count();
        debug!("normalize: span {} octave(s), folding {} note(s)", span, moved);
        Normalized {
            song: song.map_notes(|n| self.fold(n, median)),
            strategy: Strategy::Folded { moved },
        }
    }

    fn unchanged(&self, song: &Song) -> Normalized {
        Normalized {
            song: song.clone(),
            strategy: Strategy::Unchanged,
        }
    }

    /// Picks the uniform shift closest to centering the song among shifts that
    /// put every note in a band. Falls back to the centering shift rounded
    /// down when none fits.
    fn transposition(&self, min_oct: i8, max_oct: i8, median: Option<f64>, song: &Song) -> i8 {
        let lo = self.bands.low as i32;
        let hi = self.bands.high as i32;
        let (min_oct, max_oct) = (min_oct as i32, max_oct as i32);
        let center = ((lo + hi) - (min_oct + max_oct)) as f64 / 2.0;

        let mut best: Option<i32> = None;
        for k in (lo - min_oct)..=(hi - max_oct) {
            let fits = song
                .notes()
                .all(|n| self.bands.contains((n.octave as i32 + k) as i8));
            if !fits {
                continue;
            }
            best = match best {
                None => Some(k),
                Some(b) => Some(self.prefer_shift(b, k, center, median)),
            };
        }
        let shift = best.unwrap_or_else(|| center.floor() as i32);
        shift.clamp(i8::MIN as i32, i8::MAX as i32) as i8
    }

    fn prefer_shift(&self, current: i32, candidate: i32, center: f64, median: Option<f64>) -> i32 {
        let dc = (current as f64 - center).abs();
        let dk = (candidate as f64 - center).abs();
        if dk < dc {
            return candidate;
        }
        if dk > dc {
            return current;
        }
        if let Some(m) = median {
            let middle = self.bands.middle as f64;
            let mc = (m + current as f64 - middle).abs();
            let mk = (m + candidate as f64 - middle).abs();
            if mk < mc {
                return candidate;
            }
            if mk > mc {
                return current;
            }
        }
        current.min(candidate)
    }

    /// Moves one note to the nearest band octave. In-band notes stay put.
    pub fn fold(&self, note: &NoteEvent, median: Option<f64>) -> NoteEvent {
        if self.bands.contains(note.octave) {
            return note.clone();
        }
        let octave = note.octave as i32;
        let mut best: Option<i8> = None;
        for candidate in self.bands.octaves() {
            best = match best {
                None => Some(candidate),
                Some(b) => {
                    let db = (b as i32 - octave).abs();
                    let dc = (candidate as i32 - octave).abs();
                    if dc < db {
                        Some(candidate)
                    } else if dc > db {
                        Some(b)
                    } else {
                        Some(tie_break(b, candidate, median))
                    }
                }
            };
        }
        note.with_octave(best.unwrap_or(self.bands.middle))
    }
}

fn tie_break(a: i8, b: i8, median: Option<f64>) -> i8 {
    if let Some(m) = median {
        let da = (a as f64 - m).abs();
        let db = (b as f64 - m).abs();
        if da < db {
            return a;
        }
        if db < da {
            return b;
        }
    }
    a.min(b)
}

/// Octave of the median pitch, fractional within the octave.
fn median_octave(song: &Song) -> Option<f64> {
    song.median_key().map(|k| k / 12.0 - 1.0)
}

/// Normalizes with the default transposition span.
pub fn normalize(song: &Song, bands: &OctaveBands) -> Result<Normalized> {
    Ok(Normalizer::new(*bands)?.normalize(song))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SongMetadata;

    fn song_of(keys: &[i32]) -> Song {
        let notes = keys
            .iter()
            .enumerate()
            .map(|(i, k)| NoteEvent::from_midi(*k, i as f64, 1.0, 0))
            .collect();
        Song::from_notes(SongMetadata::default(), notes)
    }

    fn octaves(song: &Song) -> Vec<i8> {
        song.notes().map(|n| n.octave).collect()
    }

    #[test]
    fn in_range_song_is_untouched() {
        let song = song_of(&[48, 60, 72, 83]);
        let result = normalize(&song, &OctaveBands::default()).unwrap();
        assert_eq!(result.strategy, Strategy::Unchanged);
        assert_eq!(result.song, song);
    }

    #[test]
    fn narrow_song_transposes_uniformly() {
        // octaves 5 and 6 fit with -1 or -2; the median is in octave 6 so -2
        // moves it onto the middle band
        let song = song_of(&[72, 84, 86]);
        let result = normalize(&song, &OctaveBands::default()).unwrap();
        assert_eq!(
            result.strategy,
            Strategy::Transposed {
                octaves: -2,
                folded: 0
            }
        );
        assert_eq!(octaves(&result.song), vec![3, 4, 4]);
    }

    #[test]
    fn centering_tie_follows_median() {
        // octaves 6 and 7 can shift by -3 or -2
        let song = song_of(&[84, 96, 97, 98]);
        let result = normalize(&song, &OctaveBands::default()).unwrap();
        assert_eq!(
            result.strategy,
            Strategy::Transposed {
                octaves: -3,
                folded: 0
            }
        );
        assert_eq!(octaves(&result.song), vec![3, 4, 4, 4]);
    }

    #[test]
    fn single_octave_song_centers_on_middle() {
        let song = song_of(&[96, 98]);
        let result = normalize(&song, &OctaveBands::default()).unwrap();
        assert_eq!(octaves(&result.song), vec![4, 4]);
    }

    #[test]
    fn span_three_transposes_then_folds() {
        // octaves 2..5: shift 0 is the centre, octave 2 folds up
        let song = song_of(&[36, 48, 60, 72]);
        let result = normalize(&song, &OctaveBands::default()).unwrap();
        assert_eq!(
            result.strategy,
            Strategy::Transposed {
                octaves: 0,
                folded: 1
            }
        );
        assert_eq!(octaves(&result.song), vec![3, 3, 4, 5]);
    }

    #[test]
    fn wide_song_folds_per_note() {
        let song = song_of(&[36, 48, 60, 72, 84]);
        let result = normalize(&song, &OctaveBands::default()).unwrap();
        assert_eq!(result.strategy, Strategy::Folded { moved: 2 });
        assert_eq!(octaves(&result.song), vec![3, 3, 4, 5, 5]);
        assert!(result
            .song
            .notes()
            .all(|n| OctaveBands::default().contains(n.octave)));
    }

    #[test]
    fn normalizing_twice_is_stable() {
        for keys in [&[36, 48, 60, 72, 84][..], &[84, 96, 97], &[20, 100, 64]] {
            let once = normalize(&song_of(keys), &OctaveBands::default()).unwrap();
            let twice = normalize(&once.song, &OctaveBands::default()).unwrap();
            assert_eq!(twice.strategy, Strategy::Unchanged);
            assert_eq!(twice.song, once.song);
        }
    }

    #[test]
    fn gapped_table_tie_goes_toward_median_then_down() {
        let bands = OctaveBands {
            low: 2,
            middle: 4,
            high: 6,
        };
        let normalizer = Normalizer::new(bands).unwrap();
        let note = NoteEvent::from_midi(60, 0.0, 1.0, 0);
        assert_eq!(normalizer.fold(&note, None).octave, 4);
        let c3 = NoteEvent::from_midi(48, 0.0, 1.0, 0);
        assert_eq!(normalizer.fold(&c3, Some(5.2)).octave, 4);
        assert_eq!(normalizer.fold(&c3, None).octave, 2);
        assert_eq!(normalizer.fold(&c3, Some(3.0)).octave, 2);
    }

    #[test]
    fn invalid_bands_rejected() {
        let bands = OctaveBands {
            low: 5,
            middle: 4,
            high: 6,
        };
        assert!(Normalizer::new(bands).is_err());
    }
}
