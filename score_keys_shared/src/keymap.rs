//! Note to keyboard-key lookup.
//!
//! A [`KeyMap`] is three rows of twelve keys, one row per [`Band`], one
//! column per chromatic pitch class starting at C. The default layout puts
//! the Low band on the home row, Middle on the top letter row and High on the
//! number row.

use serde::{Deserialize, Serialize};

use crate::error::{KeysError, Result};
use crate::types::{Band, NoteEvent, OctaveBands, ScaleDegree};

pub const KEYS_PER_ROW: usize = 12;

const DEFAULT_LOW: [&str; KEYS_PER_ROW] = ["a", "s", "d", "f", "g", "h", "j", "k", "l", ";", "'", "\\"];
const DEFAULT_MIDDLE: [&str; KEYS_PER_ROW] = ["q", "w", "e", "r", "t", "y", "u", "i", "o", "p", "[", "]"];
const DEFAULT_HIGH: [&str; KEYS_PER_ROW] = ["1", "2", "3", "4", "5", "6", "7", "8", "9", "0", "-", "="];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMap {
    pub low: Vec<String>,
    pub middle: Vec<String>,
    pub high: Vec<String>,
}

impl Default for KeyMap {
    fn default() -> Self {
        let row = |keys: [&str; KEYS_PER_ROW]| keys.iter().map(|k| k.to_string()).collect();
        KeyMap {
            low: row(DEFAULT_LOW),
            middle: row(DEFAULT_MIDDLE),
            high: row(DEFAULT_HIGH),
        }
    }
}

impl KeyMap {
    pub fn validate(&self) -> Result<()> {
        for band in Band::ALL {
            let row = self.row(band);
            if row.len() != KEYS_PER_ROW {
                return Err(KeysError::InvalidConfig(format!(
                    "key map row {} has {} keys, expected {}",
                    band,
                    row.len(),
                    KEYS_PER_ROW
                )));
            }
            if let Some(pos) = row.iter().position(|k| k.trim().is_empty()) {
                return Err(KeysError::InvalidConfig(format!(
                    "key map row {} has an empty key at column {}",
                    band, pos
                )));
            }
        }
        Ok(())
    }

    pub fn row(&self, band: Band) -> &[String] {
        match band {
            Band::Low => &self.low,
            Band::Middle => &self.middle,
            Band::High => &self.high,
        }
    }

    /// Looks up a song-file pitch: note digit 1..7, optional sharp, band
    /// digit 1..3. A sharp that carries past the High row is unmapped.
    pub fn lookup(&self, note_digit: u8, sharp: bool, band_digit: u8) -> Result<&str> {
        let token = format!("{}{}-{}", if sharp { "#" } else { "" }, note_digit, band_digit);
        let degree = ScaleDegree::new(note_digit, sharp)
            .ok_or_else(|| KeysError::unmapped(&token, "note digit must be 1-7"))?;
        let band = Band::from_digit(band_digit)
            .ok_or_else(|| KeysError::unmapped(&token, "octave digit must be 1-3"))?;
        let (pitch_class, carry) = degree.pitch();
        let band = if carry > 0 {
            Band::ALL
                .get(band.index() + 1)
                .copied()
                .ok_or_else(|| KeysError::unmapped(&token, "sharp carries past the High band"))?
        } else {
            band
        };
        self.key_at(band, pitch_class)
            .ok_or_else(|| KeysError::unmapped(&token, "key map row is too short"))
    }

    /// Looks up a note by its absolute octave through the band table.
    pub fn key_for_note(&self, note: &NoteEvent, bands: &OctaveBands) -> Result<&str> {
        let band = bands.band_of(note.octave).ok_or_else(|| {
            KeysError::unmapped(
                note.name(),
                format!(
                    "octave {} is outside the configured bands {}/{}/{}",
                    note.octave, bands.low, bands.middle, bands.high
                ),
            )
        })?;
        self.key_at(band, note.pitch_class)
            .ok_or_else(|| KeysError::unmapped(note.name(), "key map row is too short"))
    }

    fn key_at(&self, band: Band, pitch_class: u8) -> Option<&str> {
        self.row(band).get(pitch_class as usize).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout() {
        let map = KeyMap::default();
        assert!(map.validate().is_ok());
        assert_eq!(map.lookup(1, false, 2).unwrap(), "q");
        assert_eq!(map.lookup(1, true, 2).unwrap(), "w");
        assert_eq!(map.lookup(7, false, 1).unwrap(), "\\");
        assert_eq!(map.lookup(6, true, 3).unwrap(), "-");
    }

    #[test]
    fn sharp_three_is_f() {
        let map = KeyMap::default();
        assert_eq!(map.lookup(3, true, 1).unwrap(), map.lookup(4, false, 1).unwrap());
    }

    #[test]
    fn sharp_seven_carries_into_next_band() {
        let map = KeyMap::default();
        assert_eq!(map.lookup(7, true, 1).unwrap(), "q");
        let err = map.lookup(7, true, 3).unwrap_err();
        assert!(matches!(err, KeysError::UnmappedNote { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn out_of_table_lookups_fail() {
        let map = KeyMap::default();
        assert!(map.lookup(8, false, 2).is_err());
        assert!(map.lookup(0, false, 2).is_err());
        assert!(map.lookup(1, false, 4).is_err());
    }

    #[test]
    fn note_lookup_uses_band_table() {
        let map = KeyMap::default();
        let bands = OctaveBands::default();
        let c5 = NoteEvent::from_midi(72, 0.0, 1.0, 0);
        assert_eq!(map.key_for_note(&c5, &bands).unwrap(), "1");
        let c6 = NoteEvent::from_midi(84, 0.0, 1.0, 0);
        assert!(map.key_for_note(&c6, &bands).is_err());
    }

    #[test]
    fn short_rows_are_rejected() {
        let mut map = KeyMap::default();
        map.high.pop();
        assert!(matches!(map.validate(), Err(KeysError::InvalidConfig(_))));
    }
}
