//! Core of score_keys: score readers, the song model, octave normalization,
//! the song text format and the key table.
//!
//! ```rust
//! use score_keys_shared::{normalize, parse_song, serialize_song, DurationUnit, OctaveBands};
//!
//! let bands = OctaveBands::default();
//! let song = parse_song("1-2+3-2:0.5\nR:0.25\n5-3:1\n", &bands).unwrap();
//! let normalized = normalize(&song, &bands).unwrap();
//! let text = serialize_song(&normalized.song, &bands, DurationUnit::Seconds).unwrap();
//! assert!(text.ends_with("1-2+3-2:0.5\nR:0.25\n5-3:1\n"));
//! ```

pub mod error;
pub mod keymap;
pub mod normalize;
pub mod score;
pub mod song_format;
pub mod tempo;
pub mod timeline;
pub mod types;

pub use error::{KeysError, Result};
pub use keymap::KeyMap;
pub use normalize::{normalize, Normalized, Normalizer, Strategy};
pub use score::{
    is_score_file, read_raw, read_score, read_score_bytes, DurationMode, RawScore, ReadOptions,
    ScoreFormat, ScoreParser, SUPPORTED_EXTENSIONS,
};
pub use song_format::{parse_song, serialize_song};
pub use tempo::{retime, TempoChange, TempoMap};
pub use timeline::slice;
pub use types::{
    Band, ChordGroup, DurationUnit, NoteEvent, OctaveBands, PartInfo, RestEvent, ScaleDegree,
    Song, SongEvent, SongMetadata, TimeSignature,
};
