//! # Error Types
//!
//! Every fallible operation in the converter and the player returns
//! [`KeysError`]. Conversion errors (`UnsupportedFormat`, `MalformedScore`,
//! `SongFormat`) abort the operation that raised them. `UnmappedNote` is
//! recoverable during playback: the driver logs it and drops the note.
//!
//! ```rust
//! use score_keys_shared::{parse_song, KeysError, OctaveBands};
//!
//! match parse_song("# only a comment\n", &OctaveBands::default()) {
//!     Err(KeysError::SongFormat { line, message }) => {
//!         assert_eq!(line, 1);
//!         assert_eq!(message, "no playable notes found");
//!     }
//!     other => panic!("unexpected result: {:?}", other),
//! }
//! ```

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeysError {
    /// The file extension is not one of the supported score formats.
    #[error("Unsupported file type '{0}' (use .mid, .midi, .mxl, .musicxml or .xml)")]
    UnsupportedFormat(String),

    /// The score could not be parsed or contained no note events.
    #[error("Malformed score '{source_name}': {message}")]
    MalformedScore { source_name: String, message: String },

    /// A line of a song text file violates the song grammar.
    ///
    /// ```
    /// # use score_keys_shared::KeysError;
    /// let err = KeysError::SongFormat { line: 4, message: "unknown note digit '9'".to_string() };
    /// assert_eq!(err.to_string(), "Song format error at line 4: unknown note digit '9'");
    /// ```
    #[error("Song format error at line {line}: {message}")]
    SongFormat { line: usize, message: String },

    /// A note has no key in the lookup table.
    #[error("Unmapped note {token}: {reason}")]
    UnmappedNote { token: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KeysError {
    pub fn malformed(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        KeysError::MalformedScore {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn song_format(line: usize, message: impl Into<String>) -> Self {
        KeysError::SongFormat {
            line,
            message: message.into(),
        }
    }

    pub fn unmapped(token: impl Into<String>, reason: impl Into<String>) -> Self {
        KeysError::UnmappedNote {
            token: token.into(),
            reason: reason.into(),
        }
    }

    /// True for errors the player may skip over.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, KeysError::UnmappedNote { .. })
    }
}

pub type Result<T> = std::result::Result<T, KeysError>;
