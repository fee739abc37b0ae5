use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use score_keys_shared::{
    DurationMode, KeyMap, KeysError, OctaveBands, ReadOptions, Result, TimeSignature,
};

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "score_keys.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Settings for conversion and playback
pub struct Config {
    /// Directory scanned for .mid/.midi/.mxl/.musicxml/.xml scores
    pub source_dir: PathBuf,
    /// Directory converted song files are written to and listed from
    pub output_dir: PathBuf,
    /// Constant tempo in BPM replacing the tempo found in the score
    pub tempo_override: Option<f64>,
    /// Meter written to song headers instead of the score's, e.g. `"3/4"`
    pub time_signature_override: Option<TimeSignature>,
    /// Absolute octave played by each keyboard band
    pub octave_bands: OctaveBands,
    /// Keys for each band, twelve per row starting at C
    pub key_map: KeyMap,
    /// Unit of durations in converted songs
    pub duration_mode: DurationMode,
    /// Notes and slices shorter than this (in the output unit) are dropped
    pub min_duration: f64,
    /// Write overlapping notes unsliced; overlapping events are moved to
    /// start after the previous one ends
    pub keep_overlaps: bool,
    /// Seconds to count down before playback starts
    pub countdown_secs: u32,
    /// Only convert parts whose name contains this text
    pub part_filter: Option<String>,
    /// MIDI output port index used by `play`
    pub midi_port: Option<usize>,
    /// Ignore notes on the General MIDI percussion channel
    pub skip_percussion: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            source_dir: PathBuf::from("scores"),
            output_dir: PathBuf::from("songs"),
            tempo_override: None,
            time_signature_override: None,
            octave_bands: OctaveBands::default(),
            key_map: KeyMap::default(),
            duration_mode: DurationMode::Auto,
            min_duration: 0.0,
            keep_overlaps: false,
            countdown_secs: 3,
            part_filter: None,
            midi_port: None,
            skip_percussion: true,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text).map_err(|e| {
            KeysError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Loads `path` if given, else `score_keys.json` when present, else the
    /// defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::load(fallback)
                } else {
                    debug!("no {} found, using defaults", DEFAULT_CONFIG_FILE);
                    Ok(Config::default())
                }
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| KeysError::InvalidConfig(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.octave_bands.validate()?;
        self.key_map.validate()?;
        if let Some(bpm) = self.tempo_override {
            if !(bpm.is_finite() && bpm > 0.0) {
                return Err(KeysError::InvalidConfig(format!(
                    "tempo override must be a positive BPM, got {}",
                    bpm
                )));
            }
        }
        if !(self.min_duration.is_finite() && self.min_duration >= 0.0) {
            return Err(KeysError::InvalidConfig(format!(
                "min_duration must be zero or positive, got {}",
                self.min_duration
            )));
        }
        Ok(())
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            duration_mode: self.duration_mode,
            tempo_override: self.tempo_override,
            time_signature_override: self.time_signature_override,
            min_duration: self.min_duration,
            part_filter: self.part_filter.clone(),
            skip_percussion: self.skip_percussion,
        }
    }
}
