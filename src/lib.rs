use std::ffi::OsStr;
use std::fs;
use std::io::{stdout, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use score_keys_shared::{
    is_score_file, normalize, parse_song, read_score, serialize_song, slice, DurationUnit,
    KeysError, Result, ScoreFormat, Song, Strategy,
};

pub mod cli;
pub mod config;
pub mod menu;
pub mod playback;

pub use config::Config;
use playback::{build_schedule, countdown, CancelToken, KeySink, PlaybackSummary};

/// Extension of converted song files.
pub const SONG_EXTENSION: &str = "txt";

/// A score converted to song text, not yet written anywhere.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub text: String,
    pub song: Song,
    pub strategy: Strategy,
    pub unit: DurationUnit,
}

#[derive(Debug, Clone)]
pub struct ConvertedFile {
    pub source: PathBuf,
    pub output: PathBuf,
    pub strategy: Strategy,
    pub events: usize,
}

/// Outcome of a batch conversion.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub converted: Vec<ConvertedFile>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Converter and player over the configured source and output directories.
pub struct ScoreKeys {
    config: Config,
}

impl ScoreKeys {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(ScoreKeys { config })
    }

    pub fn get_config(&self) -> &Config {
        &self.config
    }

    pub fn get_config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Score files in the source directory, sorted by name.
    pub fn source_files(&self) -> Result<Vec<PathBuf>> {
        list_dir(&self.config.source_dir, is_score_file)
    }

    /// Converted song files in the output directory, sorted by name.
    pub fn song_files(&self) -> Result<Vec<PathBuf>> {
        list_dir(&self.config.output_dir, |p| {
            p.extension().and_then(OsStr::to_str) == Some(SONG_EXTENSION)
        })
    }

    /// Reads, normalizes, slices and serializes the score at `path`.
    pub fn convert_to_text(&self, path: &Path) -> Result<Conversion> {
        let song = read_score(path, &self.config.read_options())?;
        let unit = song.metadata.unit;
        let normalized = normalize(&song, &self.config.octave_bands)?;
        info!("{}: {}", path.display(), normalized.strategy);

        let song = if self.config.keep_overlaps {
            normalized.song
        } else {
            slice(&normalized.song, self.config.min_duration)
        };
        let text = serialize_song(&song, &self.config.octave_bands, unit)?;
        Ok(Conversion {
            text,
            song,
            strategy: normalized.strategy,
            unit,
        })
    }

    /// Converts `path` and writes `<stem>_<YYYYMMDD_HHMMSS>.txt` into the
    /// output directory. Nothing is written unless conversion succeeds.
    pub fn convert_file(&self, path: &Path) -> Result<ConvertedFile> {
        let conversion = self.convert_to_text(path)?;
        fs::create_dir_all(&self.config.output_dir)?;
        let output = unique_output_path(&self.config.output_dir, &file_stem(path), now_secs());
        write_atomic(&output, &conversion.text)?;
        info!("wrote {}", output.display());
        Ok(ConvertedFile {
            source: path.to_path_buf(),
            output,
            strategy: conversion.strategy,
            events: conversion.song.events().len(),
        })
    }

    /// Whether the output directory already holds a conversion of `source`.
    pub fn has_output(&self, source: &Path) -> Result<bool> {
        let stem = file_stem(source);
        Ok(self.song_files()?.iter().any(|p| {
            p.file_name()
                .and_then(OsStr::to_str)
                .is_some_and(|name| is_output_for(&stem, name))
        }))
    }

    /// Converts every source file. Sources with existing output are skipped
    /// unless `force`; failures are collected and the batch continues.
    pub fn convert_all(&self, force: bool) -> Result<BatchReport> {
        let sources = self.source_files()?;
        let mut report = BatchReport::default();
        if sources.is_empty() {
            println!(
                "📭 No score files found in {}",
                self.config.source_dir.display()
            );
            return Ok(report);
        }

        println!(
            "🔍 Converting {} score(s) from {}",
            sources.len(),
            self.config.source_dir.display()
        );
        for source in sources {
            let name = display_name(&source);
            if !force && self.has_output(&source)? {
                println!("  ⏭️  Skipped: {} (already converted)", name);
                report.skipped.push(source);
                continue;
            }
            match self.convert_file(&source) {
                Ok(converted) => {
                    println!(
                        "  ✅ Converted: {} -> {} ({})",
                        name,
                        display_name(&converted.output),
                        converted.strategy
                    );
                    report.converted.push(converted);
                }
                Err(e) => {
                    println!("  ❌ Failed to convert {}: {}", name, e);
                    report.failed.push((source, e.to_string()));
                }
            }
        }
        println!(
            "🎵 {} converted, {} skipped, {} failed",
            report.converted.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Finds a song by path, by index into [`song_files`](Self::song_files)
    /// or by file name inside the output directory.
    pub fn resolve_song(&self, arg: &str) -> Result<PathBuf> {
        let direct = PathBuf::from(arg);
        if direct.is_file() {
            return Ok(direct);
        }
        let songs = self.song_files()?;
        if let Ok(index) = arg.parse::<usize>() {
            if let Some(path) = songs.get(index) {
                return Ok(path.clone());
            }
        }
        let in_output = self.config.output_dir.join(arg);
        if in_output.is_file() {
            return Ok(in_output);
        }
        Err(KeysError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("song '{}' not found", arg),
        )))
    }

    pub fn load_song(&self, path: &Path) -> Result<Song> {
        let text = fs::read_to_string(path)?;
        let song = parse_song(&text, &self.config.octave_bands)?;
        debug!(
            "{}: {} event(s), unit {}",
            path.display(),
            song.events().len(),
            song.metadata.unit
        );
        Ok(song)
    }

    /// Loads the song at `path`, counts down and plays it into `sink`.
    pub fn play_song(
        &self,
        path: &Path,
        tempo_override: Option<f64>,
        countdown_secs: u32,
        sink: &mut dyn KeySink,
        cancel: &CancelToken,
    ) -> Result<PlaybackSummary> {
        let song = self.load_song(path)?;
        let tempo = tempo_override.or(self.config.tempo_override);
        let schedule = build_schedule(&song, &self.config.key_map, &self.config.octave_bands, tempo);
        schedule.check_timing()?;

        println!(
            "\n🎹 {} ({} chord(s), {:.1}s)",
            display_name(path),
            schedule.presses.len(),
            schedule.total_secs
        );
        if schedule.dropped > 0 {
            println!("⚠️  {} note(s) have no key and will be skipped", schedule.dropped);
        }
        println!("🎮 Controls: 'q' + Enter or Ctrl+C = stop");

        let started = countdown(countdown_secs, cancel, |left| {
            print!("\r⏳ Starting in {}...", left);
            stdout().flush().unwrap_or(());
        });
        if countdown_secs > 0 {
            println!();
        }
        if !started {
            println!("🛑 Cancelled before playback");
            return Ok(PlaybackSummary {
                played: 0,
                dropped: schedule.dropped,
                cancelled: true,
                elapsed: std::time::Duration::ZERO,
            });
        }

        let summary = playback::play(&schedule, sink, cancel)?;
        if summary.cancelled {
            println!("🛑 Stopped after {} chord(s)", summary.played);
        } else {
            println!(
                "✅ Playback complete! {} chord(s) in {:.1}s",
                summary.played,
                summary.elapsed.as_secs_f64()
            );
        }
        Ok(summary)
    }

    pub fn list_sources(&self) -> Result<()> {
        let sources = self.source_files()?;
        if sources.is_empty() {
            println!("📭 No score files in {}", self.config.source_dir.display());
            return Ok(());
        }
        println!(
            "📀 Scores in {} ({} total):",
            self.config.source_dir.display(),
            sources.len()
        );
        let mut rows = Vec::with_capacity(sources.len());
        for (i, source) in sources.iter().enumerate() {
            let format = ScoreFormat::from_path(source)
                .map(|f| f.to_string())
                .unwrap_or_default();
            let converted = if self.has_output(source)? { "yes" } else { "no" };
            rows.push(vec![
                i.to_string(),
                display_name(source),
                format,
                converted.to_string(),
            ]);
        }
        print_table(&["#", "File", "Format", "Converted"], &rows);
        Ok(())
    }

    pub fn list_songs(&self) -> Result<()> {
        let songs = self.song_files()?;
        if songs.is_empty() {
            println!("📭 No songs in {}", self.config.output_dir.display());
            return Ok(());
        }
        println!(
            "🎶 Songs in {} ({} total):",
            self.config.output_dir.display(),
            songs.len()
        );
        let rows: Vec<Vec<String>> = songs
            .iter()
            .enumerate()
            .map(|(i, song)| {
                let size = fs::metadata(song).map(|m| m.len()).unwrap_or(0);
                vec![i.to_string(), display_name(song), format_size(size)]
            })
            .collect();
        print_table(&["#", "Song", "Size"], &rows);
        Ok(())
    }
}

fn list_dir<F: Fn(&Path) -> bool>(dir: &Path, keep: F) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        debug!("{} is not a directory", dir.display());
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && keep(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "song".to_string())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// `<stem>_<YYYYMMDD_HHMMSS>.txt` for a UTC unix timestamp.
pub fn timestamped_name(stem: &str, unix_secs: i64) -> String {
    let (year, month, day) = civil_from_days(unix_secs.div_euclid(86_400));
    let secs = unix_secs.rem_euclid(86_400);
    format!(
        "{}_{:04}{:02}{:02}_{:02}{:02}{:02}.{}",
        stem,
        year,
        month,
        day,
        secs / 3600,
        secs / 60 % 60,
        secs % 60,
        SONG_EXTENSION
    )
}

/// Timestamped path in `dir`, with `_2`, `_3`... appended on collision.
pub fn unique_output_path(dir: &Path, stem: &str, unix_secs: i64) -> PathBuf {
    let name = timestamped_name(stem, unix_secs);
    let candidate = dir.join(&name);
    if !candidate.exists() {
        return candidate;
    }
    let base = name.trim_end_matches(&format!(".{}", SONG_EXTENSION)).to_string();
    (2..)
        .map(|n| dir.join(format!("{}_{}.{}", base, n, SONG_EXTENSION)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Matches `<stem>_<8 digits>_<6 digits>[_<n>].txt`.
fn is_output_for(stem: &str, file_name: &str) -> bool {
    let Some(rest) = file_name
        .strip_prefix(stem)
        .and_then(|r| r.strip_prefix('_'))
        .and_then(|r| r.strip_suffix(&format!(".{}", SONG_EXTENSION)))
    else {
        return false;
    };
    let all_digits = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_digit());
    let mut parts = rest.split('_');
    let date_ok = parts.next().is_some_and(|d| all_digits(d, 8));
    let time_ok = parts.next().is_some_and(|t| all_digits(t, 6));
    let suffix_ok = match parts.next() {
        None => true,
        Some(n) => !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()),
    };
    date_ok && time_ok && suffix_ok && parts.next().is_none()
}

/// Writes `text` to a sibling temp file and renames it over `path`.
pub fn write_atomic(path: &Path, text: &str) -> Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", SONG_EXTENSION));
    fs::write(&tmp, text)?;
    if let Err(e) = fs::rename(&tmp, path) {
        if let Err(cleanup) = fs::remove_file(&tmp) {
            warn!("could not remove {}: {}", tmp.display(), cleanup);
        }
        return Err(e.into());
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Prints a left-aligned table with a header rule.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }
    let render = |cells: Vec<&str>| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = *w))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    println!("  {}", render(headers.to_vec()));
    println!(
        "  {}",
        widths.iter().map(|w| "─".repeat(*w)).collect::<Vec<_>>().join("  ")
    );
    for row in rows {
        println!("  {}", render(row.iter().map(String::as_str).collect()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
        assert_eq!(civil_from_days(-1), (1969, 12, 31));
    }

    #[test]
    fn timestamped_names() {
        // 2024-03-05 07:08:09 UTC
        assert_eq!(
            timestamped_name("minuet", 1_709_622_489),
            "minuet_20240305_070809.txt"
        );
    }

    #[test]
    fn output_names_match_their_stem_only() {
        assert!(is_output_for("minuet", "minuet_20240305_070809.txt"));
        assert!(is_output_for("minuet", "minuet_20240305_070809_2.txt"));
        assert!(!is_output_for("minuet", "minuet_in_g_20240305_070809.txt"));
        assert!(!is_output_for("minuet", "minuet_2024_070809.txt"));
        assert!(!is_output_for("minuet", "minuet.txt"));
        assert!(is_output_for("minuet_in_g", "minuet_in_g_20240305_070809.txt"));
    }
}
