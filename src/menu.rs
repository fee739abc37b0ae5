use std::error::Error;
use std::io::{stdout, Write};
use std::path::PathBuf;

use score_keys_shared::DurationMode;

use crate::playback::{CancelToken, MidiSink, PrintSink, StdinLines};
use crate::ScoreKeys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    ListScores,
    ListSongs,
    ConvertOne,
    ConvertAll,
    Play,
    Test,
    CycleDurationMode,
    ToggleOverlaps,
    SetTempo,
    SetCountdown,
    Exit,
}

impl MenuChoice {
    pub fn parse(input: &str) -> Option<MenuChoice> {
        let choice = match input.trim() {
            "1" => MenuChoice::ListScores,
            "2" => MenuChoice::ListSongs,
            "3" => MenuChoice::ConvertOne,
            "4" => MenuChoice::ConvertAll,
            "5" => MenuChoice::Play,
            "6" => MenuChoice::Test,
            "7" => MenuChoice::CycleDurationMode,
            "8" => MenuChoice::ToggleOverlaps,
            "9" => MenuChoice::SetTempo,
            "10" => MenuChoice::SetCountdown,
            "x" | "X" => MenuChoice::Exit,
            _ => return None,
        };
        Some(choice)
    }
}

fn next_mode(mode: DurationMode) -> DurationMode {
    match mode {
        DurationMode::Auto => DurationMode::Beats,
        DurationMode::Beats => DurationMode::Seconds,
        DurationMode::Seconds => DurationMode::Auto,
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "✅ ON"
    } else {
        "❌ OFF"
    }
}

/// Numbered-option loop over the configured directories. Returns when the
/// user exits, stdin closes or Ctrl+C arrives at the menu.
pub fn run_interactive(
    app: &mut ScoreKeys,
    lines: &StdinLines,
    cancel: &CancelToken,
) -> Result<(), Box<dyn Error>> {
    loop {
        if cancel.is_cancelled() {
            println!("🛑 Shutdown requested, exiting interactive mode");
            return Ok(());
        }
        show_main_menu(app);
        let Some(input) = prompt(lines, "\nSelect option (1-10, x): ")? else {
            println!("👋 Goodbye!");
            return Ok(());
        };
        if input.is_empty() {
            continue;
        }
        let Some(choice) = MenuChoice::parse(&input) else {
            println!("❌ Invalid option. Please select 1-10 or x.");
            continue;
        };
        if choice == MenuChoice::Exit {
            println!("👋 Goodbye!");
            return Ok(());
        }
        if let Err(e) = handle_choice(app, lines, cancel, choice) {
            println!("❌ {}", e);
        }
    }
}

fn show_main_menu(app: &ScoreKeys) {
    let config = app.get_config();
    println!("\n🎹 score_keys - Score to Keyboard Converter");
    println!("═══════════════════════════════════════════");
    println!("\n📚 Files:");
    println!("1: List scores in {}", config.source_dir.display());
    println!("2: List songs in {}", config.output_dir.display());
    println!("3: Convert a score");
    println!("4: Convert all new scores");
    println!("\n🎵 Playback:");
    println!("5: Play a song (MIDI output)");
    println!("6: Test a song (print keys)");
    println!("\n⚙️  Settings:");
    println!("7: Duration unit: {}", config.duration_mode);
    println!("8: Keep overlapping notes: {}", on_off(config.keep_overlaps));
    match config.tempo_override {
        Some(bpm) => println!("9: Tempo override: {} BPM", bpm),
        None => println!("9: Tempo override: from file"),
    }
    println!("10: Countdown: {}s", config.countdown_secs);
    if let Some(signature) = config.time_signature_override {
        println!("    Time signature override: {}", signature);
    }
    println!("\nx: Exit program");
}

fn prompt(lines: &StdinLines, text: &str) -> Result<Option<String>, Box<dyn Error>> {
    print!("{}", text);
    stdout().flush()?;
    Ok(lines.read_line())
}

fn pick(
    lines: &StdinLines,
    files: &[PathBuf],
    what: &str,
) -> Result<Option<PathBuf>, Box<dyn Error>> {
    if files.is_empty() {
        println!("📭 No {} available", what);
        return Ok(None);
    }
    let Some(input) = prompt(lines, &format!("Select {} number (q to cancel): ", what))? else {
        return Ok(None);
    };
    if input.eq_ignore_ascii_case("q") || input.is_empty() {
        return Ok(None);
    }
    match input.parse::<usize>().ok().and_then(|i| files.get(i)) {
        Some(path) => Ok(Some(path.clone())),
        None => {
            println!("❌ Invalid number: {}", input);
            Ok(None)
        }
    }
}

fn handle_choice(
    app: &mut ScoreKeys,
    lines: &StdinLines,
    cancel: &CancelToken,
    choice: MenuChoice,
) -> Result<(), Box<dyn Error>> {
    match choice {
        MenuChoice::ListScores => app.list_sources()?,
        MenuChoice::ListSongs => app.list_songs()?,
        MenuChoice::ConvertOne => {
            app.list_sources()?;
            if let Some(source) = pick(lines, &app.source_files()?, "score")? {
                println!("🎵 Converting {}...", source.display());
                let converted = app.convert_file(&source)?;
                println!(
                    "✅ Saved {} ({} event(s), {})",
                    converted.output.display(),
                    converted.events,
                    converted.strategy
                );
            }
        }
        MenuChoice::ConvertAll => {
            app.convert_all(false)?;
        }
        MenuChoice::Play | MenuChoice::Test => {
            app.list_songs()?;
            let Some(song) = pick(lines, &app.song_files()?, "song")? else {
                return Ok(());
            };
            cancel.reset();
            let countdown = app.get_config().countdown_secs;
            let result = if choice == MenuChoice::Play {
                let mut sink = MidiSink::connect(app.get_config().midi_port)?;
                lines.stop_on_input(cancel, || {
                    app.play_song(&song, None, countdown, &mut sink, cancel)
                })
            } else {
                let mut sink = PrintSink::stdout();
                lines.stop_on_input(cancel, || app.play_song(&song, None, 0, &mut sink, cancel))
            };
            cancel.reset();
            result?;
        }
        MenuChoice::CycleDurationMode => {
            let config = app.get_config_mut();
            config.duration_mode = next_mode(config.duration_mode);
            println!("📏 Duration unit: {}", config.duration_mode);
        }
        MenuChoice::ToggleOverlaps => {
            let config = app.get_config_mut();
            config.keep_overlaps = !config.keep_overlaps;
            println!("🔀 Keep overlapping notes: {}", on_off(config.keep_overlaps));
        }
        MenuChoice::SetTempo => {
            let Some(input) = prompt(lines, "⏱️  Enter tempo in BPM (empty = from file): ")? else {
                return Ok(());
            };
            let config = app.get_config_mut();
            if input.is_empty() {
                config.tempo_override = None;
                println!("⏱️  Tempo taken from each file");
            } else {
                match input.parse::<f64>() {
                    Ok(bpm) if bpm.is_finite() && bpm > 0.0 => {
                        config.tempo_override = Some(bpm);
                        println!("⏱️  Tempo set to {} BPM", bpm);
                    }
                    _ => println!("❌ Tempo must be a positive number"),
                }
            }
        }
        MenuChoice::SetCountdown => {
            let Some(input) = prompt(lines, "⏳ Enter countdown in seconds: ")? else {
                return Ok(());
            };
            match input.parse::<u32>() {
                Ok(secs) => {
                    app.get_config_mut().countdown_secs = secs;
                    println!("⏳ Countdown set to {}s", secs);
                }
                Err(_) => println!("❌ Countdown must be a whole number of seconds"),
            }
        }
        MenuChoice::Exit => {}
    }
    Ok(())
}
