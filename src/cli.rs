use clap::{ArgAction, Parser, Subcommand};
use log::{debug, LevelFilter};
use std::error::Error;
use std::path::PathBuf;

use score_keys_shared::{DurationMode, TimeSignature};

use crate::config::Config;
use crate::menu;
use crate::playback::{install_ctrlc, list_midi_ports, CancelToken, MidiSink, PrintSink, StdinLines};
use crate::ScoreKeys;

#[derive(Parser)]
#[command(name = "score_keys")]
#[command(about = "Converts MIDI and MusicXML scores into keyboard songs and plays them")]
#[command(version)]
#[command(author = "David Horner <david.horner@example.com>")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// JSON configuration file (default: score_keys.json when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Run the interactive menu (default without a subcommand)
    #[arg(short, long)]
    pub interactive: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Convert a score, or every score in the source directory
    Convert {
        /// Score file to convert
        file: Option<PathBuf>,

        /// Convert every score in the source directory
        #[arg(long, conflicts_with = "file")]
        batch: bool,

        /// Convert scores that already have output
        #[arg(long)]
        force: bool,

        /// Directory for converted songs
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Duration unit: auto, beats or seconds
        #[arg(long)]
        unit: Option<DurationMode>,

        /// Drop notes shorter than this, in the output unit
        #[arg(long)]
        min_duration: Option<f64>,

        /// Constant tempo in BPM
        #[arg(long)]
        tempo: Option<f64>,

        /// Time signature written to the song header, e.g. 3/4
        #[arg(long)]
        time_signature: Option<TimeSignature>,

        /// Only convert parts whose name contains this text
        #[arg(long)]
        part: Option<String>,

        /// Write overlapping notes unsliced; an event that starts before the
        /// previous one ends is moved to start after it
        #[arg(long)]
        keep_overlaps: bool,
    },

    /// Play a song on a MIDI output port
    Play {
        /// Song file, file name in the output directory, or list index
        song: String,

        /// Tempo in BPM
        #[arg(long)]
        tempo: Option<f64>,

        /// Seconds to count down before playing
        #[arg(long)]
        countdown: Option<u32>,

        /// MIDI output port index
        #[arg(long)]
        port: Option<usize>,
    },

    /// Print the key presses of a song with their timing
    Test {
        /// Song file, file name in the output directory, or list index
        song: String,

        /// Tempo in BPM
        #[arg(long)]
        tempo: Option<f64>,
    },

    /// List scores, converted songs and MIDI ports
    List,
}

fn log_level(verbose: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::Error;
    }
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level(verbose, quiet));
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    let _ = builder.try_init();
}

/// Ctrl+C handler and stdin reader, each set up at most once per process.
#[derive(Default)]
struct Session {
    cancel: Option<CancelToken>,
    lines: Option<StdinLines>,
}

impl Session {
    fn cancel(&mut self) -> Result<CancelToken, Box<dyn Error>> {
        if let Some(token) = &self.cancel {
            token.reset();
            return Ok(token.clone());
        }
        let token = CancelToken::new();
        install_ctrlc(&token)?;
        self.cancel = Some(token.clone());
        Ok(token)
    }

    fn lines(&mut self) -> &StdinLines {
        self.lines.get_or_insert_with(StdinLines::spawn)
    }
}

pub fn run_cli() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let config = Config::load_or_default(cli.config.as_deref())?;
    debug!("configuration: {:?}", config);
    let mut app = ScoreKeys::new(config)?;
    let mut session = Session::default();
    let has_command = cli.command.is_some();

    match cli.command {
        Some(Commands::Convert {
            file,
            batch,
            force,
            output_dir,
            unit,
            min_duration,
            tempo,
            time_signature,
            part,
            keep_overlaps,
        }) => {
            {
                let config = app.get_config_mut();
                if let Some(dir) = output_dir {
                    config.output_dir = dir;
                }
                if let Some(unit) = unit {
                    config.duration_mode = unit;
                }
                if let Some(min) = min_duration {
                    config.min_duration = min;
                }
                if tempo.is_some() {
                    config.tempo_override = tempo;
                }
                if time_signature.is_some() {
                    config.time_signature_override = time_signature;
                }
                if part.is_some() {
                    config.part_filter = part;
                }
                config.keep_overlaps |= keep_overlaps;
                config.validate()?;
            }

            match file {
                Some(file) if !batch => {
                    println!("🎵 Converting {}...", file.display());
                    let converted = app.convert_file(&file)?;
                    println!(
                        "✅ Saved {} ({} event(s), {})",
                        converted.output.display(),
                        converted.events,
                        converted.strategy
                    );
                }
                _ => {
                    let report = app.convert_all(force)?;
                    if !report.is_clean() {
                        return Err(format!("{} file(s) failed to convert", report.failed.len()).into());
                    }
                }
            }
        }

        Some(Commands::Play {
            song,
            tempo,
            countdown,
            port,
        }) => {
            let path = app.resolve_song(&song)?;
            let countdown = countdown.unwrap_or(app.get_config().countdown_secs);
            let port = port.or(app.get_config().midi_port);
            let cancel = session.cancel()?;
            let mut sink = MidiSink::connect(port)?;
            session.lines().stop_on_input(&cancel, || {
                app.play_song(&path, tempo, countdown, &mut sink, &cancel)
            })?;
        }

        Some(Commands::Test { song, tempo }) => {
            let path = app.resolve_song(&song)?;
            let cancel = session.cancel()?;
            let mut sink = PrintSink::stdout();
            session
                .lines()
                .stop_on_input(&cancel, || app.play_song(&path, tempo, 0, &mut sink, &cancel))?;
        }

        Some(Commands::List) => {
            app.list_sources()?;
            println!();
            app.list_songs()?;
            match list_midi_ports() {
                Ok(ports) if ports.is_empty() => println!("\n🎛️  No MIDI output ports"),
                Ok(ports) => {
                    println!("\n🎛️  MIDI output ports:");
                    for (i, name) in ports.iter().enumerate() {
                        println!("  {}: {}", i, name);
                    }
                }
                Err(e) => println!("\n❌ Cannot list MIDI ports: {}", e),
            }
        }

        None => {}
    }

    // `-i` with a subcommand drops into the menu once it finishes.
    if !has_command || cli.interactive {
        let cancel = session.cancel()?;
        menu::run_interactive(&mut app, session.lines(), &cancel)?;
    }

    Ok(())
}
