//! Plays a song as timed key presses.
//!
//! A [`Schedule`] is built from a song up front: every chord becomes a
//! [`Press`] with absolute start and hold times in seconds and the keys its
//! notes map to. [`play`] then walks the schedule on the calling thread,
//! sending key-down and key-up events to a [`KeySink`]. Held keys live in a
//! guard that releases them however the loop exits.

use std::collections::HashMap;
use std::io::{stdin, stdout, Stdout, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, sleep};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use midir::{MidiOutput, MidiOutputConnection};

use score_keys_shared::{
    DurationUnit, KeyMap, KeysError, OctaveBands, Result, Song, SongEvent, TempoMap,
};

/// Longest single sleep while waiting, so cancellation is seen quickly.
pub const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Shared stop flag for playback and countdown.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Clears the flag so the token can guard the next run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Sleeps until `deadline` in slices. Returns `false` if cancelled.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    pub fn sleep(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration)
    }
}

/// Routes Ctrl+C to `token`. The handler can be installed once per process.
pub fn install_ctrlc(token: &CancelToken) -> Result<()> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        token.cancel();
    })
    .map_err(|e| KeysError::Playback(format!("cannot install Ctrl+C handler: {}", e)))
}

/// Lines read from stdin by a background thread.
///
/// The menu reads its prompts from here and playback watches the same
/// stream for a stop request, so no line is lost to a stale reader.
pub struct StdinLines {
    rx: Mutex<Receiver<String>>,
}

impl StdinLines {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let stdin = stdin();
            loop {
                let mut line = String::new();
                match stdin.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Self::from_receiver(rx)
    }

    pub fn from_receiver(rx: Receiver<String>) -> Self {
        StdinLines { rx: Mutex::new(rx) }
    }

    /// Next line, trimmed. `None` once stdin is closed.
    pub fn read_line(&self) -> Option<String> {
        let rx = self.rx.lock().ok()?;
        rx.recv().ok().map(|line| line.trim().to_string())
    }

    /// Cancels `token` on a `q` or Esc line until `done` is set. Other lines
    /// are discarded.
    pub fn watch(&self, token: &CancelToken, done: &AtomicBool) {
        let Ok(rx) = self.rx.lock() else {
            return;
        };
        loop {
            if done.load(Ordering::Relaxed) || token.is_cancelled() {
                return;
            }
            match rx.recv_timeout(SLEEP_SLICE * 5) {
                Ok(line) if is_stop_input(&line) => {
                    debug!("stop requested from stdin");
                    token.cancel();
                    return;
                }
                Ok(line) => trace!("ignored input {:?}", line.trim()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Runs `f` while a scoped thread watches for a stop line.
    pub fn stop_on_input<T, F: FnOnce() -> T>(&self, token: &CancelToken, f: F) -> T {
        let done = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| self.watch(token, &done));
            let out = f();
            done.store(true, Ordering::Relaxed);
            out
        })
    }
}

fn is_stop_input(input: &str) -> bool {
    let input = input.trim();
    input.eq_ignore_ascii_case("q") || input.contains('\u{1b}')
}

/// Counts down `secs` seconds, calling `on_tick` with the seconds left.
/// Returns `false` if cancelled.
pub fn countdown<F: FnMut(u32)>(secs: u32, cancel: &CancelToken, mut on_tick: F) -> bool {
    for left in (1..=secs).rev() {
        on_tick(left);
        if !cancel.sleep(Duration::from_secs(1)) {
            return false;
        }
    }
    !cancel.is_cancelled()
}

/// A key plus the pitch it stands for, so MIDI sinks can sound it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MappedKey {
    pub key: String,
    pub midi_key: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Press {
    /// Seconds from the start of playback.
    pub start: f64,
    pub hold: f64,
    pub keys: Vec<MappedKey>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schedule {
    pub presses: Vec<Press>,
    /// Notes with no key in the table.
    pub dropped: usize,
    /// Seconds until the last event ends.
    pub total_secs: f64,
}

impl Schedule {
    /// Fails when the last event ends too far out to wait for.
    pub fn check_timing(&self) -> Result<()> {
        deadline(Instant::now(), self.total_secs).map(|_| ())
    }
}

/// `secs` after `started`. Times that do not fit an [`Instant`] are errors.
fn deadline(started: Instant, secs: f64) -> Result<Instant> {
    Duration::try_from_secs_f64(secs.max(0.0))
        .ok()
        .and_then(|offset| started.checked_add(offset))
        .ok_or_else(|| KeysError::Playback(format!("event time {}s is out of range", secs)))
}

/// Resolves every chord of `song` to keys and wall-clock times.
///
/// Beat songs are timed through the song's tempo map, or a constant
/// `tempo_override`. Second songs are stretched by the ratio of the song
/// tempo to the override. Unmapped notes are logged and dropped; a chord left
/// with no keys produces no press.
pub fn build_schedule(
    song: &Song,
    keymap: &KeyMap,
    bands: &OctaveBands,
    tempo_override: Option<f64>,
) -> Schedule {
    let override_bpm = tempo_override.filter(|bpm| bpm.is_finite() && *bpm > 0.0);
    let map = match override_bpm {
        Some(bpm) => TempoMap::constant(bpm),
        None => song.metadata.tempo_map(),
    };
    let stretch = match (song.metadata.unit, override_bpm) {
        (DurationUnit::Seconds, Some(bpm)) if song.metadata.tempo_bpm > 0.0 => {
            song.metadata.tempo_bpm / bpm
        }
        _ => 1.0,
    };
    let to_secs = |start: f64, duration: f64| -> (f64, f64) {
        match song.metadata.unit {
            DurationUnit::Beats => (map.to_seconds(start), map.span_seconds(start, duration)),
            DurationUnit::Seconds => (start * stretch, duration * stretch),
        }
    };

    let mut schedule = Schedule::default();
    for event in song.events() {
        let (start, hold) = to_secs(event.start(), event.duration());
        schedule.total_secs = schedule.total_secs.max(start + hold);
        let SongEvent::Chord(chord) = event else {
            continue;
        };
        let mut keys: Vec<MappedKey> = Vec::with_capacity(chord.len());
        for note in chord.notes() {
            match keymap.key_for_note(note, bands) {
                Ok(key) => {
                    let mapped = MappedKey {
                        key: key.to_string(),
                        midi_key: note.midi_key(),
                    };
                    if !keys.contains(&mapped) {
                        keys.push(mapped);
                    }
                }
                Err(e) if e.is_recoverable() => {
                    warn!("{} (at {:.3}s), skipping", e, start);
                    schedule.dropped += 1;
                }
                Err(e) => {
                    warn!("{}", e);
                    schedule.dropped += 1;
                }
            }
        }
        if keys.is_empty() {
            continue;
        }
        schedule.presses.push(Press { start, hold, keys });
    }
    debug!(
        "schedule: {} press(es), {} dropped note(s), {:.3}s",
        schedule.presses.len(),
        schedule.dropped,
        schedule.total_secs
    );
    schedule
}

/// Receives key events from the player.
pub trait KeySink {
    fn key_down(&mut self, key: &MappedKey) -> Result<()>;
    fn key_up(&mut self, key: &MappedKey) -> Result<()>;
    /// Called once after the last release of a run that was not cancelled.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keys currently held down. Dropping the guard releases them.
pub struct HeldKeys<'a, S: KeySink + ?Sized> {
    sink: &'a mut S,
    held: Vec<MappedKey>,
}

impl<'a, S: KeySink + ?Sized> HeldKeys<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        HeldKeys {
            sink,
            held: Vec::new(),
        }
    }

    pub fn press(&mut self, keys: &[MappedKey]) -> Result<()> {
        for key in keys {
            self.sink.key_down(key)?;
            self.held.push(key.clone());
        }
        Ok(())
    }

    pub fn release_all(&mut self) -> Result<()> {
        while let Some(key) = self.held.pop() {
            self.sink.key_up(&key)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    fn sink(&mut self) -> &mut S {
        self.sink
    }
}

impl<S: KeySink + ?Sized> Drop for HeldKeys<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            warn!("failed to release held keys: {}", e);
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackSummary {
    pub played: usize,
    pub dropped: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Plays `schedule` into `sink` until it ends or `cancel` is set.
pub fn play<S: KeySink + ?Sized>(
    schedule: &Schedule,
    sink: &mut S,
    cancel: &CancelToken,
) -> Result<PlaybackSummary> {
    let started = Instant::now();
    deadline(started, schedule.total_secs)?;
    let mut played = 0usize;
    let mut cancelled = false;

    info!(
        "playing {} press(es) over {:.1}s",
        schedule.presses.len(),
        schedule.total_secs
    );
    {
        let mut held = HeldKeys::new(sink);
        for press in &schedule.presses {
            if !cancel.sleep_until(deadline(started, press.start)?) {
                cancelled = true;
                break;
            }
            trace!("{:.3}s press {:?}", press.start, press.keys);
            held.press(&press.keys)?;
            if !cancel.sleep_until(deadline(started, press.start + press.hold)?) {
                cancelled = true;
                break;
            }
            held.release_all()?;
            played += 1;
        }
        held.release_all()?;
        if !cancelled {
            held.sink().finish()?;
        }
    }

    if cancelled {
        info!("playback cancelled after {} press(es)", played);
    }
    Ok(PlaybackSummary {
        played,
        dropped: schedule.dropped,
        cancelled,
        elapsed: started.elapsed(),
    })
}

/// Test mode: prints each transition with its time since the first event.
/// A key shared by overlapping presses is reported once down and once up.
pub struct PrintSink<W: Write> {
    out: W,
    started: Option<Instant>,
    counts: HashMap<String, usize>,
}

impl PrintSink<Stdout> {
    pub fn stdout() -> Self {
        PrintSink::new(stdout())
    }
}

impl<W: Write> PrintSink<W> {
    pub fn new(out: W) -> Self {
        PrintSink {
            out,
            started: None,
            counts: HashMap::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn elapsed(&mut self) -> f64 {
        self.started.get_or_insert_with(Instant::now).elapsed().as_secs_f64()
    }

    fn line(&mut self, action: &str, key: &MappedKey) -> Result<()> {
        let t = self.elapsed();
        writeln!(self.out, "[{:>8.3}s] {:<4} {}", t, action, key.key)?;
        Ok(())
    }
}

impl<W: Write> KeySink for PrintSink<W> {
    fn key_down(&mut self, key: &MappedKey) -> Result<()> {
        let count = self.counts.entry(key.key.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.line("down", key)?;
        }
        Ok(())
    }

    fn key_up(&mut self, key: &MappedKey) -> Result<()> {
        let release = match self.counts.get_mut(&key.key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(&key.key);
                true
            }
            None => false,
        };
        if release {
            self.line("up", key)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Play mode: sounds each mapped pitch on a MIDI output port.
pub struct MidiSink {
    conn: MidiOutputConnection,
    channel: u8,
    velocity: u8,
}

/// Names of the available MIDI output ports, in index order.
pub fn list_midi_ports() -> Result<Vec<String>> {
    let midi_out = MidiOutput::new("score_keys").map_err(|e| KeysError::Playback(e.to_string()))?;
    Ok(midi_out
        .ports()
        .iter()
        .map(|p| midi_out.port_name(p).unwrap_or_else(|_| "<Unknown>".to_string()))
        .collect())
}

impl MidiSink {
    /// Connects to port `index`, or the first port.
    pub fn connect(index: Option<usize>) -> Result<Self> {
        let midi_out =
            MidiOutput::new("score_keys").map_err(|e| KeysError::Playback(e.to_string()))?;
        let ports = midi_out.ports();
        if ports.is_empty() {
            return Err(KeysError::Playback(
                "no MIDI output ports found (start a software synthesizer or use `test`)"
                    .to_string(),
            ));
        }
        let index = index.unwrap_or(0);
        let port = ports.get(index).ok_or_else(|| {
            KeysError::Playback(format!(
                "MIDI port {} does not exist ({} available)",
                index,
                ports.len()
            ))
        })?;
        let port_name = midi_out
            .port_name(port)
            .unwrap_or_else(|_| "Unknown".to_string());
        let conn = midi_out
            .connect(port, "score_keys")
            .map_err(|e| KeysError::Playback(e.to_string()))?;
        info!("connected to MIDI port {}: {}", index, port_name);
        Ok(MidiSink {
            conn,
            channel: 0,
            velocity: 96,
        })
    }

    fn send(&mut self, message: &[u8]) -> Result<()> {
        self.conn
            .send(message)
            .map_err(|e| KeysError::Playback(e.to_string()))
    }

    fn all_notes_off(&mut self) -> Result<()> {
        self.send(&[0xB0 | self.channel, 123, 0])
    }
}

fn midi_note(key: &MappedKey) -> Option<u8> {
    u8::try_from(key.midi_key).ok().filter(|k| *k <= 127)
}

impl KeySink for MidiSink {
    fn key_down(&mut self, key: &MappedKey) -> Result<()> {
        match midi_note(key) {
            Some(note) => self.send(&[0x90 | self.channel, note, self.velocity]),
            None => Ok(()),
        }
    }

    fn key_up(&mut self, key: &MappedKey) -> Result<()> {
        match midi_note(key) {
            Some(note) => self.send(&[0x80 | self.channel, note, 0]),
            None => Ok(()),
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.all_notes_off()
    }
}

impl Drop for MidiSink {
    fn drop(&mut self) {
        if let Err(e) = self.all_notes_off() {
            warn!("all-notes-off failed: {}", e);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyAction {
    Down(String),
    Up(String),
}

/// Records key events in order. Can cancel a token after a number of
/// key-downs to simulate the user stopping playback.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub actions: Vec<KeyAction>,
    pub finished: bool,
    cancel_after: Option<(usize, CancelToken)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelling_after(downs: usize, token: &CancelToken) -> Self {
        RecordingSink {
            cancel_after: Some((downs, token.clone())),
            ..Self::default()
        }
    }

    pub fn downs(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                KeyAction::Down(k) => Some(k.as_str()),
                KeyAction::Up(_) => None,
            })
            .collect()
    }
}

impl KeySink for RecordingSink {
    fn key_down(&mut self, key: &MappedKey) -> Result<()> {
        self.actions.push(KeyAction::Down(key.key.clone()));
        if let Some((limit, token)) = &self.cancel_after {
            if self.downs().len() >= *limit {
                token.cancel();
            }
        }
        Ok(())
    }

    fn key_up(&mut self, key: &MappedKey) -> Result<()> {
        self.actions.push(KeyAction::Up(key.key.clone()));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}
