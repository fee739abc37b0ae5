//! Cuts overlapping notes into a contiguous run of chords and rests.

use log::trace;

use crate::types::{
    round_time, ChordGroup, NoteEvent, RestEvent, Song, SongEvent, TIME_EPSILON,
};

/// Every note start and end becomes a cut point. Each interval turns into the
/// chord of all notes sounding through it, or a rest when nothing sounds.
/// Intervals shorter than `min_duration` extend the event before them, so
/// later start times stay where they were.
pub fn slice(song: &Song, min_duration: f64) -> Song {
    let mut notes: Vec<&NoteEvent> = song.notes().collect();
    if notes.is_empty() {
        return song.with_events(Vec::new());
    }
    notes.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut cuts: Vec<f64> = notes
        .iter()
        .flat_map(|n| [round_time(n.start), round_time(n.end())])
        .collect();
    cuts.push(0.0);
    cuts.sort_by(|a, b| a.total_cmp(b));
    cuts.dedup_by(|a, b| (*a - *b).abs() < TIME_EPSILON);

    // Windows only move forward, so a note joins `active` once and leaves it
    // for good once it ends before a window does.
    let mut pending = notes.into_iter().peekable();
    let mut active: Vec<&NoteEvent> = Vec::new();
    let mut events: Vec<SongEvent> = Vec::new();
    for window in cuts.windows(2) {
        let (from, to) = (window[0], window[1]);
        let length = round_time(to - from);
        if length < TIME_EPSILON {
            continue;
        }
        while let Some(note) = pending.next_if(|n| n.start <= from + TIME_EPSILON) {
            active.push(note);
        }
        active.retain(|n| n.end() >= to - TIME_EPSILON);

        if length < min_duration {
            if let Some(previous) = events.pop() {
                trace!("slice: merging {:.3} at {:.3} into previous event", length, from);
                events.push(extend(previous, length));
                continue;
            }
        }

        let event = if active.is_empty() {
            SongEvent::Rest(RestEvent {
                start: from,
                duration: length,
            })
        } else {
            let sounding: Vec<NoteEvent> = active.iter().map(|n| (*n).clone()).collect();
            SongEvent::Chord(ChordGroup::rebuild(from, length, sounding))
        };
        let event = merge_rests(&mut events, event);
        events.push(event);
    }

    song.with_events(events)
}

fn extend(event: SongEvent, by: f64) -> SongEvent {
    match event {
        SongEvent::Chord(c) => SongEvent::Chord(ChordGroup::rebuild(
            c.start(),
            round_time(c.duration() + by),
            c.notes().to_vec(),
        )),
        SongEvent::Rest(r) => SongEvent::Rest(RestEvent {
            start: r.start,
            duration: round_time(r.duration + by),
        }),
    }
}

/// Back-to-back rests become one.
fn merge_rests(events: &mut Vec<SongEvent>, next: SongEvent) -> SongEvent {
    if let SongEvent::Rest(rest) = &next {
        if let Some(SongEvent::Rest(_)) = events.last() {
            if let Some(previous) = events.pop() {
                return extend(previous, rest.duration);
            }
        }
    }
    next
}
