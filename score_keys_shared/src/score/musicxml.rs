//! MusicXML reader (`score-partwise`), plain or in an `.mxl` container.
//!
//! The document is streamed with quick-xml. Each `<part>` keeps its own
//! cursor in quarter-note beats, moved by note durations, `<backup>` and
//! `<forward>`. Tied notes are merged into one sustained note.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use log::{debug, trace, warn};
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesRef, BytesStart, Event};
use quick_xml::Reader;
use zip::ZipArchive;

use super::{RawNote, RawPart, RawScore, ScoreParser};
use crate::error::{KeysError, Result};
use crate::tempo::TempoChange;
use crate::types::{TimeSignature, TimeSignatureChange};

#[derive(Debug, Clone, Copy, Default)]
pub struct MusicXmlParser;

/// `.mxl`: a zip archive whose root document is named by
/// `META-INF/container.xml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressedMusicXmlParser;

fn attr(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name)
        .map(|a| String::from_utf8_lossy(&a.value).trim().to_string())
}

/// Text for `&amp;`-style and `&#233;`-style references.
fn reference_text(reference: &BytesRef) -> Option<String> {
    if let Ok(Some(ch)) = reference.resolve_char_ref() {
        return Some(ch.to_string());
    }
    let name = reference.decode().ok()?;
    resolve_predefined_entity(&name).map(str::to_string)
}

fn step_to_pitch_class(step: &str) -> Option<i32> {
    match step.trim().to_ascii_uppercase().as_str() {
        "C" => Some(0),
        "D" => Some(2),
        "E" => Some(4),
        "F" => Some(5),
        "G" => Some(7),
        "A" => Some(9),
        "B" => Some(11),
        _ => None,
    }
}

/// Leaf elements whose text we read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    PartName,
    Step,
    Alter,
    Octave,
    Duration,
    Divisions,
    Beats,
    BeatType,
}

impl Field {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"part-name" => Some(Field::PartName),
            b"step" => Some(Field::Step),
            b"alter" => Some(Field::Alter),
            b"octave" => Some(Field::Octave),
            b"duration" => Some(Field::Duration),
            b"divisions" => Some(Field::Divisions),
            b"beats" => Some(Field::Beats),
            b"beat-type" => Some(Field::BeatType),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct PendingNote {
    chord: bool,
    rest: bool,
    grace: bool,
    cue: bool,
    step: Option<i32>,
    alter: f64,
    octave: Option<i32>,
    duration: f64,
    tie_start: bool,
    tie_stop: bool,
}

#[derive(Debug)]
struct PartCursor {
    index: usize,
    divisions: f64,
    position: f64,
    last_start: f64,
}

#[derive(Debug, Default)]
struct TimeBuilder {
    beats: Option<u32>,
    beat_type: Option<u32>,
}

#[derive(Default)]
struct XmlState {
    raw: RawScore,
    part_ids: HashMap<String, usize>,
    score_part: Option<String>,
    part: Option<PartCursor>,
    note: Option<PendingNote>,
    time: Option<TimeBuilder>,
    /// Duration of the open `<backup>` (negative) or `<forward>` (positive).
    shift: Option<(f64, f64)>,
    field: Option<Field>,
    text: String,
    open_ties: HashMap<(usize, i32), usize>,
}

impl XmlState {
    fn part_index(&mut self, id: &str) -> usize {
        if let Some(index) = self.part_ids.get(id) {
            return *index;
        }
        let index = self.raw.parts.len();
        self.raw.parts.push(RawPart {
            name: id.to_string(),
        });
        self.part_ids.insert(id.to_string(), index);
        index
    }

    fn open(&mut self, e: &BytesStart) {
        let name = e.name();
        let name = name.as_ref();
        if let Some(field) = Field::from_name(name) {
            self.field = Some(field);
            self.text.clear();
            return;
        }
        match name {
            b"score-part" => {
                let id = attr(e, b"id").unwrap_or_default();
                self.part_index(&id);
                self.score_part = Some(id);
            }
            b"part" => {
                let id = attr(e, b"id").unwrap_or_default();
                let index = self.part_index(&id);
                trace!("part '{}' -> index {}", id, index);
                self.part = Some(PartCursor {
                    index,
                    divisions: 1.0,
                    position: 0.0,
                    last_start: 0.0,
                });
                self.open_ties.retain(|(p, _), _| *p != index);
            }
            b"note" => self.note = Some(PendingNote::default()),
            b"backup" => self.shift = Some((-1.0, 0.0)),
            b"forward" => self.shift = Some((1.0, 0.0)),
            b"time" => self.time = Some(TimeBuilder::default()),
            _ => self.flag(e),
        }
    }

    /// Elements that only carry attributes or mark a note.
    fn flag(&mut self, e: &BytesStart) {
        match e.name().as_ref() {
            b"chord" => {
                if let Some(n) = self.note.as_mut() {
                    n.chord = true;
                }
            }
            b"rest" => {
                if let Some(n) = self.note.as_mut() {
                    n.rest = true;
                }
            }
            b"grace" => {
                if let Some(n) = self.note.as_mut() {
                    n.grace = true;
                }
            }
            b"cue" => {
                if let Some(n) = self.note.as_mut() {
                    n.cue = true;
                }
            }
            b"tie" => {
                if let Some(n) = self.note.as_mut() {
                    match attr(e, b"type").as_deref() {
                        Some("start") => n.tie_start = true,
                        Some("stop") => n.tie_stop = true,
                        _ => {}
                    }
                }
            }
            b"sound" => {
                let tempo = attr(e, b"tempo").and_then(|t| t.parse::<f64>().ok());
                if let (Some(bpm), Some(cursor)) = (tempo, self.part.as_ref()) {
                    if bpm > 0.0 {
                        self.raw.tempo_changes.push(TempoChange {
                            beat: cursor.position,
                            bpm,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    fn close(&mut self, name: &[u8]) {
        if let Some(field) = self.field.take() {
            let text = std::mem::take(&mut self.text);
            self.apply_field(field, text.trim());
            return;
        }
        match name {
            b"score-part" => self.score_part = None,
            b"part" => self.part = None,
            b"note" => {
                if let Some(note) = self.note.take() {
                    self.finish_note(note);
                }
            }
            b"backup" | b"forward" => {
                if let (Some((sign, duration)), Some(cursor)) = (self.shift.take(), self.part.as_mut()) {
                    cursor.position = (cursor.position + sign * duration / cursor.divisions).max(0.0);
                }
            }
            b"time" => {
                if let (Some(time), Some(cursor)) = (self.time.take(), self.part.as_ref()) {
                    if let (Some(beats), Some(beat_type)) = (time.beats, time.beat_type) {
                        if (1..=255).contains(&beats) && (1..=255).contains(&beat_type) {
                            self.raw.time_signatures.push(TimeSignatureChange {
                                beat: cursor.position,
                                signature: TimeSignature {
                                    numerator: beats as u8,
                                    denominator: beat_type as u8,
                                },
                            });
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn apply_field(&mut self, field: Field, text: &str) {
        match field {
            Field::PartName => {
                if let Some(id) = self.score_part.clone() {
                    let index = self.part_index(&id);
                    if !text.is_empty() {
                        self.raw.parts[index].name = text.to_string();
                    }
                }
            }
            Field::Step => {
                if let Some(n) = self.note.as_mut() {
                    n.step = step_to_pitch_class(text);
                }
            }
            Field::Alter => {
                if let Some(n) = self.note.as_mut() {
                    n.alter = text.parse().unwrap_or(0.0);
                }
            }
            Field::Octave => {
                if let Some(n) = self.note.as_mut() {
                    n.octave = text.parse().ok();
                }
            }
            Field::Duration => {
                let value: f64 = text.parse().unwrap_or(0.0);
                if let Some(n) = self.note.as_mut() {
                    n.duration = value;
                } else if let Some(shift) = self.shift.as_mut() {
                    shift.1 = value;
                }
            }
            Field::Divisions => {
                if let (Ok(divisions), Some(cursor)) = (text.parse::<f64>(), self.part.as_mut()) {
                    if divisions > 0.0 {
                        cursor.divisions = divisions;
                    }
                }
            }
            Field::Beats => {
                if let Some(time) = self.time.as_mut() {
                    // compound meters such as 3+2
                    time.beats = text
                        .split('+')
                        .map(|p| p.trim().parse::<u32>().ok())
                        .sum::<Option<u32>>();
                }
            }
            Field::BeatType => {
                if let Some(time) = self.time.as_mut() {
                    time.beat_type = text.parse().ok();
                }
            }
        }
    }

    fn finish_note(&mut self, note: PendingNote) {
        let Some(cursor) = self.part.as_mut() else {
            return;
        };
        if note.grace {
            return;
        }
        let length = note.duration / cursor.divisions;
        let start = if note.chord {
            cursor.last_start
        } else {
            let start = cursor.position;
            cursor.last_start = start;
            cursor.position += length;
            start
        };
        let part = cursor.index;
        if note.rest || note.cue || length <= 0.0 {
            return;
        }
        let (Some(step), Some(octave)) = (note.step, note.octave) else {
            return;
        };
        let key = (octave + 1) * 12 + step + note.alter.round() as i32;

        if note.tie_stop {
            if let Some(&idx) = self.open_ties.get(&(part, key)) {
                let tied = &mut self.raw.notes[idx];
                tied.duration = (start + length - tied.start).max(tied.duration);
                if !note.tie_start {
                    self.open_ties.remove(&(part, key));
                }
                return;
            }
        }
        self.raw.notes.push(RawNote {
            key,
            start,
            duration: length,
            part,
            percussion: false,
        });
        if note.tie_start {
            self.open_ties.insert((part, key), self.raw.notes.len() - 1);
        }
    }
}

impl ScoreParser for MusicXmlParser {
    fn parse(&self, source_name: &str, bytes: &[u8]) -> Result<RawScore> {
        let mut reader = Reader::from_reader(bytes);
        let mut buf = Vec::new();
        let mut state = XmlState::default();
        let mut root_seen = false;

        loop {
            let event = reader.read_event_into(&mut buf).map_err(|e| {
                KeysError::malformed(
                    source_name,
                    format!("invalid XML at byte {}: {}", reader.buffer_position(), e),
                )
            })?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) if !root_seen => {
                    root_seen = true;
                    match e.name().as_ref() {
                        b"score-partwise" => {}
                        b"score-timewise" => {
                            return Err(KeysError::malformed(
                                source_name,
                                "score-timewise documents are not supported",
                            ))
                        }
                        other => {
                            return Err(KeysError::malformed(
                                source_name,
                                format!(
                                    "not a MusicXML score (root element <{}>)",
                                    String::from_utf8_lossy(other)
                                ),
                            ))
                        }
                    }
                }
                Event::Start(ref e) => state.open(e),
                Event::Empty(ref e) => {
                    if Field::from_name(e.name().as_ref()).is_none() {
                        state.flag(e);
                    }
                }
                Event::End(ref e) => state.close(e.name().as_ref()),
                Event::Text(ref t) => {
                    if state.field.is_some() {
                        state.text.push_str(&String::from_utf8_lossy(t));
                    }
                }
                Event::GeneralRef(ref r) => {
                    if state.field.is_some() {
                        match reference_text(r) {
                            Some(text) => state.text.push_str(&text),
                            None => trace!("unknown entity &{};", String::from_utf8_lossy(r)),
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !root_seen {
            return Err(KeysError::malformed(source_name, "empty document"));
        }
        debug!(
            "{}: {} part(s), {} note(s), {} tempo mark(s)",
            source_name,
            state.raw.parts.len(),
            state.raw.notes.len(),
            state.raw.tempo_changes.len()
        );
        Ok(state.raw)
    }
}

impl ScoreParser for CompressedMusicXmlParser {
    fn parse(&self, source_name: &str, bytes: &[u8]) -> Result<RawScore> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| {
            KeysError::malformed(source_name, format!("invalid .mxl archive: {}", e))
        })?;
        let root = match container_root(&mut archive) {
            Some(path) => path,
            None => {
                warn!("{}: no usable META-INF/container.xml, using first score entry", source_name);
                first_score_entry(&mut archive).ok_or_else(|| {
                    KeysError::malformed(source_name, "archive holds no MusicXML document")
                })?
            }
        };
        debug!("{}: reading root document '{}'", source_name, root);

        let mut xml = Vec::new();
        archive
            .by_name(&root)
            .map_err(|e| KeysError::malformed(source_name, format!("missing '{}': {}", root, e)))?
            .read_to_end(&mut xml)
            .map_err(|e| KeysError::malformed(source_name, format!("cannot read '{}': {}", root, e)))?;
        MusicXmlParser.parse(source_name, &xml)
    }
}

fn container_root(archive: &mut ZipArchive<Cursor<&[u8]>>) -> Option<String> {
    let mut container = String::new();
    archive
        .by_name("META-INF/container.xml")
        .ok()?
        .read_to_string(&mut container)
        .ok()?;

    let mut reader = Reader::from_reader(container.as_bytes());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) if e.name().as_ref() == b"rootfile" => {
                if let Some(path) = attr(e, b"full-path").filter(|p| !p.is_empty()) {
                    return Some(path);
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

fn first_score_entry(archive: &mut ZipArchive<Cursor<&[u8]>>) -> Option<String> {
    (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
        .find(|name| {
            let lower = name.to_ascii_lowercase();
            !lower.starts_with("meta-inf/") && (lower.ends_with(".xml") || lower.ends_with(".musicxml"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::{resolve, ReadOptions};
    use crate::types::{DurationUnit, SongEvent};
    use std::io::Write;

    const DUET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE score-partwise PUBLIC "-//Recordare//DTD MusicXML 3.1 Partwise//EN" "http://www.musicxml.org/dtds/partwise.dtd">
<score-partwise version="3.1">
  <part-list>
    <score-part id="P1"><part-name>Piano</part-name></score-part>
    <score-part id="P2"><part-name>Flute</part-name></score-part>
  </part-list>
  <part id="P1">
    <measure number="1">
      <attributes>
        <divisions>2</divisions>
        <time><beats>3</beats><beat-type>4</beat-type></time>
      </attributes>
      <direction><sound tempo="90"/></direction>
      <note><pitch><step>C</step><octave>4</octave></pitch><duration>2</duration><voice>1</voice></note>
      <note><chord/><pitch><step>E</step><octave>4</octave></pitch><duration>2</duration><voice>1</voice></note>
      <note><grace/><pitch><step>D</step><octave>4</octave></pitch><voice>1</voice></note>
      <note><rest/><duration>1</duration><voice>1</voice></note>
      <note><pitch><step>F</step><alter>1</alter><octave>4</octave></pitch><duration>1</duration><tie type="start"/><voice>1</voice></note>
      <note><pitch><step>F</step><alter>1</alter><octave>4</octave></pitch><duration>2</duration><tie type="stop"/><voice>1</voice></note>
      <backup><duration>6</duration></backup>
      <note><pitch><step>C</step><octave>3</octave></pitch><duration>6</duration><voice>2</voice></note>
    </measure>
  </part>
  <part id="P2">
    <measure number="1">
      <attributes><divisions>1</divisions><time><beats>3</beats><beat-type>4</beat-type></time></attributes>
      <direction><sound tempo="90"/></direction>
      <forward><duration>2</duration></forward>
      <note><pitch><step>B</step><alter>-1</alter><octave>5</octave></pitch><duration>1</duration></note>
    </measure>
  </part>
</score-partwise>
"#;

    #[test]
    fn reads_chords_rests_ties_and_voices() {
        let raw = MusicXmlParser.parse("duet.musicxml", DUET.as_bytes()).unwrap();
        assert_eq!(raw.parts.len(), 2);
        assert_eq!(raw.parts[0].name, "Piano");
        assert_eq!(raw.parts[1].name, "Flute");

        let mut notes: Vec<(i32, f64, f64, usize)> = raw
            .notes
            .iter()
            .map(|n| (n.key, n.start, n.duration, n.part))
            .collect();
        notes.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        assert_eq!(
            notes,
            vec![
                (48, 0.0, 3.0, 0),
                (60, 0.0, 1.0, 0),
                (64, 0.0, 1.0, 0),
                (66, 1.5, 1.5, 0),
                (82, 2.0, 1.0, 1),
            ]
        );
    }

    #[test]
    fn tempo_and_meter_deduplicate_across_parts() {
        let raw = MusicXmlParser.parse("duet.musicxml", DUET.as_bytes()).unwrap();
        let song = resolve("duet.musicxml", raw, &ReadOptions::default()).unwrap();
        assert_eq!(song.metadata.tempo_bpm, 90.0);
        assert!(song.metadata.tempo_changes.is_empty());
        assert_eq!(song.metadata.time_signature.to_string(), "3/4");
        assert!(song.metadata.time_signature_changes.is_empty());
        assert_eq!(song.metadata.unit, DurationUnit::Beats);
        // C4/E4 sort ahead of the longer C3 that starts with them
        match &song.events()[0] {
            SongEvent::Chord(c) => assert_eq!(c.len(), 2),
            other => panic!("expected the C4/E4 chord, got {:?}", other),
        }
    }

    #[test]
    fn part_names_keep_entity_references() {
        let xml = r#"<score-partwise>
  <part-list>
    <score-part id="P1"><part-name>Piano &amp; Strings</part-name></score-part>
    <score-part id="P2"><part-name>Caf&#233; &lt;Solo&gt;</part-name></score-part>
  </part-list>
  <part id="P1"><measure><attributes><divisions>1</divisions></attributes>
    <note><pitch><step>C</step><octave>4</octave></pitch><duration>1</duration></note>
  </measure></part>
  <part id="P2"><measure><attributes><divisions>1</divisions></attributes>
    <note><pitch><step>G</step><octave>4</octave></pitch><duration>1</duration></note>
  </measure></part>
</score-partwise>"#;
        let raw = MusicXmlParser.parse("ensemble.xml", xml.as_bytes()).unwrap();
        assert_eq!(raw.parts[0].name, "Piano & Strings");
        assert_eq!(raw.parts[1].name, "Caf\u{e9} <Solo>");

        let options = ReadOptions {
            part_filter: Some("piano & strings".to_string()),
            ..ReadOptions::default()
        };
        let song = resolve("ensemble.xml", raw, &options).unwrap();
        assert_eq!(song.note_count(), 1);
    }

    #[test]
    fn timewise_and_broken_documents_are_malformed() {
        let timewise = r#"<score-timewise><part-list/></score-timewise>"#;
        let err = MusicXmlParser.parse("t.xml", timewise.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("score-timewise"));

        let broken = "<score-partwise><part id=\"P1\"><measure></part></score-partwise>";
        assert!(matches!(
            MusicXmlParser.parse("b.xml", broken.as_bytes()),
            Err(KeysError::MalformedScore { .. })
        ));

        let html = "<html><body/></html>";
        assert!(MusicXmlParser.parse("h.xml", html.as_bytes()).is_err());
    }

    fn mxl(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, body) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn compressed_score_follows_container() {
        let container = r#"<?xml version="1.0"?>
<container><rootfiles><rootfile full-path="scores/duet.xml" media-type="application/vnd.recordare.musicxml+xml"/></rootfiles></container>"#;
        let bytes = mxl(&[
            ("META-INF/container.xml", container),
            ("decoy.xml", "<html/>"),
            ("scores/duet.xml", DUET),
        ]);
        let raw = CompressedMusicXmlParser.parse("duet.mxl", &bytes).unwrap();
        assert_eq!(raw.notes.len(), 5);
    }

    #[test]
    fn compressed_score_without_container_uses_first_xml() {
        let bytes = mxl(&[("readme.txt", "hello"), ("duet.musicxml", DUET)]);
        let raw = CompressedMusicXmlParser.parse("duet.mxl", &bytes).unwrap();
        assert_eq!(raw.parts.len(), 2);
    }

    #[test]
    fn non_zip_is_malformed() {
        let err = CompressedMusicXmlParser.parse("x.mxl", b"plain text").unwrap_err();
        assert!(matches!(err, KeysError::MalformedScore { .. }));
    }
}
