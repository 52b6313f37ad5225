//! Standard MIDI File (SMF) import functionality.
//!
//! Reads .mid and .midi files into a [`MidiSong`] for one instrument.
//! Supports SMF Format 0 (single track) and Format 1 (multi-track) files.
//!
//! # Limitations
//!
//! - Only note on/off, tempo, track name, instrument name and end of track
//!   events are used
//! - Notes the instrument has no key for are dropped
//! - SMPTE timecode timing and Format 2 files are rejected

use super::{note_letter, note_octave, note_to_name, MidiNote, MidiSong, MidiTrack, DEFAULT_TEMPO};
use crate::config::InstrumentConfig;
use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Microseconds per quarter note at 120 BPM.
const DEFAULT_USEC_PER_BEAT: u32 = 500_000;

/// Errors that can occur during MIDI import.
#[derive(Debug, Error)]
pub enum MidiImportError {
    /// File could not be read
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    /// MIDI parsing failed
    #[error("MIDI parse error: {0}")]
    ParseError(String),
    /// Unsupported MIDI format or timing
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Converts absolute ticks to seconds following the file's tempo changes.
struct TempoMap {
    ticks_per_beat: f64,
    /// (tick, microseconds per beat), sorted by tick, starting at tick 0.
    changes: Vec<(u64, u32)>,
}

impl TempoMap {
    fn new(ticks_per_beat: u16, mut changes: Vec<(u64, u32)>) -> Self {
        changes.sort_by_key(|(tick, _)| *tick);
        if changes.first().map_or(true, |(tick, _)| *tick > 0) {
            changes.insert(0, (0, DEFAULT_USEC_PER_BEAT));
        }
        Self {
            ticks_per_beat: ticks_per_beat.max(1) as f64,
            changes,
        }
    }

    fn seconds(&self, tick: u64) -> f64 {
        let mut seconds = 0.0;
        for (i, &(start, usec)) in self.changes.iter().enumerate() {
            if start >= tick {
                break;
            }
            let end = self
                .changes
                .get(i + 1)
                .map_or(tick, |&(next, _)| next.min(tick));
            seconds += (end - start) as f64 / self.ticks_per_beat * usec as f64 / 1_000_000.0;
        }
        seconds
    }

    fn initial_tempo(&self) -> f64 {
        self.changes
            .first()
            .map_or(DEFAULT_TEMPO, |&(_, usec)| 60_000_000.0 / usec.max(1) as f64)
    }
}

/// A note as found in the file, before timing and key mapping.
struct RawNote {
    pitch: u8,
    start_tick: u64,
    end_tick: u64,
}

/// A track as found in the file, in ticks.
#[derive(Default)]
struct RawTrack {
    name: String,
    instrument: String,
    notes: Vec<RawNote>,
    end_tick: u64,
}

/// Imports a MIDI file for the given instrument.
///
/// # Arguments
///
/// * `path` - Path to the .mid or .midi file
/// * `instrument` - Instrument whose keys the notes are mapped to
///
/// # Returns
///
/// The imported song, named after the file stem
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn import_from_midi<P: AsRef<Path>>(
    path: P,
    instrument: &InstrumentConfig,
) -> Result<MidiSong, MidiImportError> {
    let path = path.as_ref();
    let data = fs::read(path)?;
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Imported MIDI");
    import_from_bytes(name, &data, instrument)
}

/// Imports MIDI data already held in memory.
///
/// # Arguments
///
/// * `name` - Song name
/// * `data` - Raw SMF bytes
/// * `instrument` - Instrument whose keys the notes are mapped to
///
/// # Returns
///
/// One [`MidiTrack`] per track in the file, including tracks left empty
/// after mapping
///
/// # Errors
///
/// Returns error if the data is not a supported SMF
pub fn import_from_bytes(
    name: &str,
    data: &[u8],
    instrument: &InstrumentConfig,
) -> Result<MidiSong, MidiImportError> {
    let smf = Smf::parse(data).map_err(|e| MidiImportError::ParseError(e.to_string()))?;

    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(tpb) => tpb.as_int(),
        Timing::Timecode(_, _) => {
            return Err(MidiImportError::UnsupportedFormat(
                "SMPTE timecode timing not supported".to_string(),
            ))
        }
    };
    if smf.header.format == Format::Sequential {
        return Err(MidiImportError::UnsupportedFormat(
            "Format 2 (sequential) MIDI files not supported".to_string(),
        ));
    }

    let mut tempo_changes = Vec::new();
    let raw_tracks: Vec<RawTrack> = smf
        .tracks
        .iter()
        .map(|track| parse_track(track, ticks_per_beat, &mut tempo_changes))
        .collect();
    let tempo_map = TempoMap::new(ticks_per_beat, tempo_changes);

    let tracks = raw_tracks
        .into_iter()
        .enumerate()
        .map(|(idx, raw)| map_track(idx, raw, &tempo_map, instrument))
        .collect();

    Ok(MidiSong {
        name: name.to_string(),
        tempo: tempo_map.initial_tempo(),
        tracks,
    })
}

/// Collects notes and metadata of one track; tempo changes go to the shared
/// list since Format 1 files keep them in the first track only.
fn parse_track(
    track: &[midly::TrackEvent],
    ticks_per_beat: u16,
    tempo_changes: &mut Vec<(u64, u32)>,
) -> RawTrack {
    let mut raw = RawTrack::default();
    // Key is (channel, pitch), value is start tick.
    let mut active_notes: HashMap<(u8, u8), u64> = HashMap::new();
    let mut current_tick: u64 = 0;
    let mut end_of_track = None;

    for event in track {
        current_tick += event.delta.as_int() as u64;

        match event.kind {
            TrackEventKind::Meta(meta) => match meta {
                MetaMessage::TrackName(bytes) => {
                    raw.name = String::from_utf8_lossy(bytes).into_owned();
                }
                MetaMessage::InstrumentName(bytes) => {
                    raw.instrument = String::from_utf8_lossy(bytes).into_owned();
                }
                MetaMessage::Tempo(usec_per_beat) => {
                    tempo_changes.push((current_tick, usec_per_beat.as_int()));
                }
                MetaMessage::EndOfTrack => {
                    end_of_track = Some(current_tick);
                }
                _ => {} // Ignore other meta events
            },
            TrackEventKind::Midi { channel, message } => {
                let ch = channel.as_int();
                match message {
                    MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        active_notes.insert((ch, key.as_int()), current_tick);
                    }
                    // Note on with velocity 0 = note off
                    MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                        let pitch = key.as_int();
                        if let Some(start_tick) = active_notes.remove(&(ch, pitch)) {
                            raw.notes.push(RawNote {
                                pitch,
                                start_tick,
                                end_tick: current_tick,
                            });
                        }
                    }
                    _ => {} // Ignore other MIDI messages
                }
            }
            _ => {} // Ignore SysEx and other events
        }
    }

    // Close any remaining active notes (in case MIDI file is incomplete)
    for ((_, pitch), start_tick) in active_notes {
        raw.notes.push(RawNote {
            pitch,
            start_tick,
            end_tick: start_tick + ticks_per_beat as u64,
        });
    }

    // Without an end-of-track event the track lasts until its last note ends.
    raw.end_tick = end_of_track.unwrap_or_else(|| {
        raw.notes
            .iter()
            .map(|n| n.end_tick)
            .fold(current_tick, u64::max)
    });
    raw
}

/// Converts a raw track to seconds and keeps the notes the instrument plays.
fn map_track(
    idx: usize,
    raw: RawTrack,
    tempo_map: &TempoMap,
    instrument: &InstrumentConfig,
) -> MidiTrack {
    let mut notes: Vec<MidiNote> = raw
        .notes
        .iter()
        .filter_map(|n| {
            let letter = note_letter(n.pitch);
            match instrument.key_for(note_octave(n.pitch), letter) {
                Some((register, key)) => {
                    let start = tempo_map.seconds(n.start_tick);
                    let end = tempo_map.seconds(n.end_tick);
                    Some(MidiNote::new(start, end - start, register, letter, key.key.clone()))
                }
                None => {
                    tracing::debug!(
                        "Track {}: no {} key for {}",
                        idx,
                        instrument.name,
                        note_to_name(n.pitch)
                    );
                    None
                }
            }
        })
        .collect();
    notes.sort_by(|a, b| a.start_offset.total_cmp(&b.start_offset));

    let dropped = raw.notes.len() - notes.len();
    if dropped > 0 {
        tracing::warn!(
            "Track {}: dropped {} of {} notes outside the {} range",
            idx,
            dropped,
            raw.notes.len(),
            instrument.name
        );
    }

    MidiTrack {
        name: if raw.name.is_empty() {
            format!("Track {}", idx + 1)
        } else {
            raw.name
        },
        instrument: raw.instrument,
        notes,
        end_seconds: tempo_map.seconds(raw.end_tick),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Format 1, 480 ticks per beat, 120 BPM conductor track, and a melody
    /// of C4 (0.0s), E4 (0.5s) and C#4 (1.0s, not on the harp) ending at 1.5s.
    fn two_track_file() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"MThd");
        data.extend_from_slice(&[0, 0, 0, 6, 0, 1, 0, 2, 0x01, 0xE0]);

        data.extend_from_slice(b"MTrk");
        data.extend_from_slice(&[0, 0, 0, 0x0B]);
        data.extend_from_slice(&[0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20]);
        data.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);

        data.extend_from_slice(b"MTrk");
        data.extend_from_slice(&[0, 0, 0, 0x20]);
        data.extend_from_slice(&[0x00, 0x90, 0x3C, 0x64]);
        data.extend_from_slice(&[0x83, 0x60, 0x80, 0x3C, 0x40]);
        data.extend_from_slice(&[0x00, 0x90, 0x40, 0x64]);
        data.extend_from_slice(&[0x83, 0x60, 0x80, 0x40, 0x40]);
        data.extend_from_slice(&[0x00, 0x90, 0x3D, 0x64]);
        data.extend_from_slice(&[0x81, 0x70, 0x80, 0x3D, 0x40]);
        data.extend_from_slice(&[0x81, 0x70, 0xFF, 0x2F, 0x00]);
        data
    }

    #[test]
    fn test_import_maps_notes_to_keys() {
        let song = import_from_bytes("melody", &two_track_file(), &InstrumentConfig::harp())
            .unwrap();
        assert_eq!(song.name, "melody");
        assert!((song.tempo - 120.0).abs() < 1e-9);
        assert_eq!(song.tracks.len(), 2);
        assert_eq!(song.first_playable_track(), Some(1));

        let track = &song.tracks[1];
        assert_eq!(track.notes.len(), 2);
        // C4 is reachable as key 8 of register 0 and key 1 of register 1;
        // the first listed register wins
        assert_eq!(track.notes[0].key, "8");
        assert_eq!(track.notes[0].register, 0);
        assert_eq!(track.notes[0].start_offset, 0.0);
        assert!((track.notes[0].duration - 0.5).abs() < 1e-9);
        assert_eq!(track.notes[1].key, "3");
        assert_eq!(track.notes[1].letter, "E");
        assert!((track.notes[1].start_offset - 0.5).abs() < 1e-9);
        assert!((track.end_seconds - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_end_of_track_is_not_extended() {
        // Format 0, C4 held with no note off, end of track after half a beat
        let mut data = Vec::new();
        data.extend_from_slice(b"MThd");
        data.extend_from_slice(&[0, 0, 0, 6, 0, 0, 0, 1, 0x01, 0xE0]);
        data.extend_from_slice(b"MTrk");
        data.extend_from_slice(&[0, 0, 0, 0x09]);
        data.extend_from_slice(&[0x00, 0x90, 0x3C, 0x64]);
        data.extend_from_slice(&[0x81, 0x70, 0xFF, 0x2F, 0x00]);

        let song = import_from_bytes("held", &data, &InstrumentConfig::harp()).unwrap();
        let track = &song.tracks[0];
        assert!((track.end_seconds - 0.25).abs() < 1e-9);
        assert_eq!(track.notes.len(), 1);
        assert!((track.notes[0].duration - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_tempo_map_changes() {
        // 120 BPM for the first beat, then 60 BPM
        let map = TempoMap::new(480, vec![(480, 1_000_000)]);
        assert!((map.seconds(480) - 0.5).abs() < 1e-9);
        assert!((map.seconds(960) - 1.5).abs() < 1e-9);
        assert!((map.initial_tempo() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_reject_garbage() {
        assert!(matches!(
            import_from_bytes("junk", b"not a midi file", &InstrumentConfig::harp()),
            Err(MidiImportError::ParseError(_))
        ));
    }
}
