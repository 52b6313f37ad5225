//! MIDI-derived song data.
//!
//! An imported song keeps only what playback needs: for every track, the
//! notes the chosen instrument can actually play, already mapped to a
//! register and a key, with onsets and durations in seconds.

mod midi_import;

pub use midi_import::{import_from_bytes, import_from_midi, MidiImportError};

use serde::{Deserialize, Serialize};

/// Standard MIDI note names for display purposes.
/// Maps MIDI note number (0-127) to note name within an octave.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Default tempo in beats per minute.
pub const DEFAULT_TEMPO: f64 = 120.0;

/// Letter of a MIDI note number, e.g. `"F#"` for 66.
pub fn note_letter(note: u8) -> &'static str {
    NOTE_NAMES[(note % 12) as usize]
}

/// Octave of a MIDI note number in the convention where 60 is C4.
pub fn note_octave(note: u8) -> i32 {
    (note / 12) as i32 - 1
}

/// Converts a MIDI note number to a human-readable note name with octave.
///
/// # Arguments
///
/// * `note` - MIDI note number (0-127)
///
/// # Returns
///
/// String like "C4", "F#5", etc.
///
/// # Examples
///
/// ```
/// use midikeys::midi::note_to_name;
///
/// let name = note_to_name(60); // Middle C
/// assert_eq!(name, "C4");
/// ```
pub fn note_to_name(note: u8) -> String {
    format!("{}{}", note_letter(note), note_octave(note))
}

/// A playable note of an imported track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiNote {
    /// Seconds from the start of the song.
    pub start_offset: f64,
    /// Seconds between note on and note off.
    pub duration: f64,
    /// Instrument register the note maps to.
    pub register: i32,
    /// Note letter as written in the file, e.g. `"C#"`.
    pub letter: String,
    /// Key that plays the note.
    pub key: String,
}

impl MidiNote {
    pub fn new(
        start_offset: f64,
        duration: f64,
        register: i32,
        letter: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            start_offset,
            duration,
            register,
            letter: letter.into(),
            key: key.into(),
        }
    }
}

/// One track of an imported song.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiTrack {
    pub name: String,
    /// Instrument name meta event, if the file had one.
    pub instrument: String,
    /// Playable notes, sorted by onset.
    pub notes: Vec<MidiNote>,
    /// Time of the track's end-of-track event in seconds.
    pub end_seconds: f64,
}

/// An imported MIDI file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiSong {
    pub name: String,
    /// Initial tempo in beats per minute.
    pub tempo: f64,
    pub tracks: Vec<MidiTrack>,
}

impl MidiSong {
    pub fn track(&self, index: usize) -> Option<&MidiTrack> {
        self.tracks.get(index)
    }

    /// Index of the first track with at least one playable note.
    pub fn first_playable_track(&self) -> Option<usize> {
        self.tracks.iter().position(|t| !t.notes.is_empty())
    }

    /// End time of the longest track in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.tracks
            .iter()
            .map(|t| t.end_seconds)
            .fold(0.0, f64::max)
    }
}
