//! The note timeline shared by every playback source.
//!
//! Whether notes come from an imported MIDI track or from a hand-authored
//! grid, playback only ever sees a [`Timeline`]: notes bucketed by their
//! onset, in ascending order, plus the time at which the track ends.
//! A timeline is built once and never mutated afterwards; which notes have
//! already fired is tracked by the tick engine, not on the notes.

use crate::grid::Grid;
use crate::midi::MidiTrack;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// A note onset in seconds, usable as an ordered map key.
///
/// Ordering is IEEE total order; `-0.0` is folded into `0.0` on
/// construction so both land in the same bucket.
#[derive(Debug, Clone, Copy)]
pub struct Onset(f64);

impl Onset {
    pub fn new(seconds: f64) -> Self {
        Self(if seconds == 0.0 { 0.0 } else { seconds })
    }

    pub fn seconds(self) -> f64 {
        self.0
    }
}

impl PartialEq for Onset {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Onset {}

impl PartialOrd for Onset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Onset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Onset {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// Stable fingerprint of a logical note.
///
/// Two notes with the same onset, register and key share an id, no matter
/// which object they live in. Used to tell whether a note already fired
/// during the current play-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoteId(u64);

impl NoteId {
    pub fn fingerprint(start_offset: f64, register: i32, key: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        Onset::new(start_offset).hash(&mut hasher);
        register.hash(&mut hasher);
        key.hash(&mut hasher);
        Self(hasher.finish())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A single key press scheduled on the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    /// Seconds from the start of playback.
    pub start_offset: f64,
    /// Seconds the note sounds; informational, keys are only tapped.
    pub duration: f64,
    /// Instrument register the key belongs to.
    pub register: i32,
    /// Logical key name for the input sink.
    pub key: String,
    pub id: NoteId,
}

impl Note {
    pub fn new(start_offset: f64, duration: f64, register: i32, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            id: NoteId::fingerprint(start_offset, register, &key),
            start_offset,
            duration,
            register,
            key,
        }
    }
}

/// Where a timeline's notes come from. Resolved once, at build time.
#[derive(Debug, Clone, Copy)]
pub enum TimelineSource<'a> {
    /// An imported MIDI track; offsets come straight from the file.
    Midi(&'a MidiTrack),
    /// A step grid; offsets derive from measure, step and tempo.
    Grid(&'a Grid),
}

/// Notes bucketed by onset, in ascending order.
pub type TickMap = BTreeMap<Onset, Vec<Note>>;

/// Read-only note schedule consumed by the tick engine.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    buckets: TickMap,
    duration: f64,
}

impl Timeline {
    /// Builds the timeline for a MIDI track or a grid.
    ///
    /// The end sentinel is the track's end-of-track time for MIDI, and one
    /// second past the last activated step for grids. An empty source gives
    /// an empty timeline ending at 0.
    ///
    /// # Arguments
    ///
    /// * `source` - The MIDI track or grid to read notes from
    ///
    /// # Returns
    ///
    /// The notes bucketed by onset, with the track duration
    pub fn build(source: TimelineSource<'_>) -> Self {
        match source {
            TimelineSource::Midi(track) => {
                let notes = track
                    .notes
                    .iter()
                    .map(|n| Note::new(n.start_offset, n.duration, n.register, n.key.clone()));
                Self::from_notes(notes, track.end_seconds)
            }
            TimelineSource::Grid(grid) => Self::from_notes(grid.notes(), grid.track_duration()),
        }
    }

    /// Builds a timeline from loose notes ending at `duration` seconds.
    pub fn from_notes(notes: impl IntoIterator<Item = Note>, duration: f64) -> Self {
        let mut buckets = TickMap::new();
        for note in notes {
            buckets
                .entry(Onset::new(note.start_offset))
                .or_default()
                .push(note);
        }
        let duration = if buckets.is_empty() { 0.0 } else { duration.max(0.0) };
        tracing::debug!(
            "Built timeline with {} onsets, duration {:.3}s",
            buckets.len(),
            duration
        );
        Self { buckets, duration }
    }

    /// Returns true if there is nothing to play.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Total number of notes.
    pub fn note_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Time in seconds at which playback of this timeline ends.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Distinct onsets, ascending.
    pub fn onsets(&self) -> impl Iterator<Item = Onset> + '_ {
        self.buckets.keys().copied()
    }

    /// Notes starting exactly at `onset`.
    pub fn bucket(&self, onset: Onset) -> &[Note] {
        self.buckets.get(&onset).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Largest onset at or before `time`.
    ///
    /// A time before the first onset yields the first onset, a time past the
    /// last onset yields the last one. `None` only for an empty timeline.
    pub fn floor_onset(&self, time: f64) -> Option<Onset> {
        self.buckets
            .range(..=Onset::new(time))
            .next_back()
            .or_else(|| self.buckets.iter().next())
            .map(|(onset, _)| *onset)
    }
}
