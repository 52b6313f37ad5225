//! midikeys - plays songs on keyboard-driven in-game instruments.
//!
//! A song (an imported MIDI file or a hand-authored step grid) is flattened
//! into a [`Timeline`], walked in real time by a [`PlaybackController`], and
//! emitted as key presses through an [`InputSink`].

pub mod config;
pub mod grid;
pub mod input;
pub mod midi;
pub mod playback;
pub mod project;
pub mod timeline;

// Re-export commonly used types
pub use config::{ConfigError, InstrumentConfig, Instruments, Settings};
pub use grid::{Grid, GridError};
pub use input::{InputSink, LogSink, RecordingSink, UdpSink};
pub use midi::{import_from_midi, MidiImportError, MidiSong, MidiTrack};
pub use playback::{Action, PlaybackController, PlaybackState, RegisterPolicy, TickEngine};
pub use project::{Project, ProjectSource};
pub use timeline::{Note, NoteId, Timeline, TimelineSource};
