//! Saved playback projects.
//!
//! A project pairs a song with the instrument it was mapped for. The song is
//! either an imported MIDI file or a hand-authored step grid.

use crate::grid::Grid;
use crate::midi::MidiSong;
use crate::timeline::{Timeline, TimelineSource};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// What a project plays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProjectSource {
    Midi(MidiSong),
    Grid(Grid),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    /// Name of the instrument the notes were mapped for.
    pub instrument: String,
    pub source: ProjectSource,
}

impl Project {
    pub fn from_midi(song: MidiSong, instrument: impl Into<String>) -> Self {
        Self {
            name: song.name.clone(),
            instrument: instrument.into(),
            source: ProjectSource::Midi(song),
        }
    }

    pub fn from_grid(name: impl Into<String>, grid: Grid) -> Self {
        Self {
            name: name.into(),
            instrument: grid.instrument().name.clone(),
            source: ProjectSource::Grid(grid),
        }
    }

    /// Number of selectable tracks. A grid is a single track.
    pub fn track_count(&self) -> usize {
        match &self.source {
            ProjectSource::Midi(song) => song.tracks.len(),
            ProjectSource::Grid(_) => 1,
        }
    }

    /// Builds the playback timeline for a track.
    ///
    /// # Arguments
    ///
    /// * `track` - Track index; grids ignore it
    ///
    /// # Returns
    ///
    /// The timeline, or `None` if the MIDI song has no such track
    pub fn timeline(&self, track: usize) -> Option<Timeline> {
        match &self.source {
            ProjectSource::Midi(song) => song
                .track(track)
                .map(|t| Timeline::build(TimelineSource::Midi(t))),
            ProjectSource::Grid(grid) => Some(Timeline::build(TimelineSource::Grid(grid))),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Saves the project to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file writing fails
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), io::Error> {
        let json = self
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }

    /// Loads a project from a JSON file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the input file
    ///
    /// # Returns
    ///
    /// Loaded Project
    ///
    /// # Errors
    ///
    /// Returns error if file reading or parsing fails
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Saves the project in the compact binary format.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file writing fails
    pub fn save_to_binary<P: AsRef<Path>>(&self, path: P) -> Result<(), io::Error> {
        let data =
            bincode::serialize(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, data)
    }

    /// Loads a project saved with [`save_to_binary`](Self::save_to_binary).
    ///
    /// # Errors
    ///
    /// Returns error if file reading or parsing fails
    pub fn load_from_binary<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let data = fs::read(path)?;
        bincode::deserialize(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentConfig;
    use crate::midi::{MidiNote, MidiTrack};

    fn grid_project() -> Project {
        let mut grid = Grid::new(&InstrumentConfig::harp(), 120.0, 16);
        grid.toggle(0, 1, 0, "1").unwrap();
        grid.toggle(0, 2, 4, "3").unwrap();
        Project::from_grid("Scales", grid)
    }

    fn midi_project() -> Project {
        let song = MidiSong {
            name: "song".to_string(),
            tempo: 120.0,
            tracks: vec![
                MidiTrack {
                    name: "Conductor".to_string(),
                    instrument: String::new(),
                    notes: Vec::new(),
                    end_seconds: 0.0,
                },
                MidiTrack {
                    name: "Lead".to_string(),
                    instrument: "Harp".to_string(),
                    notes: vec![MidiNote::new(0.5, 0.25, 1, "E", "3")],
                    end_seconds: 2.0,
                },
            ],
        };
        Project::from_midi(song, "harp")
    }

    #[test]
    fn test_grid_timeline() {
        let project = grid_project();
        assert_eq!(project.instrument, "harp");
        assert_eq!(project.track_count(), 1);

        let timeline = project.timeline(7).unwrap();
        assert_eq!(timeline.note_count(), 2);
        // step 4 at 120 bpm is 0.5s, plus one second of tail
        assert!((timeline.duration() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_midi_timeline() {
        let project = midi_project();
        assert_eq!(project.track_count(), 2);
        assert!(project.timeline(0).unwrap().is_empty());
        let timeline = project.timeline(1).unwrap();
        assert_eq!(timeline.note_count(), 1);
        assert_eq!(timeline.duration(), 2.0);
        assert!(project.timeline(2).is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let project = grid_project();
        let loaded = Project::from_json(&project.to_json().unwrap()).unwrap();
        assert_eq!(loaded, project);
    }

    #[test]
    fn test_file_formats() {
        let dir = std::env::temp_dir().join(format!("midikeys-project-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let project = midi_project();
        let json = dir.join("song.json");
        project.save_to_file(&json).unwrap();
        assert_eq!(Project::load_from_file(&json).unwrap(), project);

        let binary = dir.join("song.mkp");
        project.save_to_binary(&binary).unwrap();
        assert_eq!(Project::load_from_binary(&binary).unwrap(), project);

        let err = Project::load_from_binary(&json).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        fs::remove_dir_all(&dir).unwrap();
    }
}
