//! Hand-authored step grids.
//!
//! A grid is a list of measures; each measure holds every register of the
//! instrument, each register a fixed number of steps, and each step one cell
//! per key of that register. A cell the user switched on becomes a note.
//! Step timing is derived from the tempo: one step is a sixteenth note.

use crate::config::InstrumentConfig;
use crate::midi::{MidiTrack, DEFAULT_TEMPO};
use crate::timeline::Note;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Tolerance, in steps, for onsets that sit on a step boundary but carry
/// float error from tick to seconds conversion.
const QUANTIZE_EPSILON: f64 = 1e-6;

/// Errors for grid positions that do not exist.
#[derive(Debug, Error, PartialEq)]
pub enum GridError {
    #[error("measure {0} does not exist")]
    Measure(usize),
    #[error("register {0} does not exist")]
    Register(i32),
    #[error("step {0} is outside the measure")]
    Step(usize),
    #[error("key {0} is not part of the register")]
    Key(String),
    #[error("tempo {0} must be a positive number of beats per minute")]
    Tempo(f64),
}

fn is_valid_tempo(tempo: f64) -> bool {
    tempo.is_finite() && tempo > 0.0
}

/// Rejects saved grids whose tempo would make every step infinitely long.
fn valid_tempo<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let tempo = f64::deserialize(deserializer)?;
    if is_valid_tempo(tempo) {
        Ok(tempo)
    } else {
        Err(serde::de::Error::custom(GridError::Tempo(tempo)))
    }
}

/// One toggleable key at one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridCell {
    /// Letters this key plays, e.g. `["C", "B#"]`. Display only.
    pub letters: Vec<String>,
    /// Key emitted when the cell is played.
    pub key: String,
    pub activated: bool,
}

/// One register's worth of steps inside a measure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridRegister {
    pub num: i32,
    /// `steps[step]` holds one cell per key of the register.
    pub steps: Vec<Vec<GridCell>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measure {
    pub num: usize,
    pub registers: Vec<GridRegister>,
}

/// A step grid for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    instrument: InstrumentConfig,
    /// Tempo in beats per minute, always finite and positive.
    #[serde(deserialize_with = "valid_tempo")]
    tempo: f64,
    steps_per_measure: usize,
    measures: Vec<Measure>,
}

impl Grid {
    /// Creates a grid with a single empty measure.
    ///
    /// # Arguments
    ///
    /// * `instrument` - Instrument whose registers and keys lay out each measure
    /// * `tempo` - Beats per minute; an invalid tempo falls back to the default
    /// * `steps_per_measure` - Number of steps per measure, at least one
    ///
    /// # Returns
    ///
    /// A grid with one measure and no activated cells
    pub fn new(instrument: &InstrumentConfig, tempo: f64, steps_per_measure: u32) -> Self {
        let tempo = if is_valid_tempo(tempo) {
            tempo
        } else {
            tracing::warn!("Invalid tempo {}, using {}", tempo, DEFAULT_TEMPO);
            DEFAULT_TEMPO
        };
        let mut grid = Self {
            instrument: instrument.clone(),
            tempo,
            steps_per_measure: steps_per_measure.max(1) as usize,
            measures: Vec::new(),
        };
        grid.add_measure();
        grid
    }

    /// Builds a grid from an imported MIDI track, snapping every note to the
    /// next step at or after its onset.
    ///
    /// Notes whose register or key the instrument does not have are skipped.
    ///
    /// # Arguments
    ///
    /// * `track` - Imported track with notes already mapped to keys
    /// * `instrument` - Instrument the grid is laid out for
    /// * `tempo` - Beats per minute used to place the steps
    /// * `steps_per_measure` - Grid resolution
    ///
    /// # Returns
    ///
    /// A grid with as many measures as the track needs
    pub fn from_midi_track(
        track: &MidiTrack,
        instrument: &InstrumentConfig,
        tempo: f64,
        steps_per_measure: u32,
    ) -> Self {
        let mut grid = Self::new(instrument, tempo, steps_per_measure);
        let step_seconds = grid.step_seconds();

        for note in &track.notes {
            let steps = note.start_offset / step_seconds;
            let index = (steps - QUANTIZE_EPSILON).ceil().max(0.0) as usize;
            let measure = index / grid.steps_per_measure;
            let step = index % grid.steps_per_measure;
            while measure >= grid.measures.len() {
                grid.add_measure();
            }
            if let Err(e) = grid.set_activated(measure, note.register, step, &note.key, true) {
                tracing::warn!("Skipping note at {:.3}s: {}", note.start_offset, e);
            }
        }
        grid
    }

    /// Appends an empty measure laid out from the instrument's registers.
    pub fn add_measure(&mut self) {
        let num = self.measures.len();
        let registers = self
            .instrument
            .registers
            .iter()
            .map(|register| GridRegister {
                num: register.num,
                steps: (0..self.steps_per_measure)
                    .map(|_| {
                        register
                            .notes
                            .iter()
                            .map(|n| GridCell {
                                letters: n.letters.clone(),
                                key: n.key.clone(),
                                activated: false,
                            })
                            .collect()
                    })
                    .collect(),
            })
            .collect();
        self.measures.push(Measure { num, registers });
    }

    pub fn measures(&self) -> &[Measure] {
        &self.measures
    }

    pub fn instrument(&self) -> &InstrumentConfig {
        &self.instrument
    }

    /// Tempo in beats per minute.
    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    /// Changes the tempo, which moves every step.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::Tempo`] unless `tempo` is finite and positive.
    pub fn set_tempo(&mut self, tempo: f64) -> Result<(), GridError> {
        if !is_valid_tempo(tempo) {
            return Err(GridError::Tempo(tempo));
        }
        self.tempo = tempo;
        Ok(())
    }

    pub fn steps_per_measure(&self) -> usize {
        self.steps_per_measure
    }

    /// Length of one step (a sixteenth note) in seconds.
    pub fn step_seconds(&self) -> f64 {
        15.0 / self.tempo
    }

    /// Onset of the given step in seconds. The very first step is exactly 0.
    pub fn step_offset(&self, measure: usize, step: usize) -> f64 {
        let index = measure * self.steps_per_measure + step;
        if index == 0 {
            0.0
        } else {
            index as f64 * self.step_seconds()
        }
    }

    fn cell_mut(
        &mut self,
        measure: usize,
        register: i32,
        step: usize,
        key: &str,
    ) -> Result<&mut GridCell, GridError> {
        let steps_per_measure = self.steps_per_measure;
        let row = self
            .measures
            .get_mut(measure)
            .ok_or(GridError::Measure(measure))?
            .registers
            .iter_mut()
            .find(|r| r.num == register)
            .ok_or(GridError::Register(register))?;
        if step >= steps_per_measure {
            return Err(GridError::Step(step));
        }
        row.steps[step]
            .iter_mut()
            .find(|c| c.key == key)
            .ok_or_else(|| GridError::Key(key.to_string()))
    }

    /// Switches a cell on or off.
    ///
    /// # Errors
    ///
    /// Returns a [`GridError`] if the position does not exist.
    pub fn set_activated(
        &mut self,
        measure: usize,
        register: i32,
        step: usize,
        key: &str,
        activated: bool,
    ) -> Result<(), GridError> {
        self.cell_mut(measure, register, step, key)?.activated = activated;
        Ok(())
    }

    /// Flips a cell and returns its new state.
    ///
    /// # Errors
    ///
    /// Returns a [`GridError`] if the position does not exist.
    pub fn toggle(
        &mut self,
        measure: usize,
        register: i32,
        step: usize,
        key: &str,
    ) -> Result<bool, GridError> {
        let cell = self.cell_mut(measure, register, step, key)?;
        cell.activated = !cell.activated;
        Ok(cell.activated)
    }

    pub fn is_activated(&self, measure: usize, register: i32, step: usize, key: &str) -> bool {
        self.measures
            .get(measure)
            .and_then(|m| m.registers.iter().find(|r| r.num == register))
            .and_then(|r| r.steps.get(step))
            .is_some_and(|cells| cells.iter().any(|c| c.key == key && c.activated))
    }

    /// Every activated cell as a timeline note, in grid order.
    pub fn notes(&self) -> Vec<Note> {
        let step_seconds = self.step_seconds();
        let mut notes = Vec::new();
        for measure in &self.measures {
            for register in &measure.registers {
                for (step, cells) in register.steps.iter().enumerate() {
                    let offset = self.step_offset(measure.num, step);
                    notes.extend(
                        cells
                            .iter()
                            .filter(|c| c.activated)
                            .map(|c| Note::new(offset, step_seconds, register.num, c.key.clone())),
                    );
                }
            }
        }
        notes
    }

    /// One second past the last activated step, or 0 for an empty grid.
    pub fn track_duration(&self) -> f64 {
        self.notes()
            .iter()
            .map(|n| n.start_offset)
            .fold(None, |last: Option<f64>, o| Some(last.map_or(o, |l| l.max(o))))
            .map_or(0.0, |last| last + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MidiNote;
    use crate::timeline::{Timeline, TimelineSource};

    fn grid() -> Grid {
        Grid::new(&InstrumentConfig::harp(), 120.0, 16)
    }

    #[test]
    fn test_new_grid_layout() {
        let grid = grid();
        assert_eq!(grid.measures().len(), 1);
        let measure = &grid.measures()[0];
        assert_eq!(measure.registers.len(), 3);
        assert_eq!(measure.registers[0].steps.len(), 16);
        assert_eq!(measure.registers[0].steps[0].len(), 8);
        assert!(grid.notes().is_empty());
    }

    #[test]
    fn test_step_offset() {
        let grid = grid();
        assert_eq!(grid.step_offset(0, 0), 0.0);
        assert!((grid.step_offset(1, 2) - 2.25).abs() < 1e-9);
        assert!((grid.step_offset(0, 1) - 0.125).abs() < 1e-9);
    }

    #[test]
    fn test_toggle_and_errors() {
        let mut grid = grid();
        assert_eq!(grid.toggle(0, 1, 3, "5"), Ok(true));
        assert!(grid.is_activated(0, 1, 3, "5"));
        assert_eq!(grid.toggle(0, 1, 3, "5"), Ok(false));
        assert!(!grid.is_activated(0, 1, 3, "5"));

        assert_eq!(grid.toggle(1, 1, 0, "1"), Err(GridError::Measure(1)));
        assert_eq!(grid.toggle(0, 7, 0, "1"), Err(GridError::Register(7)));
        assert_eq!(grid.toggle(0, 1, 16, "1"), Err(GridError::Step(16)));
        assert_eq!(grid.toggle(0, 1, 0, "x"), Err(GridError::Key("x".to_string())));
    }

    #[test]
    fn test_grid_timeline() {
        let mut grid = grid();
        grid.add_measure();
        grid.set_activated(0, 0, 0, "1", true).unwrap();
        grid.set_activated(0, 2, 0, "4", true).unwrap();
        grid.set_activated(1, 1, 2, "8", true).unwrap();

        let timeline = Timeline::build(TimelineSource::Grid(&grid));
        assert_eq!(timeline.note_count(), 3);
        let onsets: Vec<f64> = timeline.onsets().map(|o| o.seconds()).collect();
        assert_eq!(onsets.len(), 2);
        assert_eq!(onsets[0], 0.0);
        assert!((onsets[1] - 2.25).abs() < 1e-9);
        assert!((timeline.duration() - 3.25).abs() < 1e-9);
    }

    #[test]
    fn test_empty_grid_duration() {
        let grid = grid();
        assert_eq!(grid.track_duration(), 0.0);
        let timeline = Timeline::build(TimelineSource::Grid(&grid));
        assert!(timeline.is_empty());
    }

    #[test]
    fn test_from_midi_track() {
        let track = MidiTrack {
            name: "lead".to_string(),
            instrument: String::new(),
            notes: vec![
                MidiNote::new(0.0, 0.1, 1, "C", "1"),
                // slightly late, snaps up to step 1
                MidiNote::new(0.1, 0.1, 2, "E", "3"),
                // beyond the first measure at 120 BPM (2s per measure)
                MidiNote::new(2.25, 0.1, 0, "G", "5"),
                MidiNote::new(0.5, 0.1, 9, "G", "5"),
            ],
            end_seconds: 3.0,
        };
        let grid = Grid::from_midi_track(&track, &InstrumentConfig::harp(), 120.0, 16);
        assert_eq!(grid.measures().len(), 2);
        assert!(grid.is_activated(0, 1, 0, "1"));
        assert!(grid.is_activated(0, 2, 1, "3"));
        assert!(grid.is_activated(1, 0, 2, "5"));
        assert_eq!(grid.notes().len(), 3);
    }

    #[test]
    fn test_on_grid_onsets_keep_their_step() {
        // 100 BPM, 480 ticks per beat: sixteenth k sits at tick k * 120
        let notes = (0..64u64)
            .map(|k| {
                let seconds = (k * 120) as f64 / 480.0 * 600_000.0 / 1_000_000.0;
                MidiNote::new(seconds, 0.1, 1, "C", "1")
            })
            .collect();
        let track = MidiTrack {
            name: "sixteenths".to_string(),
            instrument: String::new(),
            notes,
            end_seconds: 10.0,
        };
        let grid = Grid::from_midi_track(&track, &InstrumentConfig::harp(), 100.0, 16);
        assert_eq!(grid.measures().len(), 4);
        for k in 0..64 {
            assert!(grid.is_activated(k / 16, 1, k % 16, "1"), "sixteenth {}", k);
        }
        assert_eq!(grid.notes().len(), 64);

        // a note just after a step still moves to the next one
        let late = MidiTrack {
            notes: vec![MidiNote::new(0.16, 0.1, 1, "C", "1")],
            ..track
        };
        let grid = Grid::from_midi_track(&late, &InstrumentConfig::harp(), 100.0, 16);
        assert!(grid.is_activated(0, 1, 2, "1"));
    }

    #[test]
    fn test_invalid_tempo() {
        let grid = Grid::new(&InstrumentConfig::harp(), 0.0, 16);
        assert_eq!(grid.tempo(), DEFAULT_TEMPO);
        assert!(grid.step_seconds().is_finite());

        let mut grid = Grid::new(&InstrumentConfig::harp(), f64::NAN, 16);
        assert_eq!(grid.tempo(), DEFAULT_TEMPO);
        assert_eq!(grid.set_tempo(-5.0), Err(GridError::Tempo(-5.0)));
        assert_eq!(grid.set_tempo(90.0), Ok(()));
        assert_eq!(grid.tempo(), 90.0);

        let mut json = serde_json::to_value(&grid).unwrap();
        json["tempo"] = serde_json::json!(0.0);
        assert!(serde_json::from_value::<Grid>(json).is_err());
    }
}
