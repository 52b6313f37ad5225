//! Instrument key maps and playback settings.
//!
//! Instruments describe which keyboard key plays which note on the target
//! application, grouped into registers (octaves) of which only one is
//! reachable at a time. They are loaded from a config directory laid out as:
//!
//! ```text
//! config/
//!   instruments.json   # ["harp", "bell", ...]
//!   harp.json          # one InstrumentConfig per listed name
//!   bell.json
//! ```
//!
//! Nothing here is global: callers build an [`Instruments`] and a
//! [`Settings`] once and hand references to the timeline builders and the
//! playback controller.

use crate::playback::RegisterPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Name of the index file inside a config directory.
const INDEX_FILE: &str = "instruments.json";

/// Instrument used when nothing else is requested.
pub const DEFAULT_INSTRUMENT: &str = "harp";

/// Errors raised while loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown instrument: {0}")]
    UnknownInstrument(String),
}

/// One playable key within a register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
    /// MIDI octave this key sounds in (C4 = middle C, octave 4).
    #[serde(alias = "midi_octave")]
    pub midi_register: i32,
    /// Note letters this key answers to, e.g. `["C", "B#"]`.
    pub letters: Vec<String>,
    /// Logical key name handed to the input sink.
    pub key: String,
}

/// A register (octave) of the instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub num: i32,
    pub notes: Vec<KeyConfig>,
}

/// Key layout of a single instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    #[serde(default)]
    pub name: String,
    /// Whether the instrument sustains notes while the key is held.
    /// Recorded for completeness; playback only taps keys.
    #[serde(default)]
    pub supports_held_notes: bool,
    /// Register the target application starts in.
    #[serde(alias = "starting_octave")]
    pub starting_register: i32,
    #[serde(alias = "octaves")]
    pub registers: Vec<RegisterConfig>,
}

impl InstrumentConfig {
    /// Built-in harp: three registers covering MIDI octaves 3 to 5, keys
    /// `1` through `8` in each, starting in the middle register.
    pub fn harp() -> Self {
        let registers = (0..3)
            .map(|num| RegisterConfig {
                num,
                notes: diatonic_keys(num + 3),
            })
            .collect();
        Self {
            name: DEFAULT_INSTRUMENT.to_string(),
            supports_held_notes: false,
            starting_register: 1,
            registers,
        }
    }

    /// Finds the register and key that play `letter` in `midi_octave`.
    ///
    /// Registers are searched in order, so a letter reachable from two
    /// registers resolves to the first one listed.
    ///
    /// # Arguments
    ///
    /// * `midi_octave` - Octave of the note, with middle C in octave 4
    /// * `letter` - Note letter such as `"C"` or `"F#"`
    ///
    /// # Returns
    ///
    /// The register number and key config, or `None` if the instrument
    /// cannot play the note
    pub fn key_for(&self, midi_octave: i32, letter: &str) -> Option<(i32, &KeyConfig)> {
        self.registers.iter().find_map(|register| {
            register
                .notes
                .iter()
                .find(|n| n.midi_register == midi_octave && n.letters.iter().any(|l| l == letter))
                .map(|n| (register.num, n))
        })
    }

    /// Returns the register with the given number.
    pub fn register(&self, num: i32) -> Option<&RegisterConfig> {
        self.registers.iter().find(|r| r.num == num)
    }
}

/// Keys `1`..`8` spanning C to the C above, starting at `midi_octave`.
fn diatonic_keys(midi_octave: i32) -> Vec<KeyConfig> {
    let scale: [(&[&str], i32); 8] = [
        (&["C", "B#"], 0),
        (&["D"], 0),
        (&["E", "Fb"], 0),
        (&["F", "E#"], 0),
        (&["G"], 0),
        (&["A"], 0),
        (&["B", "Cb"], 0),
        (&["C", "B#"], 1),
    ];
    scale
        .iter()
        .enumerate()
        .map(|(i, (letters, octave_shift))| KeyConfig {
            midi_register: midi_octave + octave_shift,
            letters: letters.iter().map(|l| l.to_string()).collect(),
            key: (i + 1).to_string(),
        })
        .collect()
}

/// All known instruments, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Instruments {
    instruments: BTreeMap<String, InstrumentConfig>,
}

impl Instruments {
    /// The built-in instrument set.
    pub fn builtin() -> Self {
        let mut instruments = Self::default();
        instruments.insert(InstrumentConfig::harp());
        instruments
    }

    /// Loads every instrument listed in `dir/instruments.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the index or any listed instrument file is
    /// missing or malformed.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let names: Vec<String> = read_json(&dir.join(INDEX_FILE))?;

        let mut instruments = Self::default();
        for name in names {
            let mut instrument: InstrumentConfig = read_json(&dir.join(format!("{}.json", name)))?;
            tracing::debug!(
                "Loaded instrument {} with {} registers",
                name,
                instrument.registers.len()
            );
            instrument.name = name;
            instruments.insert(instrument);
        }
        Ok(instruments)
    }

    /// Adds or replaces an instrument.
    pub fn insert(&mut self, instrument: InstrumentConfig) {
        self.instruments.insert(instrument.name.clone(), instrument);
    }

    /// Looks up an instrument by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownInstrument`] if the name is not loaded.
    pub fn get(&self, name: &str) -> Result<&InstrumentConfig, ConfigError> {
        self.instruments
            .get(name)
            .ok_or_else(|| ConfigError::UnknownInstrument(name.to_string()))
    }

    /// Names of all loaded instruments, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.instruments.keys().map(String::as_str)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Playback and editing settings. Every field has a default, so a settings
/// file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How simultaneous notes in different registers are collapsed.
    pub register_policy: RegisterPolicy,
    /// Sleep between playback loop iterations.
    pub poll_interval_ms: u64,
    /// Key that moves the instrument one register up.
    pub register_up_key: String,
    /// Key that moves the instrument one register down.
    pub register_down_key: String,
    /// Delay after a register step when one step remains.
    pub register_swap_delay_ms: u64,
    /// Delay after a register step when more than one step remains; the
    /// target application animates each swap and drops rapid repeats.
    pub register_swap_long_delay_ms: u64,
    /// Grid resolution; 16 steps means sixteenth notes in 4/4.
    pub steps_per_measure: u32,
    /// Tempo for new grids.
    pub default_tempo: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            register_policy: RegisterPolicy::Lowest,
            poll_interval_ms: 10,
            register_up_key: "0".to_string(),
            register_down_key: "9".to_string(),
            register_swap_delay_ms: 10,
            register_swap_long_delay_ms: 200,
            steps_per_measure: 16,
            default_tempo: 120.0,
        }
    }
}

impl Settings {
    /// Reads settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        read_json(path.as_ref())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay to wait after a register step, given how many registers
    /// separated the current and the target register before the step.
    pub fn register_swap_delay(&self, distance: i32) -> Duration {
        if distance.abs() > 1 {
            Duration::from_millis(self.register_swap_long_delay_ms)
        } else {
            Duration::from_millis(self.register_swap_delay_ms)
        }
    }
}
