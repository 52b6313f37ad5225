//! midikeys - plays MIDI files and step grids as key presses.
//!
//! # Usage
//!
//! ```bash
//! midikeys song.mid                       # log keys instead of pressing them
//! midikeys song.mid --udp 192.168.1.5:4000
//! midikeys song.mid --grid --save song.json
//! ```
//!
//! While playing, `space` pauses and resumes, `s` stops and `q` quits.

use anyhow::{bail, Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use midikeys::config::DEFAULT_INSTRUMENT;
use midikeys::{
    import_from_midi, Grid, InputSink, InstrumentConfig, Instruments, LogSink, PlaybackController,
    Project, ProjectSource, RegisterPolicy, Settings, UdpSink,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Command-line options for the application.
struct CliOptions {
    /// MIDI file (`.mid`) or saved project (`.json`, `.mkp`).
    input: PathBuf,
    instrument: Option<String>,
    /// Directory holding `instruments.json` and one file per instrument.
    instruments_dir: Option<PathBuf>,
    settings: Option<PathBuf>,
    policy: Option<RegisterPolicy>,
    track: Option<usize>,
    udp: Option<String>,
    /// Convert the MIDI track into a step grid before playing.
    grid: bool,
    save: Option<PathBuf>,
    /// Play to the end without reading transport keys.
    headless: bool,
}

fn print_help(program: &str) {
    eprintln!("midikeys - play songs on keyboard-driven instruments");
    eprintln!();
    eprintln!("Usage: {} <FILE> [OPTIONS]", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -i, --instrument NAME   Instrument to map notes for (default: harp)");
    eprintln!("  -c, --config DIR        Load instruments from DIR/instruments.json");
    eprintln!("      --settings PATH     Load playback settings from a JSON file");
    eprintln!("  -p, --policy NAME       Register policy: lowest, highest or most");
    eprintln!("  -t, --track N           Track to play (default: first with notes)");
    eprintln!("  -u, --udp ADDR          Send keys to a UDP listener instead of logging");
    eprintln!("  -g, --grid              Quantize the MIDI track into a step grid");
    eprintln!("  -s, --save PATH         Save the project (.json or binary .mkp)");
    eprintln!("      --headless          Play to the end without transport keys");
    eprintln!("  -h, --help              Print this help message");
}

impl CliOptions {
    /// Parses command-line arguments.
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let program = args.first().map_or("midikeys", String::as_str);
        let mut input = None;
        let mut options = Self {
            input: PathBuf::new(),
            instrument: None,
            instruments_dir: None,
            settings: None,
            policy: None,
            track: None,
            udp: None,
            grid: false,
            save: None,
            headless: false,
        };

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            let mut value = || -> Result<String> {
                i += 1;
                args.get(i)
                    .cloned()
                    .with_context(|| format!("{} requires a value", flag))
            };
            match flag {
                "--instrument" | "-i" => options.instrument = Some(value()?),
                "--config" | "-c" => options.instruments_dir = Some(PathBuf::from(value()?)),
                "--settings" => options.settings = Some(PathBuf::from(value()?)),
                "--policy" | "-p" => {
                    let name = value()?;
                    options.policy = Some(
                        RegisterPolicy::from_name(&name)
                            .with_context(|| format!("Unknown register policy: {}", name))?,
                    );
                }
                "--track" | "-t" => {
                    let n = value()?;
                    options.track = Some(n.parse().with_context(|| format!("Bad track: {}", n))?);
                }
                "--udp" | "-u" => options.udp = Some(value()?),
                "--grid" | "-g" => options.grid = true,
                "--save" | "-s" => options.save = Some(PathBuf::from(value()?)),
                "--headless" => options.headless = true,
                "--help" | "-h" => {
                    print_help(program);
                    std::process::exit(0);
                }
                other if other.starts_with('-') => {
                    bail!("Unknown option: {} (use --help for usage)", other)
                }
                other => {
                    if input.is_some() {
                        bail!("Only one input file can be played");
                    }
                    input = Some(PathBuf::from(other));
                }
            }
            i += 1;
        }

        match input {
            Some(path) => options.input = path,
            None => {
                print_help(program);
                bail!("No input file given");
            }
        }
        Ok(options)
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Loads a saved project or imports a MIDI file.
fn load_project(
    cli: &CliOptions,
    instrument: &InstrumentConfig,
    settings: &Settings,
) -> Result<Project> {
    let path = &cli.input;
    if has_extension(path, "json") {
        return Project::load_from_file(path)
            .with_context(|| format!("Failed to load project {}", path.display()));
    }
    if has_extension(path, "mkp") {
        return Project::load_from_binary(path)
            .with_context(|| format!("Failed to load project {}", path.display()));
    }

    let song = import_from_midi(path, instrument)
        .with_context(|| format!("Failed to import {}", path.display()))?;
    tracing::info!(
        "Imported {} with {} tracks, {:.1}s",
        song.name,
        song.tracks.len(),
        song.duration_seconds()
    );

    if !cli.grid {
        return Ok(Project::from_midi(song, &instrument.name));
    }
    let index = cli.track.or_else(|| song.first_playable_track()).unwrap_or(0);
    let track = song
        .track(index)
        .with_context(|| format!("Track {} does not exist", index))?;
    let tempo = if song.tempo > 0.0 { song.tempo } else { settings.default_tempo };
    let grid = Grid::from_midi_track(track, instrument, tempo, settings.steps_per_measure);
    tracing::info!("Converted track {} into {} measures", index, grid.measures().len());
    Ok(Project::from_grid(song.name.clone(), grid))
}

fn save_project(project: &Project, path: &Path) -> Result<()> {
    if has_extension(path, "json") {
        project.save_to_file(path)
    } else {
        project.save_to_binary(path)
    }
    .with_context(|| format!("Failed to save project to {}", path.display()))?;
    tracing::info!("Saved project to {}", path.display());
    Ok(())
}

/// Leaves raw mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Reads transport keys until playback finishes or the user quits.
fn run_transport(controller: &PlaybackController, finished: &AtomicBool) -> Result<()> {
    let _raw = RawModeGuard::enable()?;
    controller.play();

    while !finished.load(Ordering::SeqCst) {
        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match key.code {
                KeyCode::Char(' ') => {
                    if controller.is_playing() {
                        controller.pause();
                    } else {
                        controller.play();
                    }
                }
                KeyCode::Char('s') => controller.stop(),
                KeyCode::Char('q') | KeyCode::Esc => break,
                _ => {}
            }
        }
    }
    controller.stop();
    Ok(())
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(policy) = cli.policy {
        settings.register_policy = policy;
    }

    let instruments = match &cli.instruments_dir {
        Some(dir) => Instruments::load_dir(dir)?,
        None => Instruments::builtin(),
    };
    let names: Vec<&str> = instruments.names().collect();
    tracing::debug!("Available instruments: {}", names.join(", "));

    let instrument_name = cli.instrument.as_deref().unwrap_or(DEFAULT_INSTRUMENT);
    let project = load_project(&cli, instruments.get(instrument_name)?, &settings)?;
    // A saved project remembers which instrument its notes were mapped for.
    let instrument = match &project.source {
        ProjectSource::Grid(grid) => grid.instrument(),
        ProjectSource::Midi(_) => instruments.get(&project.instrument)?,
    };

    if let Some(path) = &cli.save {
        save_project(&project, path)?;
    }

    let track = match &project.source {
        ProjectSource::Midi(song) => cli
            .track
            .or_else(|| song.first_playable_track())
            .unwrap_or(0),
        ProjectSource::Grid(_) => 0,
    };
    let timeline = project
        .timeline(track)
        .with_context(|| format!("Track {} does not exist", track))?;
    if timeline.is_empty() {
        tracing::warn!("Track {} has no playable notes", track);
        return Ok(());
    }
    tracing::info!(
        "Playing {} track {} on {} ({} notes, {:.1}s)",
        project.name,
        track,
        instrument.name,
        timeline.note_count(),
        timeline.duration()
    );

    let sink: Arc<dyn InputSink> = match &cli.udp {
        Some(addr) => Arc::new(
            UdpSink::connect(addr.as_str())
                .with_context(|| format!("Failed to open UDP sink for {}", addr))?,
        ),
        None => Arc::new(LogSink),
    };

    let controller = PlaybackController::new(instrument, &settings, sink);
    controller.assign(Arc::new(timeline));

    let finished = Arc::new(AtomicBool::new(false));
    let on_complete = Arc::clone(&finished);
    controller.set_on_complete(move || on_complete.store(true, Ordering::SeqCst));

    if cli.headless {
        controller.play();
        while !finished.load(Ordering::SeqCst) && !controller.is_stopped() {
            std::thread::sleep(Duration::from_millis(50));
        }
        controller.stop();
    } else {
        run_transport(&controller, &finished)?;
    }

    tracing::info!("Done");
    Ok(())
}
