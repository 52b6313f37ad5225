//! Real-time playback on a background thread.
//!
//! The controller owns a [`TickEngine`] and a loop thread that advances it by
//! the wall-clock time elapsed since the previous iteration, switches the
//! instrument register when needed, and taps the due keys through an
//! [`InputSink`]. Playback is controlled from other threads through
//! [`play`](PlaybackController::play), [`pause`](PlaybackController::pause)
//! and [`stop`](PlaybackController::stop).

use super::tick::{Action, TickEngine};
use crate::config::{InstrumentConfig, Settings};
use crate::input::InputSink;
use crate::timeline::Timeline;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Represents the current playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Not playing, position reset to start.
    Stopped,
    /// Currently playing.
    Playing,
    /// Paused at current position.
    Paused,
}

/// Called from the playback thread when a track plays to its end.
pub type CompletionObserver = Arc<dyn Fn() + Send + Sync>;

/// Everything the loop thread mutates while playing.
struct Session {
    engine: TickEngine,
    /// Register the target application is currently in.
    current_register: i32,
}

/// State shared between the controller and its loop thread.
struct Shared {
    state: Mutex<PlaybackState>,
    /// Wakes a paused loop on play or stop.
    wake: Condvar,
    session: Mutex<Session>,
    sink: Arc<dyn InputSink>,
    settings: Settings,
    on_complete: Mutex<Option<CompletionObserver>>,
}

/// Locks a mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Joins a loop thread, unless called from that very thread.
fn join_unless_current(handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        tracing::error!("Playback thread panicked");
    }
}

impl Shared {
    /// Blocks while paused. Returns false once stopped. Resets `last` after
    /// a pause so the paused time is not played through.
    fn wait_while_paused(&self, last: &mut Instant) -> bool {
        let mut state = lock(&self.state);
        let mut paused = false;
        while *state == PlaybackState::Paused {
            paused = true;
            state = self.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if *state == PlaybackState::Stopped {
            return false;
        }
        if paused {
            *last = Instant::now();
        }
        true
    }

    /// Steps the instrument one register at a time from `from` until it is
    /// in the register the action asks for. The session lock is only taken
    /// to record each step, never across the swap delays.
    fn switch_register(&self, from: i32, action: &Action) {
        let Some(target) = action.chosen_register else {
            return;
        };
        let mut current = from;
        while current != target {
            let distance = target - current;
            let key = if distance > 0 {
                &self.settings.register_up_key
            } else {
                &self.settings.register_down_key
            };
            let next = current + distance.signum();
            tracing::info!("Swapping register {} -> {} (target {})", current, next, target);
            self.sink.send_input(key);
            current = next;
            lock(&self.session).current_register = current;

            let delay = self.settings.register_swap_delay(distance);
            tracing::debug!("Waiting register swap delay: {:?}", delay);
            thread::sleep(delay);
        }
    }

    fn play_notes(&self, action: &Action) {
        let mut played = 0;
        for note in action.playable() {
            tracing::info!("Sending input key: {}", note.key);
            self.sink.send_input(&note.key);
            played += 1;
        }
        if played < action.notes.len() {
            tracing::debug!(
                "Dropped {} notes outside register {:?}",
                action.notes.len() - played,
                action.chosen_register
            );
        }
    }

    fn notify_complete(&self) {
        let observer = lock(&self.on_complete).clone();
        if let Some(observer) = observer {
            observer();
        }
    }

    /// Moves to `Stopped` unless a `stop()` got there first. Returns true if
    /// this call made the transition.
    fn finish(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == PlaybackState::Stopped {
            return false;
        }
        *state = PlaybackState::Stopped;
        true
    }

    fn run(&self) {
        if !lock(&self.session).engine.has_data() {
            tracing::warn!("Nothing to play");
            self.finish();
            return;
        }

        let poll_interval = self.settings.poll_interval();
        let mut last = Instant::now();
        while self.wait_while_paused(&mut last) {
            let now = Instant::now();
            let delta = now.duration_since(last);
            last = now;

            let (action, register) = {
                let mut session = lock(&self.session);
                let action = session.engine.advance(delta.as_secs_f64());
                if action.end_reached {
                    session.engine.reset();
                }
                (action, session.current_register)
            };
            self.switch_register(register, &action);
            self.play_notes(&action);

            if action.end_reached {
                // Nothing past this point touches the session, so a new loop
                // may start while the observer runs.
                if self.finish() {
                    tracing::info!("Reached end of track");
                    self.notify_complete();
                }
                break;
            }
            thread::sleep(poll_interval);
        }
        tracing::debug!("Playback loop exited");
    }
}

/// Plays a timeline in real time through an input sink.
pub struct PlaybackController {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Serializes `play`, `stop` and `assign` so a stop finishes joining
    /// before another loop can be spawned.
    transport: Mutex<()>,
}

impl PlaybackController {
    /// Creates a stopped controller.
    ///
    /// # Arguments
    ///
    /// * `instrument` - Provides the register the target application starts in
    /// * `settings` - Register policy, poll interval, swap keys and delays
    /// * `sink` - Receives every key press
    ///
    /// # Returns
    ///
    /// A controller with no timeline assigned
    pub fn new(
        instrument: &InstrumentConfig,
        settings: &Settings,
        sink: Arc<dyn InputSink>,
    ) -> Self {
        let session = Session {
            engine: TickEngine::new(settings.register_policy),
            current_register: instrument.starting_register,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PlaybackState::Stopped),
                wake: Condvar::new(),
                session: Mutex::new(session),
                sink,
                settings: settings.clone(),
                on_complete: Mutex::new(None),
            }),
            thread: Mutex::new(None),
            transport: Mutex::new(()),
        }
    }

    /// Stops playback and switches to a new timeline.
    pub fn assign(&self, timeline: Arc<Timeline>) {
        let _transport = lock(&self.transport);
        self.stop_running();
        tracing::info!(
            "Assigned timeline: {} notes, {:.2}s",
            timeline.note_count(),
            timeline.duration()
        );
        lock(&self.shared.session).engine.assign(timeline);
    }

    /// Registers a callback for when playback reaches the end of the track.
    pub fn set_on_complete<F>(&self, observer: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.shared.on_complete) = Some(Arc::new(observer));
    }

    /// Returns true if a non-empty timeline is assigned.
    pub fn has_data(&self) -> bool {
        lock(&self.shared.session).engine.has_data()
    }

    /// Starts playback from the current position, or resumes it if paused.
    /// Does nothing while already playing.
    pub fn play(&self) {
        let _transport = lock(&self.transport);
        let mut state = lock(&self.shared.state);
        match *state {
            PlaybackState::Playing => return,
            PlaybackState::Paused => {
                *state = PlaybackState::Playing;
                self.shared.wake.notify_all();
                tracing::info!("Playback resumed");
                return;
            }
            PlaybackState::Stopped => {}
        }

        *state = PlaybackState::Playing;
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || shared.run())
        {
            Ok(handle) => {
                // A handle still stored here belongs to a loop that ran to the
                // end on its own and is past its last session access; replacing
                // it detaches that thread.
                *lock(&self.thread) = Some(handle);
                tracing::info!("Playback started");
            }
            Err(e) => {
                tracing::error!("Failed to spawn playback thread: {}", e);
                *state = PlaybackState::Stopped;
            }
        }
    }

    /// Pauses playback. Does nothing unless playing.
    pub fn pause(&self) {
        let mut state = lock(&self.shared.state);
        if *state == PlaybackState::Playing {
            *state = PlaybackState::Paused;
            tracing::info!("Playback paused");
        }
    }

    /// Stops playback, waits for the loop thread to exit, and rewinds to the
    /// start. Does nothing while stopped. Safe to call from any thread.
    pub fn stop(&self) {
        let _transport = lock(&self.transport);
        self.stop_running();
    }

    /// Stops the running loop. The caller holds the transport lock.
    fn stop_running(&self) {
        let running = {
            let mut state = lock(&self.shared.state);
            if *state == PlaybackState::Stopped {
                return;
            }
            *state = PlaybackState::Stopped;
            self.shared.wake.notify_all();
            lock(&self.thread).take()
        };

        if let Some(handle) = running {
            join_unless_current(handle);
        }
        lock(&self.shared.session).engine.reset();
        tracing::info!("Playback stopped");
    }

    pub fn state(&self) -> PlaybackState {
        *lock(&self.shared.state)
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state() == PlaybackState::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == PlaybackState::Stopped
    }

    /// Virtual playback position in seconds.
    pub fn position(&self) -> f64 {
        lock(&self.shared.session).engine.clock()
    }

    /// Register the target application is believed to be in.
    pub fn current_register(&self) -> i32 {
        lock(&self.shared.session).current_register
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = lock(&self.thread).take() {
            join_unless_current(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::RecordingSink;
    use crate::timeline::Note;
    use std::sync::mpsc;
    use std::time::Duration;

    fn fast_settings() -> Settings {
        Settings {
            register_swap_delay_ms: 1,
            register_swap_long_delay_ms: 5,
            ..Settings::default()
        }
    }

    fn controller(notes: Vec<Note>, duration: f64) -> (PlaybackController, RecordingSink) {
        let sink = RecordingSink::new();
        let controller = PlaybackController::new(
            &InstrumentConfig::harp(),
            &fast_settings(),
            Arc::new(sink.clone()),
        );
        controller.assign(Arc::new(Timeline::from_notes(notes, duration)));
        (controller, sink)
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_empty_controller_stops_immediately() {
        let sink = RecordingSink::new();
        let controller = PlaybackController::new(
            &InstrumentConfig::harp(),
            &fast_settings(),
            Arc::new(sink.clone()),
        );
        assert!(!controller.has_data());
        controller.play();
        assert!(wait_for(|| controller.is_stopped()));
        assert!(sink.keys().is_empty());
    }

    #[test]
    fn test_plays_to_end_with_register_switches() {
        let (controller, sink) = controller(
            vec![
                Note::new(0.0, 0.1, 1, "1"),
                Note::new(0.2, 0.1, 2, "2"),
                Note::new(0.4, 0.1, 0, "3"),
            ],
            0.6,
        );
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        controller.set_on_complete(move || {
            let _ = lock(&tx).send(());
        });

        controller.play();
        assert!(controller.is_playing());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(wait_for(|| controller.is_stopped()));
        assert_eq!(sink.keys(), vec!["1", "0", "2", "9", "9", "3"]);
        assert_eq!(controller.current_register(), 0);
        assert_eq!(controller.position(), 0.0);
    }

    #[test]
    fn test_drops_notes_outside_chosen_register() {
        let (controller, sink) = controller(
            vec![Note::new(0.0, 0.1, 1, "1"), Note::new(0.0, 0.1, 2, "7")],
            0.1,
        );
        controller.play();
        assert!(wait_for(|| controller.is_stopped()));
        assert_eq!(sink.keys(), vec!["1"]);
    }

    #[test]
    fn test_play_pause_no_ops() {
        let (controller, _sink) = controller(vec![Note::new(0.0, 0.1, 1, "1")], 30.0);
        controller.pause();
        assert!(controller.is_stopped());

        controller.play();
        controller.play();
        assert!(controller.is_playing());
        controller.pause();
        controller.pause();
        assert!(controller.is_paused());
        controller.play();
        assert!(controller.is_playing());

        controller.stop();
        controller.stop();
        assert!(controller.is_stopped());
    }

    #[test]
    fn test_stop_wakes_paused_loop() {
        let (controller, _sink) = controller(vec![Note::new(0.0, 0.1, 1, "1")], 30.0);
        controller.play();
        controller.pause();
        thread::sleep(Duration::from_millis(30));
        controller.stop();
        assert!(controller.is_stopped());
        assert_eq!(controller.position(), 0.0);
    }

    #[test]
    fn test_replay_after_stop_fires_again() {
        let (controller, sink) = controller(vec![Note::new(0.0, 0.1, 1, "1")], 30.0);
        controller.play();
        assert!(wait_for(|| sink.keys().len() == 1));
        controller.stop();
        assert_eq!(controller.position(), 0.0);

        controller.play();
        assert!(wait_for(|| sink.keys().len() == 2));
        controller.stop();
        assert_eq!(sink.keys(), vec!["1", "1"]);
    }

    #[test]
    fn test_pause_time_not_counted() {
        let (controller, _sink) = controller(vec![Note::new(0.0, 0.1, 1, "1")], 100.0);
        controller.play();
        thread::sleep(Duration::from_millis(100));
        controller.pause();
        thread::sleep(Duration::from_millis(30));
        let paused_at = controller.position();
        assert!(paused_at > 0.0);

        thread::sleep(Duration::from_millis(400));
        assert_eq!(controller.position(), paused_at);

        controller.play();
        thread::sleep(Duration::from_millis(50));
        controller.pause();
        thread::sleep(Duration::from_millis(30));
        let resumed_for = controller.position() - paused_at;
        assert!(resumed_for < 0.25, "paused time leaked: {}", resumed_for);
        controller.stop();
    }

    #[test]
    fn test_concurrent_play_and_stop_settle() {
        let (controller, sink) = controller(vec![Note::new(0.0, 0.1, 1, "1")], 30.0);
        let controller = Arc::new(controller);
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let controller = Arc::clone(&controller);
                thread::spawn(move || {
                    for _ in 0..50 {
                        if i % 2 == 0 {
                            controller.play();
                        } else {
                            controller.stop();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        controller.stop();
        assert!(controller.is_stopped());
        assert_eq!(controller.position(), 0.0);
        // no loop survives the final stop
        let emitted = sink.keys().len();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.keys().len(), emitted);
        assert_eq!(controller.position(), 0.0);
    }

    #[test]
    fn test_queries_not_blocked_by_register_swap() {
        let sink = RecordingSink::new();
        let settings = Settings {
            register_swap_delay_ms: 400,
            register_swap_long_delay_ms: 400,
            ..Settings::default()
        };
        let controller =
            PlaybackController::new(&InstrumentConfig::harp(), &settings, Arc::new(sink.clone()));
        controller.assign(Arc::new(Timeline::from_notes(
            vec![Note::new(0.0, 0.1, 3, "1")],
            30.0,
        )));

        controller.play();
        assert!(wait_for(|| controller.current_register() == 2));
        let started = Instant::now();
        let _ = controller.position();
        let _ = controller.current_register();
        assert!(controller.has_data());
        assert!(started.elapsed() < Duration::from_millis(200));

        controller.stop();
        assert_eq!(sink.keys(), vec!["0", "0", "1"]);
    }
}
