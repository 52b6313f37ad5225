//! The tick engine: a virtual clock walking a [`Timeline`].
//!
//! Each call to [`TickEngine::advance`] moves the clock forward and returns
//! an [`Action`] holding every note that became due and has not fired yet
//! during this run. Polls arrive at irregular intervals, so the engine looks
//! up the latest onset at or before the clock instead of an exact match;
//! a [`FiredSet`] keeps re-polls of the same onset from firing twice.

use super::policy::RegisterPolicy;
use crate::timeline::{NoteId, Onset, Timeline};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A note to be played this tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionNote {
    pub offset: f64,
    pub register: i32,
    pub key: String,
}

/// Output of a single tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Action {
    /// Notes that became due this tick, in timeline order.
    pub notes: Vec<ActionNote>,
    /// Register to play in, `None` when nothing is due.
    pub chosen_register: Option<i32>,
    /// Set on the first tick at or past the end of the timeline.
    pub end_reached: bool,
}

impl Action {
    /// Notes in the chosen register. The rest are dropped for this tick.
    pub fn playable(&self) -> impl Iterator<Item = &ActionNote> {
        self.notes
            .iter()
            .filter(move |n| Some(n.register) == self.chosen_register)
    }
}

/// Notes already emitted during the current run, per onset.
#[derive(Debug, Clone, Default)]
pub struct FiredSet {
    fired: HashMap<Onset, HashSet<NoteId>>,
}

impl FiredSet {
    /// Records a note; returns false if it was already recorded.
    pub fn insert(&mut self, onset: Onset, id: NoteId) -> bool {
        self.fired.entry(onset).or_default().insert(id)
    }

    pub fn contains(&self, onset: Onset, id: NoteId) -> bool {
        self.fired.get(&onset).is_some_and(|ids| ids.contains(&id))
    }

    /// Number of notes recorded.
    pub fn len(&self) -> usize {
        self.fired.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.fired.clear();
    }
}

/// Stateful scanner over a shared timeline.
#[derive(Debug, Clone)]
pub struct TickEngine {
    timeline: Option<Arc<Timeline>>,
    policy: RegisterPolicy,
    clock: f64,
    fired: FiredSet,
    end_signalled: bool,
}

impl TickEngine {
    pub fn new(policy: RegisterPolicy) -> Self {
        Self {
            timeline: None,
            policy,
            clock: 0.0,
            fired: FiredSet::default(),
            end_signalled: false,
        }
    }

    /// Replaces the timeline and starts a fresh run.
    pub fn assign(&mut self, timeline: Arc<Timeline>) {
        self.timeline = Some(timeline);
        self.reset();
    }

    /// Returns true if a non-empty timeline is assigned.
    pub fn has_data(&self) -> bool {
        self.timeline.as_ref().is_some_and(|t| !t.is_empty())
    }

    pub fn timeline(&self) -> Option<&Arc<Timeline>> {
        self.timeline.as_ref()
    }

    pub fn policy(&self) -> RegisterPolicy {
        self.policy
    }

    /// Current virtual time in seconds.
    pub fn clock(&self) -> f64 {
        self.clock
    }

    /// Notes fired so far in this run.
    pub fn fired(&self) -> &FiredSet {
        &self.fired
    }

    /// Rewinds to the start: clears fired notes, the clock and the end latch.
    /// The timeline is kept.
    pub fn reset(&mut self) {
        self.clock = 0.0;
        self.fired.clear();
        self.end_signalled = false;
    }

    /// Moves the clock forward by `delta` seconds and collects due notes.
    /// Negative deltas are ignored.
    ///
    /// # Arguments
    ///
    /// * `delta` - Seconds elapsed since the previous call
    ///
    /// # Returns
    ///
    /// The notes not yet fired at the latest onset at or before the clock,
    /// the register to play them in, and whether the end was just reached
    pub fn advance(&mut self, delta: f64) -> Action {
        if delta > 0.0 {
            self.clock += delta;
        }

        let mut action = Action::default();
        let Some(timeline) = self.timeline.as_ref() else {
            action.end_reached = self.latch_end();
            return action;
        };

        let ended = self.clock >= timeline.duration();

        if let Some(onset) = timeline.floor_onset(self.clock) {
            for note in timeline.bucket(onset) {
                if self.fired.insert(onset, note.id) {
                    action.notes.push(ActionNote {
                        offset: note.start_offset,
                        register: note.register,
                        key: note.key.clone(),
                    });
                }
            }
        }

        action.chosen_register = self.policy.resolve(action.notes.iter().map(|n| n.register));
        if ended {
            action.end_reached = self.latch_end();
        }

        tracing::debug!(
            "tick at {:.3}s: {} notes, register {:?}, end {}",
            self.clock,
            action.notes.len(),
            action.chosen_register,
            action.end_reached
        );
        action
    }

    /// Returns true only the first time the end is hit in a run.
    fn latch_end(&mut self) -> bool {
        !std::mem::replace(&mut self.end_signalled, true)
    }
}
