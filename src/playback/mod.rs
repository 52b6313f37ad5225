//! Playback scheduling: register policy, tick engine and the real-time
//! controller that drives them.

pub mod controller;
pub mod policy;
pub mod tick;

pub use controller::{CompletionObserver, PlaybackController, PlaybackState};
pub use policy::RegisterPolicy;
pub use tick::{Action, ActionNote, FiredSet, TickEngine};
