//! Time-based windowing operators.
//!
//! Every windowed operator buffers events in a state store and owns a
//! background timer that sweeps expired windows. Window mutation and the
//! close check are atomic per operator (the sweep lock); the timer collects
//! the windows to close under the lock and emits after releasing it, so user
//! callbacks never run while the lock is held on the timer path.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

pub use session::SessionWindow;
pub use sliding::SlidingWindow;
pub use tumbling::TumblingWindow;
pub use tumbling_all::{
    GlobalTumblingWindow, GlobalWindowCheckpoint, TimeMode, WINDOW_CHECKPOINT_KEY,
};

mod session;
mod sliding;
mod tumbling;
mod tumbling_all;

/// Identifies a closed keyed window: the user key plus the window (or
/// session) start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowKey<K> {
    pub key: K,
    pub start: Timestamp,
}

/// Identifies a closed global window by its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalWindowKey {
    pub start: Timestamp,
    pub end: Timestamp,
}

/// Buffered state of one open window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowState<T> {
    pub start: Timestamp,
    pub events: Vec<T>,
}

impl<T> WindowState<T> {
    pub fn open(start: Timestamp, first: T) -> Self {
        Self {
            start,
            events: vec![first],
        }
    }
}

/// Buffered state of one key's sliding-window grid: the anchor is the key's
/// first observed event time and every window start lies on
/// `anchor + k * slide`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingState<T> {
    pub anchor: Timestamp,
    pub windows: Vec<WindowState<T>>,
}

/// Buffered state of one open session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState<T> {
    pub start: Timestamp,
    pub last_event: Timestamp,
    pub events: Vec<T>,
}

/// Marker trait for the function that folds a closed window into its result.
pub trait WindowCombine<In, Out>: Fn(Vec<In>) -> Out + Send + Sync + 'static {}
impl<In, Out, T: Fn(Vec<In>) -> Out + Send + Sync + 'static> WindowCombine<In, Out> for T {}

/// Marker trait for key extractors shared with the timer thread.
pub trait WindowKeyer<Key, In>: Fn(&In) -> Key + Send + Sync + 'static {}
impl<Key, In, T: Fn(&In) -> Key + Send + Sync + 'static> WindowKeyer<Key, In> for T {}
