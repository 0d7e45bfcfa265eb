//! Turns raw per-eye openness samples into discrete blink edges.
//!
//! The gate is a two-state machine (open / closed) with a fixed closure
//! threshold and a debounce on the re-opening edge. It never actuates
//! anything itself; the caller decides what a [`BlinkEvent`] means.

use crate::Seconds;
use log::debug;
use serde::{Deserialize, Serialize};

/// One eye as reported by the eye tracker for a single tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeReading {
    /// Openness in `[0, 1]`, where `0` is fully closed.
    pub openness: f32,
    /// The tracker's validity flag for this eye.
    pub valid: bool,
}

impl EyeReading {
    /// A valid reading with the given openness.
    pub fn open(openness: f32) -> Self {
        Self {
            openness,
            valid: true,
        }
    }

    /// A reading the tracker flagged as unusable.
    pub fn invalid() -> Self {
        Self {
            openness: 0.0,
            valid: false,
        }
    }
}

/// Both eyes at one point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlinkSample {
    /// Left eye.
    pub left: EyeReading,
    /// Right eye.
    pub right: EyeReading,
    /// Host time of the sample, in seconds.
    pub timestamp_s: Seconds,
}

/// A blink edge derived by the [`BlinkGate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlinkEvent {
    /// Both eyes just closed.
    Onset(Seconds),
    /// The eyes re-opened after a blink that lasted long enough to count.
    Offset(Seconds),
}

/// Tunables for blink detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlinkConfig {
    /// An eye below this openness counts as closed.
    pub blink_threshold: f32,
    /// Minimum time between an onset and the offset that ends it.
    pub min_blink_interval_s: Seconds,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            blink_threshold: 0.3,
            min_blink_interval_s: 0.25,
        }
    }
}

/// Edge detector over [`BlinkSample`]s.
#[derive(Debug, Clone)]
pub struct BlinkGate {
    config: BlinkConfig,
    was_closed: bool,
    last_onset_s: Option<Seconds>,
}

impl BlinkGate {
    /// A gate that starts in the "eyes open" state.
    pub fn new(config: BlinkConfig) -> Self {
        Self {
            config,
            was_closed: false,
            last_onset_s: None,
        }
    }

    /// Feeds one tick of eye data. `None` means eye tracking is not
    /// available at all this tick.
    pub fn observe(&mut self, sample: Option<&BlinkSample>) -> Option<BlinkEvent> {
        let sample = match sample {
            Some(s) if s.left.valid && s.right.valid => s,
            _ => {
                // A dropout must not be able to fire a stale offset later.
                self.reset();
                return None;
            }
        };

        let closed = sample.left.openness < self.config.blink_threshold
            && sample.right.openness < self.config.blink_threshold;

        match (self.was_closed, closed) {
            (false, true) => {
                self.was_closed = true;
                self.last_onset_s = Some(sample.timestamp_s);
                debug!("blink onset at {:.3}s", sample.timestamp_s);
                Some(BlinkEvent::Onset(sample.timestamp_s))
            }
            (true, false) => {
                self.was_closed = false;
                let elapsed = self
                    .last_onset_s
                    .map(|onset| sample.timestamp_s - onset)
                    .unwrap_or(Seconds::INFINITY);
                if elapsed >= self.config.min_blink_interval_s {
                    debug!("blink offset at {:.3}s", sample.timestamp_s);
                    Some(BlinkEvent::Offset(sample.timestamp_s))
                } else {
                    debug!(
                        "blink offset suppressed after {:.3}s (debounce {:.3}s)",
                        elapsed, self.config.min_blink_interval_s
                    );
                    None
                }
            }
            _ => None,
        }
    }

    /// Forgets any blink in progress.
    pub fn reset(&mut self) {
        self.was_closed = false;
    }

    /// Whether the gate currently considers the eyes closed.
    pub fn is_blinking(&self) -> bool {
        self.was_closed
    }
}
