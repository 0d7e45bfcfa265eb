//! The redirection controller: turns blink edges and head motion into yaw
//! rotations of the virtual environment.
//!
//! Exactly one redirection mode is armed at a time, either a fixed rotation
//! per blink or a rotation proportional to distance walked. The controller
//! talks to the outside world only through the [`WorldRotator`] and
//! [`Occluder`] capabilities.

use crate::{Degrees, Planar, Seconds};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Something that can rotate the virtual environment about a vertical axis.
pub trait WorldRotator {
    /// Rotates the environment by `yaw` degrees about the vertical axis
    /// through `pivot`.
    fn rotate_about(&mut self, pivot: Planar, yaw: Degrees);
}

/// Something that can black out the participant's whole field of view.
pub trait Occluder {
    /// Occludes the view for `duration_s`, starting now.
    fn occlude(&mut self, duration_s: Seconds);
}

/// The currently armed redirection. Carrying the gain inside the variant
/// makes it impossible for both modes to be non-zero at once.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RedirectionParameter {
    /// No redirection.
    #[default]
    Off,
    /// Signed degrees applied once per blink.
    Blink(Degrees),
    /// Signed degrees per metre walked.
    Walking(Degrees),
}

/// Blackout shown after each blink.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlackoutConfig {
    /// How long the occlusion lasts, timed from the blink offset.
    pub duration_s: Seconds,
    /// Also black out when the blink gain is zero, so the unmanipulated run
    /// looks the same as the manipulated one.
    pub on_zero_gain: bool,
}

/// Tunables for the controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RedirectionConfig {
    /// Planar displacements at or below this are treated as tracking noise.
    pub min_move_distance_m: f64,
    /// Planar displacements above this are treated as a reset, not walking.
    pub teleport_threshold_m: f64,
    /// Optional blackout on blink offsets.
    pub blackout: Option<BlackoutConfig>,
}

impl Default for RedirectionConfig {
    fn default() -> Self {
        Self {
            min_move_distance_m: 0.01,
            teleport_threshold_m: 0.3,
            blackout: Some(BlackoutConfig {
                duration_s: 0.4,
                on_zero_gain: true,
            }),
        }
    }
}

/// Returned when a rotation is attempted without an environment to rotate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectionError {
    /// No [`WorldRotator`] has been bound.
    UnboundWorld,
}

impl fmt::Display for RedirectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RedirectionError::UnboundWorld => {
                write!(f, "no environment bound; redirection cannot be applied")
            }
        }
    }
}

impl std::error::Error for RedirectionError {}

/// Blink statistics for one run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunStats {
    /// Blink onsets seen while the run was tracked.
    pub detected: u32,
    /// Onsets that actually rotated the environment.
    pub applied: u32,
    /// Length of the run.
    pub seconds: Seconds,
}

/// Owns the active [`RedirectionParameter`] and applies it.
pub struct RedirectionController {
    config: RedirectionConfig,
    parameter: RedirectionParameter,
    world: Option<Box<dyn WorldRotator>>,
    occluder: Option<Box<dyn Occluder>>,

    // Last accepted planar head position, and the latest one seen.
    reference: Option<Planar>,
    head: Option<Planar>,

    paused: bool,
    run_active: bool,
    // An onset was seen and its offset has not arrived yet.
    awaiting_offset: bool,
    // Bumped whenever upstream blink-edge state must be forgotten.
    blink_epoch: u64,
    run_started_s: Seconds,
    detected: u32,
    applied: u32,
    unbound_reported: bool,
}

impl RedirectionController {
    /// A controller with redirection off and nothing bound.
    pub fn new(config: RedirectionConfig) -> Self {
        Self {
            config,
            parameter: RedirectionParameter::Off,
            world: None,
            occluder: None,
            reference: None,
            head: None,
            paused: false,
            run_active: false,
            awaiting_offset: false,
            blink_epoch: 0,
            run_started_s: 0.0,
            detected: 0,
            applied: 0,
            unbound_reported: false,
        }
    }

    /// Binds the environment that rotations are applied to.
    pub fn with_world(mut self, world: Box<dyn WorldRotator>) -> Self {
        self.world = Some(world);
        self
    }

    /// Binds the full-field occlusion capability.
    pub fn with_occluder(mut self, occluder: Box<dyn Occluder>) -> Self {
        self.occluder = Some(occluder);
        self
    }

    /// The active parameter.
    pub fn parameter(&self) -> RedirectionParameter {
        self.parameter
    }

    /// Degrees per blink, zero unless blink mode is armed.
    pub fn blink_gain(&self) -> Degrees {
        match self.parameter {
            RedirectionParameter::Blink(g) => g,
            _ => 0.0,
        }
    }

    /// Degrees per metre, zero unless walking mode is armed.
    pub fn walking_gain(&self) -> Degrees {
        match self.parameter {
            RedirectionParameter::Walking(g) => g,
            _ => 0.0,
        }
    }

    /// Arms blink redirection. A non-zero gain disarms walking redirection.
    pub fn set_blink_gain(&mut self, degrees_per_blink: Degrees) {
        if degrees_per_blink != 0.0 {
            self.parameter = RedirectionParameter::Blink(degrees_per_blink);
        } else if let RedirectionParameter::Blink(_) = self.parameter {
            self.parameter = RedirectionParameter::Off;
        }
    }

    /// Arms walking redirection. A non-zero gain disarms blink redirection.
    pub fn set_walking_gain(&mut self, degrees_per_meter: Degrees) {
        if degrees_per_meter != 0.0 {
            self.parameter = RedirectionParameter::Walking(degrees_per_meter);
        } else if let RedirectionParameter::Walking(_) = self.parameter {
            self.parameter = RedirectionParameter::Off;
        }
    }

    /// Whether rotations can currently be applied.
    pub fn is_live(&self) -> bool {
        self.run_active && !self.paused
    }

    /// Whether rotations are paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether a run is being tracked.
    pub fn is_run_active(&self) -> bool {
        self.run_active
    }

    /// Handles a blink onset. Returns the yaw applied, if any.
    pub fn on_blink_onset(&mut self) -> Result<Option<Degrees>, RedirectionError> {
        if !self.is_live() {
            return Ok(None);
        }
        self.detected += 1;
        self.awaiting_offset = true;

        let gain = self.blink_gain();
        if gain == 0.0 {
            return Ok(None);
        }
        let pivot = self.pivot();
        self.rotate(pivot, gain)?;
        self.applied += 1;
        Ok(Some(gain))
    }

    /// Handles a blink offset: masks the eyes re-opening with a blackout.
    /// Returns whether an occlusion was triggered. Offsets without a
    /// matching onset are ignored.
    pub fn on_blink_offset(&mut self) -> bool {
        let awaiting = std::mem::take(&mut self.awaiting_offset);
        if !self.is_live() || !awaiting {
            return false;
        }
        let Some(blackout) = self.config.blackout else {
            return false;
        };
        if self.blink_gain() == 0.0 && !blackout.on_zero_gain {
            return false;
        }
        match self.occluder.as_mut() {
            Some(occluder) => {
                occluder.occlude(blackout.duration_s);
                true
            }
            None => false,
        }
    }

    /// Handles a new head position. Returns the yaw applied, if any.
    pub fn on_motion_sample(
        &mut self,
        position: Planar,
    ) -> Result<Option<Degrees>, RedirectionError> {
        self.head = Some(position);

        let reference = match self.reference {
            Some(r) if self.is_live() => r,
            _ => {
                self.reference = Some(position);
                return Ok(None);
            }
        };

        let distance = reference.distance(&position);
        if distance > self.config.teleport_threshold_m {
            debug!("discarding {:.3}m jump as a reset", distance);
            self.reference = Some(position);
            return Ok(None);
        }

        let gain = self.walking_gain();
        if gain == 0.0 || distance <= self.config.min_move_distance_m {
            // Not resyncing keeps small jitter from being lost.
            return Ok(None);
        }

        let yaw = gain * distance;
        self.rotate(position, yaw)?;
        self.reference = Some(position);
        Ok(Some(yaw))
    }

    /// Stops applying rotations. Safe to call repeatedly.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Starts applying rotations again from the current position, without
    /// catching up on anything that happened while paused.
    pub fn resume(&mut self) {
        self.paused = false;
        self.resync();
    }

    /// Starts a tracked run: counters reset and the reference position is
    /// taken from here.
    pub fn begin_run_tracking(&mut self, now_s: Seconds) {
        self.detected = 0;
        self.applied = 0;
        self.run_started_s = now_s;
        self.run_active = true;
        self.forget_blink();
        self.resync();
    }

    /// Ends the tracked run and returns its blink statistics.
    pub fn end_run_tracking(&mut self, now_s: Seconds) -> RunStats {
        self.run_active = false;
        RunStats {
            detected: self.detected,
            applied: self.applied,
            seconds: (now_s - self.run_started_s).max(0.0),
        }
    }

    /// Called after the host has moved the environment back to its start
    /// pose. Forgets any blink in progress; run and pause state are left
    /// alone.
    pub fn notify_world_reset(&mut self) {
        self.forget_blink();
        self.resync();
    }

    /// Changes every time a blink in progress must be forgotten, so blink
    /// detectors feeding this controller know to reset their edge state.
    pub fn blink_epoch(&self) -> u64 {
        self.blink_epoch
    }

    fn forget_blink(&mut self) {
        self.awaiting_offset = false;
        self.blink_epoch += 1;
    }

    fn resync(&mut self) {
        self.reference = self.head;
    }

    fn pivot(&self) -> Planar {
        self.head.unwrap_or_default()
    }

    fn rotate(&mut self, pivot: Planar, yaw: Degrees) -> Result<(), RedirectionError> {
        match self.world.as_mut() {
            Some(world) => {
                debug!("rotating world {:+.3} deg about {}", yaw, pivot);
                world.rotate_about(pivot, yaw);
                Ok(())
            }
            None => {
                if !self.unbound_reported {
                    error!("{}", RedirectionError::UnboundWorld);
                    self.unbound_reported = true;
                }
                Err(RedirectionError::UnboundWorld)
            }
        }
    }
}
