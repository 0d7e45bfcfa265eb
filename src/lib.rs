//! Measures how much a virtual environment can be rotated around a walking
//! participant before they notice, with two kinds of redirection:
//!
//! - **blink**: a fixed yaw applied the instant both eyes close, hidden by
//!   the blink itself;
//! - **walking**: a yaw proportional to the distance walked.
//!
//! Each participant does one block per modality. Every trial consists of
//! two runs down the same path; at most one of them is manipulated, and the
//! participant has to say which. A two-phase adaptive staircase finds the
//! detection threshold from those answers, and every trial is logged as a
//! CSV row.
//!
//! The experiment is driven from a single host tick: sensor frames go
//! through the [`blink_gate`] into the [`redirection`] controller, and the
//! [`trial_sequencer`] moves through runs and trials on a [`timeline`] of
//! deadlines. [`session`] wires all of that together; [`bridge_protocol`]
//! and [`simulated_participant`] are two ways of feeding it.

#![warn(missing_docs)]
pub mod args;
pub mod blink_gate;
pub mod bridge_protocol;
pub mod component;
pub mod config;
pub mod csv_writer;
pub mod redirection;
pub mod sensor_feed;
pub mod session;
pub mod simulated_participant;
pub mod staircase;
pub mod timeline;
pub mod trial_record;
pub mod trial_sequencer;

use std::fmt;

/// Host time, in seconds since an arbitrary start.
pub type Seconds = f64;

/// A yaw angle, in degrees.
pub type Degrees = f64;

/// A position on the floor plane, in metres. Height is never needed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Planar {
    /// Lateral coordinate, in metres.
    pub x: f64,
    /// Forward coordinate, in metres.
    pub z: f64,
}

impl Planar {
    /// A point at `(x, z)`.
    pub fn new(x: f64, z: f64) -> Self {
        Self { x, z }
    }

    /// Straight-line distance on the floor plane.
    pub fn distance(&self, other: &Self) -> f64 {
        ((self.x - other.x).powi(2) + (self.z - other.z).powi(2)).sqrt()
    }
}

impl fmt::Display for Planar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3})", self.x, self.z)
    }
}
