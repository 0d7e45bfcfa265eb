//! A two-phase adaptive staircase.
//!
//! The coarse phase takes large steps toward the detection threshold. Once
//! enough reversals have been seen, the fine phase starts from the mean of
//! the coarse reversals with a smaller step that halves on every reversal.
//! A block ends on the fine reversal limit, on convergence of the most
//! recent reversals, or on the trial cap.
//!
//! All state lives in [`StaircaseState`] and is only ever changed through
//! [`StaircaseEngine::apply_outcome`]. Catch trials never reach it.

use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kind of redirection a block measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modality {
    /// A fixed yaw per blink, in degrees per blink.
    Blink,
    /// A yaw proportional to distance walked, in degrees per metre.
    Walking,
}

impl Modality {
    /// The modality that is not `self`.
    pub fn other(self) -> Self {
        match self {
            Modality::Blink => Modality::Walking,
            Modality::Walking => Modality::Blink,
        }
    }

    /// Unit of the redirection gain in this modality.
    pub fn unit(self) -> &'static str {
        match self {
            Modality::Blink => "deg/blink",
            Modality::Walking => "deg/m",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Blink => write!(f, "blink"),
            Modality::Walking => write!(f, "walking"),
        }
    }
}

/// Phase of the staircase within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Large steps until enough reversals are seen.
    Coarse,
    /// Small, shrinking steps around the coarse estimate.
    Fine,
    /// The block is complete; no more outcomes are accepted.
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Coarse => write!(f, "coarse"),
            Phase::Fine => write!(f, "fine"),
            Phase::Finished => write!(f, "finished"),
        }
    }
}

/// Per-modality bounds and starting point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModalityLimits {
    /// Lowest value the staircase may reach.
    pub min_value: f64,
    /// Highest value the staircase may reach.
    pub max_value: f64,
    /// Value of the first trial of the block.
    pub initial_value: f64,
    /// Step size during the coarse phase.
    pub coarse_step: f64,
    /// Largest spread of recent fine reversals that counts as converged.
    pub convergence_range: f64,
}

impl ModalityLimits {
    /// Reference limits for blink redirection, in degrees per blink.
    pub fn blink() -> Self {
        Self {
            min_value: 0.5,
            max_value: 5.0,
            initial_value: 0.5,
            coarse_step: 0.5,
            convergence_range: 0.5,
        }
    }

    /// Reference limits for walking redirection, in degrees per metre.
    pub fn walking() -> Self {
        Self {
            min_value: 1.0,
            max_value: 20.0,
            initial_value: 2.0,
            coarse_step: 2.0,
            convergence_range: 1.5,
        }
    }

    /// Clamps `value` into `[min_value, max_value]`.
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min_value, self.max_value)
    }
}

/// Stopping and step rules shared by both modalities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StaircaseConfig {
    /// Fine start step as a fraction of the fine seed value.
    pub fine_start_step_factor: f64,
    /// The fine step never halves below this.
    pub fine_step_floor: f64,
    /// Coarse reversals needed before switching to the fine phase.
    pub coarse_min_reversals: u32,
    /// Fine reversals after which the block is complete.
    pub fine_max_reversals: u32,
    /// Hard cap on staircase trials per block, both phases combined.
    pub max_trials_per_block: u32,
    /// Number of recent fine reversals checked for convergence, if any.
    pub convergence_window: Option<usize>,
}

impl Default for StaircaseConfig {
    fn default() -> Self {
        Self {
            fine_start_step_factor: 0.25,
            fine_step_floor: 0.1,
            coarse_min_reversals: 6,
            fine_max_reversals: 8,
            max_trials_per_block: 30,
            convergence_window: Some(4),
        }
    }
}

/// Direction the value moved on the last trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    /// No trial yet in this phase.
    None,
    /// Value decreased after a correct answer.
    Down,
    /// Value increased after a wrong answer.
    Up,
}

impl StepDirection {
    /// `-1`, `0` or `+1`.
    pub fn sign(self) -> i8 {
        match self {
            StepDirection::None => 0,
            StepDirection::Down => -1,
            StepDirection::Up => 1,
        }
    }
}

/// Where the block stands after an outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlockStatus {
    /// Keep running trials in the current phase.
    Continue,
    /// The fine phase just started from `seed` with `step`.
    PhaseTransition {
        /// Value the fine phase starts from.
        seed: f64,
        /// Step the fine phase starts with.
        step: f64,
    },
    /// The block is complete.
    Done,
}

/// Everything that changed because of one outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Phase the trial was run in.
    pub phase: Phase,
    /// Value before the update.
    pub value_before: f64,
    /// Value after the update (and after any phase transition).
    pub value_after: f64,
    /// Step size used for this update.
    pub step_applied: f64,
    /// Direction of the update.
    pub direction: StepDirection,
    /// Whether this trial was a reversal.
    pub reversal: bool,
    /// Reversals across both phases of the block so far.
    pub total_reversals: u32,
    /// What the sequencer should do next.
    pub status: BlockStatus,
}

/// The mutable part of the staircase.
#[derive(Debug, Clone, PartialEq)]
pub struct StaircaseState {
    /// Current phase.
    pub phase: Phase,
    /// Value the next trial is run at.
    pub current_value: f64,
    /// Step the next update will use.
    pub current_step: f64,
    /// Direction of the last update in this phase.
    pub last_direction: StepDirection,
    /// Reversals in the current phase.
    pub reversal_count: u32,
    /// Pre-update values at each reversal in the current phase.
    pub reversal_history: Vec<f64>,
    /// Staircase trials in this block, both phases.
    pub trials_in_block: u32,
}

impl StaircaseState {
    fn fresh(initial_value: f64, step: f64) -> Self {
        Self {
            phase: Phase::Coarse,
            current_value: initial_value,
            current_step: step,
            last_direction: StepDirection::None,
            reversal_count: 0,
            reversal_history: Vec::new(),
            trials_in_block: 0,
        }
    }
}

/// Mean of `values`, if there are any.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Seed value and start step for the fine phase.
pub fn fine_seed(coarse_reversals: &[f64], fallback: f64, factor: f64) -> (f64, f64) {
    let seed = mean(coarse_reversals).unwrap_or(fallback);
    (seed, seed * factor)
}

/// Whether the last `window` reversals lie within `range` of each other.
pub fn has_converged(reversals: &[f64], window: usize, range: f64) -> bool {
    if window == 0 || reversals.len() < window {
        return false;
    }
    let tail = &reversals[reversals.len() - window..];
    let max = tail.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = tail.iter().cloned().fold(f64::INFINITY, f64::min);
    max - min <= range
}

/// Drives one block of the staircase.
#[derive(Debug, Clone)]
pub struct StaircaseEngine {
    config: StaircaseConfig,
    limits: ModalityLimits,
    state: StaircaseState,
    coarse_history: Vec<f64>,
    fine_ran: bool,
}

impl StaircaseEngine {
    /// An engine for `limits`, starting at the limits' initial value and
    /// coarse step.
    pub fn new(config: StaircaseConfig, limits: ModalityLimits) -> Self {
        let mut engine = Self {
            config,
            limits,
            state: StaircaseState::fresh(limits.initial_value, limits.coarse_step),
            coarse_history: Vec::new(),
            fine_ran: false,
        };
        engine.begin_block(limits.initial_value, limits.coarse_step);
        engine
    }

    /// Resets to a fresh coarse phase.
    pub fn begin_block(&mut self, initial_value: f64, coarse_step: f64) {
        self.state = StaircaseState::fresh(self.limits.clamp(initial_value), coarse_step);
        self.coarse_history.clear();
        self.fine_ran = false;
    }

    /// The full mutable state.
    pub fn state(&self) -> &StaircaseState {
        &self.state
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// The value the next trial should use.
    pub fn current_value(&self) -> f64 {
        self.state.current_value
    }

    /// Limits this block was built with.
    pub fn limits(&self) -> &ModalityLimits {
        &self.limits
    }

    /// Reversals in both phases of this block.
    pub fn total_reversals(&self) -> u32 {
        let coarse = self.coarse_history.len() as u32;
        match self.state.phase {
            Phase::Coarse => self.state.reversal_count,
            _ => coarse + self.state.reversal_count,
        }
    }

    /// The threshold estimate for this block: the mean fine reversal,
    /// falling back to the coarse reversals and then the current value.
    pub fn threshold(&self) -> f64 {
        let (coarse, fine): (&[f64], &[f64]) = if self.fine_ran {
            (&self.coarse_history, &self.state.reversal_history)
        } else {
            (&self.state.reversal_history, &[])
        };
        mean(fine)
            .or_else(|| mean(coarse))
            .unwrap_or(self.state.current_value)
    }

    /// Applies the outcome of one non-catch trial.
    pub fn apply_outcome(&mut self, correct: bool) -> StepReport {
        let phase = self.state.phase;
        let value_before = self.state.current_value;
        let step_applied = self.state.current_step;

        if phase == Phase::Finished {
            return StepReport {
                phase,
                value_before,
                value_after: value_before,
                step_applied: 0.0,
                direction: StepDirection::None,
                reversal: false,
                total_reversals: self.total_reversals(),
                status: BlockStatus::Done,
            };
        }

        let direction = if correct {
            StepDirection::Down
        } else {
            StepDirection::Up
        };
        let reversal = self.state.last_direction != StepDirection::None
            && direction != self.state.last_direction;

        self.state.current_value =
            self.limits.clamp(value_before + step_applied * f64::from(direction.sign()));
        self.state.last_direction = direction;
        self.state.trials_in_block += 1;

        if reversal {
            self.state.reversal_history.push(value_before);
            self.state.reversal_count += 1;
            info!(
                "{} reversal #{} at {:.3}",
                phase, self.state.reversal_count, value_before
            );
            if phase == Phase::Fine {
                self.state.current_step =
                    (self.state.current_step * 0.5).max(self.config.fine_step_floor);
            }
        }

        let mut status = BlockStatus::Continue;
        if phase == Phase::Coarse && self.state.reversal_count >= self.config.coarse_min_reversals {
            let (seed, step) = self.enter_fine();
            status = BlockStatus::PhaseTransition { seed, step };
        }
        if self.block_complete() {
            self.state.phase = Phase::Finished;
            status = BlockStatus::Done;
        }

        StepReport {
            phase,
            value_before,
            value_after: self.state.current_value,
            step_applied,
            direction,
            reversal,
            total_reversals: self.total_reversals(),
            status,
        }
    }

    fn enter_fine(&mut self) -> (f64, f64) {
        let (seed, step) = fine_seed(
            &self.state.reversal_history,
            self.state.current_value,
            self.config.fine_start_step_factor,
        );
        let seed = self.limits.clamp(seed);
        let step = step.max(self.config.fine_step_floor);
        info!("entering fine phase at {:.3} with step {:.3}", seed, step);

        self.coarse_history = std::mem::take(&mut self.state.reversal_history);
        self.state.phase = Phase::Fine;
        self.state.current_value = seed;
        self.state.current_step = step;
        self.state.last_direction = StepDirection::None;
        self.state.reversal_count = 0;
        self.fine_ran = true;
        (seed, step)
    }

    fn block_complete(&self) -> bool {
        if self.state.trials_in_block >= self.config.max_trials_per_block {
            return true;
        }
        if self.state.phase != Phase::Fine {
            return false;
        }
        if self.state.reversal_count >= self.config.fine_max_reversals {
            return true;
        }
        match self.config.convergence_window {
            Some(window) => has_converged(
                &self.state.reversal_history,
                window,
                self.limits.convergence_range,
            ),
            None => false,
        }
    }
}
