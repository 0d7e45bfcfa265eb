//! A synthetic participant for dry runs of the whole experiment.
//!
//! The participant walks a straight path at constant speed, blinks now and
//! then, and answers each trial from a Weibull psychometric function of the
//! gain they were exposed to. [`Simulation`] puts one in front of a
//! [`Session`] and plays the host's part.

use crate::blink_gate::{BlinkSample, EyeReading};
use crate::config::ExperimentConfig;
use crate::redirection::{RedirectionParameter, WorldRotator};
use crate::sensor_feed::SensorFrame;
use crate::session::Session;
use crate::staircase::Modality;
use crate::trial_record::{Response, RunIndex, TrialSink};
use crate::trial_sequencer::{ExperimentHost, Overlay, SequencerState};
use crate::{Degrees, Planar, Seconds};

use log::{debug, info};
use rand::prelude::*;
use std::sync::{Arc, Mutex};

/// How the synthetic participant behaves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticipantModel {
    /// Blink gain detected with probability `1 - 1/e`, in degrees per blink.
    pub blink_threshold: f64,
    /// Walking gain detected with probability `1 - 1/e`, in degrees per metre.
    pub walking_threshold: f64,
    /// Steepness of the psychometric function.
    pub slope: f64,
    /// Walking speed along the path.
    pub walking_speed_mps: f64,
    /// Length of one run.
    pub path_length_m: f64,
    /// Blinks are this far apart, uniformly.
    pub blink_interval_s: (Seconds, Seconds),
    /// Each blink keeps the eyes closed this long, uniformly.
    pub blink_duration_s: (Seconds, Seconds),
    /// Chance per frame that the eye tracker drops out.
    pub dropout_probability: f64,
    /// Chance of naming a run on a trial where nothing was felt.
    pub false_alarm_probability: f64,
}

impl Default for ParticipantModel {
    fn default() -> Self {
        Self {
            blink_threshold: 2.0,
            walking_threshold: 6.0,
            slope: 3.0,
            walking_speed_mps: 1.0,
            path_length_m: 5.0,
            blink_interval_s: (2.0, 6.0),
            blink_duration_s: (0.15, 0.4),
            dropout_probability: 0.002,
            false_alarm_probability: 0.1,
        }
    }
}

impl ParticipantModel {
    /// Threshold for the given modality.
    pub fn threshold(&self, modality: Modality) -> f64 {
        match modality {
            Modality::Blink => self.blink_threshold,
            Modality::Walking => self.walking_threshold,
        }
    }

    /// Probability of noticing a manipulation of `gain`.
    pub fn detection_probability(&self, gain: f64, modality: Modality) -> f64 {
        let threshold = self.threshold(modality);
        if threshold <= 0.0 {
            return 1.0;
        }
        1.0 - (-(gain.abs() / threshold).powf(self.slope)).exp()
    }
}

/// Sums the absolute yaw applied to the environment. Clones share the sum.
#[derive(Debug, Clone, Default)]
pub struct RotationMeter {
    total: Arc<Mutex<Degrees>>,
}

impl RotationMeter {
    /// A meter reading zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the sum so far and restarts from zero.
    pub fn take(&self) -> Degrees {
        self.total
            .lock()
            .map(|mut total| std::mem::take(&mut *total))
            .unwrap_or(0.0)
    }
}

impl WorldRotator for RotationMeter {
    fn rotate_about(&mut self, _pivot: Planar, yaw: Degrees) {
        if let Ok(mut total) = self.total.lock() {
            *total += yaw.abs();
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Exposure {
    gain: f64,
    felt: bool,
}

/// The participant's body and mind.
pub struct SimulatedParticipant<R: Rng> {
    model: ParticipantModel,
    rng: R,
    meter: RotationMeter,

    start: Planar,
    position: Planar,
    walking: bool,
    next_blink_s: Seconds,
    eyes_closed_until_s: Option<Seconds>,
    exposures: [Exposure; 2],
}

impl<R: Rng> SimulatedParticipant<R> {
    /// A participant standing at the origin, facing down the path. `meter`
    /// must be the world the session rotates.
    pub fn new(model: ParticipantModel, mut rng: R, meter: RotationMeter) -> Self {
        let next_blink_s = rng.gen_range(model.blink_interval_s.0..=model.blink_interval_s.1);
        Self {
            model,
            rng,
            meter,
            start: Planar::default(),
            position: Planar::default(),
            walking: false,
            next_blink_s,
            eyes_closed_until_s: None,
            exposures: [Exposure::default(); 2],
        }
    }

    /// Current planar head position.
    pub fn position(&self) -> Planar {
        self.position
    }

    /// Whether the end of the path has been reached.
    pub fn finished_path(&self) -> bool {
        self.walking && self.start.distance(&self.position) >= self.model.path_length_m
    }

    /// Starts walking a run with `gain` armed.
    pub fn begin_run(&mut self, run: RunIndex, gain: f64) {
        self.meter.take();
        self.exposures[run_slot(run)] = Exposure { gain, felt: false };
        self.position = self.start;
        self.walking = true;
    }

    /// Stops at the end of the path and walks back to the start.
    pub fn end_run(&mut self, run: RunIndex) {
        self.exposures[run_slot(run)].felt = self.meter.take() > 0.0;
        self.walking = false;
        self.position = self.start;
    }

    /// Advances by `dt_s` and reports what the sensors see at `now_s`.
    pub fn step(&mut self, now_s: Seconds, dt_s: Seconds) -> SensorFrame {
        if self.walking {
            self.position.z += self.model.walking_speed_mps * dt_s;
        }

        if now_s >= self.next_blink_s {
            let (lo, hi) = self.model.blink_duration_s;
            self.eyes_closed_until_s = Some(now_s + self.rng.gen_range(lo..=hi));
            let (lo, hi) = self.model.blink_interval_s;
            self.next_blink_s = now_s + self.rng.gen_range(lo..=hi);
        }
        let closed = match self.eyes_closed_until_s {
            Some(until) if now_s < until => true,
            Some(_) => {
                self.eyes_closed_until_s = None;
                false
            }
            None => false,
        };

        let eyes = if self.rng.gen_bool(self.model.dropout_probability) {
            None
        } else {
            let mut eye = || {
                let openness = if closed {
                    self.rng.gen_range(0.0..0.1)
                } else {
                    self.rng.gen_range(0.8..1.0)
                };
                EyeReading::open(openness)
            };
            Some(BlinkSample {
                left: eye(),
                right: eye(),
                timestamp_s: now_s,
            })
        };

        SensorFrame {
            time_s: now_s,
            eyes,
            head: Some(self.position),
        }
    }

    /// Answers the trial just walked.
    pub fn answer(&mut self, modality: Modality, likert_points: u8) -> Response {
        let manipulated = self
            .exposures
            .iter()
            .position(|e| e.gain != 0.0)
            .map(|slot| (slot, self.exposures[slot]));

        let choice = match manipulated {
            Some((slot, exposure)) if exposure.felt => {
                let p = self.model.detection_probability(exposure.gain, modality);
                if self.rng.gen_bool(p) {
                    Some(slot_run(slot))
                } else {
                    Some(self.guess())
                }
            }
            Some(_) => Some(self.guess()),
            None if self.rng.gen_bool(self.model.false_alarm_probability) => Some(self.guess()),
            None => None,
        };
        let top = likert_points.max(1);
        let ratings = (self.rng.gen_range(1..=top), self.rng.gen_range(1..=top));
        self.exposures = [Exposure::default(); 2];

        Response {
            choice,
            ratings: Some(ratings),
        }
    }

    fn guess(&mut self) -> RunIndex {
        if self.rng.gen_bool(0.5) {
            RunIndex::First
        } else {
            RunIndex::Second
        }
    }
}

fn run_slot(run: RunIndex) -> usize {
    match run {
        RunIndex::First => 0,
        RunIndex::Second => 1,
    }
}

fn slot_run(slot: usize) -> RunIndex {
    if slot == 0 {
        RunIndex::First
    } else {
        RunIndex::Second
    }
}

/// Logs what a real host would put on screen.
#[derive(Debug, Default)]
pub struct LoggingHost;

impl ExperimentHost for LoggingHost {
    fn reset_world(&mut self) {
        debug!("host: world reset");
    }

    fn begin_invisible_snap(&mut self, window_s: Seconds) {
        debug!("host: invisible snap for {:.2}s", window_s);
    }

    fn show_overlay(&mut self, overlay: &Overlay) {
        info!("overlay: {}", overlay);
    }

    fn hide_overlay(&mut self) {
        debug!("host: overlay hidden");
    }

    fn present_choice(&mut self, collect_ratings: bool) {
        debug!("host: asking for an answer (ratings: {})", collect_ratings);
    }
}

/// A whole experiment run against a [`SimulatedParticipant`].
pub struct Simulation {
    session: Session<StdRng>,
    participant: SimulatedParticipant<StdRng>,
    likert_points: u8,
    now_s: Seconds,
    dt_s: Seconds,
    last_state: SequencerState,
}

impl Simulation {
    /// Sets up participant `participant_id`, ticking at `tick_hz`. The same
    /// `seed` always produces the same experiment.
    pub fn new(
        config: ExperimentConfig,
        participant_id: u32,
        model: ParticipantModel,
        seed: u64,
        tick_hz: f64,
        sink: Box<dyn TrialSink>,
    ) -> Self {
        let meter = RotationMeter::new();
        let likert_points = config.sequencer.likert_points;
        let mut session = Session::new(
            config,
            participant_id,
            StdRng::seed_from_u64(seed),
            Box::new(meter.clone()),
            None,
            Box::new(LoggingHost),
            sink,
        );
        session.start(0.0);
        let participant =
            SimulatedParticipant::new(model, StdRng::seed_from_u64(seed.wrapping_add(1)), meter);
        Self {
            session,
            participant,
            likert_points,
            now_s: 0.0,
            dt_s: 1.0 / tick_hz.max(1.0),
            last_state: SequencerState::Idle,
        }
    }

    /// Simulated time so far.
    pub fn now(&self) -> Seconds {
        self.now_s
    }

    /// Length of one tick.
    pub fn tick_length(&self) -> Seconds {
        self.dt_s
    }

    /// The session being driven.
    pub fn session(&self) -> &Session<StdRng> {
        &self.session
    }

    /// Advances one tick. Returns `false` once the experiment has finished.
    pub fn step(&mut self) -> bool {
        self.now_s += self.dt_s;
        let frame = self.participant.step(self.now_s, self.dt_s);
        if let Err(error) = self.session.tick(&frame) {
            debug!("tick at {:.3}s: {}", self.now_s, error);
        }

        let state = self.session.sequencer().state();
        match state {
            SequencerState::Running(run) if self.last_state != state => {
                let gain = match self.session.controller().parameter() {
                    RedirectionParameter::Off => 0.0,
                    RedirectionParameter::Blink(g) | RedirectionParameter::Walking(g) => g,
                };
                self.participant.begin_run(run, gain);
            }
            SequencerState::Running(run) if self.participant.finished_path() => {
                self.participant.end_run(run);
                self.session.run_end(self.now_s);
            }
            SequencerState::AwaitingResponse => {
                let modality = self.session.sequencer().modality();
                let response = self.participant.answer(modality, self.likert_points);
                self.session.respond(self.now_s, response);
            }
            _ => {}
        }
        self.last_state = self.session.sequencer().state();

        !self.session.is_finished()
    }

    /// Steps until the experiment finishes and returns the thresholds.
    pub fn run_to_end(&mut self) -> Vec<(Modality, f64)> {
        while self.step() {}
        self.session.sequencer().thresholds().to_vec()
    }
}
