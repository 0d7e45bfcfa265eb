//! Block, run and trial lifecycle.
//!
//! A trial consists of two runs down the same path; in at most one of them
//! the environment is redirected. After the second run the participant
//! says which run was manipulated. Non-catch answers drive the
//! [`StaircaseEngine`]; catch trials only ever reach the log.
//!
//! ```text
//! Idle -> Starting(1) -> Running(1) -> Starting(2) -> Running(2)
//!      -> AwaitingResponse -> Idle | PhaseTransition | BlockComplete | Finished
//! ```
//!
//! All waiting is done through a [`Timeline`] that the host drives from its
//! frame tick.

use crate::config::ExperimentConfig;
use crate::redirection::RedirectionController;
use crate::staircase::{BlockStatus, Modality, Phase, StaircaseEngine, StepDirection};
use crate::timeline::Timeline;
use crate::trial_record::{BlockSummary, Response, RunIndex, TrialRecord, TrialSink};
use crate::Seconds;

use log::{debug, info, warn};
use rand::Rng;
use std::fmt;

/// Messages the host shows on its full-screen overlay.
#[derive(Debug, Clone, PartialEq)]
pub enum Overlay {
    /// A run is about to start.
    RunStarting(RunIndex),
    /// The fine phase starts from `threshold`.
    PhaseTransition {
        /// Modality of the running block.
        modality: Modality,
        /// Value the fine phase starts from.
        threshold: f64,
    },
    /// One block is done and the other is next.
    BlockComplete {
        /// Modality of the finished block.
        modality: Modality,
        /// Threshold estimate of the finished block.
        threshold: f64,
    },
    /// Both blocks are done.
    ExperimentFinished {
        /// Blink threshold, if that block ran.
        blink: Option<f64>,
        /// Walking threshold, if that block ran.
        walking: Option<f64>,
    },
}

impl fmt::Display for Overlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let estimate = |t: &Option<f64>| match t {
            Some(t) => format!("{:.2}", t),
            None => "-".to_string(),
        };
        match self {
            Overlay::RunStarting(run) => write!(f, "Run {} starts in a moment", run),
            Overlay::PhaseTransition { modality, threshold } => write!(
                f,
                "Fine phase starts at {:.2} {}",
                threshold,
                modality.unit()
            ),
            Overlay::BlockComplete { modality, threshold } => write!(
                f,
                "{} block complete, threshold {:.2} {}",
                modality,
                threshold,
                modality.unit()
            ),
            Overlay::ExperimentFinished { blink, walking } => write!(
                f,
                "Experiment finished, blink {} deg/blink, walking {} deg/m",
                estimate(blink),
                estimate(walking)
            ),
        }
    }
}

/// What the sequencer needs from the engine hosting the experiment, beyond
/// the redirection controller.
pub trait ExperimentHost {
    /// Puts the environment and the rig back at their recorded start pose.
    fn reset_world(&mut self);
    /// Lets floor alignment snap the rig without smoothing for `window_s`,
    /// while the participant cannot see it.
    fn begin_invisible_snap(&mut self, window_s: Seconds);
    /// Shows an operator or participant message.
    fn show_overlay(&mut self, overlay: &Overlay);
    /// Removes any message shown.
    fn hide_overlay(&mut self);
    /// Asks "which run was manipulated?", plus the two ratings if
    /// `collect_ratings` is set.
    fn present_choice(&mut self, collect_ratings: bool);
}

/// How a trial manipulates its runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrialKind {
    /// Neither run is manipulated.
    Catch,
    /// `run` is redirected with the staircase value times `sign`.
    Manipulated {
        /// The redirected run.
        run: RunIndex,
        /// `1.0` or `-1.0`.
        sign: f64,
    },
}

/// The trial currently in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialPlan {
    /// Catch or manipulated.
    pub kind: TrialKind,
    /// Index within the block, from 0.
    pub block_trial: u32,
    /// Index across the experiment, from 0.
    pub total_trial: u32,
}

/// Where the sequencer is in the trial lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// Not started, or waiting to prepare the next trial.
    Idle,
    /// The overlay before a run is showing.
    Starting(RunIndex),
    /// The participant is walking a run.
    Running(RunIndex),
    /// Both runs are done; waiting for the answer.
    AwaitingResponse,
    /// The fine-phase overlay is showing.
    PhaseTransition,
    /// The between-blocks overlay is showing.
    BlockComplete,
    /// No more trials.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Resume {
    StartRun(RunIndex),
    NextTrial,
    NextBlock,
}

/// Which modality a participant does first: walking for even IDs, blink
/// for odd ones.
pub fn first_modality(participant_id: u32) -> Modality {
    if participant_id % 2 == 0 {
        Modality::Walking
    } else {
        Modality::Blink
    }
}

/// Runs the whole experiment for one participant.
pub struct TrialSequencer<R: Rng> {
    config: ExperimentConfig,
    participant_id: u32,
    rng: R,
    host: Box<dyn ExperimentHost>,
    sink: Box<dyn TrialSink>,

    timeline: Timeline<Resume>,
    state: SequencerState,
    modality: Modality,
    staircase: StaircaseEngine,
    thresholds: Vec<(Modality, f64)>,

    trial: Option<TrialPlan>,
    block_trials: u32,
    block_catch_trials: u32,
    block_false_alarms: u32,
    total_trials: u32,
}

impl<R: Rng> TrialSequencer<R> {
    /// A sequencer waiting for [`TrialSequencer::start`].
    pub fn new(
        config: ExperimentConfig,
        participant_id: u32,
        rng: R,
        host: Box<dyn ExperimentHost>,
        sink: Box<dyn TrialSink>,
    ) -> Self {
        let modality = first_modality(participant_id);
        let staircase = StaircaseEngine::new(config.staircase, *config.limits(modality));
        Self {
            config,
            participant_id,
            rng,
            host,
            sink,
            timeline: Timeline::new(),
            state: SequencerState::Idle,
            modality,
            staircase,
            thresholds: Vec::new(),
            trial: None,
            block_trials: 0,
            block_catch_trials: 0,
            block_false_alarms: 0,
            total_trials: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Modality of the current block.
    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// The staircase of the running block.
    pub fn staircase(&self) -> &StaircaseEngine {
        &self.staircase
    }

    /// The trial in flight, if any.
    pub fn current_trial(&self) -> Option<&TrialPlan> {
        self.trial.as_ref()
    }

    /// Threshold estimates of the blocks completed so far, in order.
    pub fn thresholds(&self) -> &[(Modality, f64)] {
        &self.thresholds
    }

    /// Due time of the next scheduled step, if any.
    pub fn next_due(&self) -> Option<Seconds> {
        self.timeline.next_due()
    }

    /// Whether both blocks are done.
    pub fn is_finished(&self) -> bool {
        self.state == SequencerState::Finished
    }

    /// Starts the first block. Ignored once the experiment has started.
    pub fn start(&mut self, now_s: Seconds, ctl: &mut RedirectionController) {
        if self.state != SequencerState::Idle || self.trial.is_some() || self.total_trials > 0 {
            warn!("experiment already started");
            return;
        }
        info!(
            "participant {}: starting with the {} block",
            self.participant_id, self.modality
        );
        self.begin_block(self.modality);
        self.prepare_trial(now_s, ctl);
    }

    /// Fires everything scheduled up to `now_s`.
    pub fn tick(&mut self, now_s: Seconds, ctl: &mut RedirectionController) {
        for event in self.timeline.drain_due(now_s) {
            debug!("timeline: {:?} at {:.3}s", event, now_s);
            match event {
                Resume::StartRun(run) => self.start_run(now_s, run, ctl),
                Resume::NextTrial => {
                    self.host.hide_overlay();
                    self.prepare_trial(now_s, ctl);
                }
                Resume::NextBlock => {
                    self.host.hide_overlay();
                    self.begin_block(self.modality);
                    self.prepare_trial(now_s, ctl);
                }
            }
        }
    }

    /// The participant reached the end of the current run.
    pub fn run_end(&mut self, now_s: Seconds, ctl: &mut RedirectionController) {
        let run = match self.state {
            SequencerState::Running(run) => run,
            other => {
                warn!("run end signalled while {:?}; ignoring", other);
                return;
            }
        };

        let stats = ctl.end_run_tracking(now_s);
        info!(
            "run {} done in {:.1}s: {} blinks detected, {} redirected",
            run, stats.seconds, stats.detected, stats.applied
        );
        ctl.pause();
        self.arm(ctl, 0.0);
        self.reset_pose(ctl);

        match run {
            RunIndex::First => self.schedule_run(now_s, RunIndex::Second),
            RunIndex::Second => {
                self.state = SequencerState::AwaitingResponse;
                self.host.present_choice(self.staircase.phase() == Phase::Fine);
            }
        }
    }

    /// The participant answered. Returns whether the answer was used;
    /// answers while no trial is waiting for one are dropped.
    pub fn respond(&mut self, now_s: Seconds, response: Response) -> bool {
        if self.state != SequencerState::AwaitingResponse {
            warn!("response {:?} while {:?}; ignoring", response, self.state);
            return false;
        }
        let Some(plan) = self.trial.take() else {
            warn!("no trial in flight; ignoring response");
            return false;
        };

        let phase = self.staircase.phase();
        let (rating_confidence, rating_discomfort) = match (phase, response.ratings) {
            (Phase::Fine, Some((confidence, discomfort))) => {
                let top = self.config.sequencer.likert_points;
                (Some(confidence.clamp(1, top)), Some(discomfort.clamp(1, top)))
            }
            _ => (None, None),
        };
        let mut record = TrialRecord {
            timestamp_s: now_s,
            participant_id: self.participant_id,
            modality: self.modality,
            phase,
            block_trial: plan.block_trial,
            total_trial: plan.total_trial,
            is_catch: false,
            manipulated_run: None,
            choice: response.choice,
            correct: None,
            false_alarm: None,
            gain_before: self.staircase.current_value(),
            gain_after: self.staircase.current_value(),
            step_applied: 0.0,
            total_reversals: self.staircase.total_reversals(),
            step_direction: StepDirection::None.sign(),
            reversal: false,
            rating_confidence,
            rating_discomfort,
        };

        let status = match plan.kind {
            TrialKind::Catch => {
                let false_alarm = response.choice.is_some();
                self.block_catch_trials += 1;
                if false_alarm {
                    self.block_false_alarms += 1;
                }
                record.is_catch = true;
                record.false_alarm = Some(false_alarm);
                BlockStatus::Continue
            }
            TrialKind::Manipulated { run, .. } => {
                let correct = response.choice == Some(run);
                let report = self.staircase.apply_outcome(correct);
                record.manipulated_run = Some(run);
                record.correct = Some(correct);
                record.gain_before = report.value_before;
                record.gain_after = report.value_after;
                record.step_applied = report.step_applied;
                record.total_reversals = report.total_reversals;
                record.step_direction = report.direction.sign();
                record.reversal = report.reversal;
                report.status
            }
        };
        self.sink.record(&record);
        self.block_trials += 1;
        self.total_trials += 1;

        match status {
            BlockStatus::Continue => {
                self.state = SequencerState::Idle;
                self.timeline
                    .schedule(now_s + self.config.sequencer.inter_trial_delay_s, Resume::NextTrial);
            }
            BlockStatus::PhaseTransition { seed, .. } => {
                self.state = SequencerState::PhaseTransition;
                self.host.show_overlay(&Overlay::PhaseTransition {
                    modality: self.modality,
                    threshold: seed,
                });
                self.timeline.schedule(
                    now_s + self.config.sequencer.phase_transition_delay_s,
                    Resume::NextTrial,
                );
            }
            BlockStatus::Done => self.finish_block(now_s),
        }
        true
    }

    fn begin_block(&mut self, modality: Modality) {
        let limits = *self.config.limits(modality);
        self.modality = modality;
        self.staircase = StaircaseEngine::new(self.config.staircase, limits);
        self.staircase.begin_block(limits.initial_value, limits.coarse_step);
        self.block_trials = 0;
        self.block_catch_trials = 0;
        self.block_false_alarms = 0;
        info!(
            "{} block starts at {:.3} {}",
            modality,
            self.staircase.current_value(),
            modality.unit()
        );
    }

    fn prepare_trial(&mut self, now_s: Seconds, ctl: &mut RedirectionController) {
        let kind = if self.rng.gen_bool(self.config.sequencer.catch_trial_probability) {
            TrialKind::Catch
        } else {
            let run = if self.rng.gen_bool(0.5) {
                RunIndex::First
            } else {
                RunIndex::Second
            };
            let sign = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            TrialKind::Manipulated { run, sign }
        };
        let plan = TrialPlan {
            kind,
            block_trial: self.block_trials,
            total_trial: self.total_trials,
        };
        debug!("prepared trial {:?}", plan);
        self.trial = Some(plan);

        ctl.pause();
        self.arm(ctl, 0.0);
        self.reset_pose(ctl);
        self.schedule_run(now_s, RunIndex::First);
    }

    fn schedule_run(&mut self, now_s: Seconds, run: RunIndex) {
        self.state = SequencerState::Starting(run);
        self.host.show_overlay(&Overlay::RunStarting(run));
        self.timeline
            .schedule(now_s + self.config.sequencer.pre_run_delay_s, Resume::StartRun(run));
    }

    fn start_run(&mut self, now_s: Seconds, run: RunIndex, ctl: &mut RedirectionController) {
        let Some(plan) = self.trial else {
            warn!("run {} due without a trial; ignoring", run);
            return;
        };
        self.host.hide_overlay();

        let gain = match plan.kind {
            TrialKind::Manipulated { run: manipulated, sign } if manipulated == run => {
                sign * self.staircase.current_value()
            }
            _ => 0.0,
        };
        self.arm(ctl, gain);
        ctl.begin_run_tracking(now_s);
        ctl.resume();
        self.state = SequencerState::Running(run);
        info!(
            "trial {} run {}: {:+.3} {}",
            plan.total_trial,
            run,
            gain,
            self.modality.unit()
        );
    }

    fn finish_block(&mut self, now_s: Seconds) {
        let threshold = self.staircase.threshold();
        let summary = BlockSummary {
            participant_id: self.participant_id,
            modality: self.modality,
            threshold,
            trials: self.block_trials,
            catch_trials: self.block_catch_trials,
            false_alarms: self.block_false_alarms,
            total_reversals: self.staircase.total_reversals(),
        };
        info!(
            "{} block complete: threshold {:.3} {} after {} trials ({} catch, {} false alarms)",
            summary.modality,
            threshold,
            summary.modality.unit(),
            summary.trials,
            summary.catch_trials,
            summary.false_alarms
        );
        self.sink.record_block(&summary);
        self.thresholds.push((self.modality, threshold));

        let next = self.modality.other();
        if self.thresholds.iter().any(|(m, _)| *m == next) {
            self.state = SequencerState::Finished;
            self.timeline.clear();
            let lookup = |m: Modality| {
                self.thresholds
                    .iter()
                    .find(|(done, _)| *done == m)
                    .map(|(_, t)| *t)
            };
            let overlay = Overlay::ExperimentFinished {
                blink: lookup(Modality::Blink),
                walking: lookup(Modality::Walking),
            };
            self.host.show_overlay(&overlay);
            info!("participant {}: experiment finished", self.participant_id);
        } else {
            self.state = SequencerState::BlockComplete;
            self.host.show_overlay(&Overlay::BlockComplete {
                modality: self.modality,
                threshold,
            });
            self.modality = next;
            self.timeline.schedule(
                now_s + self.config.sequencer.block_transition_delay_s,
                Resume::NextBlock,
            );
        }
    }

    fn arm(&self, ctl: &mut RedirectionController, gain: f64) {
        match self.modality {
            Modality::Blink => ctl.set_blink_gain(gain),
            Modality::Walking => ctl.set_walking_gain(gain),
        }
    }

    fn reset_pose(&mut self, ctl: &mut RedirectionController) {
        self.host.reset_world();
        ctl.notify_world_reset();
        self.host
            .begin_invisible_snap(self.config.sequencer.invisible_snap_s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redirection::{RedirectionConfig, WorldRotator};
    use crate::trial_record::MemorySink;
    use crate::{Degrees, Planar};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum HostCall {
        Reset,
        Snap,
        Show(Overlay),
        Hide,
        Prompt(bool),
    }

    #[derive(Clone, Default)]
    struct FakeHost {
        calls: Arc<Mutex<Vec<HostCall>>>,
    }

    impl FakeHost {
        fn calls(&self) -> Vec<HostCall> {
            self.calls.lock().unwrap().clone()
        }

        fn last_prompt(&self) -> Option<bool> {
            self.calls().iter().rev().find_map(|c| match c {
                HostCall::Prompt(ratings) => Some(*ratings),
                _ => None,
            })
        }
    }

    impl ExperimentHost for FakeHost {
        fn reset_world(&mut self) {
            self.calls.lock().unwrap().push(HostCall::Reset);
        }
        fn begin_invisible_snap(&mut self, _window_s: Seconds) {
            self.calls.lock().unwrap().push(HostCall::Snap);
        }
        fn show_overlay(&mut self, overlay: &Overlay) {
            self.calls.lock().unwrap().push(HostCall::Show(overlay.clone()));
        }
        fn hide_overlay(&mut self) {
            self.calls.lock().unwrap().push(HostCall::Hide);
        }
        fn present_choice(&mut self, collect_ratings: bool) {
            self.calls.lock().unwrap().push(HostCall::Prompt(collect_ratings));
        }
    }

    struct NullWorld;

    impl WorldRotator for NullWorld {
        fn rotate_about(&mut self, _pivot: Planar, _yaw: Degrees) {}
    }

    struct Rig {
        seq: TrialSequencer<StdRng>,
        ctl: RedirectionController,
        host: FakeHost,
        sink: MemorySink,
        now: Seconds,
    }

    impl Rig {
        fn new(config: ExperimentConfig, participant_id: u32) -> Self {
            let host = FakeHost::default();
            let sink = MemorySink::new();
            let seq = TrialSequencer::new(
                config,
                participant_id,
                StdRng::seed_from_u64(participant_id as u64),
                Box::new(host.clone()),
                Box::new(sink.clone()),
            );
            let ctl = RedirectionController::new(RedirectionConfig::default())
                .with_world(Box::new(NullWorld));
            Self {
                seq,
                ctl,
                host,
                sink,
                now: 0.0,
            }
        }

        fn advance(&mut self, dt: Seconds) {
            self.now += dt;
            self.seq.tick(self.now, &mut self.ctl);
        }

        /// Ticks in large steps until the sequencer reaches `target`.
        fn advance_until(&mut self, target: SequencerState) {
            for _ in 0..10 {
                if self.seq.state() == target {
                    return;
                }
                self.advance(5.0);
            }
            panic!("stuck in {:?}, wanted {:?}", self.seq.state(), target);
        }

        /// Walks both runs of the current trial up to the question.
        fn walk_trial(&mut self) {
            self.advance_until(SequencerState::Running(RunIndex::First));
            self.seq.run_end(self.now, &mut self.ctl);
            self.advance_until(SequencerState::Running(RunIndex::Second));
            self.seq.run_end(self.now, &mut self.ctl);
            assert_eq!(self.seq.state(), SequencerState::AwaitingResponse);
        }

        fn answer(&mut self, choice: Option<RunIndex>) -> bool {
            self.seq.respond(
                self.now,
                Response {
                    choice,
                    ratings: Some((9, 0)),
                },
            )
        }

        fn manipulated_run(&self) -> Option<RunIndex> {
            match self.seq.current_trial().map(|t| t.kind) {
                Some(TrialKind::Manipulated { run, .. }) => Some(run),
                _ => None,
            }
        }
    }

    fn config(catch_trial_probability: f64) -> ExperimentConfig {
        let mut config = ExperimentConfig::default();
        config.sequencer.catch_trial_probability = catch_trial_probability;
        config
    }

    #[test]
    fn test_first_modality_by_parity() {
        assert_eq!(first_modality(0), Modality::Walking);
        assert_eq!(first_modality(4), Modality::Walking);
        assert_eq!(first_modality(1), Modality::Blink);
        assert_eq!(first_modality(7), Modality::Blink);
    }

    #[test]
    fn test_trial_lifecycle() {
        let mut rig = Rig::new(config(0.0), 1);
        rig.seq.start(0.0, &mut rig.ctl);
        assert_eq!(rig.seq.state(), SequencerState::Starting(RunIndex::First));
        assert_eq!(
            rig.host.calls(),
            vec![
                HostCall::Reset,
                HostCall::Snap,
                HostCall::Show(Overlay::RunStarting(RunIndex::First))
            ]
        );
        assert!(rig.ctl.is_paused());

        // nothing happens before the overlay delay runs out
        rig.advance(4.9);
        assert_eq!(rig.seq.state(), SequencerState::Starting(RunIndex::First));
        rig.advance(0.1);
        assert_eq!(rig.seq.state(), SequencerState::Running(RunIndex::First));
        assert!(rig.ctl.is_live());

        let (run, sign) = match rig.seq.current_trial().unwrap().kind {
            TrialKind::Manipulated { run, sign } => (run, sign),
            TrialKind::Catch => panic!("catch probability is zero"),
        };
        let expected = |r: RunIndex| if r == run { sign * 0.5 } else { 0.0 };
        assert_eq!(rig.ctl.blink_gain(), expected(RunIndex::First));

        rig.seq.run_end(rig.now, &mut rig.ctl);
        assert_eq!(rig.seq.state(), SequencerState::Starting(RunIndex::Second));
        assert!(!rig.ctl.is_live());
        assert_eq!(rig.ctl.blink_gain(), 0.0);

        rig.advance(5.0);
        assert_eq!(rig.ctl.blink_gain(), expected(RunIndex::Second));
        rig.seq.run_end(rig.now, &mut rig.ctl);
        assert_eq!(rig.seq.state(), SequencerState::AwaitingResponse);
        assert_eq!(rig.host.last_prompt(), Some(false));

        assert!(rig.answer(Some(run)));
        assert_eq!(rig.seq.state(), SequencerState::Idle);
        let records = rig.sink.records();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.modality, Modality::Blink);
        assert_eq!(r.correct, Some(true));
        assert_eq!(r.manipulated_run, Some(run));
        assert_eq!((r.gain_before, r.gain_after), (0.5, 0.5)); // clamped at min
        assert_eq!(r.step_direction, -1);
        // coarse phase: ratings are not collected
        assert_eq!((r.rating_confidence, r.rating_discomfort), (None, None));

        rig.advance(2.0);
        assert_eq!(rig.seq.state(), SequencerState::Starting(RunIndex::First));
        assert_eq!(rig.seq.current_trial().unwrap().total_trial, 1);
    }

    #[test]
    fn test_stray_inputs_are_ignored() {
        let mut rig = Rig::new(config(0.0), 2);
        assert!(!rig.answer(Some(RunIndex::First)));
        rig.seq.start(0.0, &mut rig.ctl);
        rig.seq.run_end(rig.now, &mut rig.ctl);
        assert_eq!(rig.seq.state(), SequencerState::Starting(RunIndex::First));

        rig.walk_trial();
        assert!(rig.answer(None));
        // duplicate answer
        assert!(!rig.answer(None));
        assert_eq!(rig.sink.records().len(), 1);

        // starting twice does nothing
        rig.seq.start(rig.now, &mut rig.ctl);
        assert_eq!(rig.seq.state(), SequencerState::Idle);
    }

    #[test]
    fn test_catch_trials_never_touch_the_staircase() {
        let mut rig = Rig::new(config(1.0), 3);
        let mut choices = StdRng::seed_from_u64(99);
        rig.seq.start(0.0, &mut rig.ctl);
        let before = rig.seq.staircase().state().clone();

        for _ in 0..1000 {
            rig.walk_trial();
            assert_eq!(rig.ctl.blink_gain(), 0.0);
            let choice = match choices.gen_range(0..3) {
                0 => None,
                1 => Some(RunIndex::First),
                _ => Some(RunIndex::Second),
            };
            assert!(rig.answer(choice));
            assert_eq!(rig.seq.staircase().state(), &before);
        }

        let records = rig.sink.records();
        assert_eq!(records.len(), 1000);
        for r in &records {
            assert!(r.is_catch);
            assert_eq!(r.correct, None);
            assert_eq!(r.false_alarm, Some(r.choice.is_some()));
            assert_eq!(r.manipulated_run, None);
        }
        assert_eq!(records[999].block_trial, 999);
    }

    #[test]
    fn test_ratings_only_in_fine_phase() {
        let mut cfg = config(0.0);
        cfg.staircase.coarse_min_reversals = 1;
        let mut rig = Rig::new(cfg, 5);
        rig.seq.start(0.0, &mut rig.ctl);

        // right, then wrong: one reversal, so the fine phase starts
        rig.walk_trial();
        let run = rig.manipulated_run().unwrap();
        rig.answer(Some(run));
        rig.advance(2.0);
        rig.walk_trial();
        rig.answer(None);
        assert_eq!(rig.seq.state(), SequencerState::PhaseTransition);
        assert!(rig.host.calls().iter().any(|c| matches!(
            c,
            HostCall::Show(Overlay::PhaseTransition { modality: Modality::Blink, .. })
        )));

        rig.advance(3.0);
        rig.walk_trial();
        assert_eq!(rig.host.last_prompt(), Some(true));
        rig.answer(None);

        let records = rig.sink.records();
        assert_eq!(records[1].phase, Phase::Coarse);
        assert_eq!(records[1].rating_confidence, None);
        assert_eq!(records[2].phase, Phase::Fine);
        // clamped into the 5-point scale
        assert_eq!(records[2].rating_confidence, Some(5));
        assert_eq!(records[2].rating_discomfort, Some(1));
    }

    #[test]
    fn test_full_experiment_runs_both_blocks() {
        let mut cfg = config(0.2);
        cfg.staircase.max_trials_per_block = 12;
        let mut rig = Rig::new(cfg, 4);
        let mut answers = StdRng::seed_from_u64(5);
        rig.seq.start(0.0, &mut rig.ctl);
        assert_eq!(rig.seq.modality(), Modality::Walking);

        let mut guard = 0;
        while !rig.seq.is_finished() {
            guard += 1;
            assert!(guard < 10_000, "experiment did not terminate");
            match rig.seq.state() {
                SequencerState::AwaitingResponse => {
                    let choice = match rig.manipulated_run() {
                        Some(run) if answers.gen_bool(0.7) => Some(run),
                        _ => Some(RunIndex::First),
                    };
                    assert!(rig.answer(choice));
                }
                SequencerState::Running(_) => rig.seq.run_end(rig.now, &mut rig.ctl),
                _ => rig.advance(1.0),
            }
        }

        let blocks = rig.sink.blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].modality, Modality::Walking);
        assert_eq!(blocks[1].modality, Modality::Blink);
        for b in &blocks {
            let limits = *ExperimentConfig::default().limits(b.modality);
            assert!(b.threshold >= limits.min_value && b.threshold <= limits.max_value);
        }
        assert_eq!(rig.seq.thresholds().len(), 2);
        assert!(rig.host.calls().iter().any(|c| matches!(
            c,
            HostCall::Show(Overlay::ExperimentFinished {
                blink: Some(_),
                walking: Some(_)
            })
        )));

        // the experiment stays finished
        assert!(rig.seq.next_due().is_none());
        rig.advance(100.0);
        assert!(rig.seq.is_finished());
        assert!(!rig.answer(Some(RunIndex::First)));

        let records = rig.sink.records();
        let total: u32 = blocks.iter().map(|b| b.trials).sum();
        assert_eq!(records.len() as u32, total);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.total_trial, i as u32);
        }
    }
}
