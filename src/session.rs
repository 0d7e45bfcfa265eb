//! Ties the gate, the controller and the sequencer to one host tick.

use crate::blink_gate::{BlinkEvent, BlinkGate};
use crate::config::ExperimentConfig;
use crate::redirection::{Occluder, RedirectionController, RedirectionError, WorldRotator};
use crate::sensor_feed::{SensorFrame, SensorSource};
use crate::trial_record::{Response, TrialSink};
use crate::trial_sequencer::{ExperimentHost, TrialSequencer};
use crate::Seconds;

use log::debug;
use rand::Rng;

/// One participant's experiment, advanced frame by frame.
pub struct Session<R: Rng> {
    gate: BlinkGate,
    controller: RedirectionController,
    sequencer: TrialSequencer<R>,
    // Controller epoch the gate was last reset for.
    gate_epoch: u64,
}

impl<R: Rng> Session<R> {
    /// Builds a session. The occluder is optional; without one no blackout
    /// is shown.
    pub fn new(
        config: ExperimentConfig,
        participant_id: u32,
        rng: R,
        world: Box<dyn WorldRotator>,
        occluder: Option<Box<dyn Occluder>>,
        host: Box<dyn ExperimentHost>,
        sink: Box<dyn TrialSink>,
    ) -> Self {
        let mut controller = RedirectionController::new(config.redirection).with_world(world);
        if let Some(occluder) = occluder {
            controller = controller.with_occluder(occluder);
        }
        Self {
            gate: BlinkGate::new(config.blink),
            gate_epoch: controller.blink_epoch(),
            controller,
            sequencer: TrialSequencer::new(config, participant_id, rng, host, sink),
        }
    }

    /// Starts the first block.
    pub fn start(&mut self, now_s: Seconds) {
        self.sequencer.start(now_s, &mut self.controller);
    }

    /// Processes one frame: blink edges first, then head motion, then
    /// anything on the timeline that has come due.
    ///
    /// A rotation error does not stop the tick; the remaining steps still
    /// run and the error is returned afterwards.
    pub fn tick(&mut self, frame: &SensorFrame) -> Result<(), RedirectionError> {
        let mut outcome = Ok(());

        if self.controller.blink_epoch() != self.gate_epoch {
            self.gate_epoch = self.controller.blink_epoch();
            self.gate.reset();
        }

        match self.gate.observe(frame.eyes.as_ref()) {
            Some(BlinkEvent::Onset(_)) => {
                if let Err(error) = self.controller.on_blink_onset() {
                    outcome = Err(error);
                }
            }
            Some(BlinkEvent::Offset(_)) => {
                if self.controller.on_blink_offset() {
                    debug!("blackout after blink at {:.3}s", frame.time_s);
                }
            }
            None => {}
        }

        if let Some(head) = frame.head {
            if let Err(error) = self.controller.on_motion_sample(head) {
                outcome = Err(error);
            }
        }

        self.sequencer.tick(frame.time_s, &mut self.controller);
        outcome
    }

    /// Ticks every frame waiting in `source`. Returns how many were
    /// processed, or the first rotation error once all of them are.
    ///
    /// Once the experiment has finished, whatever is left in `source` is
    /// dropped.
    pub fn drain(&mut self, source: &mut impl SensorSource) -> Result<usize, RedirectionError> {
        let mut processed = 0;
        let mut outcome = Ok(());
        for frame in &mut *source {
            if self.is_finished() {
                break;
            }
            if let Err(error) = self.tick(&frame) {
                outcome = outcome.and(Err(error));
            }
            processed += 1;
        }
        if self.is_finished() {
            source.clear();
        }
        outcome.map(|_| processed)
    }

    /// Forwards the end of a run.
    pub fn run_end(&mut self, now_s: Seconds) {
        self.sequencer.run_end(now_s, &mut self.controller);
    }

    /// Forwards an answer. Returns whether it was used.
    pub fn respond(&mut self, now_s: Seconds, response: Response) -> bool {
        self.sequencer.respond(now_s, response)
    }

    /// The trial sequencer.
    pub fn sequencer(&self) -> &TrialSequencer<R> {
        &self.sequencer
    }

    /// The redirection controller.
    pub fn controller(&self) -> &RedirectionController {
        &self.controller
    }

    /// Whether both blocks are done.
    pub fn is_finished(&self) -> bool {
        self.sequencer.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blink_gate::{BlinkSample, EyeReading};
    use crate::sensor_feed::SensorFeed;
    use crate::trial_record::{MemorySink, RunIndex};
    use crate::trial_sequencer::{Overlay, SequencerState, TrialKind};
    use crate::{Degrees, Planar};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        rotations: Arc<Mutex<Vec<Degrees>>>,
        blackouts: Arc<Mutex<u32>>,
    }

    impl WorldRotator for Recorder {
        fn rotate_about(&mut self, _pivot: Planar, yaw: Degrees) {
            self.rotations.lock().unwrap().push(yaw);
        }
    }

    impl Occluder for Recorder {
        fn occlude(&mut self, _duration_s: Seconds) {
            *self.blackouts.lock().unwrap() += 1;
        }
    }

    struct QuietHost;

    impl ExperimentHost for QuietHost {
        fn reset_world(&mut self) {}
        fn begin_invisible_snap(&mut self, _window_s: Seconds) {}
        fn show_overlay(&mut self, _overlay: &Overlay) {}
        fn hide_overlay(&mut self) {}
        fn present_choice(&mut self, _collect_ratings: bool) {}
    }

    fn eye_frame(t: Seconds, openness: f32) -> SensorFrame {
        SensorFrame {
            time_s: t,
            eyes: Some(BlinkSample {
                left: EyeReading::open(openness),
                right: EyeReading::open(openness),
                timestamp_s: t,
            }),
            head: None,
        }
    }

    fn session(participant_id: u32, recorder: &Recorder) -> Session<StdRng> {
        let mut config = ExperimentConfig::default();
        config.sequencer.catch_trial_probability = 0.0;
        Session::new(
            config,
            participant_id,
            StdRng::seed_from_u64(8),
            Box::new(recorder.clone()),
            Some(Box::new(recorder.clone())),
            Box::new(QuietHost),
            Box::new(MemorySink::new()),
        )
    }

    /// Ticks until the first run of the first trial is live.
    fn start_first_run(session: &mut Session<StdRng>) -> Seconds {
        session.start(0.0);
        let mut t = 0.0;
        while session.sequencer().state() != SequencerState::Running(RunIndex::First) {
            t += 0.5;
            session.tick(&SensorFrame::empty(t)).unwrap();
            assert!(t < 60.0);
        }
        t
    }

    #[test]
    fn test_blink_run_rotates_only_when_live() {
        let recorder = Recorder::default();
        let mut session = session(1, &recorder);

        // a blink before the experiment runs does nothing
        session.tick(&eye_frame(0.0, 0.0)).unwrap();
        assert!(recorder.rotations.lock().unwrap().is_empty());

        let t = start_first_run(&mut session);
        let manipulated_first = matches!(
            session.sequencer().current_trial().unwrap().kind,
            TrialKind::Manipulated { run: RunIndex::First, .. }
        );

        for (dt, openness) in [(0.1, 0.9), (0.2, 0.1), (0.6, 0.9)] {
            session.tick(&eye_frame(t + dt, openness)).unwrap();
        }

        let rotations = recorder.rotations.lock().unwrap().clone();
        if manipulated_first {
            assert_eq!(rotations.len(), 1);
            assert_eq!(rotations[0].abs(), 0.5);
        } else {
            assert!(rotations.is_empty());
        }
        // blackout follows every blink in a live run
        assert_eq!(*recorder.blackouts.lock().unwrap(), 1);
    }

    #[test]
    fn test_walking_run_rotates_with_distance() {
        let recorder = Recorder::default();
        let mut session = session(0, &recorder);
        let t = start_first_run(&mut session);
        let manipulated_first = matches!(
            session.sequencer().current_trial().unwrap().kind,
            TrialKind::Manipulated { run: RunIndex::First, .. }
        );

        let mut feed = SensorFeed::new();
        for i in 0..=10 {
            feed.push(SensorFrame {
                time_s: t + 0.1 * i as f64,
                eyes: None,
                head: Some(Planar::new(0.0, 0.1 * i as f64)),
            });
        }
        assert_eq!(session.drain(&mut feed), Ok(11));

        let total: Degrees = recorder.rotations.lock().unwrap().iter().map(|y| y.abs()).sum();
        if manipulated_first {
            // 1 m at the initial 2 deg/m
            assert!((total - 2.0).abs() < 1e-9);
        } else {
            assert_eq!(total, 0.0);
        }

        session.run_end(t + 1.0);
        assert_eq!(session.sequencer().state(), SequencerState::Starting(RunIndex::Second));
        assert!(!session.controller().is_live());
    }

    #[test]
    fn test_run_goes_live_after_overlay_delay() {
        let mut config = ExperimentConfig::default();
        config.sequencer.catch_trial_probability = 0.0;
        let mut session = Session::new(
            config,
            1,
            StdRng::seed_from_u64(3),
            Box::new(Recorder::default()),
            None,
            Box::new(QuietHost),
            Box::new(MemorySink::new()),
        );
        session.start(0.0);
        session.tick(&SensorFrame::empty(4.0)).unwrap();
        assert!(!session.controller().is_live());
        session.tick(&SensorFrame::empty(5.0)).unwrap();
        assert!(session.controller().is_live());
        assert_eq!(session.sequencer().state(), SequencerState::Running(RunIndex::First));
    }

    #[test]
    fn test_blink_closed_across_run_start_fires_once_live() {
        let recorder = Recorder::default();
        let mut session = session(1, &recorder);
        session.start(0.0);
        session.tick(&SensorFrame::empty(4.0)).unwrap();

        // eyes shut before the run goes live and kept shut after
        session.tick(&eye_frame(4.9, 0.0)).unwrap();
        session.tick(&eye_frame(5.0, 0.0)).unwrap();
        assert_eq!(session.sequencer().state(), SequencerState::Running(RunIndex::First));
        assert!(recorder.rotations.lock().unwrap().is_empty());

        session.tick(&eye_frame(5.1, 0.0)).unwrap();
        session.tick(&eye_frame(5.2, 0.0)).unwrap();
        session.tick(&eye_frame(5.6, 0.9)).unwrap();

        let manipulated_first = matches!(
            session.sequencer().current_trial().unwrap().kind,
            TrialKind::Manipulated { run: RunIndex::First, .. }
        );
        let rotations = recorder.rotations.lock().unwrap().len();
        assert_eq!(rotations, if manipulated_first { 1 } else { 0 });
        assert_eq!(*recorder.blackouts.lock().unwrap(), 1);
    }

    #[test]
    fn test_drain_drops_frames_after_finish() {
        let mut config = ExperimentConfig::default();
        config.sequencer.catch_trial_probability = 0.0;
        config.staircase.max_trials_per_block = 1;
        let mut session = Session::new(
            config,
            2,
            StdRng::seed_from_u64(5),
            Box::new(Recorder::default()),
            None,
            Box::new(QuietHost),
            Box::new(MemorySink::new()),
        );
        session.start(0.0);

        let mut t = 0.0;
        while !session.is_finished() {
            t += 0.5;
            assert!(t < 200.0);
            session.tick(&SensorFrame::empty(t)).unwrap();
            match session.sequencer().state() {
                SequencerState::Running(_) => session.run_end(t),
                SequencerState::AwaitingResponse => {
                    session.respond(
                        t,
                        Response {
                            choice: Some(RunIndex::First),
                            ratings: None,
                        },
                    );
                }
                _ => {}
            }
        }
        assert_eq!(session.sequencer().thresholds().len(), 2);

        let mut feed = SensorFeed::new();
        for i in 1..=3 {
            feed.push(SensorFrame::empty(t + i as f64));
        }
        assert_eq!(session.drain(&mut feed), Ok(0));
        assert!(feed.is_empty());
    }
}
