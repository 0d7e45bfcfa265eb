//! Experiment configuration, stored as [ron].
//!
//! Every tunable must be present in the file; there are no silent defaults.
//! [`ExperimentConfig::default()`] is the reference configuration used by
//! the simulator and is what `rdw print-config` writes out as a template:
//!
//! ```text
//! (
//!     blink: (blink_threshold: 0.3, min_blink_interval_s: 0.25),
//!     redirection: (
//!         min_move_distance_m: 0.01,
//!         teleport_threshold_m: 0.3,
//!         blackout: Some((duration_s: 0.4, on_zero_gain: true)),
//!     ),
//!     staircase: (...),
//!     blink_limits: (...),
//!     walking_limits: (...),
//!     sequencer: (...),
//! )
//! ```

use crate::blink_gate::BlinkConfig;
use crate::redirection::RedirectionConfig;
use crate::staircase::{Modality, ModalityLimits, StaircaseConfig};
use crate::Seconds;

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, fs, path::Path};

/// Timing and trial-drawing settings for the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Probability that a trial is a catch trial.
    pub catch_trial_probability: f64,
    /// Overlay time before each run starts.
    pub pre_run_delay_s: Seconds,
    /// Pause after an answer before the next trial is prepared.
    pub inter_trial_delay_s: Seconds,
    /// Overlay time announcing the fine phase.
    pub phase_transition_delay_s: Seconds,
    /// Overlay time between the two blocks.
    pub block_transition_delay_s: Seconds,
    /// Window in which the floor alignment may snap the rig unseen.
    pub invisible_snap_s: Seconds,
    /// Number of points on each rating scale.
    pub likert_points: u8,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            catch_trial_probability: 0.15,
            pre_run_delay_s: 5.0,
            inter_trial_delay_s: 2.0,
            phase_transition_delay_s: 3.0,
            block_transition_delay_s: 5.0,
            invisible_snap_s: 0.25,
            likert_points: 5,
        }
    }
}

/// Everything the experiment can be tuned with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Blink detection.
    pub blink: BlinkConfig,
    /// Rotation and blackout.
    pub redirection: RedirectionConfig,
    /// Staircase rules shared by both blocks.
    pub staircase: StaircaseConfig,
    /// Limits of the blink block, in degrees per blink.
    pub blink_limits: ModalityLimits,
    /// Limits of the walking block, in degrees per metre.
    pub walking_limits: ModalityLimits,
    /// Trial timing and drawing.
    pub sequencer: SequencerConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            blink: BlinkConfig::default(),
            redirection: RedirectionConfig::default(),
            staircase: StaircaseConfig::default(),
            blink_limits: ModalityLimits::blink(),
            walking_limits: ModalityLimits::walking(),
            sequencer: SequencerConfig::default(),
        }
    }
}

/// Things that can go wrong loading or saving a configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Reading or writing the file failed.
    IoError(std::io::Error),
    /// Serializing the configuration failed.
    RonError(ron::Error),
    /// The file is not a valid configuration.
    RonSpannedError(ron::de::SpannedError),
    /// The configuration parsed but makes no sense.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ConfigError as CE;
        let msg = match self {
            CE::IoError(error) => Cow::from(format!("io error: {}", error)),
            CE::RonError(error) => Cow::from(format!("ron error: {}", error)),
            CE::RonSpannedError(error) => Cow::from(format!("ron parse error: {}", error)),
            CE::Invalid(reason) => Cow::from(format!("invalid configuration: {}", reason)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value)
    }
}

impl From<ron::Error> for ConfigError {
    fn from(value: ron::Error) -> Self {
        Self::RonError(value)
    }
}

impl From<ron::de::SpannedError> for ConfigError {
    fn from(value: ron::de::SpannedError) -> Self {
        Self::RonSpannedError(value)
    }
}

impl ExperimentConfig {
    /// Reads and validates a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }

    /// Parses and validates a configuration.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: ExperimentConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as pretty-printed RON.
    pub fn to_ron_string(&self) -> Result<String, ConfigError> {
        let pretty = ron::ser::PrettyConfig::new().depth_limit(3);
        Ok(ron::ser::to_string_pretty(self, pretty)?)
    }

    /// Limits for the given modality.
    pub fn limits(&self, modality: Modality) -> &ModalityLimits {
        match modality {
            Modality::Blink => &self.blink_limits,
            Modality::Walking => &self.walking_limits,
        }
    }

    /// Rejects configurations the experiment cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(reason))
        };

        if let Some((name, _)) = self.float_fields().into_iter().find(|(_, v)| !v.is_finite()) {
            return invalid(format!("{name} must be a finite number"));
        }

        if !(0.0..=1.0).contains(&self.blink.blink_threshold) {
            return invalid("blink_threshold must lie in [0, 1]".into());
        }
        if self.blink.min_blink_interval_s < 0.0 {
            return invalid("min_blink_interval_s must not be negative".into());
        }
        let r = &self.redirection;
        if r.min_move_distance_m < 0.0 || r.teleport_threshold_m <= r.min_move_distance_m {
            return invalid("need 0 <= min_move_distance_m < teleport_threshold_m".into());
        }
        if r.blackout.is_some_and(|b| b.duration_s < 0.0) {
            return invalid("blackout duration_s must not be negative".into());
        }
        for modality in [Modality::Blink, Modality::Walking] {
            let l = self.limits(modality);
            if l.min_value > l.max_value {
                return invalid(format!("{modality}: min_value exceeds max_value"));
            }
            if l.coarse_step <= 0.0 {
                return invalid(format!("{modality}: coarse_step must be positive"));
            }
            if l.convergence_range < 0.0 {
                return invalid(format!("{modality}: convergence_range must not be negative"));
            }
        }
        let s = &self.staircase;
        if s.fine_start_step_factor <= 0.0 || s.fine_step_floor <= 0.0 {
            return invalid("fine_start_step_factor and fine_step_floor must be positive".into());
        }
        if s.max_trials_per_block == 0 {
            return invalid("max_trials_per_block must be positive".into());
        }
        if s.convergence_window == Some(0) {
            return invalid("convergence_window must be positive when set".into());
        }
        let q = &self.sequencer;
        // at 1.0 no staircase trial is ever drawn and a block never ends
        if !(0.0..1.0).contains(&q.catch_trial_probability) {
            return invalid("catch_trial_probability must lie in [0, 1)".into());
        }
        let delays = [
            q.pre_run_delay_s,
            q.inter_trial_delay_s,
            q.phase_transition_delay_s,
            q.block_transition_delay_s,
            q.invisible_snap_s,
        ];
        if delays.iter().any(|d| *d < 0.0) {
            return invalid("sequencer delays must not be negative".into());
        }
        if q.likert_points < 2 {
            return invalid("likert_points must be at least 2".into());
        }
        Ok(())
    }

    /// Every floating point setting, by name.
    fn float_fields(&self) -> Vec<(String, f64)> {
        let r = &self.redirection;
        let s = &self.staircase;
        let q = &self.sequencer;
        let mut fields = vec![
            ("blink_threshold".to_string(), f64::from(self.blink.blink_threshold)),
            ("min_blink_interval_s".to_string(), self.blink.min_blink_interval_s),
            ("min_move_distance_m".to_string(), r.min_move_distance_m),
            ("teleport_threshold_m".to_string(), r.teleport_threshold_m),
            ("fine_start_step_factor".to_string(), s.fine_start_step_factor),
            ("fine_step_floor".to_string(), s.fine_step_floor),
            ("catch_trial_probability".to_string(), q.catch_trial_probability),
            ("pre_run_delay_s".to_string(), q.pre_run_delay_s),
            ("inter_trial_delay_s".to_string(), q.inter_trial_delay_s),
            ("phase_transition_delay_s".to_string(), q.phase_transition_delay_s),
            ("block_transition_delay_s".to_string(), q.block_transition_delay_s),
            ("invisible_snap_s".to_string(), q.invisible_snap_s),
        ];
        if let Some(blackout) = r.blackout {
            fields.push(("blackout duration_s".to_string(), blackout.duration_s));
        }
        for modality in [Modality::Blink, Modality::Walking] {
            let l = self.limits(modality);
            fields.extend([
                (format!("{modality}: min_value"), l.min_value),
                (format!("{modality}: max_value"), l.max_value),
                (format!("{modality}: initial_value"), l.initial_value),
                (format!("{modality}: coarse_step"), l.coarse_step),
                (format!("{modality}: convergence_range"), l.convergence_range),
            ]);
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        assert!(ExperimentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_ron_round_trip_through_file() {
        let config = ExperimentConfig::default();
        let text = config.to_ron_string().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();

        let loaded = ExperimentConfig::from_path(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let text = ExperimentConfig::default()
            .to_ron_string()
            .unwrap()
            .lines()
            .filter(|line| !line.contains("likert_points"))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(matches!(
            ExperimentConfig::from_ron_str(&text),
            Err(ConfigError::RonSpannedError(_))
        ));
    }

    #[test]
    fn test_inverted_limits_are_rejected() {
        let mut config = ExperimentConfig::default();
        config.walking_limits.min_value = 30.0;
        match config.validate() {
            Err(ConfigError::Invalid(reason)) => assert!(reason.starts_with("walking")),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_nan_limit_is_rejected() {
        let text = ExperimentConfig::default().to_ron_string().unwrap();
        let start = text.find("min_value: ").unwrap() + "min_value: ".len();
        let end = start + text[start..].find(',').unwrap();
        let text = format!("{}NaN{}", &text[..start], &text[end..]);

        match ExperimentConfig::from_ron_str(&text) {
            Err(ConfigError::Invalid(reason)) => {
                assert_eq!(reason, "blink: min_value must be a finite number")
            }
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_infinite_step_settings_are_rejected() {
        let mut config = ExperimentConfig::default();
        config.staircase.fine_step_floor = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.walking_limits.coarse_step = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_probability_is_rejected() {
        let mut config = ExperimentConfig::default();
        config.sequencer.catch_trial_probability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ExperimentConfig::from_path(dir.path().join("nope.ron")),
            Err(ConfigError::IoError(_))
        ));
    }
}
