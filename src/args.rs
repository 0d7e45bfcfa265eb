// Commandline argument parser using clap for rdw

use clap::{Args, Parser, Subcommand};

/// Blink and walking redirection threshold experiment.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct RdwArgs {
    /// Experiment configuration in RON; the reference configuration is used
    /// when absent
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    /// What to do
    pub command: CommandTask,
}

/// Subcommands of `rdw`.
#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Run the whole experiment against a synthetic participant
    #[command(about)]
    Simulate(SimulateCommand),

    /// Drive the experiment from a host engine over stdin/stdout
    #[command(about)]
    Bridge(BridgeCommand),

    /// Print the reference configuration as RON
    #[command(about)]
    PrintConfig,
}

/// Arguments of `rdw simulate`.
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct SimulateCommand {
    /// Participant ID; even IDs start with walking, odd IDs with blink
    #[arg(short = 'p', long = "participant")]
    pub participant: u32,

    /// CSV file trial rows are appended to
    #[arg(short = 'o', long = "out")]
    pub outfile: String,

    /// Random seed for the trial draws and the participant
    #[arg(short = 's', long = "seed", default_value_t = 0)]
    pub seed: u64,

    /// The synthetic participant's blink threshold, in degrees per blink
    #[arg(long = "blink-threshold")]
    pub blink_threshold: Option<f64>,

    /// The synthetic participant's walking threshold, in degrees per metre
    #[arg(long = "walking-threshold")]
    pub walking_threshold: Option<f64>,

    /// Simulated frames per second
    #[arg(long = "tick-hz", default_value_t = 90.0)]
    pub tick_hz: f64,

    /// Run at wall-clock speed instead of as fast as possible
    #[arg(long = "realtime")]
    pub realtime: bool,
}

/// Arguments of `rdw bridge`.
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct BridgeCommand {
    /// Participant ID; even IDs start with walking, odd IDs with blink
    #[arg(short = 'p', long = "participant")]
    pub participant: u32,

    /// CSV file trial rows are appended to
    #[arg(short = 'o', long = "out")]
    pub outfile: String,

    /// Random seed for the trial draws
    #[arg(short = 's', long = "seed", default_value_t = 0)]
    pub seed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulate_args() {
        let args = RdwArgs::try_parse_from([
            "rdw",
            "--config",
            "study.ron",
            "simulate",
            "-p",
            "3",
            "--out",
            "trials.csv",
            "--walking-threshold",
            "7.5",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some("study.ron"));
        match args.command {
            CommandTask::Simulate(cmd) => {
                assert_eq!(cmd.participant, 3);
                assert_eq!(cmd.outfile, "trials.csv");
                assert_eq!(cmd.seed, 0);
                assert_eq!(cmd.blink_threshold, None);
                assert_eq!(cmd.walking_threshold, Some(7.5));
                assert!(!cmd.realtime);
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn test_bridge_needs_a_participant() {
        assert!(RdwArgs::try_parse_from(["rdw", "bridge", "--out", "x.csv"]).is_err());
        assert!(RdwArgs::try_parse_from(["rdw", "print-config"]).is_ok());
    }
}
