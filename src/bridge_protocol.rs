//! A line protocol for driving the experiment from a separate host engine.
//!
//! The host writes one command per line:
//!
//! ```text
//! START
//! EYE 0.95 1 0.93 1
//! HEAD 0.000 1.250
//! TICK 12.345
//! RUNEND
//! CHOICE 2 4 1
//! ```
//!
//! `EYE`, `NOEYE` and `HEAD` fill in the current frame; `TICK` closes it.
//! The core answers with [`HostCommand`] lines such as `ROTATE 0.000 1.250 2.5`.

use crate::blink_gate::EyeReading;
use crate::redirection::{Occluder, WorldRotator};
use crate::trial_record::{Response, RunIndex};
use crate::trial_sequencer::{ExperimentHost, Overlay};
use crate::{Degrees, Planar, Seconds};

use log::warn;
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, space0, space1, u8},
    combinator::{all_consuming, map, opt, value},
    error::Error,
    number::complete::{double, float},
    sequence::{delimited, pair, preceded, tuple},
    Finish, IResult,
};
use std::{borrow::Cow, fmt, str::FromStr, sync::mpsc::Sender};

/// One line from the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BridgeInput {
    /// Start the experiment.
    Start,
    /// Close the current frame at this host time.
    Tick(Seconds),
    /// Eye openness for this frame.
    Eye {
        left: EyeReading,
        right: EyeReading,
    },
    /// No eye data this frame.
    NoEye,
    /// Planar head position for this frame.
    Head(Planar),
    /// The participant reached the end of the path.
    RunEnd,
    /// The participant's answer.
    Choice(Response),
}

/// One line to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    /// Rotate the environment by `yaw` about `pivot`.
    Rotate {
        /// Point on the floor to rotate about.
        pivot: Planar,
        /// Signed rotation in degrees.
        yaw: Degrees,
    },
    /// Black out the view for this many seconds.
    Occlude(Seconds),
    /// Put the environment and rig back at the start pose.
    Reset,
    /// Open an invisible floor snap window of this many seconds.
    Snap(Seconds),
    /// Show this text on the overlay.
    Overlay(String),
    /// Hide the overlay.
    Hide,
    /// Ask for the answer, with or without ratings.
    Prompt(bool),
    /// The experiment is over.
    Done,
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostCommand::Rotate { pivot, yaw } => {
                write!(f, "ROTATE {:.4} {:.4} {:.4}", pivot.x, pivot.z, yaw)
            }
            HostCommand::Occlude(s) => write!(f, "OCCLUDE {:.3}", s),
            HostCommand::Reset => write!(f, "RESET"),
            HostCommand::Snap(s) => write!(f, "SNAP {:.3}", s),
            HostCommand::Overlay(text) => write!(f, "OVERLAY {}", text.replace('\n', " ")),
            HostCommand::Hide => write!(f, "HIDE"),
            HostCommand::Prompt(true) => write!(f, "PROMPT ratings"),
            HostCommand::Prompt(false) => write!(f, "PROMPT noratings"),
            HostCommand::Done => write!(f, "DONE"),
        }
    }
}

/// A line that could not be understood.
#[derive(Debug, PartialEq)]
pub enum BridgeError {
    /// The line did not match any command.
    ParseError(Error<String>),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            BridgeError::ParseError(error) => {
                Cow::from(format!("cannot parse {:?} ({:?})", error.input, error.code))
            }
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for BridgeError {}

impl From<Error<&str>> for BridgeError {
    fn from(Error { input, code }: Error<&str>) -> Self {
        BridgeError::ParseError(Error {
            input: input.to_string(),
            code,
        })
    }
}

fn parse_flag(s: &str) -> IResult<&str, bool> {
    alt((value(true, char('1')), value(false, char('0'))))(s)
}

fn parse_eye(s: &str) -> IResult<&str, EyeReading> {
    map(
        pair(preceded(space1, float), preceded(space1, parse_flag)),
        |(openness, valid)| EyeReading { openness, valid },
    )(s)
}

fn parse_choice(s: &str) -> IResult<&str, Response> {
    map(
        pair(
            preceded(
                space1,
                alt((
                    value(Some(RunIndex::First), char('1')),
                    value(Some(RunIndex::Second), char('2')),
                    value(None, tag("none")),
                )),
            ),
            opt(pair(preceded(space1, u8), preceded(space1, u8))),
        ),
        |(choice, ratings)| Response { choice, ratings },
    )(s)
}

fn parse_input(s: &str) -> IResult<&str, BridgeInput> {
    all_consuming(delimited(
        space0,
        alt((
            value(BridgeInput::Start, tag("START")),
            map(preceded(pair(tag("TICK"), space1), double), BridgeInput::Tick),
            value(BridgeInput::NoEye, tag("NOEYE")),
            map(
                preceded(tag("EYE"), tuple((parse_eye, parse_eye))),
                |(left, right)| BridgeInput::Eye { left, right },
            ),
            map(
                preceded(
                    tag("HEAD"),
                    pair(preceded(space1, double), preceded(space1, double)),
                ),
                |(x, z)| BridgeInput::Head(Planar::new(x, z)),
            ),
            value(BridgeInput::RunEnd, tag("RUNEND")),
            map(preceded(tag("CHOICE"), parse_choice), BridgeInput::Choice),
        )),
        space0,
    ))(s)
}

impl FromStr for BridgeInput {
    type Err = BridgeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_input(s.trim_end_matches(['\r', '\n'])).finish() {
            Ok((_remaining, input)) => Ok(input),
            Err(error) => Err(error.into()),
        }
    }
}

/// Sends every host-facing call as a [`HostCommand`] over a channel.
/// Clones share the channel, so one link can serve as world, occluder and
/// experiment host at once.
#[derive(Debug, Clone)]
pub struct CommandLink {
    tx: Sender<HostCommand>,
}

impl CommandLink {
    /// Sends commands down `tx`.
    pub fn new(tx: Sender<HostCommand>) -> Self {
        Self { tx }
    }

    /// Sends a command. A closed channel is logged, not fatal.
    pub fn send(&self, command: HostCommand) {
        if let Err(error) = self.tx.send(command) {
            warn!("host command dropped: {}", error.0);
        }
    }
}

impl WorldRotator for CommandLink {
    fn rotate_about(&mut self, pivot: Planar, yaw: Degrees) {
        self.send(HostCommand::Rotate { pivot, yaw });
    }
}

impl Occluder for CommandLink {
    fn occlude(&mut self, duration_s: Seconds) {
        self.send(HostCommand::Occlude(duration_s));
    }
}

impl ExperimentHost for CommandLink {
    fn reset_world(&mut self) {
        self.send(HostCommand::Reset);
    }

    fn begin_invisible_snap(&mut self, window_s: Seconds) {
        self.send(HostCommand::Snap(window_s));
    }

    fn show_overlay(&mut self, overlay: &Overlay) {
        self.send(HostCommand::Overlay(overlay.to_string()));
        if matches!(overlay, Overlay::ExperimentFinished { .. }) {
            self.send(HostCommand::Done);
        }
    }

    fn hide_overlay(&mut self) {
        self.send(HostCommand::Hide);
    }

    fn present_choice(&mut self, collect_ratings: bool) {
        self.send(HostCommand::Prompt(collect_ratings));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    fn parse(line: &str) -> Result<BridgeInput, BridgeError> {
        line.parse()
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse("START"), Ok(BridgeInput::Start));
        assert_eq!(parse("RUNEND\n"), Ok(BridgeInput::RunEnd));
        assert_eq!(parse("NOEYE\r\n"), Ok(BridgeInput::NoEye));
        assert_eq!(parse("TICK 12.5"), Ok(BridgeInput::Tick(12.5)));
    }

    #[test]
    fn test_eye_and_head() {
        assert_eq!(
            parse("EYE 0.95 1 0.1 0"),
            Ok(BridgeInput::Eye {
                left: EyeReading::open(0.95),
                right: EyeReading {
                    openness: 0.1,
                    valid: false
                },
            })
        );
        assert_eq!(
            parse("HEAD -0.5 2"),
            Ok(BridgeInput::Head(Planar::new(-0.5, 2.0)))
        );
    }

    #[test]
    fn test_choices() {
        assert_eq!(
            parse("CHOICE 2 4 1"),
            Ok(BridgeInput::Choice(Response {
                choice: Some(RunIndex::Second),
                ratings: Some((4, 1)),
            }))
        );
        assert_eq!(
            parse("CHOICE none"),
            Ok(BridgeInput::Choice(Response {
                choice: None,
                ratings: None,
            }))
        );
    }

    #[test]
    fn test_malformed_lines() {
        for line in ["", "TICK", "TICK abc", "EYE 0.5 1", "CHOICE 3", "HEAD 1 2 3", "JUMP"] {
            assert!(
                line.parse::<BridgeInput>().is_err(),
                "{:?} should not parse",
                line
            );
        }
    }

    #[test]
    fn test_output_lines() {
        let rotate = HostCommand::Rotate {
            pivot: Planar::new(1.0, -2.0),
            yaw: 2.5,
        };
        assert_eq!(rotate.to_string(), "ROTATE 1.0000 -2.0000 2.5000");
        assert_eq!(HostCommand::Occlude(0.4).to_string(), "OCCLUDE 0.400");
        assert_eq!(HostCommand::Prompt(false).to_string(), "PROMPT noratings");
    }

    #[test]
    fn test_link_reports_finish() {
        let (tx, rx) = channel();
        let mut link = CommandLink::new(tx);
        link.show_overlay(&Overlay::ExperimentFinished {
            blink: Some(1.0),
            walking: None,
        });
        link.rotate_about(Planar::default(), 1.0);
        drop(link);

        let sent: Vec<HostCommand> = rx.iter().collect();
        assert_eq!(sent.len(), 3);
        assert!(matches!(sent[0], HostCommand::Overlay(_)));
        assert_eq!(sent[1], HostCommand::Done);
    }
}
