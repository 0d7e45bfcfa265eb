//! Off-tick workers.
//!
//! Anything slow (file output, mostly) runs as a [`Component`] on its own
//! thread and is fed through a channel, so the per-frame tick that drives
//! the experiment never waits on it.

use log::{info, warn};
use std::fmt;
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};

/// Errors a component can report when it shuts down.
#[derive(Debug)]
pub enum ComponentError {
    /// The component's output could not be flushed or closed.
    IoError(std::io::Error),
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentError::IoError(error) => write!(f, "io error: {}", error),
        }
    }
}

impl std::error::Error for ComponentError {}

impl From<std::io::Error> for ComponentError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value)
    }
}

/// A worker that consumes items of one type and produces items of another.
pub trait Component: ToString {
    /// What the component consumes.
    type InData;
    /// What the component produces.
    type OutData;

    /// Handles a single input.
    fn convert(&mut self, input: Self::InData) -> Self::OutData;

    /// Cleans up once the input channel has closed.
    fn finalize(&mut self) -> Result<(), ComponentError>;
}

/// Runs `component` on its own thread until every sender of `input` has
/// been dropped, forwarding each result to `output`.
pub fn run_component<C: Component + Send + 'static>(
    mut component: Box<C>,
    input: Receiver<<C as Component>::InData>,
    output: Sender<<C as Component>::OutData>,
) -> JoinHandle<()>
where
    <C as Component>::InData: Send + 'static,
    <C as Component>::OutData: Send + 'static,
{
    thread::spawn(move || {
        while let Ok(data) = input.recv() {
            let out_data = component.convert(data);
            // Nobody listening for results is fine; keep consuming.
            if let Err(error) = output.send(out_data) {
                warn!("{} : result not delivered: {}.", component.to_string(), error);
            }
        }

        if let Err(component_error) = component.finalize() {
            warn!(
                "{} : error during terminating : {component_error}.",
                component.to_string(),
            );
        }
        info!("{} : terminated.", component.to_string());
    })
}
