//! The per-trial log row and the sinks that receive it.
//!
//! The set and order of fields in a [`TrialRecord`] is fixed; see
//! [`TrialRecord::HEADER`]. How rows end up on disk is the sink's business.

use crate::staircase::{Modality, Phase};
use crate::Seconds;
use log::warn;
use std::fmt;
use std::sync::{mpsc::Sender, Arc, Mutex};

/// One of the two runs in a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunIndex {
    /// The first run.
    First,
    /// The second run.
    Second,
}

impl RunIndex {
    /// `1` or `2`.
    pub fn number(self) -> u8 {
        match self {
            RunIndex::First => 1,
            RunIndex::Second => 2,
        }
    }
}

impl fmt::Display for RunIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// A participant's answer to the two-alternative question. `choice` is
/// `None` when they reported no manipulation at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// The run reported as manipulated.
    pub choice: Option<RunIndex>,
    /// Confidence and discomfort ratings, when collected.
    pub ratings: Option<(u8, u8)>,
}

/// One row of the trial log.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialRecord {
    /// Host time the answer arrived.
    pub timestamp_s: Seconds,
    /// Participant ID.
    pub participant_id: u32,
    /// Modality of the block.
    pub modality: Modality,
    /// Staircase phase the trial ran in.
    pub phase: Phase,
    /// Trial index within the block, catch trials included.
    pub block_trial: u32,
    /// Trial index across the whole experiment.
    pub total_trial: u32,
    /// Whether neither run was manipulated.
    pub is_catch: bool,
    /// `None` on catch trials.
    pub manipulated_run: Option<RunIndex>,
    /// The run the participant picked.
    pub choice: Option<RunIndex>,
    /// Only set on staircase trials.
    pub correct: Option<bool>,
    /// Only set on catch trials.
    pub false_alarm: Option<bool>,
    /// Staircase value before the answer.
    pub gain_before: f64,
    /// Staircase value after the answer.
    pub gain_after: f64,
    /// Step used for the update, `0` on catch trials.
    pub step_applied: f64,
    /// Reversals in the block so far.
    pub total_reversals: u32,
    /// `-1`, `0` or `+1`.
    pub step_direction: i8,
    /// Whether this trial was a reversal.
    pub reversal: bool,
    /// Confidence rating, fine phase only.
    pub rating_confidence: Option<u8>,
    /// Discomfort rating, fine phase only.
    pub rating_discomfort: Option<u8>,
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl TrialRecord {
    /// Field names, in the order [`TrialRecord::values`] produces them.
    pub const HEADER: [&'static str; 19] = [
        "timestamp",
        "participant_id",
        "modality",
        "phase",
        "block_trial",
        "total_trial",
        "is_catch",
        "manipulated_run",
        "choice",
        "correct",
        "false_alarm",
        "gain_before",
        "gain_after",
        "step_applied",
        "total_reversals",
        "step_direction",
        "reversal",
        "rating_confidence",
        "rating_discomfort",
    ];

    /// The row's cells. Missing values are empty strings.
    pub fn values(&self) -> [String; 19] {
        [
            format!("{:.3}", self.timestamp_s),
            self.participant_id.to_string(),
            self.modality.to_string(),
            self.phase.to_string(),
            self.block_trial.to_string(),
            self.total_trial.to_string(),
            self.is_catch.to_string(),
            self.manipulated_run.map(|r| r.number()).unwrap_or(0).to_string(),
            self.choice
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string()),
            opt(self.correct),
            opt(self.false_alarm),
            format!("{:.4}", self.gain_before),
            format!("{:.4}", self.gain_after),
            format!("{:.4}", self.step_applied),
            self.total_reversals.to_string(),
            self.step_direction.to_string(),
            self.reversal.to_string(),
            opt(self.rating_confidence),
            opt(self.rating_discomfort),
        ]
    }

    /// `(name, value)` pairs in header order.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, String)> {
        Self::HEADER.into_iter().zip(self.values())
    }
}

/// Outcome of a completed block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSummary {
    /// Participant ID.
    pub participant_id: u32,
    /// Modality of the block.
    pub modality: Modality,
    /// Mean of the block's reversal values.
    pub threshold: f64,
    /// Trials run in the block, catch trials included.
    pub trials: u32,
    /// Of which catch trials.
    pub catch_trials: u32,
    /// Of which answered with a false alarm.
    pub false_alarms: u32,
    /// Reversals across both phases.
    pub total_reversals: u32,
}

/// Receives finished trials, in order.
pub trait TrialSink {
    /// Called once per answered trial.
    fn record(&mut self, record: &TrialRecord);

    /// Called once per completed block.
    fn record_block(&mut self, _summary: &BlockSummary) {}
}

/// Keeps everything in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    /// Every trial recorded so far.
    pub records: Arc<Mutex<Vec<TrialRecord>>>,
    /// Every block summary recorded so far.
    pub blocks: Arc<Mutex<Vec<BlockSummary>>>,
}

impl MemorySink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the rows recorded so far.
    pub fn records(&self) -> Vec<TrialRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// A copy of the block summaries recorded so far.
    pub fn blocks(&self) -> Vec<BlockSummary> {
        self.blocks.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

impl TrialSink for MemorySink {
    fn record(&mut self, record: &TrialRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }

    fn record_block(&mut self, summary: &BlockSummary) {
        if let Ok(mut blocks) = self.blocks.lock() {
            blocks.push(summary.clone());
        }
    }
}

/// Forwards rows over a channel, typically to a
/// [`CsvTrialWriter`](crate::csv_writer::CsvTrialWriter) running as a
/// component on its own thread.
pub struct ChannelSink {
    tx: Sender<TrialRecord>,
}

impl ChannelSink {
    /// Sends records down `tx`.
    pub fn new(tx: Sender<TrialRecord>) -> Self {
        Self { tx }
    }
}

impl TrialSink for ChannelSink {
    fn record(&mut self, record: &TrialRecord) {
        if let Err(error) = self.tx.send(record.clone()) {
            warn!("trial row {} dropped: {}", record.total_trial, error);
        }
    }
}
