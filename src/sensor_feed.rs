//! The thread-safe buffer sensor frames are queued in until the next tick.

use crate::blink_gate::BlinkSample;
use crate::{Planar, Seconds};

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

/// Everything the sensors reported for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorFrame {
    /// Host time of the frame.
    pub time_s: Seconds,
    /// `None` when eye tracking is unavailable this tick.
    pub eyes: Option<BlinkSample>,
    /// Planar head position, if tracked this tick.
    pub head: Option<Planar>,
}

impl SensorFrame {
    /// A frame carrying only a timestamp.
    pub fn empty(time_s: Seconds) -> Self {
        Self {
            time_s,
            eyes: None,
            head: None,
        }
    }
}

/// A source of [`SensorFrame`]s that is drained once per tick.
pub trait SensorSource: Iterator<Item = SensorFrame> {
    /// Drops any frames not yet consumed.
    fn clear(&mut self);
}

/// A [`SensorSource`] backed by a shared queue. Clones push into and pop
/// from the same queue, so a reader thread can fill it while the tick
/// drains it.
#[derive(Debug, Clone, Default)]
pub struct SensorFeed {
    frames: Arc<Mutex<VecDeque<SensorFrame>>>,
}

impl SensorFeed {
    /// An empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a frame behind everything already queued.
    pub fn push(&self, frame: SensorFrame) {
        if let Ok(mut frames) = self.frames.lock() {
            frames.push_back(frame);
        }
    }

    /// Frames waiting to be consumed.
    pub fn len(&self) -> usize {
        self.frames.lock().map(|f| f.len()).unwrap_or(0)
    }

    /// Whether no frames are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Iterator for SensorFeed {
    type Item = SensorFrame;

    fn next(&mut self) -> Option<Self::Item> {
        self.frames.lock().ok()?.pop_front()
    }
}

impl SensorSource for SensorFeed {
    fn clear(&mut self) {
        if let Ok(mut frames) = self.frames.lock() {
            frames.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_frames_come_out_in_order() {
        let mut feed = SensorFeed::new();
        for i in 0..3 {
            feed.push(SensorFrame::empty(i as f64));
        }
        let times: Vec<Seconds> = feed.by_ref().map(|f| f.time_s).collect();
        assert_eq!(times, vec![0.0, 1.0, 2.0]);
        assert!(feed.is_empty());
    }

    #[test]
    fn test_clones_share_the_queue() {
        let mut feed = SensorFeed::new();
        let writer = feed.clone();
        let handle = thread::spawn(move || {
            for i in 0..100 {
                writer.push(SensorFrame {
                    time_s: i as f64,
                    eyes: None,
                    head: Some(Planar::new(0.0, i as f64)),
                });
            }
        });
        handle.join().unwrap();

        assert_eq!(feed.len(), 100);
        assert_eq!(feed.next().unwrap().head, Some(Planar::new(0.0, 0.0)));
        feed.clear();
        assert!(feed.next().is_none());
    }
}
