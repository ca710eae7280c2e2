//! Stream engine seam.
//!
//! The controller hands the engine a URL and a generation number and gets a
//! [`StreamReport`] back through its event queue some time later.  The engine
//! never decides whether a report is stale; the controller compares the
//! generation against the one it last issued.

use reqwest::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub generation: u64,
    pub outcome: StreamOutcome,
}

impl StreamReport {
    pub fn ready(generation: u64) -> Self {
        Self {
            generation,
            outcome: StreamOutcome::Ready,
        }
    }

    pub fn failed(generation: u64, reason: impl Into<String>) -> Self {
        Self {
            generation,
            outcome: StreamOutcome::Failed(reason.into()),
        }
    }
}

pub trait StreamEngine: Send {
    /// Replace whatever is attached with `url`, paused.  Exactly one report
    /// tagged with `generation` is expected per attach, unless a later attach
    /// replaces it first.
    fn attach(&mut self, generation: u64, url: &Url);

    /// Start (or continue) audio output of the attached stream.
    fn play(&mut self);

    /// Silence output without detaching.
    fn pause(&mut self);

    /// Release the engine at daemon exit.
    fn shutdown(&mut self) {}
}
