//! Events the stream decoder hands to the conversation reconciler.
//!
//! Contract:
//! - A query stream emits 0..n `Record` events in arrival order.
//! - The stream **must** terminate with exactly one terminal event: `Error` or `Done`.
//! - After a terminal event, no further events are emitted.
//!
//! `Error` carries a `SearchError`, which is not `Clone`, so neither is this enum.

use crate::error::SearchError;
use crate::model::SearchRecord;

#[derive(Debug)]
pub enum StreamEvent {
    /// One fully decoded record.
    Record(SearchRecord),
    /// Transport failure or undecodable record; the stream ends after this.
    Error(SearchError),
    /// The producer closed the body. `discarded_bytes` counts an unterminated
    /// remainder that was dropped (0 when the stream ended cleanly).
    Done { discarded_bytes: usize },
}

impl StreamEvent {
    /// Returns true if this event terminates the stream (`Error` or `Done`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Done { .. })
    }

    pub fn as_record(&self) -> Option<&SearchRecord> {
        match self {
            Self::Record(r) => Some(r),
            _ => None,
        }
    }
}
