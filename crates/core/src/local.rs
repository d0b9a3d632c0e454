// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! In-process subscriber.
//!
//! Reads a hub's streams through the registry directly, skipping HTTP, but
//! hands out the same (seq, reader) part shape a network subscriber would.
//! This is how the server process itself tails the changefeed.

use std::sync::Arc;

use crate::error::{Result, TrickleError};
use crate::hub::StreamHub;
use crate::stream::{SegmentCursor, SegmentGet, TrickleStream, SEQ_LATEST};

/// One readable segment handed to the caller.
pub struct LocalPart {
    pub seq: i64,
    pub reader: SegmentCursor,
}

/// Sequence-tracking reader over a single stream of a [`StreamHub`].
pub struct LocalSubscriber {
    stream: Arc<TrickleStream>,
    idx: i64,
}

impl LocalSubscriber {
    /// # Errors
    ///
    /// Returns [`TrickleError::StreamNotFound`] if the hub has no such
    /// stream.
    pub fn new(hub: &StreamHub, name: &str) -> Result<Self> {
        Ok(Self { stream: hub.get(name)?, idx: SEQ_LATEST })
    }

    /// Next segment in seq order. The part's reader blocks until the
    /// producer feeds the segment, so a caller that wants a bound should
    /// wrap its reads in a timeout.
    ///
    /// # Errors
    ///
    /// [`TrickleError::EndOfStream`] once the stream has ended and drained;
    /// [`TrickleError::SequenceNonexistent`] when the cursor fell out of the
    /// window (resync with [`Self::set_seq`]).
    pub fn read(&mut self) -> Result<LocalPart> {
        match self.stream.get(self.idx)? {
            SegmentGet::Hit { segment, seq, .. } => {
                self.idx = seq + 1;
                Ok(LocalPart { seq, reader: segment.attach() })
            },
            SegmentGet::Ended => Err(TrickleError::EndOfStream),
        }
    }

    /// Force the next read to use seq `n`.
    pub fn set_seq(&mut self, seq: i64) {
        self.idx = seq;
    }

    pub fn next_seq(&self) -> i64 {
        self.idx
    }
}
