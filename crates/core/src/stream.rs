// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-stream segment window.
//!
//! A stream owns a fixed ring of recent segments indexed by seq modulo the
//! window size, so memory stays bounded and eviction is O(1). Subscribers
//! may create placeholder segments ahead of the producer; the matching PUT
//! later claims the slot and feeds its drip buffer. Seating a new segment
//! evicts everything that falls out of the window, closing evicted buffers
//! so stragglers still attached to them terminate.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::drip::{DripBuffer, DripReader};
use crate::error::{Result, TrickleError};

/// Convenience seq meaning "current/latest" on a read.
pub const SEQ_LATEST: i64 = -1;

/// One numbered slice of a stream's payload.
#[derive(Debug)]
pub struct Segment {
    seq: i64,
    body: DripBuffer,
    created_at: Instant,
    write_started: AtomicBool,
    subscribers: AtomicUsize,
}

impl Segment {
    fn new(seq: i64) -> Arc<Self> {
        Arc::new(Self {
            seq,
            body: DripBuffer::new(),
            created_at: Instant::now(),
            write_started: AtomicBool::new(false),
            subscribers: AtomicUsize::new(0),
        })
    }

    pub fn seq(&self) -> i64 {
        self.seq
    }

    pub fn body(&self) -> &DripBuffer {
        &self.body
    }

    /// Whether a producer has claimed this slot.
    pub fn write_started(&self) -> bool {
        self.write_started.load(Ordering::Acquire)
    }

    pub fn closed(&self) -> bool {
        self.body.is_closed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Currently attached reader cursors. Purely a gauge; segment lifetime
    /// is determined by window position alone.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }

    /// Attach a fresh cursor at the first byte of the body.
    pub fn attach(self: &Arc<Self>) -> SegmentCursor {
        self.subscribers.fetch_add(1, Ordering::Relaxed);
        SegmentCursor { reader: self.body.reader(), segment: Arc::clone(self) }
    }
}

/// Reader cursor bound to a segment; detaches from the subscriber gauge on
/// drop.
pub struct SegmentCursor {
    reader: DripReader,
    segment: Arc<Segment>,
}

impl SegmentCursor {
    pub fn seq(&self) -> i64 {
        self.segment.seq()
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// See [`DripReader::chunk`].
    pub async fn chunk(&mut self) -> Option<Bytes> {
        self.reader.chunk().await
    }

    /// See [`DripReader::read_to_end`].
    pub async fn read_to_end(&mut self) -> Bytes {
        self.reader.read_to_end().await
    }

    pub fn position(&self) -> usize {
        self.reader.position()
    }
}

impl Drop for SegmentCursor {
    fn drop(&mut self) {
        self.segment.subscribers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Outcome of a subscriber-side lookup.
pub enum SegmentGet {
    /// A live (possibly still pending) segment. `seq` is the concrete
    /// resolved seq; `latest` is the highest seq with writing begun.
    Hit { segment: Arc<Segment>, seq: i64, latest: i64 },
    /// The stream ended and the requested slot no longer exists.
    Ended,
}

struct StreamState {
    ring: Vec<Option<Arc<Segment>>>,
    latest_seq: i64,
    mime_type: Option<String>,
    ended: bool,
}

/// A named sequence of segments with a sliding window.
pub struct TrickleStream {
    name: String,
    window: usize,
    lookahead: i64,
    state: Mutex<StreamState>,
}

impl TrickleStream {
    pub fn new(name: impl Into<String>, window: usize, lookahead: i64) -> Self {
        let window = window.max(1);
        Self {
            name: name.into(),
            window,
            lookahead: lookahead.max(0),
            state: Mutex::new(StreamState {
                ring: (0..window).map(|_| None).collect(),
                latest_seq: SEQ_LATEST,
                mime_type: None,
                ended: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Highest seq for which writing has begun, or −1.
    pub fn latest_seq(&self) -> i64 {
        self.lock().map(|state| state.latest_seq).unwrap_or(SEQ_LATEST)
    }

    pub fn ended(&self) -> bool {
        self.lock().map(|state| state.ended).unwrap_or(true)
    }

    /// Content type observed from the first producer write; sticky.
    pub fn mime_type(&self) -> Option<String> {
        self.lock().ok().and_then(|state| state.mime_type.clone())
    }

    pub fn set_mime_type_if_unset(&self, mime: &str) {
        if let Ok(mut state) = self.state.lock() {
            if state.mime_type.is_none() {
                state.mime_type = Some(mime.to_string());
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StreamState>> {
        self.state
            .lock()
            .map_err(|e| TrickleError::Internal(format!("stream lock poisoned: {e}")))
    }

    fn ring_index(&self, seq: i64) -> usize {
        usize::try_from(seq).map(|s| s % self.window).unwrap_or(0)
    }

    fn lookup(&self, state: &StreamState, seq: i64) -> Option<Arc<Segment>> {
        state.ring[self.ring_index(seq)].as_ref().filter(|seg| seg.seq() == seq).cloned()
    }

    /// Seat a new segment, evicting everything that leaves the window.
    fn insert(&self, state: &mut StreamState, seq: i64) -> Arc<Segment> {
        let low = seq - self.window as i64 + 1;
        for slot in &mut state.ring {
            if slot.as_ref().is_some_and(|seg| seg.seq() < low) {
                if let Some(evicted) = slot.take() {
                    tracing::debug!(
                        stream = %self.name,
                        seq = evicted.seq(),
                        subscribers = evicted.subscriber_count(),
                        "evicting segment"
                    );
                    evicted.body().close();
                }
            }
        }
        let segment = Segment::new(seq);
        state.ring[self.ring_index(seq)] = Some(Arc::clone(&segment));
        segment
    }

    fn check_bounds(&self, state: &StreamState, seq: i64, headroom: i64) -> Result<()> {
        let latest = state.latest_seq;
        if seq < 0
            || (latest >= 0 && seq <= latest - self.window as i64)
            || seq > latest + headroom + self.lookahead
        {
            return Err(TrickleError::SequenceNonexistent { requested: seq, latest });
        }
        Ok(())
    }

    /// Return the segment at `seq`, creating a placeholder if it is within
    /// bounds but not yet seated.
    pub fn get_or_create(&self, seq: i64) -> Result<Arc<Segment>> {
        let mut state = self.lock()?;
        if let Some(segment) = self.lookup(&state, seq) {
            return Ok(segment);
        }
        if state.ended {
            return Err(TrickleError::StreamEnded);
        }
        self.check_bounds(&state, seq, 0)?;
        Ok(self.insert(&mut state, seq))
    }

    /// Subscriber-side lookup. `SEQ_LATEST` resolves to the segment
    /// currently being written, or a placeholder one past the newest.
    pub fn get(&self, requested: i64) -> Result<SegmentGet> {
        let mut state = self.lock()?;
        let seq = if requested == SEQ_LATEST {
            Self::resolve_latest_locked(self, &state)
        } else {
            requested
        };
        if let Some(segment) = self.lookup(&state, seq) {
            return Ok(SegmentGet::Hit { segment, seq, latest: state.latest_seq });
        }
        if state.ended {
            return Ok(SegmentGet::Ended);
        }
        self.check_bounds(&state, seq, 0)?;
        let latest = state.latest_seq;
        Ok(SegmentGet::Hit { segment: self.insert(&mut state, seq), seq, latest })
    }

    fn resolve_latest_locked(&self, state: &StreamState) -> i64 {
        if state.latest_seq < 0 {
            return 0;
        }
        match self.lookup(state, state.latest_seq) {
            Some(segment) if !segment.closed() => state.latest_seq,
            _ => state.latest_seq + 1,
        }
    }

    /// Concrete seq a `SEQ_LATEST` read would serve right now.
    pub fn resolve_latest(&self) -> i64 {
        self.lock().map(|state| Self::resolve_latest_locked(self, &state)).unwrap_or(0)
    }

    /// Claim `seq` for writing. The first claimant wins; the slot may
    /// already exist as a placeholder created by waiting subscribers.
    pub fn begin_write(&self, seq: i64) -> Result<Arc<Segment>> {
        let mut state = self.lock()?;
        if state.ended {
            return Err(TrickleError::StreamEnded);
        }
        // Producers get one extra slot of headroom: the next natural seq is
        // latest + 1, and lookahead counts from there.
        self.check_bounds(&state, seq, 1)?;
        let segment = match self.lookup(&state, seq) {
            Some(existing) => existing,
            None => self.insert(&mut state, seq),
        };
        if segment.write_started.swap(true, Ordering::AcqRel) {
            return Err(TrickleError::WriteConflict(seq));
        }
        if seq > state.latest_seq {
            state.latest_seq = seq;
        }
        Ok(segment)
    }

    /// Terminal: no new segments; every open buffer closes so waiting and
    /// streaming readers drain out.
    pub fn end(&self) {
        let Ok(mut state) = self.state.lock() else { return };
        if state.ended {
            return;
        }
        state.ended = true;
        for slot in state.ring.iter().flatten() {
            slot.body().close();
        }
        tracing::debug!(stream = %self.name, latest_seq = state.latest_seq, "stream ended");
    }

    /// Drop placeholder segments no producer ever claimed within `ttl`.
    /// Readers parked on them observe a closed, never-written body.
    pub fn collect_stale(&self, ttl: Duration) -> usize {
        let Ok(mut state) = self.state.lock() else { return 0 };
        let mut collected = 0;
        for slot in &mut state.ring {
            let stale = slot
                .as_ref()
                .is_some_and(|seg| !seg.write_started() && seg.age() >= ttl);
            if stale {
                if let Some(seg) = slot.take() {
                    tracing::debug!(stream = %self.name, seq = seg.seq(), "collecting stale placeholder");
                    seg.body().close();
                    collected += 1;
                }
            }
        }
        collected
    }

    /// Number of live segments in the window.
    pub fn segment_count(&self) -> usize {
        self.lock().map(|state| state.ring.iter().flatten().count()).unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn stream() -> TrickleStream {
        TrickleStream::new("s", 3, 4)
    }

    #[test]
    fn begin_write_claims_once() {
        let s = stream();
        s.begin_write(0).unwrap();
        assert!(matches!(s.begin_write(0), Err(TrickleError::WriteConflict(0))));
        assert_eq!(s.latest_seq(), 0);
    }

    #[test]
    fn window_eviction_keeps_spread_under_w() {
        let s = stream();
        for seq in 0..5 {
            let segment = s.begin_write(seq).unwrap();
            segment.body().write(b"x").unwrap();
            segment.body().close();
        }
        // Window is 3, so only seqs 2..=4 remain.
        assert_eq!(s.segment_count(), 3);
        assert!(matches!(
            s.get(0),
            Err(TrickleError::SequenceNonexistent { requested: 0, latest: 4 })
        ));
        assert!(matches!(s.get(2).unwrap(), SegmentGet::Hit { seq: 2, .. }));
    }

    #[test]
    fn eviction_closes_displaced_buffer() {
        let s = stream();
        let oldest = s.begin_write(0).unwrap();
        for seq in 1..4 {
            s.begin_write(seq).unwrap();
        }
        assert!(oldest.closed());
    }

    #[test]
    fn lookahead_bounds_both_sides() {
        let s = stream();
        s.begin_write(0).unwrap();
        // latest=0, lookahead=4: readers may reach seq 4, writers seq 5.
        assert!(matches!(s.get(5), Err(TrickleError::SequenceNonexistent { latest: 0, .. })));
        assert!(matches!(s.get(4).unwrap(), SegmentGet::Hit { seq: 4, .. }));
        assert!(matches!(s.begin_write(6), Err(TrickleError::SequenceNonexistent { .. })));
        s.begin_write(5).unwrap();
    }

    #[test]
    fn resolve_latest_on_empty_stream_is_zero() {
        let s = stream();
        assert_eq!(s.resolve_latest(), 0);
        let SegmentGet::Hit { seq, .. } = s.get(SEQ_LATEST).unwrap() else {
            panic!("expected a placeholder hit");
        };
        assert_eq!(seq, 0);
        // The placeholder is seated; a producer claim for seq 0 reuses it.
        s.begin_write(0).unwrap();
    }

    #[test]
    fn resolve_latest_attaches_to_open_segment() {
        let s = stream();
        let open = s.begin_write(9).unwrap_err();
        assert!(matches!(open, TrickleError::SequenceNonexistent { .. }));

        let seg0 = s.begin_write(0).unwrap();
        seg0.body().write(b"live").unwrap();
        assert_eq!(s.resolve_latest(), 0);

        seg0.body().close();
        assert_eq!(s.resolve_latest(), 1);
    }

    #[test]
    fn ended_stream_rejects_writes_and_reports_eos() {
        let s = stream();
        let segment = s.begin_write(0).unwrap();
        segment.body().close();
        s.end();

        assert!(matches!(s.begin_write(1), Err(TrickleError::StreamEnded)));
        // Existing segments still serve.
        assert!(matches!(s.get(0).unwrap(), SegmentGet::Hit { seq: 0, .. }));
        // Missing slots report end of stream instead of creating placeholders.
        assert!(matches!(s.get(1).unwrap(), SegmentGet::Ended));
    }

    #[tokio::test]
    async fn end_wakes_parked_readers() {
        let s = Arc::new(stream());
        let SegmentGet::Hit { segment, .. } = s.get(SEQ_LATEST).unwrap() else {
            panic!("expected a placeholder hit");
        };
        let mut cursor = segment.attach();

        let ender = Arc::clone(&s);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            ender.end();
        });

        assert_eq!(cursor.chunk().await, None);
        assert!(s.ended());
        handle.await.unwrap();
    }

    #[test]
    fn stale_placeholders_are_collected() {
        let s = stream();
        let SegmentGet::Hit { segment, .. } = s.get(0).unwrap() else {
            panic!("expected a placeholder hit");
        };
        assert!(!segment.write_started());

        assert_eq!(s.collect_stale(Duration::ZERO), 1);
        assert!(segment.closed());
        assert_eq!(s.segment_count(), 0);

        // Claimed segments are never stale.
        s.begin_write(0).unwrap();
        assert_eq!(s.collect_stale(Duration::ZERO), 0);
    }

    #[test]
    fn subscriber_gauge_tracks_attach_and_drop() {
        let s = stream();
        let segment = s.begin_write(0).unwrap();
        let a = segment.attach();
        let b = segment.attach();
        assert_eq!(segment.subscriber_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(segment.subscriber_count(), 0);
    }
}
