// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Drip buffer - single-writer, multi-reader append-only byte stream.
//!
//! A producer appends chunks as they arrive off the wire; any number of
//! readers follow along at their own pace, each seeing every byte exactly
//! once. Existing bytes never mutate, so a reader's view is prefix-monotonic.
//! Waits park on a per-buffer watch channel, which means a slow reader only
//! ever blocks itself. This is the one wakeup primitive in the system:
//! stream-level long-polls wait on a placeholder segment's buffer.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::sync::watch;

use crate::error::{Result, TrickleError};

#[derive(Debug)]
struct DripState {
    buffer: BytesMut,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<DripState>,
    // Version-bumped after every append and on close; readers wait on it.
    wake: watch::Sender<()>,
}

/// Write side of a drip buffer.
///
/// Cloning shares the underlying buffer. Use [`DripBuffer::reader`] for a
/// consuming cursor.
#[derive(Clone, Debug)]
pub struct DripBuffer {
    shared: Arc<Shared>,
}

impl Default for DripBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DripBuffer {
    pub fn new() -> Self {
        let (wake, _) = watch::channel(());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DripState { buffer: BytesMut::new(), closed: false }),
                wake,
            }),
        }
    }

    /// Append a chunk and wake all waiting readers.
    ///
    /// # Errors
    ///
    /// Returns [`TrickleError::BufferClosed`] once the buffer is closed.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .map_err(|e| TrickleError::Internal(format!("drip lock poisoned: {e}")))?;
            if state.closed {
                return Err(TrickleError::BufferClosed);
            }
            state.buffer.extend_from_slice(data);
        }
        self.shared.wake.send_replace(());
        Ok(())
    }

    /// Mark the buffer complete and wake all waiters. Idempotent; repeated
    /// calls do not re-wake readers.
    pub fn close(&self) {
        let newly_closed = {
            let Ok(mut state) = self.shared.state.lock() else { return };
            if state.closed {
                false
            } else {
                state.closed = true;
                true
            }
        };
        if newly_closed {
            self.shared.wake.send_replace(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().map(|state| state.closed).unwrap_or(true)
    }

    /// Bytes appended so far.
    pub fn len(&self) -> usize {
        self.shared.state.lock().map(|state| state.buffer.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// New cursor positioned at the first byte.
    pub fn reader(&self) -> DripReader {
        DripReader {
            shared: Arc::clone(&self.shared),
            wake: self.shared.wake.subscribe(),
            read_pos: 0,
        }
    }
}

/// Consuming cursor over a [`DripBuffer`].
///
/// The position only moves forward. A cloned reader starts over from the
/// first byte of the buffer, which is how one producer body fans out to
/// several independent consumers.
pub struct DripReader {
    shared: Arc<Shared>,
    wake: watch::Receiver<()>,
    read_pos: usize,
}

impl Clone for DripReader {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            wake: self.shared.wake.subscribe(),
            read_pos: 0,
        }
    }
}

impl DripReader {
    /// Wait for and return the next run of bytes at or after the cursor.
    ///
    /// Returns `None` at end of stream: the buffer is closed and drained, or
    /// the cursor somehow overran the buffer.
    pub async fn chunk(&mut self) -> Option<Bytes> {
        loop {
            {
                let Ok(state) = self.shared.state.lock() else {
                    return None;
                };
                let total = state.buffer.len();
                if self.read_pos < total {
                    let data = Bytes::copy_from_slice(&state.buffer[self.read_pos..total]);
                    self.read_pos = total;
                    return Some(data);
                }
                if self.read_pos > total || state.closed {
                    return None;
                }
            }
            // The writer bumps the watch version after releasing the state
            // lock, so a write landing here resolves `changed` immediately.
            if self.wake.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Drain the buffer to completion, blocking until the writer closes it.
    pub async fn read_to_end(&mut self) -> Bytes {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }

    pub fn position(&self) -> usize {
        self.read_pos
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn reads_written_bytes_in_order() {
        let buffer = DripBuffer::new();
        let mut reader = buffer.reader();

        buffer.write(b"hello").unwrap();
        buffer.write(b" world").unwrap();
        buffer.close();

        assert_eq!(reader.read_to_end().await, Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn reader_blocks_until_data_arrives() {
        let buffer = DripBuffer::new();
        let mut reader = buffer.reader();

        let writer = buffer.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.write(b"late").unwrap();
            writer.close();
        });

        let chunk = timeout(Duration::from_secs(1), reader.chunk()).await.unwrap();
        assert_eq!(chunk, Some(Bytes::from_static(b"late")));
        assert_eq!(reader.chunk().await, None);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_writes() {
        let buffer = DripBuffer::new();
        buffer.write(b"x").unwrap();
        buffer.close();
        buffer.close();

        assert!(matches!(buffer.write(b"y"), Err(TrickleError::BufferClosed)));

        let mut reader = buffer.reader();
        assert_eq!(reader.chunk().await, Some(Bytes::from_static(b"x")));
        assert_eq!(reader.chunk().await, None);
    }

    #[tokio::test]
    async fn cloned_reader_restarts_at_zero() {
        let buffer = DripBuffer::new();
        buffer.write(b"abcdef").unwrap();
        buffer.close();

        let mut first = buffer.reader();
        assert_eq!(first.read_to_end().await, Bytes::from_static(b"abcdef"));

        let mut second = first.clone();
        assert_eq!(second.position(), 0);
        assert_eq!(second.read_to_end().await, Bytes::from_static(b"abcdef"));
    }

    #[tokio::test]
    async fn concurrent_readers_each_see_every_byte() {
        let buffer = DripBuffer::new();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let mut reader = buffer.reader();
            handles.push(tokio::spawn(async move { reader.read_to_end().await }));
        }

        let writer = buffer.clone();
        let feeder = tokio::spawn(async move {
            for i in 0..50u8 {
                writer.write(&[i; 128]).unwrap();
                tokio::task::yield_now().await;
            }
            writer.close();
        });
        feeder.await.unwrap();

        let mut expected = BytesMut::new();
        for i in 0..50u8 {
            expected.extend_from_slice(&[i; 128]);
        }
        let expected = expected.freeze();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn empty_closed_buffer_reads_as_eof() {
        let buffer = DripBuffer::new();
        buffer.close();
        let mut reader = buffer.reader();
        assert_eq!(reader.chunk().await, None);
        assert_eq!(reader.read_to_end().await, Bytes::new());
    }
}
