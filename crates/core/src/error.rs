// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for the trickle transport.
//!
//! Terminal and resync conditions are distinct variants rather than sentinel
//! strings so callers can match on them programmatically; out-of-window
//! errors carry the server's latest seq as data for resync.

use thiserror::Error;

/// Main error type for trickle operations.
#[derive(Debug, Error)]
pub enum TrickleError {
    /// The server has no stream by this name.
    ///
    /// Surfaced on 404/410 responses, or locally once a stream has been
    /// ended and dropped from the registry.
    #[error("stream not found")]
    StreamNotFound,

    /// A stream with this name already exists (explicit create only).
    #[error("stream already exists")]
    StreamExists,

    /// The requested seq fell outside the server's segment window.
    ///
    /// `latest` is the highest seq the server has started writing; callers
    /// typically resync to it and retry.
    #[error("seq {requested} is outside the window, latest is {latest}")]
    SequenceNonexistent { requested: i64, latest: i64 },

    /// Normal terminal signal: the producer ended the stream.
    #[error("end of stream")]
    EndOfStream,

    /// A producer already claimed this seq.
    #[error("seq {0} already has a writer")]
    WriteConflict(i64),

    /// The stream was ended; no new segments may be created.
    #[error("stream ended")]
    StreamEnded,

    /// Write to a drip buffer that was already closed.
    #[error("drip buffer closed")]
    BufferClosed,

    /// Stream names are restricted to `[A-Za-z0-9_\-.]`.
    #[error("invalid stream name: {0:?}")]
    InvalidStreamName(String),

    /// Underlying network failure, usually retryable.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The subscriber's consecutive preconnect failure budget was exhausted.
    #[error("too many preconnect failures")]
    TooManyPreconnects,

    /// Invariant violation inside the registry (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error while feeding or draining a segment body.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using `TrickleError`.
pub type Result<T> = std::result::Result<T, TrickleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrickleError::SequenceNonexistent { requested: 0, latest: 4 };
        assert_eq!(err.to_string(), "seq 0 is outside the window, latest is 4");

        let err = TrickleError::WriteConflict(3);
        assert_eq!(err.to_string(), "seq 3 already has a writer");
    }

    #[test]
    fn test_resync_data_is_matchable() {
        let err = TrickleError::SequenceNonexistent { requested: 0, latest: 4 };
        match err {
            TrickleError::SequenceNonexistent { latest, .. } => assert_eq!(latest, 4),
            other => panic!("unexpected variant: {other}"),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: TrickleError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
        assert!(err.to_string().contains("pipe closed"));
    }
}
