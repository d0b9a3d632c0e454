// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Producer-side segment input.
//!
//! Segmenters hand the publisher either a one-shot byte stream or a drip
//! reader whose clones restart from byte zero. The two cases carry
//! different capabilities, so they are distinct variants: only the drip
//! form can fan a segment out to several sinks.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use trickle_core::{DripReader, Result, TrickleError};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Bytes for one segment, from a segmenter or any other producer.
pub enum SegmentSource {
    /// Single-consumer byte stream (a file, a subprocess pipe).
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    /// Cloneable cursor over an in-memory buffer; supports fan-out.
    Drip(DripReader),
}

impl SegmentSource {
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Reader(Box::new(reader))
    }

    pub fn from_drip(reader: DripReader) -> Self {
        Self::Drip(reader)
    }

    /// A second consumer of the same segment, when the source supports it.
    /// The clone restarts from the first byte.
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Reader(_) => None,
            Self::Drip(reader) => Some(Self::Drip(reader.clone())),
        }
    }

    /// Next run of bytes, `None` at end of segment.
    ///
    /// # Errors
    ///
    /// I/O failures from the underlying reader.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match self {
            Self::Reader(reader) => {
                let mut buf = vec![0u8; READ_CHUNK_SIZE];
                let n = reader.read(&mut buf).await.map_err(TrickleError::Io)?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            },
            Self::Drip(reader) => Ok(reader.chunk().await),
        }
    }

    /// Drain and drop whatever remains, so a one-shot upstream (typically a
    /// subprocess pipe) does not stall after a failed publish.
    pub async fn discard(&mut self) {
        while let Ok(Some(_)) = self.chunk().await {}
    }
}
