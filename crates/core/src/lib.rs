// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Trickle Core - primitives for low-latency HTTP segment push.
//!
//! A producer feeds numbered byte segments into a stream; subscribers
//! follow with one pre-opened request for the next expected seq, and the
//! server answers each long-poll the moment the matching write begins.
//! This crate holds the transport-agnostic pieces:
//!
//! - [`drip`]: single-writer multi-reader append-only byte buffer
//! - [`stream`]: per-stream segment ring with placeholder slots
//! - [`hub`]: named-stream registry and changefeed
//! - [`local`]: in-process subscriber over a hub
//! - [`protocol`]: header names, changefeed event shape, name rules
//! - [`error`]: typed errors shared across server and clients

pub mod drip;
pub mod error;
pub mod hub;
pub mod local;
pub mod protocol;
pub mod stream;

pub use drip::{DripBuffer, DripReader};
pub use error::{Result, TrickleError};
pub use hub::{HubOptions, StreamHub};
pub use local::{LocalPart, LocalSubscriber};
pub use protocol::ChangefeedEvent;
pub use stream::{Segment, SegmentCursor, SegmentGet, TrickleStream, SEQ_LATEST};
