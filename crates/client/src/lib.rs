// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Trickle Client - publisher and subscriber over HTTP.
//!
//! The [`TricklePublisher`] pre-opens each segment's PUT before it is
//! needed; the [`TrickleSubscriber`] keeps one GET preconnected for the
//! next expected seq. Both track seqs so callers only ever see segments in
//! order. The [`SlowConsumerChecker`] gives producers admission control
//! decoupled from TCP backpressure.

pub mod checker;
mod http;
pub mod publisher;
pub mod source;
pub mod subscriber;

pub use checker::{SlowConsumerChecker, DEFAULT_MAX_INFLIGHT};
pub use publisher::{SegmentWriter, TricklePublisher};
pub use source::SegmentSource;
pub use subscriber::{SegmentPart, TrickleSubscriber, DEFAULT_MAX_PRECONNECT_FAILURES};

// Re-export the shared core types callers match on.
pub use trickle_core::{Result, TrickleError};
