//! # Shared Transport Primitives
//!
//! This crate contains the wire-level and resource primitives used by every
//! peer of the bichannel protocol. It serves as the foundation the server's
//! connection subsystem is built on and is equally usable from test clients.
//!
//! ## Core Components
//!
//! ### Framing Codec
//! The reliable channel carries `[u32 big-endian length][body]` frames; the
//! unreliable channel carries bare datagrams. The [`framing`] module owns the
//! prefix encoding, the authentication-token width, and the body-length
//! rejection threshold check.
//!
//! ### Message Buffers
//! The [`buffer`] module provides pooled, windowed byte buffers. Ownership of
//! a [`MessageBuffer`] is exclusive; storage returns to its pool on drop, so
//! every buffer is released exactly once regardless of the path it took.
//!
//! ### Metrics Sink
//! The [`metrics`] module defines the write-only sink the transport core
//! emits counters, gauges and histograms into, plus a null sink and an
//! in-memory recorder for tests.

pub mod buffer;
pub mod framing;
pub mod metrics;

pub use buffer::{BufferError, BufferPool, MessageBuffer};
pub use framing::{FrameError, HEADER_LEN, TOKEN_LEN};
pub use metrics::{MetricsSink, NullSink, RecordingSink};
