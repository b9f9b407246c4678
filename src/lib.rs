//! Capture-side audio mixing engine.
//!
//! This crate implements the capture half of a software audio router: a
//! link graph connecting hardware inputs, loopback outputs, and renderers
//! to capture streams, and a per-stream mix loop that resamples linked
//! sources into a client-supplied shared buffer on a rational timeline.
//!
//! Each stream is one tokio task: control requests are commands with
//! awaited replies, mixing is paced by a timer armed for the instant the
//! next job's audio will exist, and completed buffers are delivered by a
//! separate task so a slow consumer never stalls the mix. All position and
//! clock math goes through exact rational [`timeline`] transforms; sample
//! positions carry [`timeline::FRAC_BITS`] fractional bits end to end.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use capture_mixer::{
//!     spawn_capture_stream, CaptureError, EngineConfig, LinkGraph, MonoClock,
//!     SampleFormat, SharedBuffer, StreamType,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CaptureError> {
//!     let graph = Arc::new(LinkGraph::new());
//!     let (stream, mut events) =
//!         spawn_capture_stream(Arc::clone(&graph), EngineConfig::default(), MonoClock::new());
//!
//!     stream
//!         .set_format(StreamType::new(SampleFormat::I16, 1, 48000))
//!         .await?;
//!     stream
//!         .bind_buffer(Arc::new(SharedBuffer::new(48000 * 2)))
//!         .await?;
//!
//!     stream.capture_at(0, 4800).await?;
//!     if let Some(event) = events.recv().await {
//!         println!("captured: {event:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod client;
pub mod clock;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod event;
pub mod format;
pub mod graph;
pub mod mixer;
pub mod timeline;

pub use buffer::SharedBuffer;
pub use client::{spawn_capture_stream, CaptureStream};
pub use clock::MonoClock;
pub use config::{DeviceLimits, EngineConfig, MUTED_GAIN_DB};
pub use device::RingBufferFeed;
pub use engine::{State, StreamStats};
pub use error::CaptureError;
pub use event::{CaptureEvent, CapturePacket};
pub use format::{SampleFormat, StreamType};
pub use graph::{LinkGraph, LinkId, ObjectId};
