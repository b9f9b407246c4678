//! The client-facing capture stream handle.
//!
//! [`spawn_capture_stream`] registers a capturer in the link graph and
//! spawns its engine and delivery tasks; the returned [`CaptureStream`] is
//! a cheap handle that turns method calls into engine commands and awaits
//! their replies. Events flow back on the channel returned alongside it.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::buffer::SharedBuffer;
use crate::clock::MonoClock;
use crate::config::EngineConfig;
use crate::engine::{
    run_delivery, CaptureEngine, Command, EngineStats, PacketQueue, StreamStats,
};
use crate::error::CaptureError;
use crate::event::CaptureEvent;
use crate::format::StreamType;
use crate::graph::{LinkGraph, LinkId, ObjectId};

/// Handle to one capture stream.
///
/// Clone it freely; dropping the last clone shuts the stream down.
#[derive(Clone)]
pub struct CaptureStream {
    commands: mpsc::Sender<Command>,
    stats: Arc<EngineStats>,
    object: ObjectId,
}

/// Creates a capture stream: registers it as a capturer in `graph` and
/// spawns its engine and delivery tasks on the current runtime.
///
/// Returns the control handle and the event channel the stream delivers
/// packets and lifecycle notifications on.
pub fn spawn_capture_stream(
    graph: Arc<LinkGraph>,
    config: EngineConfig,
    clock: MonoClock,
) -> (CaptureStream, mpsc::Receiver<CaptureEvent>) {
    let object = graph.add_capturer();
    let queue = Arc::new(PacketQueue::new());
    let stats = Arc::new(EngineStats::default());
    let (command_tx, command_rx) = mpsc::channel(config.command_channel_capacity);
    let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_delivery(
        Arc::clone(&queue),
        delivery_rx,
        event_tx,
        internal_tx,
        Arc::clone(&stats),
    ));
    let engine = CaptureEngine::new(
        config,
        graph,
        object,
        clock,
        queue,
        delivery_tx,
        Arc::clone(&stats),
    );
    tokio::spawn(engine.run(command_rx, internal_rx));

    (
        CaptureStream {
            commands: command_tx,
            stats,
            object,
        },
        event_rx,
    )
}

impl CaptureStream {
    /// This stream's object in the link graph.
    pub fn object_id(&self) -> ObjectId {
        self.object
    }

    /// Current values of the stream's counters.
    pub fn stats(&self) -> StreamStats {
        self.stats.snapshot()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, CaptureError>>) -> Command,
    ) -> Result<T, CaptureError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| CaptureError::EngineUnavailable)?;
        response.await.map_err(|_| CaptureError::EngineUnavailable)?
    }

    /// Sets the stream format. Allowed once, before binding a buffer.
    pub async fn set_format(&self, stream_type: StreamType) -> Result<(), CaptureError> {
        self.request(|reply| Command::SetFormat { stream_type, reply }).await
    }

    /// Binds the shared payload buffer, returning its capacity in frames.
    ///
    /// Moves the stream into sync operation.
    pub async fn bind_buffer(&self, buffer: Arc<SharedBuffer>) -> Result<u32, CaptureError> {
        self.request(|reply| Command::BindBuffer { buffer, reply }).await
    }

    /// Queues a capture into `[offset_frames, offset_frames + num_frames)`
    /// of the shared buffer, returning the buffer's sequence number.
    ///
    /// Sync mode only. The buffer completes asynchronously as a
    /// [`CaptureEvent::Packet`].
    pub async fn capture_at(
        &self,
        offset_frames: u32,
        num_frames: u32,
    ) -> Result<u64, CaptureError> {
        self.request(|reply| Command::CaptureAt {
            offset_frames,
            num_frames,
            reply,
        })
        .await
    }

    /// Flushes all queued buffers, delivering each (zero-filled past its
    /// fill level) followed by an end-of-stream marker.
    pub async fn discard_all(&self) -> Result<(), CaptureError> {
        self.request(|reply| Command::DiscardAll { reply }).await
    }

    /// Enters async mode: the engine synthesizes and delivers
    /// `frames_per_packet`-frame packets continuously.
    pub async fn start_async(&self, frames_per_packet: u32) -> Result<(), CaptureError> {
        self.request(|reply| Command::StartAsync {
            frames_per_packet,
            reply,
        })
        .await
    }

    /// Leaves async mode. Resolves once the in-flight packet (delivered
    /// with its true fill level) and the end-of-stream marker have reached
    /// the event channel.
    pub async fn stop_async(&self) -> Result<(), CaptureError> {
        self.request(|reply| Command::StopAsync { reply }).await
    }

    /// Sets the stream gain in dB. Out-of-range gain is rejected and shuts
    /// the stream down.
    pub async fn set_gain(&self, gain_db: f32) -> Result<(), CaptureError> {
        self.request(|reply| Command::SetGain { gain_db, reply }).await
    }

    /// Mutes or unmutes the stream. A muted stream keeps capturing frames
    /// of silence on schedule.
    pub async fn set_mute(&self, muted: bool) -> Result<(), CaptureError> {
        self.request(|reply| Command::SetMute { muted, reply }).await
    }

    /// Links a graph source to this stream, returning `None` when no route
    /// is available (incompatible roles or no resampler for the format
    /// pair).
    ///
    /// Requires the stream format to be set.
    pub async fn link_source(&self, source: ObjectId) -> Result<Option<LinkId>, CaptureError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::LinkSource { source, reply })
            .await
            .map_err(|_| CaptureError::EngineUnavailable)?;
        response.await.map_err(|_| CaptureError::EngineUnavailable)
    }

    /// Shuts the stream down, unlinking it from the graph. Idempotent;
    /// resolves once the engine has torn down.
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = response.await;
        }
    }
}
