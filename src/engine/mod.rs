//! The capture engine task.
//!
//! Each capture stream is one tokio task owning all mutable engine state.
//! Control requests arrive as [`Command`]s over a bounded channel and are
//! answered through oneshot replies; mix cycles run inline on the same
//! task, paced by a timer armed at the moment the next job's audio will
//! exist. Completed buffers are handed to a separate delivery task through
//! the shared [`PacketQueue`], so a slow event consumer never stalls the
//! mix.

mod mix;
mod queue;
mod state;

pub use state::State;

pub(crate) use queue::{CommitOutcome, PacketQueue, PendingCaptureBuffer};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::buffer::SharedBuffer;
use crate::clock::MonoClock;
use crate::config::EngineConfig;
use crate::error::CaptureError;
use crate::event::{CaptureEvent, CapturePacket};
use crate::format::StreamType;
use crate::graph::{
    CaptureBookkeeping, LinkGraph, LinkId, LinkInit, ObjectId, SourceType,
};
use crate::mixer::{select_sampler, OutputWriter};
use crate::timeline::TimelineFunction;

/// Control requests handled by the engine task.
pub(crate) enum Command {
    SetFormat {
        stream_type: StreamType,
        reply: oneshot::Sender<Result<(), CaptureError>>,
    },
    BindBuffer {
        buffer: Arc<SharedBuffer>,
        reply: oneshot::Sender<Result<u32, CaptureError>>,
    },
    CaptureAt {
        offset_frames: u32,
        num_frames: u32,
        reply: oneshot::Sender<Result<u64, CaptureError>>,
    },
    DiscardAll {
        reply: oneshot::Sender<Result<(), CaptureError>>,
    },
    StartAsync {
        frames_per_packet: u32,
        reply: oneshot::Sender<Result<(), CaptureError>>,
    },
    StopAsync {
        reply: oneshot::Sender<Result<(), CaptureError>>,
    },
    SetGain {
        gain_db: f32,
        reply: oneshot::Sender<Result<(), CaptureError>>,
    },
    SetMute {
        muted: bool,
        reply: oneshot::Sender<Result<(), CaptureError>>,
    },
    LinkSource {
        source: ObjectId,
        reply: oneshot::Sender<Option<LinkId>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Work items for the delivery task.
pub(crate) enum DeliveryJob {
    /// Pop and deliver everything in the finished queue.
    DrainFinished { bytes_per_frame: usize },
    /// Deliver pre-converted packets (flush path).
    Packets(Vec<CapturePacket>),
    /// Deliver an end-of-stream marker.
    EndOfStream,
    /// Drain the finished queue, emit end-of-stream, then acknowledge the
    /// async stop back to the engine.
    FinishAsyncStop { bytes_per_frame: usize },
    /// Deliver the shutdown notification and exit.
    Shutdown { reason: String },
}

/// Messages from the delivery task back to the engine.
pub(crate) enum Internal {
    /// The async-stop drain reached the client; the engine may return to
    /// sync operation.
    AsyncStopDelivered,
}

/// Cumulative per-stream counters, shared with client handles.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub(crate) frames_captured: AtomicU64,
    pub(crate) packets_delivered: AtomicU64,
    pub(crate) flushes: AtomicU64,
}

impl EngineStats {
    /// Takes a consistent-enough snapshot for reporting.
    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            packets_delivered: self.packets_delivered.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a stream's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    /// Frames mixed into the shared buffer since the stream started.
    pub frames_captured: u64,
    /// Packets handed to the client.
    pub packets_delivered: u64,
    /// Number of `DiscardAll` flushes performed.
    pub flushes: u64,
}

struct BoundBuffer {
    buffer: Arc<SharedBuffer>,
    capacity_frames: u32,
}

/// Engine state for one capture stream; owned by its task.
pub(crate) struct CaptureEngine {
    config: EngineConfig,
    graph: Arc<LinkGraph>,
    object: ObjectId,
    clock: MonoClock,
    queue: Arc<PacketQueue>,
    delivery_tx: mpsc::UnboundedSender<DeliveryJob>,
    stats: Arc<EngineStats>,

    state: State,
    stream_type: Option<StreamType>,
    bound: Option<BoundBuffer>,
    writer: Option<OutputWriter>,
    gain_db: f32,
    muted: bool,

    /// Async mode packet size; `Some` only in async states.
    frames_per_packet: Option<u32>,
    next_async_offset: u32,

    /// Destination frames mixed since the stream started; never reset.
    frame_count: i64,
    /// Destination frame → clock-monotonic ns; `None` when invalidated.
    frames_to_clock_mono: Option<TimelineFunction>,
    /// Bumped on every re-anchor so per-link bookkeeping recomputes lazily.
    clock_generation: u64,
    /// Upper bound on one mix job, derived from the fence floor at bind.
    max_frames_per_mix: u32,
    /// Deadline for the pacing timer, in clock ns (settle margin included).
    timer_deadline_ns: Option<i64>,
    /// The next stamped buffer starts a new timeline segment.
    pending_discontinuity: bool,

    mix_buf: Vec<f32>,
    out_buf: Vec<u8>,

    stop_reply: Option<oneshot::Sender<Result<(), CaptureError>>>,
}

impl CaptureEngine {
    pub(crate) fn new(
        config: EngineConfig,
        graph: Arc<LinkGraph>,
        object: ObjectId,
        clock: MonoClock,
        queue: Arc<PacketQueue>,
        delivery_tx: mpsc::UnboundedSender<DeliveryJob>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            config,
            graph,
            object,
            clock,
            queue,
            delivery_tx,
            stats,
            state: State::WaitingForFormat,
            stream_type: None,
            bound: None,
            writer: None,
            gain_db: 0.0,
            muted: false,
            frames_per_packet: None,
            next_async_offset: 0,
            frame_count: 0,
            frames_to_clock_mono: None,
            clock_generation: 0,
            max_frames_per_mix: 0,
            timer_deadline_ns: None,
            pending_discontinuity: false,
            mix_buf: Vec::new(),
            out_buf: Vec::new(),
            stop_reply: None,
        }
    }

    /// Runs the engine until shutdown, then removes it from the graph.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        tracing::debug!(object = ?self.object, "capture engine running");
        while self.state != State::ShutDown {
            let timer_at = self.timer_deadline_ns.map(|ns| self.clock.instant_at(ns));
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.shutdown("client handle dropped"),
                },
                Some(message) = internal.recv() => self.handle_internal(message),
                _ = tokio::time::sleep_until(
                    timer_at.unwrap_or_else(tokio::time::Instant::now)
                ), if timer_at.is_some() => {
                    self.timer_deadline_ns = None;
                    self.mix_cycle();
                }
            }
        }
        self.graph.remove_object(self.object);
        tracing::debug!(object = ?self.object, "capture engine exited");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetFormat { stream_type, reply } => {
                let _ = reply.send(self.set_format(stream_type));
            }
            Command::BindBuffer { buffer, reply } => {
                let _ = reply.send(self.bind_buffer(buffer));
            }
            Command::CaptureAt {
                offset_frames,
                num_frames,
                reply,
            } => {
                let result = self.capture_at(offset_frames, num_frames);
                let run_mix = result.is_ok();
                let _ = reply.send(result);
                if run_mix {
                    self.mix_cycle();
                }
            }
            Command::DiscardAll { reply } => {
                let _ = reply.send(self.discard_all());
            }
            Command::StartAsync {
                frames_per_packet,
                reply,
            } => {
                let result = self.start_async(frames_per_packet);
                let run_mix = result.is_ok();
                let _ = reply.send(result);
                if run_mix {
                    self.mix_cycle();
                }
            }
            Command::StopAsync { reply } => {
                if self.state != State::OperatingAsync {
                    let _ = reply.send(Err(CaptureError::WrongState {
                        operation: "StopAsync",
                        state: self.state,
                    }));
                    return;
                }
                self.state = State::AsyncStopping;
                self.stop_reply = Some(reply);
                self.mix_cycle();
            }
            Command::SetGain { gain_db, reply } => {
                let _ = reply.send(self.set_gain(gain_db));
            }
            Command::SetMute { muted, reply } => {
                if let Err(err) = self.check_control_state("SetMute") {
                    let _ = reply.send(Err(err));
                    return;
                }
                self.muted = muted;
                tracing::debug!(muted, "stream mute updated");
                let _ = reply.send(Ok(()));
            }
            Command::LinkSource { source, reply } => {
                let _ = reply.send(self.link_source(source));
            }
            Command::Shutdown { reply } => {
                self.shutdown("client requested shutdown");
                let _ = reply.send(());
            }
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::AsyncStopDelivered => {
                if self.state != State::AsyncStoppingCallbackPending {
                    tracing::warn!(state = ?self.state, "stray async-stop acknowledgement");
                    return;
                }
                self.state = State::OperatingSync;
                self.frames_per_packet = None;
                self.next_async_offset = 0;
                tracing::info!("async capture stopped");
                if let Some(reply) = self.stop_reply.take() {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    fn set_format(&mut self, stream_type: StreamType) -> Result<(), CaptureError> {
        if self.state != State::WaitingForFormat {
            return Err(CaptureError::WrongState {
                operation: "SetFormat",
                state: self.state,
            });
        }
        let limits = &self.config.limits;
        if !limits.channels_in_range(stream_type.channels) {
            return Err(CaptureError::ChannelsOutOfRange {
                channels: stream_type.channels,
                min: limits.min_channels,
                max: limits.max_channels,
            });
        }
        if !limits.frame_rate_in_range(stream_type.frames_per_second) {
            return Err(CaptureError::FrameRateOutOfRange {
                frames_per_second: stream_type.frames_per_second,
                min: limits.min_frames_per_second,
                max: limits.max_frames_per_second,
            });
        }
        tracing::info!(
            format = ?stream_type.sample_format,
            channels = stream_type.channels,
            frames_per_second = stream_type.frames_per_second,
            "stream format set"
        );
        self.stream_type = Some(stream_type);
        Ok(())
    }

    fn bind_buffer(&mut self, buffer: Arc<SharedBuffer>) -> Result<u32, CaptureError> {
        if self.bound.is_some() {
            return Err(CaptureError::BufferAlreadyBound);
        }
        if self.state != State::WaitingForFormat {
            return Err(CaptureError::WrongState {
                operation: "BindBuffer",
                state: self.state,
            });
        }
        let stream_type = self.stream_type.ok_or(CaptureError::FormatNotSet)?;
        let bytes_per_frame = stream_type.bytes_per_frame();
        let bytes = buffer.len();
        if bytes < bytes_per_frame {
            return Err(CaptureError::BufferTooSmall {
                bytes,
                bytes_per_frame,
            });
        }
        if bytes % bytes_per_frame != 0 {
            return Err(CaptureError::BufferMisaligned {
                bytes,
                bytes_per_frame,
            });
        }
        let frames = (bytes / bytes_per_frame) as u64;
        if frames > u32::MAX as u64 {
            return Err(CaptureError::BufferTooLarge { frames });
        }
        let capacity_frames = frames as u32;

        let frame_ns = stream_type.frame_duration().as_nanos().max(1);
        self.max_frames_per_mix =
            (self.config.min_fence_time.as_nanos() / frame_ns).max(1) as u32;
        self.mix_buf = Vec::with_capacity(
            self.max_frames_per_mix as usize * stream_type.channels as usize,
        );
        self.writer = Some(OutputWriter::new(stream_type));
        self.bound = Some(BoundBuffer {
            buffer,
            capacity_frames,
        });
        self.state = State::OperatingSync;
        tracing::info!(
            capacity_frames,
            max_frames_per_mix = self.max_frames_per_mix,
            "payload buffer bound; stream operating"
        );
        Ok(capacity_frames)
    }

    fn capture_at(&mut self, offset_frames: u32, num_frames: u32) -> Result<u64, CaptureError> {
        if self.state != State::OperatingSync {
            return Err(CaptureError::WrongState {
                operation: "CaptureAt",
                state: self.state,
            });
        }
        let capacity_frames = match &self.bound {
            Some(bound) => bound.capacity_frames,
            None => return Err(CaptureError::FormatNotSet),
        };
        let end = offset_frames as u64 + num_frames as u64;
        if num_frames == 0 || end > capacity_frames as u64 {
            return Err(CaptureError::InvalidCaptureRange {
                offset_frames,
                num_frames,
                capacity_frames,
            });
        }
        Ok(self.queue.push_pending(offset_frames, num_frames))
    }

    fn discard_all(&mut self) -> Result<(), CaptureError> {
        if self.state != State::OperatingSync {
            return Err(CaptureError::WrongState {
                operation: "DiscardAll",
                state: self.state,
            });
        }
        let batch = self.queue.flush();
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.invalidate_timeline();
        self.timer_deadline_ns = None;
        tracing::debug!(buffers = batch.len(), "flushing capture queues");
        let packets = self.flushed_packets(batch);
        let _ = self.delivery_tx.send(DeliveryJob::Packets(packets));
        let _ = self.delivery_tx.send(DeliveryJob::EndOfStream);
        Ok(())
    }

    /// Converts flushed buffers for delivery, zero-filling the unfilled
    /// tail of each so the client always sees a fully written region.
    fn flushed_packets(&self, batch: Vec<PendingCaptureBuffer>) -> Vec<CapturePacket> {
        let (Some(bound), Some(stream_type), Some(writer)) =
            (self.bound.as_ref(), self.stream_type, self.writer)
        else {
            return Vec::new();
        };
        let bytes_per_frame = stream_type.bytes_per_frame();
        batch
            .into_iter()
            .map(|buffer| {
                if buffer.filled_frames < buffer.num_frames {
                    let start =
                        (buffer.offset_frames + buffer.filled_frames) as usize * bytes_per_frame;
                    let len =
                        (buffer.num_frames - buffer.filled_frames) as usize * bytes_per_frame;
                    bound.buffer.fill(start, len, writer.silence_byte());
                }
                CapturePacket {
                    sequence: buffer.sequence,
                    payload_offset: buffer.offset_frames as u64 * bytes_per_frame as u64,
                    payload_size: buffer.num_frames as u64 * bytes_per_frame as u64,
                    capture_timestamp: buffer.capture_timestamp,
                    discontinuity: buffer.discontinuity,
                }
            })
            .collect()
    }

    fn start_async(&mut self, frames_per_packet: u32) -> Result<(), CaptureError> {
        if self.state != State::OperatingSync {
            return Err(CaptureError::WrongState {
                operation: "StartAsync",
                state: self.state,
            });
        }
        if !self.queue.is_empty() {
            return Err(CaptureError::QueuesNotEmpty);
        }
        let capacity_frames = match &self.bound {
            Some(bound) => bound.capacity_frames,
            None => return Err(CaptureError::FormatNotSet),
        };
        let max_frames_per_packet = capacity_frames / 2;
        if frames_per_packet == 0 || frames_per_packet > max_frames_per_packet {
            return Err(CaptureError::InvalidPacketSize {
                frames_per_packet,
                max_frames_per_packet,
            });
        }
        self.state = State::OperatingAsync;
        self.frames_per_packet = Some(frames_per_packet);
        self.next_async_offset = 0;
        self.invalidate_timeline();
        tracing::info!(frames_per_packet, "async capture started");
        Ok(())
    }

    fn set_gain(&mut self, gain_db: f32) -> Result<(), CaptureError> {
        self.check_control_state("SetGain")?;
        if !self.config.limits.gain_in_range(gain_db) {
            // Invalid gain is a protocol violation severe enough to kill
            // the stream: it is rejected, never clamped.
            let err = CaptureError::GainOutOfRange {
                gain_db,
                min: self.config.limits.min_gain_db,
                max: self.config.limits.max_gain_db,
            };
            tracing::error!(gain_db, "rejecting out-of-range gain");
            self.shutdown(format!("invalid gain: {err}"));
            return Err(err);
        }
        self.gain_db = gain_db;
        tracing::debug!(gain_db, "stream gain updated");
        Ok(())
    }

    /// Gain and mute are accepted in every live state except the async
    /// stopping window, where no operations are allowed.
    fn check_control_state(&self, operation: &'static str) -> Result<(), CaptureError> {
        match self.state {
            State::WaitingForFormat | State::OperatingSync | State::OperatingAsync => Ok(()),
            state => Err(CaptureError::WrongState { operation, state }),
        }
    }

    /// Links a graph source to this capturer, selecting a resampler for
    /// ring sources. `None` means no route is available.
    fn link_source(&self, source: ObjectId) -> Option<LinkId> {
        let dest_type = self.stream_type?;
        self.graph.link_objects(source, self.object, |candidate| {
            match candidate.source_type {
                SourceType::Packet => LinkInit::Accept,
                SourceType::RingBuffer => {
                    let Some(source_type) = candidate.source_stream_type else {
                        // No live ring yet; the mix skips it until one
                        // appears under a fresh link.
                        return LinkInit::Accept;
                    };
                    match select_sampler(&source_type, &dest_type) {
                        Some(sampler) => LinkInit::AcceptWithBookkeeping(
                            CaptureBookkeeping::new(sampler),
                        ),
                        None => {
                            tracing::debug!(
                                source_channels = source_type.channels,
                                dest_channels = dest_type.channels,
                                "no resampler for format pair; rejecting link"
                            );
                            LinkInit::Reject
                        }
                    }
                }
            }
        })
    }

    fn invalidate_timeline(&mut self) {
        self.frames_to_clock_mono = None;
        self.pending_discontinuity = true;
    }

    /// The single exit path: every fatal condition and every explicit
    /// teardown funnels through here exactly once.
    pub(super) fn shutdown(&mut self, reason: impl Into<String>) {
        if self.state == State::ShutDown {
            return;
        }
        let reason = reason.into();
        tracing::info!(%reason, object = ?self.object, "shutting down capture stream");
        self.state = State::ShutDown;
        self.graph.unlink(self.object);
        let dropped = self.queue.flush();
        if !dropped.is_empty() {
            tracing::debug!(buffers = dropped.len(), "dropping queued buffers at shutdown");
        }
        self.bound = None;
        self.timer_deadline_ns = None;
        if let Some(reply) = self.stop_reply.take() {
            let _ = reply.send(Err(CaptureError::EngineUnavailable));
        }
        let _ = self.delivery_tx.send(DeliveryJob::Shutdown { reason });
    }
}

/// Converts a finished buffer into its client-facing packet.
pub(crate) fn packet_from_buffer(
    buffer: &PendingCaptureBuffer,
    bytes_per_frame: usize,
) -> CapturePacket {
    CapturePacket {
        sequence: buffer.sequence,
        payload_offset: buffer.offset_frames as u64 * bytes_per_frame as u64,
        payload_size: buffer.filled_frames as u64 * bytes_per_frame as u64,
        capture_timestamp: buffer.capture_timestamp,
        discontinuity: buffer.discontinuity,
    }
}

/// Runs the delivery side of one stream: pops finished buffers off the
/// shared queue and forwards events to the client in order.
pub(crate) async fn run_delivery(
    queue: Arc<PacketQueue>,
    mut jobs: mpsc::UnboundedReceiver<DeliveryJob>,
    events: mpsc::Sender<CaptureEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    stats: Arc<EngineStats>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            DeliveryJob::DrainFinished { bytes_per_frame } => {
                drain_finished(&queue, bytes_per_frame, &events, &stats).await;
            }
            DeliveryJob::Packets(packets) => {
                for packet in packets {
                    stats.packets_delivered.fetch_add(1, Ordering::Relaxed);
                    let _ = events.send(CaptureEvent::Packet(packet)).await;
                }
            }
            DeliveryJob::EndOfStream => {
                let _ = events.send(CaptureEvent::EndOfStream).await;
            }
            DeliveryJob::FinishAsyncStop { bytes_per_frame } => {
                drain_finished(&queue, bytes_per_frame, &events, &stats).await;
                let _ = events.send(CaptureEvent::EndOfStream).await;
                let _ = internal.send(Internal::AsyncStopDelivered);
            }
            DeliveryJob::Shutdown { reason } => {
                let _ = events.send(CaptureEvent::Shutdown { reason }).await;
                return;
            }
        }
    }
}

async fn drain_finished(
    queue: &PacketQueue,
    bytes_per_frame: usize,
    events: &mpsc::Sender<CaptureEvent>,
    stats: &EngineStats,
) {
    while let Some(buffer) = queue.pop_finished() {
        let packet = packet_from_buffer(&buffer, bytes_per_frame);
        stats.packets_delivered.fetch_add(1, Ordering::Relaxed);
        let _ = events.send(CaptureEvent::Packet(packet)).await;
    }
}
