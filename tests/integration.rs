//! End-to-end capture stream tests.
//!
//! All tests run under a paused tokio runtime: the engine's pacing timers
//! drive virtual time forward deterministically, so assertions about
//! timestamps and packet ordering are exact.

use std::sync::Arc;

use capture_mixer::format::NS_PER_SECOND;
use capture_mixer::timeline::{TimelineFunction, TimelineRate};
use capture_mixer::{
    spawn_capture_stream, CaptureError, CaptureEvent, CapturePacket, CaptureStream,
    EngineConfig, LinkGraph, MonoClock, RingBufferFeed, SampleFormat, SharedBuffer, StreamType,
};
use tokio::sync::mpsc;

fn mono16(frames_per_second: u32) -> StreamType {
    StreamType::new(SampleFormat::I16, 1, frames_per_second)
}

/// A ring feed holding a constant i16 value, with production anchored at
/// the current (virtual) time.
fn constant_feed(
    stream_type: StreamType,
    frames: u32,
    value: i16,
    clock: &MonoClock,
) -> Arc<RingBufferFeed> {
    let feed = RingBufferFeed::new(stream_type, frames);
    let samples = frames as usize * stream_type.channels as usize;
    let mut bytes = Vec::with_capacity(samples * 2);
    for _ in 0..samples {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    feed.set_payload(bytes);
    feed.start(TimelineFunction::new(
        0,
        clock.now_ns(),
        TimelineRate::new(stream_type.frames_per_second as u64, NS_PER_SECOND),
    ));
    feed
}

/// Opt-in log output: set `RUST_LOG` to watch the engine schedule while a
/// test runs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Spawns a stream, configures it, and binds a buffer of `buffer_frames`.
async fn operating_stream(
    graph: Arc<LinkGraph>,
    clock: MonoClock,
    stream_type: StreamType,
    buffer_frames: u32,
) -> (
    CaptureStream,
    mpsc::Receiver<CaptureEvent>,
    Arc<SharedBuffer>,
) {
    init_tracing();
    let (stream, events) = spawn_capture_stream(graph, EngineConfig::default(), clock);
    stream.set_format(stream_type).await.unwrap();
    let buffer = Arc::new(SharedBuffer::new(
        buffer_frames as usize * stream_type.bytes_per_frame(),
    ));
    let capacity = stream.bind_buffer(Arc::clone(&buffer)).await.unwrap();
    assert_eq!(capacity, buffer_frames);
    (stream, events, buffer)
}

async fn expect_packet(events: &mut mpsc::Receiver<CaptureEvent>) -> CapturePacket {
    match events.recv().await {
        Some(CaptureEvent::Packet(packet)) => packet,
        other => panic!("expected packet, got {other:?}"),
    }
}

fn samples_of(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_sync_capture_round_trips_source_audio() {
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let input = graph.add_input(constant_feed(mono16(8000), 16384, 1000, &clock));
    let (stream, mut events, buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    let link = stream.link_source(input).await.unwrap();
    assert!(link.is_some());

    let sequence = stream.capture_at(0, 800).await.unwrap();
    assert_eq!(sequence, 0);

    let packet = expect_packet(&mut events).await;
    assert_eq!(packet.sequence, 0);
    assert_eq!(packet.payload_offset, 0);
    assert_eq!(packet.payload_size, 1600);
    assert!(packet.capture_timestamp.is_some());
    assert!(!packet.discontinuity);

    let samples = samples_of(&buffer.read(0, 1600));
    assert!(samples.iter().all(|&s| s == 1000), "got {:?}", &samples[..8]);

    let stats = stream.stats();
    assert_eq!(stats.frames_captured, 800);
    assert_eq!(stats.packets_delivered, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_conversion_capture() {
    // 16kHz source feeding an 8kHz capture through the linear sampler.
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let input = graph.add_input(constant_feed(mono16(16000), 16384, 1000, &clock));
    let (stream, mut events, buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    assert!(stream.link_source(input).await.unwrap().is_some());
    stream.capture_at(0, 400).await.unwrap();

    let packet = expect_packet(&mut events).await;
    assert_eq!(packet.payload_size, 800);
    let samples = samples_of(&buffer.read(0, 800));
    // Interpolating a constant signal reproduces it exactly.
    assert!(samples.iter().all(|&s| s == 1000), "got {:?}", &samples[..8]);
}

#[tokio::test(start_paused = true)]
async fn test_muted_stream_captures_silence_on_schedule() {
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let input = graph.add_input(constant_feed(mono16(8000), 16384, 12345, &clock));
    let (stream, mut events, buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    assert!(stream.link_source(input).await.unwrap().is_some());
    stream.set_mute(true).await.unwrap();
    stream.capture_at(0, 2048).await.unwrap();

    // The buffer completes on its normal schedule, timestamped, silent.
    let packet = expect_packet(&mut events).await;
    assert_eq!(packet.payload_size, 4096);
    assert!(packet.capture_timestamp.is_some());
    assert!(buffer.read(0, 4096).iter().all(|&b| b == 0));
}

#[tokio::test(start_paused = true)]
async fn test_gain_floor_produces_silence() {
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let input = graph.add_input(constant_feed(mono16(8000), 16384, 12345, &clock));
    let (stream, mut events, buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    assert!(stream.link_source(input).await.unwrap().is_some());
    stream.set_gain(capture_mixer::MUTED_GAIN_DB).await.unwrap();
    stream.capture_at(0, 400).await.unwrap();

    expect_packet(&mut events).await;
    assert!(buffer.read(0, 800).iter().all(|&b| b == 0));
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_buffers_have_contiguous_timestamps() {
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let input = graph.add_input(constant_feed(mono16(8000), 16384, 1000, &clock));
    let (stream, mut events, _buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    assert!(stream.link_source(input).await.unwrap().is_some());
    stream.capture_at(0, 400).await.unwrap();
    stream.capture_at(400, 400).await.unwrap();

    let first = expect_packet(&mut events).await;
    let second = expect_packet(&mut events).await;
    assert_eq!(first.sequence, 0);
    assert_eq!(second.sequence, 1);
    assert!(!second.discontinuity);
    // 400 frames at 8kHz is exactly 50ms.
    assert_eq!(
        second.capture_timestamp.unwrap() - first.capture_timestamp.unwrap(),
        50_000_000
    );
}

#[tokio::test(start_paused = true)]
async fn test_discard_all_delivers_queued_buffers_then_end_of_stream() {
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let (stream, mut events, _buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    stream.capture_at(0, 400).await.unwrap();
    stream.capture_at(400, 400).await.unwrap();
    stream.discard_all().await.unwrap();

    // Unmixed buffers come back in order with no timestamp, then the
    // end-of-stream marker.
    let first = expect_packet(&mut events).await;
    assert_eq!(first.sequence, 0);
    assert_eq!(first.capture_timestamp, None);
    assert_eq!(first.payload_size, 800);
    let second = expect_packet(&mut events).await;
    assert_eq!(second.sequence, 1);
    assert!(matches!(events.recv().await, Some(CaptureEvent::EndOfStream)));

    // Flushing an empty queue delivers no packets, only the marker.
    stream.discard_all().await.unwrap();
    assert!(matches!(events.recv().await, Some(CaptureEvent::EndOfStream)));

    // The next captured buffer starts a new timeline segment.
    stream.capture_at(0, 400).await.unwrap();
    let next = expect_packet(&mut events).await;
    assert_eq!(next.sequence, 2);
    assert!(next.discontinuity);
    assert!(next.capture_timestamp.is_some());

    assert_eq!(stream.stats().flushes, 2);
}

#[tokio::test(start_paused = true)]
async fn test_async_capture_tiles_buffer_and_stops_cleanly() {
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let input = graph.add_input(constant_feed(mono16(8000), 8192, 1000, &clock));
    let (stream, mut events, _buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    assert!(stream.link_source(input).await.unwrap().is_some());
    stream.start_async(512).await.unwrap();

    let mut timestamps = Vec::new();
    for expected in 0..3u64 {
        let packet = expect_packet(&mut events).await;
        assert_eq!(packet.sequence, expected);
        assert_eq!(packet.payload_offset, expected * 512 * 2);
        assert_eq!(packet.payload_size, 1024);
        // First packet of the async segment marks the timeline break.
        assert_eq!(packet.discontinuity, expected == 0);
        timestamps.push(packet.capture_timestamp.unwrap());
    }
    assert!(timestamps.windows(2).all(|w| w[1] - w[0] == 64_000_000));

    stream.stop_async().await.unwrap();

    // The in-flight buffer is delivered with its true fill level, then
    // exactly one end-of-stream marker.
    let tail = expect_packet(&mut events).await;
    assert_eq!(tail.sequence, 3);
    assert_eq!(tail.payload_size, 0);
    assert_eq!(tail.capture_timestamp, None);
    assert!(matches!(events.recv().await, Some(CaptureEvent::EndOfStream)));

    // Back in sync mode.
    stream.capture_at(0, 400).await.unwrap();
    let packet = expect_packet(&mut events).await;
    assert_eq!(packet.sequence, 4);
    assert!(packet.discontinuity);
}

#[tokio::test(start_paused = true)]
async fn test_capture_at_rejected_in_async_mode() {
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let (stream, mut events, _buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    stream.start_async(512).await.unwrap();
    let err = stream.capture_at(0, 400).await.unwrap_err();
    assert!(matches!(err, CaptureError::WrongState { .. }));

    // The rejection is not fatal: async capture keeps delivering.
    let packet = expect_packet(&mut events).await;
    assert_eq!(packet.sequence, 0);
    stream.stop_async().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_start_async_validates_packet_size_and_queues() {
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let (stream, _events, _buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    let err = stream.start_async(0).await.unwrap_err();
    assert!(matches!(err, CaptureError::InvalidPacketSize { .. }));
    // More than half the buffer would collide with the in-flight packet.
    let err = stream.start_async(2049).await.unwrap_err();
    assert!(matches!(
        err,
        CaptureError::InvalidPacketSize {
            max_frames_per_packet: 2048,
            ..
        }
    ));

    stream.capture_at(0, 400).await.unwrap();
    let err = stream.start_async(512).await.unwrap_err();
    assert!(matches!(err, CaptureError::QueuesNotEmpty));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_capture_range_rejected() {
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let (stream, _events, _buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    let err = stream.capture_at(4000, 200).await.unwrap_err();
    assert!(matches!(
        err,
        CaptureError::InvalidCaptureRange {
            offset_frames: 4000,
            num_frames: 200,
            capacity_frames: 4096,
        }
    ));
    let err = stream.capture_at(0, 0).await.unwrap_err();
    assert!(matches!(err, CaptureError::InvalidCaptureRange { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_silence_sentinel_source_is_fatal() {
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let sentinel = graph.add_silence_output();
    let (stream, mut events, _buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    // The link itself is accepted; the mix loop detects the sentinel.
    assert!(stream.link_source(sentinel).await.unwrap().is_some());
    stream.capture_at(0, 400).await.unwrap();

    match events.recv().await {
        Some(CaptureEvent::Shutdown { reason }) => {
            assert!(reason.contains("silence"), "reason: {reason}");
        }
        other => panic!("expected shutdown, got {other:?}"),
    }
    assert!(events.recv().await.is_none());

    // The engine is gone; further requests fail cleanly.
    let err = stream.capture_at(0, 400).await.unwrap_err();
    assert!(matches!(err, CaptureError::EngineUnavailable));
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_gain_shuts_stream_down() {
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let (stream, mut events, _buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    let err = stream.set_gain(500.0).await.unwrap_err();
    assert!(matches!(err, CaptureError::GainOutOfRange { .. }));
    assert!(matches!(
        events.recv().await,
        Some(CaptureEvent::Shutdown { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_incompatible_channel_pair_has_no_route() {
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let quad = StreamType::new(SampleFormat::I16, 4, 8000);
    let input = graph.add_input(constant_feed(quad, 1024, 0, &clock));
    let (stream, _events, _buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    // Four channels cannot be mapped onto one; no link is created.
    assert!(stream.link_source(input).await.unwrap().is_none());
    assert_eq!(graph.source_link_count(stream.object_id()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_unlinks_from_graph() {
    let graph = Arc::new(LinkGraph::new());
    let clock = MonoClock::new();
    let input = graph.add_input(constant_feed(mono16(8000), 1024, 0, &clock));
    let (stream, mut events, _buffer) =
        operating_stream(Arc::clone(&graph), clock, mono16(8000), 4096).await;

    assert!(stream.link_source(input).await.unwrap().is_some());
    let object = stream.object_id();
    assert_eq!(graph.source_link_count(object), 1);

    stream.shutdown().await;
    assert!(matches!(
        events.recv().await,
        Some(CaptureEvent::Shutdown { .. })
    ));
    assert!(graph.object_kind(object).is_none());
}
