//! The mix cycle.
//!
//! One cycle fills the front pending buffer from the capturer's linked
//! sources, at most [`max_frames_per_mix`] frames at a time. When the
//! job's audio has not been produced yet, the cycle arms the pacing timer
//! and returns instead of busy-waiting; the timer fires once the last
//! frame of the job exists (plus the settle margin) and re-enters here.
//!
//! [`max_frames_per_mix`]: super::CaptureEngine

use std::sync::atomic::Ordering;
use std::sync::PoisonError;

use crate::config::MUTED_GAIN_DB;
use crate::error::CaptureError;
use crate::graph::{CaptureBookkeeping, SourceType};
use crate::mixer::{gain_scale_from_db, Sampler, SourceRegion};
use crate::timeline::{frames_to_frac, TimelineFunction};

use super::{CaptureEngine, CommitOutcome, DeliveryJob, State};

/// Capability witness: functions taking one may only run inside a mix
/// cycle, where the engine's timeline and bookkeeping are coherent.
pub(super) struct MixToken;

impl CaptureEngine {
    /// Runs mix cycles until the stream is caught up or waiting on audio.
    ///
    /// Any error here is fatal to the stream and routes through the single
    /// shutdown path.
    pub(super) fn mix_cycle(&mut self) {
        if !(self.state.is_operating() || self.state == State::AsyncStopping) {
            return;
        }
        let token = MixToken;
        if let Err(error) = self.mix_until_blocked(&token) {
            tracing::error!(%error, "mix cycle failed");
            self.shutdown(format!("mix failure: {error}"));
        }
    }

    fn mix_until_blocked(&mut self, token: &MixToken) -> Result<(), CaptureError> {
        loop {
            match self.state {
                State::OperatingSync | State::OperatingAsync => {}
                State::AsyncStopping => return self.finish_async_stop(token),
                _ => return Ok(()),
            }

            let Some(front) = self.queue.front_snapshot() else {
                if self.state == State::OperatingAsync {
                    self.synthesize_async_buffer(token);
                    continue;
                }
                // Queue ran dry: the timeline stops here, and whatever is
                // captured next is not contiguous with it.
                self.invalidate_timeline();
                self.timer_deadline_ns = None;
                return Ok(());
            };
            let (Some(stream_type), Some(writer)) = (self.stream_type, self.writer) else {
                debug_assert!(false, "operating without a bound format");
                return Ok(());
            };
            let payload = match &self.bound {
                Some(bound) => std::sync::Arc::clone(&bound.buffer),
                None => {
                    debug_assert!(false, "operating without a bound buffer");
                    return Ok(());
                }
            };

            let frames_to_clock = self.ensure_timeline(stream_type);
            let todo = (front.num_frames - front.filled_frames).min(self.max_frames_per_mix);

            // Pace: wait until the last frame of this job has been
            // produced before reading anything.
            let last_frame_ready_ns = frames_to_clock.apply(self.frame_count + todo as i64)?;
            let now = self.clock.now_ns();
            if last_frame_ready_ns > now {
                self.timer_deadline_ns =
                    Some(last_frame_ready_ns + self.config.settle_margin.as_nanos() as i64);
                return Ok(());
            }
            self.timer_deadline_ns = None;

            let channels = stream_type.channels;
            self.mix_buf.clear();
            self.mix_buf.resize(todo as usize * channels as usize, 0.0);
            self.mix_sources(todo as usize, channels, &frames_to_clock, token)?;

            let bytes_per_frame = stream_type.bytes_per_frame();
            writer.to_bytes(&self.mix_buf, &mut self.out_buf);
            payload.write_at(
                (front.offset_frames + front.filled_frames) as usize * bytes_per_frame,
                &self.out_buf,
            );

            let timestamp = frames_to_clock.apply(self.frame_count)?;
            match self.queue.commit_mix(
                front.sequence,
                todo,
                timestamp,
                self.pending_discontinuity,
            ) {
                CommitOutcome::Raced => {
                    // The buffer was flushed out from under us; the bytes
                    // we wrote are unreferenced. Start a fresh segment.
                    tracing::debug!(sequence = front.sequence, "mix raced with flush");
                    self.invalidate_timeline();
                }
                CommitOutcome::Progress {
                    completed,
                    finished_was_empty,
                    stamped_timestamp,
                } => {
                    if stamped_timestamp {
                        self.pending_discontinuity = false;
                    }
                    self.frame_count += todo as i64;
                    self.stats.frames_captured.fetch_add(todo as u64, Ordering::Relaxed);
                    if completed {
                        if finished_was_empty {
                            let _ = self
                                .delivery_tx
                                .send(DeliveryJob::DrainFinished { bytes_per_frame });
                        }
                        if self.state == State::OperatingAsync {
                            self.synthesize_async_buffer(token);
                        }
                    }
                }
            }
        }
    }

    /// Returns the destination-frame → clock mapping, anchoring a fresh one
    /// at (now, accumulated frames) when none is live.
    fn ensure_timeline(&mut self, stream_type: crate::format::StreamType) -> TimelineFunction {
        if let Some(function) = self.frames_to_clock_mono {
            return function;
        }
        let now = self.clock.now_ns();
        let function = TimelineFunction::new(now, self.frame_count, stream_type.ns_per_frame());
        self.frames_to_clock_mono = Some(function);
        self.clock_generation += 1;
        tracing::debug!(
            now_ns = now,
            frame = self.frame_count,
            generation = self.clock_generation,
            "anchored capture timeline"
        );
        function
    }

    /// Mixes every linked ring source into the intermediate buffer for the
    /// job covering destination frames `[frame_count, frame_count + dest_frames)`.
    fn mix_sources(
        &mut self,
        dest_frames: usize,
        dest_channels: u16,
        frames_to_clock: &TimelineFunction,
        _token: &MixToken,
    ) -> Result<(), CaptureError> {
        // Fully muted streams capture silence without touching any source.
        if self.muted || self.gain_db <= MUTED_GAIN_DB {
            return Ok(());
        }
        let gain_scale = gain_scale_from_db(self.gain_db);
        let job_start_frame = self.frame_count;
        let job_end_frame = job_start_frame + dest_frames as i64;

        let sources = self.graph.capture_sources(self.object);
        let mut first_source = true;
        for source in &sources {
            if source.silence_sentinel {
                return Err(CaptureError::SilenceSourceLinked);
            }
            if source.source_type == SourceType::Packet {
                continue;
            }
            let Some(ring) = &source.ring else { continue };
            let Some(snapshot) = ring.snapshot() else {
                // Driver has not anchored production yet.
                continue;
            };
            let Some(bookkeeping) = &source.bookkeeping else {
                tracing::warn!(link = ?source.link, "ring source without bookkeeping");
                continue;
            };
            let mut bookkeeping = bookkeeping
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if bookkeeping.is_stale(self.clock_generation, snapshot.generation()) {
                let clock_to_frac = snapshot.clock_mono_to_frac_frames()?;
                bookkeeping.update_transform(
                    frames_to_clock,
                    &clock_to_frac,
                    self.clock_generation,
                    snapshot.generation(),
                )?;
            }
            let Some(transform) = bookkeeping.dest_frames_to_frac_source_frames else {
                continue;
            };
            let mut frac_source_pos = transform.apply(job_start_frame)?;
            let job_end_frac = transform.apply(job_end_frame)?;

            let Some((safe_start, safe_end)) = snapshot.safe_read_range(self.clock.now_ns())?
            else {
                continue;
            };
            let regions = snapshot.regions(safe_start, safe_end - safe_start);

            let CaptureBookkeeping {
                sampler,
                step_size,
                rate_modulo,
                denominator,
                src_pos_modulo,
                ..
            } = &mut *bookkeeping;

            let mut dest_frame_offset = 0usize;
            for region in &regions {
                let region_start_frac = frames_to_frac(region.first_frame)?;
                let region_end_frac =
                    frames_to_frac(region.first_frame + region.frame_count as i64)?;
                // Skip regions entirely behind the filter window; stop at
                // regions entirely beyond it.
                if region_end_frac <= frac_source_pos - sampler.neg_filter_width() {
                    continue;
                }
                if region_start_frac >= job_end_frac + sampler.pos_filter_width() {
                    break;
                }
                let source_region = SourceRegion {
                    bytes: snapshot.bytes(region),
                    stream_type: snapshot.stream_type(),
                    frac_start: region_start_frac,
                    frame_count: region.frame_count as usize,
                };
                let exhausted = sampler.mix_region(
                    &mut self.mix_buf,
                    dest_channels,
                    &mut dest_frame_offset,
                    dest_frames,
                    &source_region,
                    &mut frac_source_pos,
                    *step_size,
                    *rate_modulo,
                    *denominator,
                    src_pos_modulo,
                    gain_scale,
                    !first_source,
                );
                if !exhausted {
                    break;
                }
            }
            first_source = false;
        }
        Ok(())
    }

    /// Final cycle of an async stop: hand whatever is in flight to
    /// delivery with its true fill level and wait for the acknowledgement.
    fn finish_async_stop(&mut self, _token: &MixToken) -> Result<(), CaptureError> {
        let Some(stream_type) = self.stream_type else {
            debug_assert!(false, "async stop without a bound format");
            return Ok(());
        };
        self.queue.drain_pending_to_finished();
        self.invalidate_timeline();
        self.timer_deadline_ns = None;
        self.state = State::AsyncStoppingCallbackPending;
        let _ = self.delivery_tx.send(DeliveryJob::FinishAsyncStop {
            bytes_per_frame: stream_type.bytes_per_frame(),
        });
        tracing::debug!("async stop draining to delivery");
        Ok(())
    }

    /// Queues the next synthesized async buffer, tiling the shared buffer
    /// in packet-size strides and wrapping to offset zero when the next
    /// stride would not fit.
    fn synthesize_async_buffer(&mut self, _token: &MixToken) {
        let (Some(frames_per_packet), Some(bound)) =
            (self.frames_per_packet, self.bound.as_ref())
        else {
            debug_assert!(false, "async synthesis outside async mode");
            return;
        };
        let offset = packet_offset(
            self.next_async_offset,
            frames_per_packet,
            bound.capacity_frames,
        );
        self.queue.push_pending(offset, frames_per_packet);
        self.next_async_offset = offset + frames_per_packet;
    }
}

/// Start of the next tiled packet: `offset`, or zero when a full stride no
/// longer fits before the end of the buffer. Widened so the check cannot
/// overflow for capacities near `u32::MAX`.
fn packet_offset(offset: u32, frames_per_packet: u32, capacity_frames: u32) -> u32 {
    if offset as u64 + frames_per_packet as u64 > capacity_frames as u64 {
        0
    } else {
        offset
    }
}
