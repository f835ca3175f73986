//! Decoder: one worker per elementary stream plus the thread-safe
//! controller façade the demuxer drives.
//!
//! [`Decoder::new`] loads a packetiser (when the input is not already
//! unit-framed) and a codec, then spawns the worker. All other operations
//! are safe to call from the demuxer thread while the worker runs:
//! enqueue, pause, flush, drain, frame stepping, the first-data wait gate
//! and the closed-caption channel controls. Dropping the decoder cancels
//! the worker, joins it and returns the rented sinks to the pool.

mod owner;
mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use common::{
    Block, CLOCK_FREQ, CodecId, EngineError, EsCategory, EsFormat, RATE_DEFAULT, TICK_INVALID,
    Tick, codec,
};

use crate::clock::MasterClock;
use crate::codec::CodecLoader;
use crate::config::EngineConfig;
use crate::sink::ResourcePool;
use crate::stats::StatsSink;
use owner::DecoderInner;
use worker::Worker;

/// Pictures dated this far past their conversion instant carry a bogus
/// timestamp and are rejected.
pub const DECODER_BOGUS_VIDEO_DELAY: Tick = DEFAULT_PTS_DELAY * 30;

/// Nominal demuxer read-ahead.
pub const DEFAULT_PTS_DELAY: Tick = 300_000;

/// How far ahead of its deadline an audio buffer is handed to the sink.
pub const AOUT_MAX_PREPARE_TIME: Tick = CLOCK_FREQ;

/// Upper bound on audio timestamp conversions.
pub const AOUT_MAX_ADVANCE_TIME: Tick = 2 * CLOCK_FREQ;

/// How far ahead of its window a subtitle is handed to the sink.
pub const SPU_MAX_PREPARE_TIME: Tick = CLOCK_FREQ / 2;

/// Poll interval while a subtitle decoder waits for a video output.
pub const DECODER_SPU_VOUT_WAIT_DURATION: Tick = 200_000;

/// Attempts before a subtitle unit is dropped for lack of a video output.
pub const SPU_VOUT_WAIT_ATTEMPTS: u32 = 30;

/// Everything needed to create a decoder.
pub struct DecoderParams {
    pub fmt: EsFormat,
    pub clock: Option<Arc<dyn MasterClock>>,
    pub pool: Arc<dyn ResourcePool>,
    pub loader: Arc<dyn CodecLoader>,
    pub stats: Option<Arc<dyn StatsSink>>,
    pub config: EngineConfig,
}

/// Handle on one running decoder.
pub struct Decoder {
    pub(crate) inner: Arc<DecoderInner>,
    thread: Option<JoinHandle<()>>,
    category: EsCategory,
    codec_id: CodecId,
}

impl Decoder {
    /// Load the codec chain for `params.fmt` and spawn the worker.
    /// Fails when no codec module matches the format.
    pub fn new(params: DecoderParams) -> Result<Self, EngineError> {
        let category = params.fmt.category.ok_or_else(|| {
            EngineError::InvalidState("elementary stream without category".to_string())
        })?;

        // Load a packetiser when the input is not already unit-framed.
        let mut packetizer = None;
        let mut codec_fmt = params.fmt.clone();
        if !params.fmt.packetized {
            match params.loader.load(&params.fmt, true) {
                Some(module) => {
                    let mut out = module.output_format();
                    out.packetized = true;
                    codec_fmt = out;
                    packetizer = Some(module);
                }
                None => {
                    log::debug!("no packetiser module for `{}`", params.fmt.codec);
                }
            }
        }

        let codec = params.loader.load(&codec_fmt, false).ok_or_else(|| {
            log::error!("codec `{}` is not supported", codec_fmt.codec);
            EngineError::CodecUnavailable(codec_fmt.codec.to_string())
        })?;

        let cc_supported = category == EsCategory::Video
            && (codec.supports_cc() || packetizer.as_ref().is_some_and(|p| p.supports_cc()));

        let inner = Arc::new(DecoderInner::new(
            codec_fmt.clone(),
            params.clock,
            params.pool,
            params.loader,
            params.stats,
            params.config,
            cc_supported,
        ));

        let worker = Worker {
            inner: Arc::clone(&inner),
            codec: Some(codec),
            packetizer,
            fmt_in: codec_fmt.clone(),
            category,
            preroll_end: TICK_INVALID,
            last_rate: RATE_DEFAULT,
        };

        let name = match category {
            EsCategory::Audio => "kanade-adec",
            EsCategory::Video => "kanade-vdec",
            EsCategory::Subtitle => "kanade-sdec",
        };
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker.run())
            .map_err(|e| EngineError::InvalidState(format!("cannot spawn decoder worker: {e}")))?;

        Ok(Self {
            inner,
            thread: Some(thread),
            category,
            codec_id: codec_fmt.codec,
        })
    }

    /// Queue a block for decoding. With `paced` set the call applies the
    /// FIFO back-pressure policy; pacing is suspended while the output
    /// gate is closed, since the worker is not draining the FIFO then.
    pub fn enqueue(&self, block: Block, paced: bool) {
        let waiting = self.inner.owner.lock().unwrap().waiting;
        self.inner.fifo.push(block, paced && !waiting);
    }

    /// Discard everything queued and in flight. Blocks until the worker
    /// acknowledged the flush; calling it twice back-to-back is the same
    /// as calling it once.
    pub fn flush(&self) {
        let guard = self.inner.owner.lock().unwrap();
        drop(self.flush_locked(guard));
    }

    fn flush_locked<'a>(
        &self,
        mut guard: std::sync::MutexGuard<'a, owner::OwnerState>,
    ) -> std::sync::MutexGuard<'a, owner::OwnerState> {
        drop(self.inner.fifo.clear());

        guard.flushing = true;
        self.inner.request.notify_all();

        self.inner.fifo.push(Block::flush_sentinel(), false);

        while guard.flushing {
            guard = self.inner.acknowledge.wait(guard).unwrap();
        }
        guard
    }

    /// Request a drain: once the FIFO empties the worker performs one nil
    /// decode and drains the sink. Does not wait.
    pub fn drain(&self) {
        self.inner.fifo.set_draining();
    }

    /// True once nothing remains queued, in the codec or in the sink.
    pub fn is_empty(&self) -> bool {
        if !self.inner.fifo.is_empty() {
            return false;
        }
        let state = self.inner.owner.lock().unwrap();
        debug_assert!(!state.waiting);
        match self.category {
            EsCategory::Video => state.vout.as_ref().is_none_or(|v| v.is_empty()),
            EsCategory::Audio => state.drained,
            EsCategory::Subtitle => true,
        }
    }

    /// Pause or resume the stream, propagating to the rented sinks.
    pub fn change_pause(&self, paused: bool, date: Tick) {
        let mut state = self.inner.owner.lock().unwrap();
        if state.paused == paused {
            return;
        }
        state.paused = paused;
        state.pause_date = date;
        state.pause_ignore = 0;
        self.inner.request.notify_all();

        // Only audio and video sinks pause; subtitles follow the video
        // output.
        match self.category {
            EsCategory::Audio => {
                if let Some(aout) = state.aout.clone() {
                    aout.change_pause(paused, date);
                }
            }
            EsCategory::Video => {
                if let Some(vout) = state.vout.clone() {
                    vout.change_pause(paused, date);
                }
            }
            EsCategory::Subtitle => {}
        }
    }

    /// Set the extra delay added to every timestamp. Takes effect on the
    /// next conversion.
    pub fn set_delay(&self, delay: Tick) {
        self.inner.owner.lock().unwrap().ts_delay = delay;
    }

    /// Open the first-data gate: output is held until the first decoded
    /// unit after this call is ready, so playback resumes aligned with
    /// the clock.
    pub fn start_wait(&self) {
        let mut state = self.inner.owner.lock().unwrap();
        debug_assert!(!state.waiting);
        state.first = true;
        state.has_data = false;
        state.waiting = true;
        self.inner.request.notify_all();
    }

    /// Close the first-data gate and let output flow.
    pub fn stop_wait(&self) {
        let mut state = self.inner.owner.lock().unwrap();
        debug_assert!(state.waiting);
        state.waiting = false;
        self.inner.request.notify_all();
    }

    /// Block until the worker holds a decoded unit, or until the FIFO is
    /// empty with the worker idle (there is nothing to wait for then).
    pub fn wait_until_data(&self) {
        let mut state = self.inner.owner.lock().unwrap();
        debug_assert!(state.waiting);
        while !state.has_data {
            if self.inner.fifo.is_idle_and_empty() {
                log::warn!("can't wait without data to decode");
                break;
            }
            // The idle flag lives under the FIFO lock, so the worker can go
            // idle between its acknowledge and our check; a timed wait
            // covers that window.
            state = self
                .inner
                .acknowledge
                .wait_timeout(state, std::time::Duration::from_millis(20))
                .unwrap()
                .0;
        }
    }

    /// While paused, advance video by one picture; every call admits one
    /// more frame through the pause gate, so queued steps accumulate.
    /// Returns the stepped picture's duration. Other categories flush.
    pub fn frame_next(&self) -> Tick {
        let mut state = self.inner.owner.lock().unwrap();
        let mut duration = 0;
        if self.category == EsCategory::Video {
            if state.paused && let Some(vout) = state.vout.clone() {
                if let Some(stepped) = vout.next_picture() {
                    duration = stepped;
                }
                state.pause_ignore += 1;
                self.inner.request.notify_all();
            }
        } else {
            state.waiting = false;
            state = self.flush_locked(state);
        }
        drop(state);
        duration
    }

    /// Consume the format-change latch: the negotiated output format and
    /// its description, if they changed since the last call.
    pub fn format_changed(&self) -> Option<(EsFormat, BTreeMap<String, String>)> {
        let mut state = self.inner.owner.lock().unwrap();
        if !state.fmt_changed {
            return None;
        }
        state.fmt_changed = false;
        Some((state.fmt.clone(), state.description.clone()))
    }

    /// Queued payload bytes in the FIFO.
    pub fn fifo_size(&self) -> usize {
        self.inner.fifo.byte_size()
    }

    /// True when the stream entered the errored state; it still accepts
    /// flush, drain and delete.
    pub fn has_failed(&self) -> bool {
        self.inner.is_errored()
    }

    /// Closed-caption channels seen in the stream so far.
    pub fn cc_present(&self) -> [bool; 4] {
        self.inner.owner.lock().unwrap().cc_present
    }

    /// Enable or disable decoding of closed-caption `channel`, creating or
    /// destroying the per-channel sub-decoder.
    pub fn set_cc_state(&self, channel: usize, enable: bool) -> Result<(), EngineError> {
        if channel >= 4 || !self.inner.owner.lock().unwrap().cc_present[channel] {
            return Err(EngineError::InvalidState(format!(
                "no closed-caption channel {channel}"
            )));
        }

        if enable {
            if self.inner.owner.lock().unwrap().cc_decoders[channel].is_some() {
                return Ok(());
            }
            let sub = Decoder::new(DecoderParams {
                fmt: EsFormat::new(EsCategory::Subtitle, codec::CC[channel]),
                clock: self.inner.clock.clone(),
                pool: Arc::clone(&self.inner.pool),
                loader: Arc::clone(&self.inner.loader),
                stats: self.inner.stats.clone(),
                config: self.inner.config.clone(),
            })?;
            self.inner.owner.lock().unwrap().cc_decoders[channel] = Some(sub);
        } else {
            let sub = self.inner.owner.lock().unwrap().cc_decoders[channel].take();
            // Dropped outside the owner lock: deleting it joins a thread.
            drop(sub);
        }
        Ok(())
    }

    /// Whether closed-caption `channel` currently decodes.
    pub fn cc_state(&self, channel: usize) -> Result<bool, EngineError> {
        let state = self.inner.owner.lock().unwrap();
        if channel >= 4 || !state.cc_present[channel] {
            return Err(EngineError::InvalidState(format!(
                "no closed-caption channel {channel}"
            )));
        }
        Ok(state.cc_decoders[channel].is_some())
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        log::debug!(
            "stopping decoder `{}` ({} blocks in FIFO)",
            self.codec_id,
            self.inner.fifo.count()
        );

        // Cancel the worker: its only cancellation point is the FIFO wait,
        // and the forced flags unblock any inner wait on the way there.
        self.inner.fifo.cancel();
        {
            let mut state = self.inner.owner.lock().unwrap();
            state.paused = false;
            state.waiting = false;
            state.flushing = true;
            self.inner.request.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        // Tear down the closed-caption sub-decoders.
        let subs: Vec<Decoder> = {
            let mut state = self.inner.owner.lock().unwrap();
            state.cc_decoders.iter_mut().filter_map(Option::take).collect()
        };
        drop(subs);

        // Return the rented sinks.
        let (aout, vout, spu_vout, spu_channel) = {
            let mut state = self.inner.owner.lock().unwrap();
            (
                state.aout.take(),
                state.vout.take(),
                state.spu_vout.take(),
                state.spu_channel,
            )
        };
        if let Some(aout) = aout {
            aout.flush(false);
            self.inner.pool.put_audio(aout);
        }
        if let Some(vout) = vout {
            // Free every picture the decoder still holds and clear any
            // pause before the output changes hands.
            vout.reset();
            self.inner.pool.request_video(Some(vout), None, 0, true);
        }
        if self.category == EsCategory::Subtitle
            && let Some(spu_vout) = spu_vout
            && let Some(held) = self.inner.pool.hold_video()
            && Arc::ptr_eq(&held, &spu_vout)
        {
            spu_vout.flush_subpicture_channel(spu_channel);
        }
    }
}
