//! Decoder owner state and the capabilities exposed to codecs.
//!
//! The owner record backs one elementary stream: its FIFO, rented sinks,
//! format snapshot and the flag set coordinating the worker with the
//! controller façade. One mutex guards all of it, with the *request* and
//! *acknowledge* condition variables layered on top: two condvars on one
//! mutex, because the waits must observe several flags atomically with the
//! signal.
//!
//! Lock order: owner lock before FIFO lock, never the reverse. The heap
//! locks are leaves.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use common::{
    Block, CodecId, EngineError, EsFormat, PixelFormat, RATE_DEFAULT, Rate, Rect, TICK_INVALID,
    Tick, codec, tick_is_valid,
};

use super::{DECODER_SPU_VOUT_WAIT_DURATION, SPU_VOUT_WAIT_ATTEMPTS};
use crate::clock::{self, MasterClock};
use crate::codec::{CodecLoader, DecoderHost};
use crate::config::{DolbyOverride, EngineConfig};
use crate::decoder::Decoder;
use crate::fifo::BlockFifo;
use crate::sink::{AudioSink, ResourcePool, VideoSink};
use crate::stats::StatsSink;
use crate::vout::VOUT_OUTMEM_SLEEP;
use crate::vout::heap::PictureRef;
use crate::vout::spu::SubpictureRef;

/// Everything behind the owner lock.
pub(crate) struct OwnerState {
    /// Negotiated output format snapshot.
    pub fmt: EsFormat,
    /// Consumable format-change latch.
    pub fmt_changed: bool,
    /// Free-form description captured with the last format change.
    pub description: BTreeMap<String, String>,

    pub aout: Option<Arc<dyn AudioSink>>,
    pub vout: Option<Arc<dyn VideoSink>>,
    pub spu_vout: Option<Arc<dyn VideoSink>>,
    pub spu_channel: u32,

    pub paused: bool,
    pub pause_date: Tick,
    /// Frames allowed through while paused; one per frame-step request.
    pub pause_ignore: u32,

    pub waiting: bool,
    pub first: bool,
    pub has_data: bool,

    pub flushing: bool,
    pub drained: bool,

    /// Extra microseconds added to every timestamp before conversion.
    pub ts_delay: Tick,

    pub cc_present: [bool; 4],
    pub cc_decoders: [Option<Decoder>; 4],
}

impl OwnerState {
    fn new() -> Self {
        Self {
            fmt: EsFormat::default(),
            fmt_changed: false,
            description: BTreeMap::new(),
            aout: None,
            vout: None,
            spu_vout: None,
            spu_channel: 0,
            paused: false,
            pause_date: TICK_INVALID,
            pause_ignore: 0,
            waiting: false,
            first: true,
            has_data: false,
            flushing: false,
            drained: false,
            ts_delay: 0,
            cc_present: [false; 4],
            cc_decoders: [None, None, None, None],
        }
    }
}

/// The shared core of one decoder: FIFO, owner state, collaborators.
pub(crate) struct DecoderInner {
    pub fifo: BlockFifo,
    pub owner: Mutex<OwnerState>,
    /// Wakes the worker out of its pause/wait/date waits.
    pub request: Condvar,
    /// Signals controller-visible progress: first data, flush done, idle.
    pub acknowledge: Condvar,

    /// Current input contract from the demuxer side.
    pub input: Mutex<EsFormat>,

    pub clock: Option<Arc<dyn MasterClock>>,
    pub pool: Arc<dyn ResourcePool>,
    pub loader: Arc<dyn CodecLoader>,
    pub stats: Option<Arc<dyn StatsSink>>,
    pub config: EngineConfig,

    /// The stream entered the errored state; its decode path becomes a
    /// pure sink that still honours flush and delete.
    pub errored: AtomicBool,
    pub cc_supported: bool,
}

impl DecoderInner {
    pub(crate) fn new(
        input: EsFormat,
        clock: Option<Arc<dyn MasterClock>>,
        pool: Arc<dyn ResourcePool>,
        loader: Arc<dyn CodecLoader>,
        stats: Option<Arc<dyn StatsSink>>,
        config: EngineConfig,
        cc_supported: bool,
    ) -> Self {
        Self {
            fifo: BlockFifo::new(),
            owner: Mutex::new(OwnerState::new()),
            request: Condvar::new(),
            acknowledge: Condvar::new(),
            input: Mutex::new(input),
            clock,
            pool,
            loader,
            stats,
            config,
            errored: AtomicBool::new(false),
            cc_supported,
        }
    }

    pub(crate) fn is_flushing(&self) -> bool {
        self.owner.lock().unwrap().flushing
    }

    pub(crate) fn is_errored(&self) -> bool {
        self.errored.load(Ordering::Acquire)
    }

    pub(crate) fn set_errored(&self) {
        self.errored.store(true, Ordering::Release);
    }

    /// Block while the owner is paused or gated on the first-data wait.
    /// Returns immediately on flush; while paused, each pause-ignore
    /// credit admits one unit (frame stepping). The returned flag tells
    /// the caller to treat its unit as rejected.
    pub(crate) fn wait_unblock<'a>(
        &self,
        mut guard: MutexGuard<'a, OwnerState>,
    ) -> (MutexGuard<'a, OwnerState>, bool) {
        loop {
            if guard.flushing {
                break;
            }
            if guard.paused {
                if guard.waiting && !guard.has_data {
                    break;
                }
                if guard.pause_ignore > 0 {
                    guard.pause_ignore -= 1;
                    break;
                }
            } else if !guard.waiting || !guard.has_data {
                break;
            }
            guard = self.request.wait(guard).unwrap();
        }
        let flushing = guard.flushing;
        (guard, flushing)
    }

    /// Sleep until `deadline` or a flush. A flush sets `reject`. Does
    /// nothing when `reject` is already set or the deadline is negative.
    pub(crate) fn wait_date<'a>(
        &self,
        mut guard: MutexGuard<'a, OwnerState>,
        reject: &mut bool,
        deadline: Tick,
    ) -> MutexGuard<'a, OwnerState> {
        if *reject || deadline < 0 {
            return guard;
        }
        loop {
            if guard.flushing {
                *reject = true;
                return guard;
            }
            let current = clock::now();
            if current >= deadline {
                return guard;
            }
            let timeout = Duration::from_micros((deadline - current) as u64);
            guard = self.request.wait_timeout(guard, timeout).unwrap().0;
        }
    }

    /// Translate `ts0` (and optionally `ts1`) to display instants: apply
    /// the stream delay, convert through the master clock bounded by
    /// `bound`, and scale `duration` by the returned rate. A pair that was
    /// ephemeral (equal stamps) stays ephemeral; a pair that rounding made
    /// equal is forced one microsecond apart. A failed conversion
    /// invalidates `ts0`.
    pub(crate) fn fix_ts(
        &self,
        state: &OwnerState,
        ts0: &mut Tick,
        mut ts1: Option<&mut Tick>,
        duration: Option<&mut Tick>,
        bound: Tick,
    ) -> Rate {
        let Some(master) = self.clock.as_deref() else {
            return RATE_DEFAULT;
        };

        let delay = state.ts_delay;
        let ephemeral = ts1.as_deref().is_some_and(|ts1| *ts1 == *ts0);

        let rate = if tick_is_valid(*ts0) {
            *ts0 += delay;
            if let Some(ts1) = ts1.as_deref_mut()
                && tick_is_valid(*ts1)
            {
                *ts1 += delay;
            }
            let bound = if bound == Tick::MAX { bound } else { bound + delay };
            match master.convert(ts0, ts1.as_deref_mut(), bound) {
                Some(rate) => rate,
                None => {
                    log::error!("could not convert timestamp {}", *ts0);
                    *ts0 = TICK_INVALID;
                    master.rate()
                }
            }
        } else {
            master.rate()
        };

        // Do not fabricate ephemeral pairs out of rounding errors.
        if !ephemeral
            && tick_is_valid(*ts0)
            && let Some(ts1) = ts1.as_deref_mut()
            && *ts1 == *ts0
        {
            *ts1 += 1;
        }

        if let Some(duration) = duration {
            *duration = (*duration * rate as Tick + RATE_DEFAULT as Tick - 1) / RATE_DEFAULT as Tick;
        }

        rate
    }

    /// Refresh the owner format snapshot and raise the format-change
    /// latch.
    pub(crate) fn update_format_locked(&self, state: &mut OwnerState, fmt_out: &EsFormat) {
        state.fmt = fmt_out.clone();
        state.description = fmt_out.description.clone();
        state.fmt_changed = true;
    }

    /// Renegotiate the audio sink when the codec's output no longer
    /// matches the live one.
    pub(crate) fn update_audio_format(&self, fmt_out: &EsFormat) -> Result<(), EngineError> {
        let returned = {
            let mut state = self.owner.lock().unwrap();
            if state.aout.is_some() {
                if state.fmt.audio.is_identical(&fmt_out.audio) {
                    return Ok(());
                }
                state.aout.take()
            } else {
                None
            }
        };
        if let Some(old) = returned {
            log::debug!("audio format changed, restarting audio sink");
            self.pool.put_audio(old);
        }

        let mut format = fmt_out.audio;
        // The override only concerns plain stereo pairs.
        if format.channels == 2 {
            match self.config.force_dolby_surround {
                DolbyOverride::On => format.dolby_stereo = Some(true),
                DolbyOverride::Off => format.dolby_stereo = Some(false),
                DolbyOverride::Auto => {}
            }
        }
        let mut gain = fmt_out.replay_gain;
        gain.merge_missing(&self.input.lock().unwrap().replay_gain);

        let sink = self.pool.get_audio(&format, &gain);

        let mut state = self.owner.lock().unwrap();
        state.aout = sink.clone();
        self.update_format_locked(&mut state, fmt_out);
        state.fmt.audio = format;
        if state.paused && let Some(aout) = &state.aout {
            // The sink arrives running; align it with the paused owner.
            aout.change_pause(true, clock::now());
        }
        drop(state);

        if sink.is_none() {
            log::error!("failed to create audio output");
            self.set_errored();
            return Err(EngineError::SinkUnavailable("audio".to_string()));
        }
        Ok(())
    }

    /// Renegotiate the video sink when the codec's output geometry,
    /// chroma, pixel aspect or orientation changed.
    pub(crate) fn update_video_format(
        &self,
        fmt_out: &EsFormat,
        extra_buffers: usize,
    ) -> Result<(), EngineError> {
        {
            let state = self.owner.lock().unwrap();
            if state.vout.is_some() && state.fmt.video.is_identical(&fmt_out.video) {
                return Ok(());
            }
        }

        let mut video = fmt_out.video;
        if video.width == 0 || video.height == 0 {
            // Can't negotiate a sink without display dimensions.
            return Err(EngineError::InvalidState(
                "video format without dimensions".to_string(),
            ));
        }

        // Widen coded dimensions to the chroma sampling grid.
        if video.pixel.is_yuv() {
            let (wd, hd) = match video.pixel {
                PixelFormat::Yuv420 => (2, 2),
                PixelFormat::Yuv422 => (2, 1),
                _ => (1, 1),
            };
            video.width = video.width.next_multiple_of(wd);
            video.height = video.height.next_multiple_of(hd);
        }

        if video.visible.width == 0 || video.visible.height == 0 {
            let input_visible = self.input.lock().unwrap().video.visible;
            video.visible = if input_visible.width > 0 && input_visible.height > 0 {
                input_visible
            } else {
                Rect {
                    x: 0,
                    y: 0,
                    width: video.width,
                    height: video.height,
                }
            };
        }

        if self.config.hdtv_fix && video.visible.height == 1088 {
            video.visible.height = 1080;
            if video.sar_num.is_multiple_of(136) {
                video.sar_num *= 135;
                video.sar_den *= 136;
            }
            log::warn!("fixing broken HDTV stream (1088 visible lines)");
        }

        if video.sar_num == 0 || video.sar_den == 0 {
            video.sar_num = 1;
            video.sar_den = 1;
        }
        let divisor = gcd(video.sar_num, video.sar_den);
        video.sar_num /= divisor;
        video.sar_den /= divisor;

        let dpb = decoded_picture_buffer_count(self.input.lock().unwrap().codec);
        let capacity = dpb + extra_buffers + 1;

        let previous = self.owner.lock().unwrap().vout.take();
        let sink = self
            .pool
            .request_video(previous, Some(&video), capacity, true);

        let mut state = self.owner.lock().unwrap();
        state.vout = sink.clone();
        self.update_format_locked(&mut state, fmt_out);
        state.fmt.video = video;
        drop(state);

        if sink.is_none() {
            log::error!("failed to create video output");
            return Err(EngineError::SinkUnavailable("video".to_string()));
        }
        Ok(())
    }
}

/// Reference frames a codec family may hold in flight.
fn decoded_picture_buffer_count(id: CodecId) -> usize {
    match id {
        id if id == codec::H264 || id == codec::HEVC || id == codec::DIRAC => 18,
        id if id == codec::VP5 || id == codec::VP6 || id == codec::VP6F || id == codec::VP8 => 3,
        _ => 2,
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.max(1)
}

impl DecoderHost for DecoderInner {
    fn new_audio_buffer(&self, fmt: &EsFormat, samples: u32) -> Option<Block> {
        if self.update_audio_format(fmt).is_err() {
            return None;
        }
        let audio = fmt.audio;
        let bytes = if audio.bytes_per_frame > 0 && audio.frame_length > 0 {
            samples as usize * audio.bytes_per_frame as usize / audio.frame_length as usize
        } else {
            // No frame layout declared: assume packed 32-bit samples.
            samples as usize * audio.channels.max(1) as usize * 4
        };
        let mut block = Block::new(vec![0u8; bytes]);
        block.samples = samples;
        Some(block)
    }

    fn new_picture(&self, fmt: &EsFormat, extra_buffers: usize) -> Option<PictureRef> {
        if self.update_video_format(fmt, extra_buffers).is_err() {
            return None;
        }
        loop {
            if self.is_flushing() || self.is_errored() {
                return None;
            }
            let (vout, video) = {
                let state = self.owner.lock().unwrap();
                (state.vout.clone()?, state.fmt.video)
            };
            match vout.get_picture(&video) {
                Ok(pic) => return Some(pic),
                Err(_) => {
                    // Heap full: the renderer will free a slot shortly.
                    clock::wait_until(clock::now() + VOUT_OUTMEM_SLEEP);
                }
            }
        }
    }

    fn new_subpicture(&self) -> Option<SubpictureRef> {
        let mut held = None;
        for _ in 0..SPU_VOUT_WAIT_ATTEMPTS {
            if self.is_flushing() || self.is_errored() {
                break;
            }
            if let Some(vout) = self.pool.hold_video() {
                held = Some(vout);
                break;
            }
            clock::wait_until(clock::now() + DECODER_SPU_VOUT_WAIT_DURATION);
        }
        let Some(vout) = held else {
            log::warn!("no video output found, dropping subpicture");
            return None;
        };

        let channel = {
            let mut state = self.owner.lock().unwrap();
            let same = state
                .spu_vout
                .as_ref()
                .is_some_and(|live| Arc::ptr_eq(live, &vout));
            if !same {
                state.spu_channel = vout.register_subpicture_channel();
                state.spu_vout = Some(Arc::clone(&vout));
            }
            state.spu_channel
        };

        vout.get_subpicture(channel).ok()
    }

    fn display_date(&self, ts: Tick) -> Tick {
        let ts = {
            let state = self.owner.lock().unwrap();
            // While waiting or paused there is no meaningful display date.
            if state.waiting || state.paused {
                TICK_INVALID
            } else {
                ts
            }
        };
        let Some(master) = self.clock.as_deref() else {
            return ts;
        };
        if !tick_is_valid(ts) {
            return ts;
        }
        let mut converted = ts;
        match master.convert(&mut converted, None, Tick::MAX) {
            Some(_) => converted,
            None => {
                log::error!("could not get display date for timestamp {ts}");
                TICK_INVALID
            }
        }
    }

    fn display_rate(&self) -> Rate {
        self.clock.as_deref().map_or(RATE_DEFAULT, |c| c.rate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dpb_by_codec_family() {
        assert_eq!(decoded_picture_buffer_count(codec::H264), 18);
        assert_eq!(decoded_picture_buffer_count(codec::HEVC), 18);
        assert_eq!(decoded_picture_buffer_count(codec::DIRAC), 18);
        assert_eq!(decoded_picture_buffer_count(codec::VP6), 3);
        assert_eq!(decoded_picture_buffer_count(codec::VP8), 3);
        assert_eq!(decoded_picture_buffer_count(codec::MPGV), 2);
    }

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(1920, 1080), 120);
        assert_eq!(gcd(0, 5), 5);
        assert_eq!(gcd(0, 0), 1);
    }
}
