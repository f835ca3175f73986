//! The decoder worker loop.
//!
//! One cooperative task per elementary stream: dequeue a block (or nil for
//! drain), run it through the optional packetiser and the codec, pace each
//! decoded unit against the master clock and hand it to the output sink.
//! The only cancellation point is the FIFO wait.

use std::sync::Arc;

use common::{
    AOUT_MAX_RATE_RATIO, Block, EsCategory, EsFormat, RATE_DEFAULT, Rate, TICK_INVALID, Tick,
    tick_is_valid,
};

use super::owner::DecoderInner;
use super::{
    AOUT_MAX_ADVANCE_TIME, AOUT_MAX_PREPARE_TIME, DECODER_BOGUS_VIDEO_DELAY, SPU_MAX_PREPARE_TIME,
};
use crate::codec::Codec;
use crate::fifo::FifoPop;
use crate::stats::CounterDeltas;
use crate::vout::heap::PictureRef;
use crate::vout::spu::SubpictureRef;

pub(crate) struct Worker {
    pub inner: Arc<DecoderInner>,
    pub codec: Option<Box<dyn Codec>>,
    pub packetizer: Option<Box<dyn Codec>>,
    /// The codec's current input contract.
    pub fmt_in: EsFormat,
    pub category: EsCategory,
    /// Timestamp below which decoded output is discarded; armed to
    /// `Tick::MAX` by preroll or discontinuity blocks.
    pub preroll_end: Tick,
    pub last_rate: Rate,
}

impl Worker {
    /// The decoding main loop.
    pub(crate) fn run(mut self) {
        log::debug!("decoder worker running");
        loop {
            {
                let _state = self.inner.owner.lock().unwrap();
                self.inner.acknowledge.notify_all();
            }

            match self.inner.fifo.pop_blocking() {
                FifoPop::Cancelled => break,
                FifoPop::Drain => {
                    // The codec is drained and its output queued; now drain
                    // the audio sink too.
                    self.process(None);
                    let mut state = self.inner.owner.lock().unwrap();
                    if let Some(aout) = state.aout.clone() {
                        aout.flush(true);
                    }
                    state.drained = true;
                }
                FifoPop::Block(block) => {
                    self.process(Some(block));
                    self.inner.owner.lock().unwrap().drained = false;
                }
            }
        }
        log::debug!("decoder worker exiting");
    }

    fn process(&mut self, block: Option<Block>) {
        let flush_request = block.as_ref().is_some_and(|b| b.flags.core_flush);

        if self.inner.is_errored() {
            // Errored stream: release everything, but still acknowledge
            // flush sentinels.
            drop(block);
        } else if block.as_ref().is_some_and(|b| b.is_empty()) && !flush_request {
            drop(block);
        } else {
            let mut block = block;
            let mut flush = false;
            if let Some(b) = block.as_mut() {
                let preroll_armed = self.preroll_end == Tick::MAX;
                self.update_preroll(b);
                // The sentinel arms the preroll itself; flushing the sink
                // twice for it would be redundant.
                flush = !preroll_armed && flush_request;
                b.flags.clear_core_private();
            }

            match self.category {
                EsCategory::Audio => self.process_audio(block, flush),
                EsCategory::Video => self.process_video(block, flush),
                EsCategory::Subtitle => self.process_spu(block, flush),
            }
        }

        if flush_request {
            let mut state = self.inner.owner.lock().unwrap();
            if state.flushing {
                state.flushing = false;
                self.inner.acknowledge.notify_all();
            }
        }
    }

    fn update_preroll(&mut self, block: &Block) {
        if block.flags.preroll || block.flags.discontinuity {
            self.preroll_end = Tick::MAX;
        } else if block.has_dts() {
            self.preroll_end = self.preroll_end.min(block.dts);
        } else if block.has_pts() {
            self.preroll_end = self.preroll_end.min(block.pts);
        }
    }

    fn reload_codec(&mut self, fmt: &EsFormat) -> bool {
        self.codec = None;
        match self.inner.loader.load(fmt, false) {
            Some(codec) => {
                self.codec = Some(codec);
                self.fmt_in = fmt.clone();
                *self.inner.input.lock().unwrap() = fmt.clone();
                true
            }
            None => {
                log::error!("codec `{}` is not supported", fmt.codec);
                self.inner.set_errored();
                false
            }
        }
    }

    fn push_stats(&self, deltas: CounterDeltas) {
        if let Some(stats) = &self.inner.stats
            && !deltas.is_empty()
        {
            stats.add(&deltas);
        }
    }

    // ---- Audio -----------------------------------------------------------

    fn process_audio(&mut self, mut block: Option<Block>, flush: bool) {
        if self.packetizer.is_some() {
            let mut packetizer = self.packetizer.take().unwrap();
            loop {
                let Some(chain) = packetizer.packetize(&mut block) else {
                    break;
                };
                let packetized_fmt = packetizer.output_format();
                if !self.fmt_in.is_similar(&packetized_fmt) {
                    log::debug!("restarting codec due to input format change");
                    self.decode_audio_units(None);
                    if !self.reload_codec(&packetized_fmt) {
                        self.packetizer = Some(packetizer);
                        return;
                    }
                }
                for packet in chain {
                    self.decode_audio_units(Some(packet));
                }
            }
            self.packetizer = Some(packetizer);
            // The packetiser emits no unit telling the codec to flush; do
            // it ourselves.
            if flush {
                self.decode_audio_units(Some(Block::flush_sentinel()));
            }
        } else {
            self.decode_audio_units(block);
        }

        if flush {
            let aout = self.inner.owner.lock().unwrap().aout.clone();
            if let Some(aout) = aout {
                aout.flush(false);
            }
        }
    }

    fn decode_audio_units(&mut self, mut block: Option<Block>) {
        let mut deltas = CounterDeltas::default();
        let Some(mut codec) = self.codec.take() else {
            self.push_stats(deltas);
            return;
        };

        while let Some(frame) = codec.decode_audio(&*self.inner, &mut block) {
            if self.inner.is_flushing() {
                // A broken codec must not wedge the flush.
                break;
            }
            deltas.audio_decoded += 1;

            if tick_is_valid(self.preroll_end) && frame.pts < self.preroll_end {
                continue;
            }
            if tick_is_valid(self.preroll_end) {
                log::debug!("end of audio preroll");
                let aout = self.inner.owner.lock().unwrap().aout.clone();
                if let Some(aout) = aout {
                    aout.flush(false);
                }
                self.preroll_end = TICK_INVALID;
            }

            self.play_audio(frame, &mut deltas);
        }

        self.codec = Some(codec);
        self.push_stats(deltas);
    }

    fn play_audio(&mut self, mut frame: Block, deltas: &mut CounterDeltas) {
        if !frame.has_pts() {
            log::warn!("non-dated audio buffer received");
            deltas.audio_lost += 1;
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut guard = inner.owner.lock().unwrap();
        if guard.waiting {
            guard.has_data = true;
            inner.acknowledge.notify_all();
        }

        let (g, flushing) = inner.wait_unblock(guard);
        guard = g;
        let mut reject = flushing;

        let rate = inner.fix_ts(
            &guard,
            &mut frame.pts,
            None,
            Some(&mut frame.duration),
            AOUT_MAX_ADVANCE_TIME,
        );
        if !frame.has_pts()
            || rate < RATE_DEFAULT / AOUT_MAX_RATE_RATIO
            || rate > RATE_DEFAULT * AOUT_MAX_RATE_RATIO
        {
            reject = true;
        }

        loop {
            let paused = guard.paused;
            guard = inner.wait_date(guard, &mut reject, frame.pts - AOUT_MAX_PREPARE_TIME);
            if guard.paused == paused {
                break;
            }
            // Raced with a pause flip during the wait; block again.
            let (g, flushing) = inner.wait_unblock(guard);
            guard = g;
            if flushing {
                reject = true;
            }
        }

        let aout = guard.aout.clone();
        match aout {
            Some(aout) if !reject => {
                if aout.play(frame, rate).is_ok() {
                    deltas.audio_played += 1;
                }
                deltas.audio_lost += aout.reset_lost();
            }
            _ => {
                log::debug!("discarded audio buffer");
                deltas.audio_lost += 1;
            }
        }
        drop(guard);
    }

    // ---- Video -----------------------------------------------------------

    fn process_video(&mut self, mut block: Option<Block>, flush: bool) {
        if self.packetizer.is_some() {
            let mut packetizer = self.packetizer.take().unwrap();
            let packetizer_cc = packetizer.supports_cc();
            loop {
                let Some(chain) = packetizer.packetize(&mut block) else {
                    break;
                };
                let packetized_fmt = packetizer.output_format();
                if !self.fmt_in.is_similar(&packetized_fmt) {
                    log::debug!("restarting codec due to input format change");
                    self.decode_video_units(None, packetizer_cc);
                    if !self.reload_codec(&packetized_fmt) {
                        self.packetizer = Some(packetizer);
                        return;
                    }
                }
                if packetizer_cc {
                    self.harvest_cc(&mut *packetizer);
                }
                for packet in chain {
                    self.decode_video_units(Some(packet), packetizer_cc);
                }
            }
            self.packetizer = Some(packetizer);
            if flush {
                self.decode_video_units(Some(Block::flush_sentinel()), packetizer_cc);
            }
        } else {
            self.decode_video_units(block, false);
        }

        if flush {
            let vout = self.inner.owner.lock().unwrap().vout.clone();
            if let Some(vout) = vout {
                vout.flush(TICK_INVALID + 1);
            }
        }
    }

    fn decode_video_units(&mut self, mut block: Option<Block>, packetizer_has_cc: bool) {
        let mut deltas = CounterDeltas::default();
        let Some(mut codec) = self.codec.take() else {
            self.push_stats(deltas);
            return;
        };

        while let Some(pic) = codec.decode_video(&*self.inner, &mut block) {
            if self.inner.is_flushing() {
                break;
            }
            deltas.video_decoded += 1;

            if tick_is_valid(self.preroll_end) && pic.date < self.preroll_end {
                continue;
            }
            if tick_is_valid(self.preroll_end) {
                log::debug!("end of video preroll");
                let vout = self.inner.owner.lock().unwrap().vout.clone();
                if let Some(vout) = vout {
                    vout.flush(TICK_INVALID + 1);
                }
                self.preroll_end = TICK_INVALID;
            }

            if codec.supports_cc() && !packetizer_has_cc {
                self.harvest_cc(&mut *codec);
            }

            self.play_video(pic, &mut deltas);
        }

        self.codec = Some(codec);
        self.push_stats(deltas);
    }

    fn play_video(&mut self, mut pic: PictureRef, deltas: &mut CounterDeltas) {
        if !tick_is_valid(pic.date) && !pic.force {
            log::warn!("non-dated video buffer received");
            deltas.video_lost += 1;
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut guard = inner.owner.lock().unwrap();
        if guard.waiting && !guard.first {
            guard.has_data = true;
            inner.acknowledge.notify_all();
        }
        let first_after_wait = guard.waiting && guard.has_data;

        let (g, flushing) = inner.wait_unblock(guard);
        guard = g;
        let mut reject = flushing;

        if !reject && guard.waiting {
            debug_assert!(guard.first);
            log::debug!("received first picture");
            guard.first = false;
            pic.force = true;
        }

        let dated = tick_is_valid(pic.date);
        let rate = inner.fix_ts(&guard, &mut pic.date, None, None, DECODER_BOGUS_VIDEO_DELAY);
        let vout = guard.vout.clone();
        drop(guard);

        if !pic.force && !tick_is_valid(pic.date) {
            reject = true;
        }

        let Some(vout) = vout else {
            log::warn!("no video output, dropping picture");
            deltas.video_lost += 1;
            return;
        };

        if !reject {
            if rate != self.last_rate || first_after_wait {
                // Do not leave pictures from the old timeline queued past
                // our own.
                vout.flush(pic.date);
                self.last_rate = rate;
            }
            vout.put_picture(pic);
        } else {
            if dated {
                log::warn!("early picture skipped");
            } else {
                log::warn!("non-dated video buffer received");
            }
            deltas.video_lost += 1;
        }

        let (displayed, lost) = vout.take_frame_counters();
        deltas.video_displayed += displayed;
        deltas.video_lost += lost;
    }

    /// Harvest one closed-caption payload from `source` and fan it out to
    /// the per-channel sub-decoders.
    fn harvest_cc(&self, source: &mut dyn Codec) {
        if !self.inner.cc_supported {
            return;
        }
        let mut present = [false; 4];
        let Some(payload) = source.get_cc(&mut present) else {
            return;
        };

        let targets = {
            let mut state = self.inner.owner.lock().unwrap();
            for (i, seen) in present.iter().enumerate() {
                state.cc_present[i] |= *seen;
            }
            state
                .cc_decoders
                .iter()
                .flatten()
                .map(|dec| Arc::clone(&dec.inner))
                .collect::<Vec<_>>()
        };

        if targets.is_empty() {
            return;
        }
        // Duplicate for all channels but the last, which takes the
        // original.
        let last = targets.len() - 1;
        let mut payload = Some(payload);
        for (i, target) in targets.iter().enumerate() {
            let block = if i == last {
                payload.take().unwrap()
            } else {
                payload.as_ref().unwrap().clone()
            };
            target.fifo.push(block, false);
        }
    }

    // ---- Subtitles -------------------------------------------------------

    fn process_spu(&mut self, mut block: Option<Block>, flush: bool) {
        let mut deltas = CounterDeltas::default();

        if let Some(mut codec) = self.codec.take() {
            while let Some(spu) = codec.decode_sub(&*self.inner, &mut block) {
                if self.inner.is_flushing() {
                    break;
                }
                deltas.sub_decoded += 1;

                let held = self.inner.pool.hold_video();
                let live = {
                    let state = self.inner.owner.lock().unwrap();
                    match (&held, &state.spu_vout) {
                        (Some(held), Some(live)) => Arc::ptr_eq(held, live),
                        _ => false,
                    }
                };
                if !live {
                    drop(spu);
                    continue;
                }

                // Preroll works poorly for subtitles: only skip units whose
                // whole window lies before the boundary.
                let skip = tick_is_valid(self.preroll_end)
                    && tick_is_valid(spu.start)
                    && spu.start < self.preroll_end
                    && (!tick_is_valid(spu.stop) || spu.stop < self.preroll_end);
                if skip {
                    drop(spu);
                } else {
                    self.play_spu(spu);
                }
            }
            self.codec = Some(codec);
        }

        if flush {
            let (vout, channel) = {
                let state = self.inner.owner.lock().unwrap();
                (state.spu_vout.clone(), state.spu_channel)
            };
            if let Some(vout) = vout {
                let held = self.inner.pool.hold_video();
                if held.is_some_and(|held| Arc::ptr_eq(&held, &vout)) {
                    vout.flush_subpicture_channel(channel);
                }
            }
        }

        self.push_stats(deltas);
    }

    fn play_spu(&mut self, mut spu: SubpictureRef) {
        if !tick_is_valid(spu.start) {
            log::warn!("non-dated subtitle received");
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut guard = inner.owner.lock().unwrap();
        if guard.waiting {
            guard.has_data = true;
            inner.acknowledge.notify_all();
        }

        let (g, flushing) = inner.wait_unblock(guard);
        guard = g;
        let mut reject = flushing;

        let mut start = spu.start;
        let mut stop = spu.stop;
        inner.fix_ts(&guard, &mut start, Some(&mut stop), None, Tick::MAX);
        spu.start = start;
        spu.stop = stop;
        if !tick_is_valid(spu.start) {
            reject = true;
        }

        guard = inner.wait_date(guard, &mut reject, spu.start - SPU_MAX_PREPARE_TIME);
        let vout = guard.spu_vout.clone();
        drop(guard);

        match vout {
            Some(vout) if !reject => vout.put_subpicture(spu),
            _ => drop(spu),
        }
    }
}
