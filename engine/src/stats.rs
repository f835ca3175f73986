//! Playback statistics tracking.
//!
//! Decoder workers accumulate per-batch counter deltas and push them to a
//! [`StatsSink`]; the provided [`Counters`] implementation totals them
//! under its own lock and logs a summary line at a configurable interval.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One batch of counter increments surfaced by a decoder worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDeltas {
    pub audio_decoded: u64,
    pub audio_played: u64,
    pub audio_lost: u64,
    pub video_decoded: u64,
    pub video_displayed: u64,
    pub video_lost: u64,
    pub sub_decoded: u64,
}

impl CounterDeltas {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Accepts counter deltas. Implementations serialise internally; callers
/// never hold engine locks across `add`.
pub trait StatsSink: Send + Sync {
    fn add(&self, deltas: &CounterDeltas);
}

/// Running totals with periodic logging.
pub struct Counters {
    inner: Mutex<Inner>,
    log_interval: Duration,
}

struct Inner {
    totals: CounterDeltas,
    last_log: Instant,
}

impl Counters {
    pub fn new(log_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                totals: CounterDeltas::default(),
                last_log: Instant::now(),
            }),
            log_interval,
        }
    }

    /// Snapshot of the running totals.
    pub fn totals(&self) -> CounterDeltas {
        self.inner.lock().unwrap().totals
    }

    /// Reset all totals to zero.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.totals = CounterDeltas::default();
        inner.last_log = Instant::now();
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

impl StatsSink for Counters {
    fn add(&self, deltas: &CounterDeltas) {
        if deltas.is_empty() {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        let t = &mut inner.totals;
        t.audio_decoded += deltas.audio_decoded;
        t.audio_played += deltas.audio_played;
        t.audio_lost += deltas.audio_lost;
        t.video_decoded += deltas.video_decoded;
        t.video_displayed += deltas.video_displayed;
        t.video_lost += deltas.video_lost;
        t.sub_decoded += deltas.sub_decoded;

        if inner.last_log.elapsed() >= self.log_interval {
            let t = inner.totals;
            log::info!(
                "playback stats: audio {}/{} played ({} lost), video {}/{} displayed ({} lost), {} subtitles",
                t.audio_played,
                t.audio_decoded,
                t.audio_lost,
                t.video_displayed,
                t.video_decoded,
                t.video_lost,
                t.sub_decoded
            );
            inner.last_log = Instant::now();
        }
    }
}
