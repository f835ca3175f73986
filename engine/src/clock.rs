//! Engine time base and the master-clock conversion seam.
//!
//! The engine runs on a monotonic microsecond clock ([`now`]) shared by all
//! workers. Stream timestamps are translated to this clock by a
//! [`MasterClock`] oracle owned by the embedder; the decoder workers never
//! do the conversion themselves.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use common::{RATE_DEFAULT, Rate, TICK_INVALID, Tick, tick_is_valid};

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Current engine time in microseconds. Always a valid [`Tick`].
pub fn now() -> Tick {
    // The +1 keeps the very first reading distinct from TICK_INVALID.
    epoch().elapsed().as_micros() as Tick + 1
}

/// Sleep until the absolute engine-clock `deadline`. Returns immediately if
/// the deadline has already passed.
pub fn wait_until(deadline: Tick) {
    let current = now();
    if deadline > current {
        thread::sleep(Duration::from_micros((deadline - current) as u64));
    }
}

/// Converts stream timestamps to engine-clock display instants at the
/// current playback rate.
///
/// `convert` rewrites the given timestamps in place and returns the rate
/// that was applied, or `None` when the conversion is rejected, typically
/// because the resulting instant would land more than `bound` microseconds
/// past [`now`].
pub trait MasterClock: Send + Sync {
    fn convert(&self, ts0: &mut Tick, ts1: Option<&mut Tick>, bound: Tick) -> Option<Rate>;

    fn rate(&self) -> Rate;
}

/// A direct master clock: stream time maps to engine time shifted by a
/// fixed offset. The default zero offset is the identity mapping used by
/// tests and by embedders whose demuxer stamps blocks on the engine clock.
#[derive(Debug, Default)]
pub struct OffsetClock {
    offset: AtomicI64,
    rate: AtomicI32,
}

impl OffsetClock {
    pub fn new(offset: Tick) -> Self {
        Self {
            offset: AtomicI64::new(offset),
            rate: AtomicI32::new(RATE_DEFAULT),
        }
    }

    pub fn set_offset(&self, offset: Tick) {
        self.offset.store(offset, Ordering::Release);
    }

    pub fn set_rate(&self, rate: Rate) {
        self.rate.store(rate, Ordering::Release);
    }
}

impl MasterClock for OffsetClock {
    fn convert(&self, ts0: &mut Tick, ts1: Option<&mut Tick>, bound: Tick) -> Option<Rate> {
        let offset = self.offset.load(Ordering::Acquire);

        let shifted = *ts0 + offset;
        if bound != Tick::MAX && shifted > now().saturating_add(bound) {
            *ts0 = TICK_INVALID;
            return None;
        }
        *ts0 = shifted;
        if let Some(ts1) = ts1
            && tick_is_valid(*ts1)
        {
            *ts1 += offset;
        }
        Some(self.rate.load(Ordering::Acquire))
    }

    fn rate(&self) -> Rate {
        self.rate.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_valid_and_monotonic() {
        let a = now();
        let b = now();
        assert!(tick_is_valid(a));
        assert!(b >= a);
    }

    #[test]
    fn test_wait_until_past_deadline_returns() {
        // Must not sleep for a deadline already behind us.
        let start = Instant::now();
        wait_until(now() - 1_000_000);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_offset_clock_identity() {
        let clock = OffsetClock::default();
        let mut ts = 5_000;
        let rate = clock.convert(&mut ts, None, Tick::MAX);
        assert_eq!(rate, Some(RATE_DEFAULT));
        assert_eq!(ts, 5_000);
    }

    #[test]
    fn test_offset_clock_shifts_both_stamps() {
        let clock = OffsetClock::new(100);
        let mut ts0 = 1_000;
        let mut ts1 = 2_000;
        clock.convert(&mut ts0, Some(&mut ts1), Tick::MAX).unwrap();
        assert_eq!(ts0, 1_100);
        assert_eq!(ts1, 2_100);
    }

    #[test]
    fn test_offset_clock_rejects_beyond_bound() {
        let clock = OffsetClock::default();
        let mut ts = now() + 10 * common::CLOCK_FREQ;
        assert!(clock.convert(&mut ts, None, common::CLOCK_FREQ).is_none());
        assert_eq!(ts, TICK_INVALID);
    }

    #[test]
    fn test_offset_clock_rate() {
        let clock = OffsetClock::default();
        clock.set_rate(2 * RATE_DEFAULT);
        assert_eq!(clock.rate(), 2 * RATE_DEFAULT);
        let mut ts = 1_000;
        assert_eq!(
            clock.convert(&mut ts, None, Tick::MAX),
            Some(2 * RATE_DEFAULT)
        );
    }
}
