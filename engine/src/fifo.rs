//! Bounded FIFO of compressed blocks between the demuxer and one decoder
//! worker.
//!
//! The queue carries plain [`Block`]s plus three pieces of side-band state
//! that must be observed atomically with the queue itself: the *drain*
//! request (emit one nil decode once empty), the worker's *idle* flag
//! (used by `wait_until_data` to avoid deadlocking on an empty stream) and
//! the *cancel* flag (the worker's only cancellation point is its wait
//! here).
//!
//! Back-pressure has two regimes. A paced producer blocks once
//! [`FIFO_PACE_MAX_COUNT`] blocks are queued. An unpaced producer never
//! blocks, but the whole queue is dropped with a warning once its byte size
//! exceeds [`FIFO_UNPACED_MAX_BYTES`].

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use common::Block;

/// A paced producer blocks at this queue depth.
pub const FIFO_PACE_MAX_COUNT: usize = 10;

/// An unpaced producer resets the queue past this byte size.
/// 400 MiB, i.e. ~50 Mb/s for 60 s.
pub const FIFO_UNPACED_MAX_BYTES: usize = 400 * 1024 * 1024;

/// Outcome of a blocking dequeue.
#[derive(Debug)]
pub enum FifoPop {
    /// The next queued block, in enqueue order.
    Block(Block),
    /// The FIFO emptied while a drain was pending; decode a nil block once.
    Drain,
    /// The FIFO was cancelled; the worker must exit.
    Cancelled,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Block>,
    bytes: usize,
    draining: bool,
    idle: bool,
    cancelled: bool,
}

/// Thread-safe block queue. See the module documentation for the
/// back-pressure policy.
#[derive(Default)]
pub struct BlockFifo {
    state: Mutex<State>,
    not_empty: Condvar,
    space: Condvar,
}

impl BlockFifo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block, waking one waiter.
    ///
    /// With `paced` set the call blocks while the queue holds
    /// [`FIFO_PACE_MAX_COUNT`] blocks or more. Unpaced, it never blocks but
    /// resets the queue once it exceeds [`FIFO_UNPACED_MAX_BYTES`]. Blocks
    /// pushed after cancellation are silently dropped.
    pub fn push(&self, block: Block, paced: bool) {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            return;
        }

        if paced {
            while state.queue.len() >= FIFO_PACE_MAX_COUNT && !state.cancelled {
                state = self.space.wait(state).unwrap();
            }
            if state.cancelled {
                return;
            }
        } else if state.bytes > FIFO_UNPACED_MAX_BYTES {
            log::warn!(
                "decoder fifo full ({} bytes not consumed quickly enough), resetting",
                state.bytes
            );
            state.queue.clear();
            state.bytes = 0;
        }

        state.bytes += block.len();
        state.queue.push_back(block);
        self.not_empty.notify_one();
    }

    /// Block until a block, a drain request or cancellation arrives.
    ///
    /// While waiting, the worker is flagged idle so `wait_until_data` can
    /// detect an empty, stalled stream.
    pub fn pop_blocking(&self) -> FifoPop {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.cancelled {
                return FifoPop::Cancelled;
            }
            if let Some(block) = state.queue.pop_front() {
                state.bytes -= block.len();
                self.space.notify_one();
                return FifoPop::Block(block);
            }
            if state.draining {
                state.draining = false;
                return FifoPop::Drain;
            }
            state.idle = true;
            state = self.not_empty.wait(state).unwrap();
            state.idle = false;
        }
    }

    /// Remove and return every queued block, leaving the FIFO empty.
    /// A pending drain is cancelled: flush supersedes drain.
    pub fn clear(&self) -> Vec<Block> {
        let mut state = self.state.lock().unwrap();
        state.bytes = 0;
        state.draining = false;
        let drained = state.queue.drain(..).collect();
        self.space.notify_all();
        drained
    }

    /// Request a drain: once the queue empties, the worker performs exactly
    /// one nil decode. Wakes a waiter without enqueueing.
    pub fn set_draining(&self) {
        let mut state = self.state.lock().unwrap();
        state.draining = true;
        self.not_empty.notify_one();
    }

    /// Cancel the FIFO. All waits return immediately; subsequent pushes are
    /// dropped.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.cancelled = true;
        self.not_empty.notify_all();
        self.space.notify_all();
    }

    /// Number of queued blocks.
    pub fn count(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Total queued payload bytes.
    pub fn byte_size(&self) -> usize {
        self.state.lock().unwrap().bytes
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().queue.is_empty()
    }

    /// True when the worker is parked in [`Self::pop_blocking`] with
    /// nothing queued.
    pub fn is_idle_and_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.idle && state.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn block(size: usize) -> Block {
        Block::new(vec![0u8; size])
    }

    #[test]
    fn test_fifo_order() {
        let fifo = BlockFifo::new();
        for pts in 1..=3 {
            fifo.push(block(8).with_pts(pts), false);
        }
        for pts in 1..=3 {
            match fifo.pop_blocking() {
                FifoPop::Block(b) => assert_eq!(b.pts, pts),
                other => panic!("unexpected pop: {other:?}"),
            }
        }
    }

    #[test]
    fn test_byte_size_tracking() {
        let fifo = BlockFifo::new();
        fifo.push(block(100), false);
        fifo.push(block(28), false);
        assert_eq!(fifo.byte_size(), 128);
        assert_eq!(fifo.count(), 2);
        let _ = fifo.pop_blocking();
        assert_eq!(fifo.byte_size(), 28);
    }

    #[test]
    fn test_drain_emits_once() {
        let fifo = BlockFifo::new();
        fifo.push(block(4), false);
        fifo.set_draining();
        assert!(matches!(fifo.pop_blocking(), FifoPop::Block(_)));
        assert!(matches!(fifo.pop_blocking(), FifoPop::Drain));
        // The drain request is consumed; the next pop waits for data.
        fifo.push(block(4), false);
        assert!(matches!(fifo.pop_blocking(), FifoPop::Block(_)));
    }

    #[test]
    fn test_clear_cancels_drain() {
        let fifo = BlockFifo::new();
        fifo.push(block(4), false);
        fifo.set_draining();
        let drained = fifo.clear();
        assert_eq!(drained.len(), 1);
        assert!(fifo.is_empty());
        // Drain must not fire after a flush emptied the queue.
        fifo.push(block(4), false);
        assert!(matches!(fifo.pop_blocking(), FifoPop::Block(_)));
    }

    #[test]
    fn test_cancel_unblocks_consumer() {
        let fifo = Arc::new(BlockFifo::new());
        let consumer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || matches!(fifo.pop_blocking(), FifoPop::Cancelled))
        };
        thread::sleep(Duration::from_millis(20));
        fifo.cancel();
        assert!(consumer.join().unwrap());
    }

    #[test]
    fn test_paced_push_blocks_at_limit() {
        let fifo = Arc::new(BlockFifo::new());
        for _ in 0..FIFO_PACE_MAX_COUNT {
            fifo.push(block(4), true);
        }
        assert_eq!(fifo.count(), FIFO_PACE_MAX_COUNT);

        let producer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || {
                fifo.push(block(4), true);
            })
        };
        // The 11th paced push must stay blocked until a dequeue frees space.
        thread::sleep(Duration::from_millis(30));
        assert_eq!(fifo.count(), FIFO_PACE_MAX_COUNT);

        let _ = fifo.pop_blocking();
        producer.join().unwrap();
        assert_eq!(fifo.count(), FIFO_PACE_MAX_COUNT);
    }

    #[test]
    fn test_unpaced_overflow_resets_queue() {
        let fifo = BlockFifo::new();
        fifo.push(block(FIFO_UNPACED_MAX_BYTES + 1), false);
        // The oversized backlog is dropped when the next block arrives.
        fifo.push(block(16), false);
        assert_eq!(fifo.count(), 1);
        assert_eq!(fifo.byte_size(), 16);
    }

    #[test]
    fn test_idle_flag() {
        let fifo = Arc::new(BlockFifo::new());
        assert!(!fifo.is_idle_and_empty());
        let consumer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || fifo.pop_blocking())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(fifo.is_idle_and_empty());
        fifo.push(block(4), false);
        assert!(matches!(consumer.join().unwrap(), FifoPop::Block(_)));
        assert!(!fifo.is_idle_and_empty());
    }
}
