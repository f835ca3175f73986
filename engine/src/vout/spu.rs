//! Fixed-capacity subpicture heap.
//!
//! The subtitle analogue of the picture heap, without the dating step:
//! `display` moves a reserved slot straight to ready. Each unit carries a
//! start and end display date, the channel of the decoder that produced it
//! and a monotonically increasing order used to break ties between
//! overlapping subtitles.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use common::{EngineError, TICK_INVALID, Tick, tick_is_valid};

/// Number of subpicture slots per video output.
pub const VOUT_MAX_SUBPICTURES: usize = 8;

/// Lifecycle state of one subpicture slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpictureStatus {
    Free,
    /// Buffer kept, slot reusable.
    Destroyed,
    /// Being filled by a producer.
    Reserved,
    /// Awaiting its display window.
    Ready,
}

struct Slot {
    status: SubpictureStatus,
    channel: u32,
    order: u64,
    start: Tick,
    stop: Tick,
    width: u32,
    height: u32,
    payload: Vec<u8>,
}

impl Slot {
    fn new() -> Self {
        Self {
            status: SubpictureStatus::Free,
            channel: 0,
            order: 0,
            start: TICK_INVALID,
            stop: TICK_INVALID,
            width: 0,
            height: 0,
            payload: Vec::new(),
        }
    }
}

/// A subpicture selected for overlay rendering.
pub struct ReadySubpicture {
    pub index: usize,
    pub order: u64,
    pub width: u32,
    pub height: u32,
    pub payload: Vec<u8>,
}

/// The subpicture heap. One dedicated mutex guards all slots.
pub struct SubpictureHeap {
    slots: Mutex<Vec<Slot>>,
    next_channel: AtomicU32,
    next_order: AtomicU64,
}

impl Default for SubpictureHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl SubpictureHeap {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new((0..VOUT_MAX_SUBPICTURES).map(|_| Slot::new()).collect()),
            next_channel: AtomicU32::new(1),
            next_order: AtomicU64::new(0),
        }
    }

    /// Hand out a fresh subtitle channel id.
    pub fn register_channel(&self) -> u32 {
        self.next_channel.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserve a slot for a new subpicture on `channel`.
    pub fn create(self: &Arc<Self>, channel: u32) -> Result<SubpictureRef, EngineError> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots
            .iter()
            .position(|s| s.status == SubpictureStatus::Free)
            .or_else(|| {
                slots
                    .iter()
                    .position(|s| s.status == SubpictureStatus::Destroyed)
            });
        let Some(index) = index else {
            log::warn!("subpicture heap is full");
            return Err(EngineError::HeapFull);
        };

        let slot = &mut slots[index];
        slot.status = SubpictureStatus::Reserved;
        slot.channel = channel;
        slot.order = self.next_order.fetch_add(1, Ordering::Relaxed);
        slot.start = TICK_INVALID;
        slot.stop = TICK_INVALID;
        slot.width = 0;
        slot.height = 0;
        slot.payload.clear();

        Ok(SubpictureRef {
            heap: Arc::clone(self),
            index,
            channel,
            submitted: false,
            start: TICK_INVALID,
            stop: TICK_INVALID,
        })
    }

    /// Release a reserved slot for display. There is no dating step; the
    /// slot becomes ready immediately.
    fn display(&self, index: usize, start: Tick, stop: Tick) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[index];
        match slot.status {
            SubpictureStatus::Reserved => {
                slot.start = start;
                slot.stop = stop;
                slot.status = SubpictureStatus::Ready;
            }
            status => invalid_transition("display", index, status),
        }
    }

    fn set_content(&self, index: usize, width: u32, height: u32, payload: Vec<u8>) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[index];
        slot.width = width;
        slot.height = height;
        slot.payload = payload;
    }

    /// Transition a slot to destroyed; the buffer is kept for reuse.
    pub fn destroy(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[index];
        if slot.status == SubpictureStatus::Free {
            invalid_transition("destroy", index, slot.status);
            return;
        }
        slot.status = SubpictureStatus::Destroyed;
    }

    /// Destroy every non-free slot of `channel`.
    pub fn flush_channel(&self, channel: u32) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if slot.channel == channel && slot.status != SubpictureStatus::Free {
                slot.status = SubpictureStatus::Destroyed;
            }
        }
    }

    /// Ready subpictures whose display window covers `date`, lowest order
    /// first.
    pub fn visible_at(&self, date: Tick) -> Vec<ReadySubpicture> {
        let slots = self.slots.lock().unwrap();
        let mut visible: Vec<ReadySubpicture> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.status == SubpictureStatus::Ready
                    && s.start <= date
                    && (!tick_is_valid(s.stop) || s.stop > date)
            })
            .map(|(index, s)| ReadySubpicture {
                index,
                order: s.order,
                width: s.width,
                height: s.height,
                payload: s.payload.clone(),
            })
            .collect();
        visible.sort_by_key(|s| s.order);
        visible
    }

    /// Destroy ready subpictures whose display window ended before `now`.
    pub fn expire(&self, now: Tick) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if slot.status == SubpictureStatus::Ready
                && tick_is_valid(slot.stop)
                && slot.stop <= now
            {
                slot.status = SubpictureStatus::Destroyed;
            }
        }
    }

    #[cfg(test)]
    fn status(&self, index: usize) -> SubpictureStatus {
        self.slots.lock().unwrap()[index].status
    }
}

fn invalid_transition(op: &str, index: usize, status: SubpictureStatus) {
    log::error!("subpicture slot {index}: invalid {op} from status {status:?}");
    debug_assert!(false, "subpicture slot {index}: invalid {op} from {status:?}");
}

/// Handle on a reserved subpicture slot.
///
/// The producer fills in the content and the display window, then submits.
/// Dropping an unsubmitted handle destroys the slot.
pub struct SubpictureRef {
    heap: Arc<SubpictureHeap>,
    index: usize,
    channel: u32,
    submitted: bool,
    /// Start of the display window; invalid until fixed by the decoder.
    pub start: Tick,
    /// End of the display window; invalid means "until replaced".
    pub stop: Tick,
}

impl SubpictureRef {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Attach the rendered subtitle band.
    pub fn set_content(&self, width: u32, height: u32, payload: Vec<u8>) {
        self.heap.set_content(self.index, width, height, payload);
    }

    /// Consume the handle, releasing the slot for display.
    pub(crate) fn submit(mut self) {
        self.submitted = true;
        let heap = Arc::clone(&self.heap);
        heap.display(self.index, self.start, self.stop);
    }
}

impl Drop for SubpictureRef {
    fn drop(&mut self) {
        if !self.submitted {
            self.heap.destroy(self.index);
        }
    }
}
