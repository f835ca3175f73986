//! Fixed-capacity picture heap.
//!
//! Every decoded picture lives in one of [`VOUT_MAX_PICTURES`] slots with an
//! explicit lifecycle:
//!
//! ```text
//! free ──create──▶ reserved ──date──▶ reserved-dated ──display──▶ ready
//!                     │                                            │
//!                     └──display──▶ reserved-displayable ──date──▶─┘
//!
//! ready ──consume──▶ displayed ──unlink to zero──▶ destroyed ──▶ reusable
//! ```
//!
//! A destroyed slot keeps its pixel buffer; a later create with the same
//! format and dimensions reuses it without reallocating, so steady-state
//! playback does not touch the allocator. Any other transition is a
//! programmer error: it is logged and, in debug builds, fatal.

use std::sync::{Arc, Mutex, RwLock};

use common::{EngineError, PixelFormat, SampleAspect, TICK_INVALID, Tick, VideoFormat};

/// Number of picture slots per video output.
pub const VOUT_MAX_PICTURES: usize = 8;

/// Lifecycle state of one picture slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureStatus {
    /// Slot unused, no buffer owned.
    Free,
    /// Buffer still allocated, eligible for reuse.
    Destroyed,
    /// Allocated and being filled by a producer.
    Reserved,
    /// Dated but not yet released for display.
    ReservedDated,
    /// Released for display but not yet dated.
    ReservedDisplayable,
    /// Dated and released, awaiting its deadline.
    Ready,
    /// Consumed by the renderer; destroyed once the refcount drops to zero.
    Displayed,
}

/// Plane offsets of a picture buffer for one pixel format.
#[derive(Debug, Clone, Copy)]
pub struct PictureLayout {
    pub pixel: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub chroma_width: u32,
    pub chroma_height: u32,
    /// Offset of the U plane; 0 for packed formats.
    pub u_offset: usize,
    /// Offset of the V plane; 0 for packed formats.
    pub v_offset: usize,
}

impl PictureLayout {
    pub fn new(pixel: PixelFormat, width: u32, height: u32) -> Self {
        let chroma_width = pixel.chroma_width(width);
        let chroma_height = match pixel {
            PixelFormat::Yuv420 => height / 2,
            PixelFormat::Yuv422 | PixelFormat::Yuv444 => height,
            PixelFormat::Rgb32 => 0,
        };
        let luma = (width * height) as usize;
        let chroma = (chroma_width * chroma_height) as usize;
        let (u_offset, v_offset) = match pixel {
            PixelFormat::Rgb32 => (0, 0),
            _ => (luma, luma + chroma),
        };
        Self {
            pixel,
            width,
            height,
            chroma_width,
            chroma_height,
            u_offset,
            v_offset,
        }
    }
}

struct Slot {
    status: PictureStatus,
    pixel: PixelFormat,
    width: u32,
    height: u32,
    aspect: SampleAspect,
    date: Tick,
    force: bool,
    refcount: u32,
    /// Owned across a lifetime wider than the logical status: a destroyed
    /// slot keeps it for reuse.
    buffer: Arc<RwLock<Vec<u8>>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            status: PictureStatus::Free,
            pixel: PixelFormat::Yuv420,
            width: 0,
            height: 0,
            aspect: SampleAspect::Square,
            date: TICK_INVALID,
            force: false,
            refcount: 0,
            buffer: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

/// A picture selected for rendering: everything the render pass needs
/// without re-locking the heap.
pub struct ReadyPicture {
    pub index: usize,
    pub date: Tick,
    pub force: bool,
    pub aspect: SampleAspect,
    pub layout: PictureLayout,
    pub buffer: Arc<RwLock<Vec<u8>>>,
}

/// The heap itself. All slot state is guarded by one dedicated mutex;
/// pixel buffers carry their own lock so rendering and producing never
/// serialise on the heap.
pub struct PictureHeap {
    slots: Mutex<Vec<Slot>>,
}

impl Default for PictureHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl PictureHeap {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new((0..VOUT_MAX_PICTURES).map(|_| Slot::new()).collect()),
        }
    }

    /// Reserve a slot for a new picture of the given geometry.
    ///
    /// Reuses the buffer of a destroyed slot with identical format and
    /// dimensions when one exists; otherwise takes the first free slot, or
    /// reallocates the first destroyed one.
    pub fn create(self: &Arc<Self>, fmt: &VideoFormat) -> Result<PictureRef, EngineError> {
        let mut slots = self.slots.lock().unwrap();

        let mut exact_match = None;
        let mut first_free = None;
        let mut first_destroyed = None;
        for (i, slot) in slots.iter().enumerate() {
            match slot.status {
                PictureStatus::Destroyed => {
                    if slot.pixel == fmt.pixel
                        && slot.width == fmt.width
                        && slot.height == fmt.height
                    {
                        exact_match = Some(i);
                        break;
                    }
                    if first_destroyed.is_none() {
                        first_destroyed = Some(i);
                    }
                }
                PictureStatus::Free => {
                    if first_free.is_none() {
                        first_free = Some(i);
                    }
                }
                _ => {}
            }
        }

        if let Some(index) = exact_match {
            // Exact match: the buffer is reused as-is.
            let slot = &mut slots[index];
            slot.status = PictureStatus::Reserved;
            slot.aspect = fmt.aspect;
            slot.date = TICK_INVALID;
            slot.force = false;
            slot.refcount = 0;
            return Ok(PictureRef::new(Arc::clone(self), index));
        }

        let index = match first_free.or(first_destroyed) {
            Some(i) => i,
            None => {
                log::warn!("picture heap is full");
                return Err(EngineError::HeapFull);
            }
        };

        let slot = &mut slots[index];
        slot.status = PictureStatus::Reserved;
        slot.pixel = fmt.pixel;
        slot.width = fmt.width;
        slot.height = fmt.height;
        slot.aspect = fmt.aspect;
        slot.date = TICK_INVALID;
        slot.force = false;
        slot.refcount = 0;
        let size = fmt.pixel.buffer_size(fmt.width, fmt.height);
        let mut buffer = slot.buffer.write().unwrap();
        buffer.clear();
        buffer.resize(size, 0);
        drop(buffer);

        Ok(PictureRef::new(Arc::clone(self), index))
    }

    /// Set the display date of a slot and advance its status.
    pub fn date(&self, index: usize, date: Tick) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[index];
        slot.date = date;
        match slot.status {
            PictureStatus::Reserved => slot.status = PictureStatus::ReservedDated,
            PictureStatus::ReservedDisplayable => slot.status = PictureStatus::Ready,
            status => invalid_transition("date", index, status),
        }
    }

    /// Release a slot for display and advance its status.
    pub fn display(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[index];
        match slot.status {
            PictureStatus::Reserved => slot.status = PictureStatus::ReservedDisplayable,
            PictureStatus::ReservedDated => slot.status = PictureStatus::Ready,
            status => invalid_transition("display", index, status),
        }
    }

    /// Transition a slot to destroyed regardless of refcount. The buffer is
    /// kept for reuse.
    pub fn destroy(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[index];
        if slot.status == PictureStatus::Free {
            invalid_transition("destroy", index, slot.status);
            return;
        }
        slot.status = PictureStatus::Destroyed;
        slot.force = false;
        slot.date = TICK_INVALID;
    }

    /// Increment the reference count of a slot.
    pub fn link(self: &Arc<Self>, index: usize) -> PictureLink {
        let mut slots = self.slots.lock().unwrap();
        slots[index].refcount += 1;
        PictureLink {
            heap: Arc::clone(self),
            index,
        }
    }

    /// Decrement the reference count; a displayed slot reaching zero is
    /// destroyed.
    pub fn unlink(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[index];
        if slot.refcount == 0 {
            invalid_transition("unlink", index, slot.status);
            return;
        }
        slot.refcount -= 1;
        if slot.refcount == 0 && slot.status == PictureStatus::Displayed {
            slot.status = PictureStatus::Destroyed;
            slot.force = false;
            slot.date = TICK_INVALID;
        }
    }

    /// Mark a slot for display regardless of its deadline.
    pub(crate) fn set_force(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap();
        slots[index].force = true;
    }

    /// The ready slot with the smallest display date; forced slots win over
    /// everything.
    pub fn earliest_ready(&self) -> Option<ReadyPicture> {
        let slots = self.slots.lock().unwrap();
        let mut best: Option<usize> = None;
        for (i, slot) in slots.iter().enumerate() {
            if slot.status != PictureStatus::Ready {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(j) => {
                    let better = (slot.force && !slots[j].force)
                        || (slot.force == slots[j].force && slot.date < slots[j].date);
                    if better { Some(i) } else { Some(j) }
                }
            };
        }
        best.map(|i| {
            let slot = &slots[i];
            ReadyPicture {
                index: i,
                date: slot.date,
                force: slot.force,
                aspect: slot.aspect,
                layout: PictureLayout::new(slot.pixel, slot.width, slot.height),
                buffer: Arc::clone(&slot.buffer),
            }
        })
    }

    /// Mark a rendered (or late) ready slot consumed: displayed while
    /// references remain, destroyed otherwise. Returns false when the slot
    /// is no longer ready, since a flush may legitimately beat the renderer to
    /// it.
    pub fn consume(&self, index: usize) -> bool {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[index];
        if slot.status != PictureStatus::Ready {
            return false;
        }
        slot.force = false;
        slot.status = if slot.refcount > 0 {
            PictureStatus::Displayed
        } else {
            slot.date = TICK_INVALID;
            PictureStatus::Destroyed
        };
        true
    }

    /// Destroy every ready or reserved-dated slot whose date is at or past
    /// `date`.
    pub fn flush(&self, date: Tick) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            let flushable = matches!(
                slot.status,
                PictureStatus::Ready | PictureStatus::ReservedDated
            );
            if flushable && slot.date >= date {
                slot.status = PictureStatus::Destroyed;
                slot.force = false;
                slot.date = TICK_INVALID;
            }
        }
    }

    /// True when no slot holds work in flight (reserved in any form or
    /// ready).
    pub fn is_empty(&self) -> bool {
        let slots = self.slots.lock().unwrap();
        slots.iter().all(|slot| {
            matches!(
                slot.status,
                PictureStatus::Free | PictureStatus::Destroyed | PictureStatus::Displayed
            )
        })
    }

    #[cfg(test)]
    fn status(&self, index: usize) -> PictureStatus {
        self.slots.lock().unwrap()[index].status
    }
}

fn invalid_transition(op: &str, index: usize, status: PictureStatus) {
    log::error!("picture slot {index}: invalid {op} from status {status:?}");
    debug_assert!(false, "picture slot {index}: invalid {op} from {status:?}");
}

/// Handle on a reserved picture slot.
///
/// The producer fills the buffer through [`PictureRef::write`], stamps
/// `date` (and possibly `force`), and submits the picture to its video
/// sink. Dropping an unsubmitted handle destroys the slot, so a rejected
/// picture is released by letting the handle go.
pub struct PictureRef {
    heap: Arc<PictureHeap>,
    index: usize,
    submitted: bool,
    /// Display date on the engine clock; invalid until fixed by the
    /// decoder.
    pub date: Tick,
    /// Display even if the deadline has passed.
    pub force: bool,
}

impl PictureRef {
    fn new(heap: Arc<PictureHeap>, index: usize) -> Self {
        Self {
            heap,
            index,
            submitted: false,
            date: TICK_INVALID,
            force: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn layout(&self) -> PictureLayout {
        let slots = self.heap.slots.lock().unwrap();
        let slot = &slots[self.index];
        PictureLayout::new(slot.pixel, slot.width, slot.height)
    }

    /// Fill the pixel buffer. The closure gets the whole buffer; plane
    /// offsets come from [`PictureRef::layout`].
    pub fn write(&self, fill: impl FnOnce(&mut [u8])) {
        let buffer = {
            let slots = self.heap.slots.lock().unwrap();
            Arc::clone(&slots[self.index].buffer)
        };
        let mut data = buffer.write().unwrap();
        fill(&mut data);
    }

    /// Take an extra reference on the slot, keeping it alive past display.
    pub fn link(&self) -> PictureLink {
        self.heap.link(self.index)
    }

    /// Consume the handle: date the slot, then release it for display.
    /// The two calls are independent; the slot passes through the dated
    /// intermediate status on its way to ready.
    pub(crate) fn submit(mut self) {
        self.submitted = true;
        let heap = Arc::clone(&self.heap);
        if self.force {
            heap.set_force(self.index);
        }
        heap.date(self.index, self.date);
        heap.display(self.index);
    }
}

impl Drop for PictureRef {
    fn drop(&mut self) {
        if !self.submitted {
            self.heap.destroy(self.index);
        }
    }
}

/// A live reference on a picture slot; dropping it unlinks, destroying a
/// displayed slot whose count reaches zero.
pub struct PictureLink {
    heap: Arc<PictureHeap>,
    index: usize,
}

impl Drop for PictureLink {
    fn drop(&mut self) {
        self.heap.unlink(self.index);
    }
}
