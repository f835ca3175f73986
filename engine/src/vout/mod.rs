//! Video output: picture heap, subpicture heap, back buffers and the
//! render worker.
//!
//! A [`VideoOutput`] owns one render thread that repeatedly selects the
//! earliest due picture from the heap, composites it into the off-screen
//! back buffer, sleeps until its display deadline, presents and flips.
//! Decoder workers reach it through the [`VideoSink`] trait.

pub mod buffer;
pub mod convert;
pub mod heap;
pub mod spu;
mod thread;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use common::{EngineError, TICK_INVALID, Tick, VideoFormat, tick_is_valid};

use crate::config::EngineConfig;
use crate::sink::{DisplayBackend, VideoSink};
use buffer::BackBuffer;
use convert::ColorTables;
use heap::{PictureHeap, PictureRef};
use spu::{SubpictureHeap, SubpictureRef};

/// A picture further than this past `now` is too early to render this
/// iteration.
pub const VOUT_DISPLAY_DELAY: Tick = 20_000;

/// Sleep between iterations when no picture is due.
pub const VOUT_IDLE_SLEEP: Tick = 20_000;

/// Poll interval while the heap has no free slot for a producer.
pub const VOUT_OUTMEM_SLEEP: Tick = 20_000;

/// Change flags handled by the management pass.
pub(crate) const CHANGE_GAMMA: u32 = 1 << 0;
pub(crate) const CHANGE_GRAYSCALE: u32 = 1 << 1;

pub(crate) struct VoutState {
    pub buffers: [BackBuffer; 2],
    pub buffer_index: usize,
    pub tables: ColorTables,
    pub changes: u32,
    pub gamma: f32,
    pub grayscale: bool,
    pub paused: bool,
    pub step_requests: u32,
    pub last_picture_date: Tick,
    pub scale: bool,
    pub show_stats: bool,
    pub show_interface: bool,
    pub backend: Box<dyn DisplayBackend>,
}

pub(crate) struct Shared {
    pub heap: Arc<PictureHeap>,
    pub spu: Arc<SubpictureHeap>,
    pub state: Mutex<VoutState>,
    pub die: AtomicBool,
    pub displayed: AtomicU64,
    pub lost: AtomicU64,
}

/// One video output worker and its heaps.
pub struct VideoOutput {
    shared: Arc<Shared>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl VideoOutput {
    /// Create the output and spawn its render worker.
    pub fn new(
        width: u32,
        height: u32,
        config: &EngineConfig,
        backend: Box<dyn DisplayBackend>,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            heap: Arc::new(PictureHeap::new()),
            spu: Arc::new(SubpictureHeap::new()),
            state: Mutex::new(VoutState {
                buffers: [BackBuffer::new(width, height), BackBuffer::new(width, height)],
                buffer_index: 0,
                tables: ColorTables::default(),
                changes: 0,
                gamma: 1.0,
                grayscale: false,
                paused: false,
                step_requests: 0,
                last_picture_date: TICK_INVALID,
                scale: config.scale,
                show_stats: config.show_stats,
                show_interface: config.show_interface,
                backend,
            }),
            die: AtomicBool::new(false),
            displayed: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        });

        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("kanade-vout".to_string())
            .spawn(move || thread::run(worker))
            .expect("failed to spawn video output worker");

        Arc::new(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Request a new gamma exponent; the render worker rebuilds its tables
    /// in the next management pass.
    pub fn set_gamma(&self, gamma: f32) {
        let mut state = self.shared.state.lock().unwrap();
        state.gamma = gamma;
        state.changes |= CHANGE_GAMMA;
    }

    /// Toggle grayscale rendering.
    pub fn set_grayscale(&self, on: bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.grayscale = on;
        state.changes |= CHANGE_GRAYSCALE;
    }
}

impl VideoSink for VideoOutput {
    fn get_picture(&self, fmt: &VideoFormat) -> Result<PictureRef, EngineError> {
        self.shared.heap.create(fmt)
    }

    fn put_picture(&self, pic: PictureRef) {
        pic.submit();
    }

    fn get_subpicture(&self, channel: u32) -> Result<SubpictureRef, EngineError> {
        self.shared.spu.create(channel)
    }

    fn put_subpicture(&self, spu: SubpictureRef) {
        spu.submit();
    }

    fn flush(&self, date: Tick) {
        self.shared.heap.flush(date);
    }

    fn change_pause(&self, paused: bool, date: Tick) {
        let mut state = self.shared.state.lock().unwrap();
        state.paused = paused;
        if paused {
            state.step_requests = 0;
        } else if tick_is_valid(date) && tick_is_valid(state.last_picture_date) {
            // Resuming: dates queued before the pause stay comparable.
            state.last_picture_date = state.last_picture_date.min(date);
        }
    }

    fn next_picture(&self) -> Option<Tick> {
        let mut state = self.shared.state.lock().unwrap();
        let next = self.shared.heap.earliest_ready()?;
        let duration = if tick_is_valid(state.last_picture_date) && next.date > state.last_picture_date
        {
            next.date - state.last_picture_date
        } else {
            0
        };
        state.step_requests += 1;
        Some(duration)
    }

    fn reset(&self) {
        // Drop everything queued and clear the pause so the worker can
        // drain; used when the owner hands the output back to the pool.
        self.shared.heap.flush(Tick::MIN);
        let mut state = self.shared.state.lock().unwrap();
        state.paused = false;
        state.step_requests = 0;
    }

    fn is_empty(&self) -> bool {
        self.shared.heap.is_empty()
    }

    fn register_subpicture_channel(&self) -> u32 {
        self.shared.spu.register_channel()
    }

    fn flush_subpicture_channel(&self, channel: u32) {
        self.shared.spu.flush_channel(channel);
    }

    fn take_frame_counters(&self) -> (u64, u64) {
        (
            self.shared.displayed.swap(0, Ordering::AcqRel),
            self.shared.lost.swap(0, Ordering::AcqRel),
        )
    }
}

impl Drop for VideoOutput {
    fn drop(&mut self) {
        self.shared.die.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let (displayed, lost) = (
            self.shared.displayed.load(Ordering::Acquire),
            self.shared.lost.load(Ordering::Acquire),
        );
        log::debug!("video output stopped (displayed: {displayed}, lost: {lost})");
    }
}
