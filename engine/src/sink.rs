//! Output-side collaborator seams.
//!
//! The engine does not open audio hardware or display surfaces; it talks to
//! sinks rented from a [`ResourcePool`] keyed by format compatibility. The
//! engine's own [`VideoOutput`](crate::vout::VideoOutput) implements
//! [`VideoSink`]; audio sinks and the pool itself belong to the embedder.

use std::sync::Arc;

use common::{AudioFormat, Block, EngineError, Rate, ReplayGain, Tick, VideoFormat};

use crate::vout::heap::PictureRef;
use crate::vout::spu::SubpictureRef;

/// A playing audio output.
pub trait AudioSink: Send + Sync {
    /// Queue one decoded buffer for playback at `rate`.
    fn play(&self, frame: Block, rate: Rate) -> Result<(), EngineError>;

    /// Drop queued buffers. With `wait` set, block until the device has
    /// played out what it already consumed (drain).
    fn flush(&self, wait: bool);

    fn change_pause(&self, paused: bool, date: Tick);

    /// Number of buffers the device dropped since the last call; resets the
    /// counter.
    fn reset_lost(&self) -> u64;
}

/// A video output accepting timed pictures and subpictures.
pub trait VideoSink: Send + Sync {
    /// Reserve a picture slot for the producer to fill.
    fn get_picture(&self, fmt: &VideoFormat) -> Result<PictureRef, EngineError>;

    /// Date and release a filled picture for display.
    fn put_picture(&self, pic: PictureRef);

    /// Reserve a subpicture slot on `channel`.
    fn get_subpicture(&self, channel: u32) -> Result<SubpictureRef, EngineError>;

    /// Release a filled subpicture for display.
    fn put_subpicture(&self, spu: SubpictureRef);

    /// Destroy queued pictures dated at or past `date`.
    fn flush(&self, date: Tick);

    fn change_pause(&self, paused: bool, date: Tick);

    /// While paused, force the next ready picture on screen. Returns its
    /// distance from the previously displayed date.
    fn next_picture(&self) -> Option<Tick>;

    /// Drop all queued work and clear the pause state.
    fn reset(&self);

    /// True when no picture is queued or in flight.
    fn is_empty(&self) -> bool;

    /// Hand out a fresh subtitle channel id.
    fn register_subpicture_channel(&self) -> u32;

    /// Destroy every queued subpicture of `channel`.
    fn flush_subpicture_channel(&self, channel: u32);

    /// `(displayed, lost)` frame counters since the last call; resets them.
    fn take_frame_counters(&self) -> (u64, u64);
}

/// Issues sinks and takes returned ones, keyed by format compatibility.
pub trait ResourcePool: Send + Sync {
    /// Rent an audio sink configured for `fmt`.
    fn get_audio(&self, fmt: &AudioFormat, gain: &ReplayGain) -> Option<Arc<dyn AudioSink>>;

    /// Return an audio sink whose format no longer matches.
    fn put_audio(&self, sink: Arc<dyn AudioSink>);

    /// Rent a video sink for `fmt` with capacity for `dpb` decoded
    /// pictures, recycling `previous` when compatible. `fmt = None`
    /// returns `previous` to the pool for good.
    fn request_video(
        &self,
        previous: Option<Arc<dyn VideoSink>>,
        fmt: Option<&VideoFormat>,
        dpb: usize,
        recycle: bool,
    ) -> Option<Arc<dyn VideoSink>>;

    /// The currently live video sink, if any; used by subtitle decoders
    /// which overlay on whatever video is playing.
    fn hold_video(&self) -> Option<Arc<dyn VideoSink>>;
}

/// The window-system seam: receives finished frames from the video output
/// worker.
pub trait DisplayBackend: Send {
    fn present(&mut self, pixels: &[u8], width: u32, height: u32);
}

/// A backend that discards frames; useful headless and in tests.
#[derive(Debug, Default)]
pub struct NullBackend;

impl DisplayBackend for NullBackend {
    fn present(&mut self, _pixels: &[u8], _width: u32, _height: u32) {}
}
