//! Codec plugin and decoder-host seams.
//!
//! A [`Codec`] implements whatever subset of the decode operations its
//! format needs; the engine never decodes bits itself. During decoding the
//! codec calls back into its owner through [`DecoderHost`] to allocate
//! output units and query the clock; the host renegotiates sinks on
//! format changes before handing out buffers.

use common::{Block, EsFormat, Rate, Tick};

use crate::vout::heap::PictureRef;
use crate::vout::spu::SubpictureRef;

/// An embedded file carried by the stream (fonts, cover art).
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime: String,
    pub data: Vec<u8>,
}

/// A loaded codec module.
///
/// The `decode_*` operations consume from `block`: the codec may take the
/// block immediately or hold it and emit several units across calls.
/// Passing `None` instructs the codec to drain. Every operation has a
/// refusing default so plugins implement only what their format needs.
pub trait Codec: Send {
    /// The output contract this codec currently produces.
    fn output_format(&self) -> EsFormat;

    /// Reference frames this codec keeps beyond the standard count.
    fn extra_picture_buffers(&self) -> usize {
        0
    }

    fn decode_audio(&mut self, host: &dyn DecoderHost, block: &mut Option<Block>) -> Option<Block> {
        let _ = (host, block);
        None
    }

    fn decode_video(
        &mut self,
        host: &dyn DecoderHost,
        block: &mut Option<Block>,
    ) -> Option<PictureRef> {
        let _ = (host, block);
        None
    }

    fn decode_sub(
        &mut self,
        host: &dyn DecoderHost,
        block: &mut Option<Block>,
    ) -> Option<SubpictureRef> {
        let _ = (host, block);
        None
    }

    /// Reframe the input into decodable units. Returns one chain per call
    /// until no more output is available.
    fn packetize(&mut self, block: &mut Option<Block>) -> Option<Vec<Block>> {
        let _ = block;
        None
    }

    /// True when this codec can surface closed-caption payloads.
    fn supports_cc(&self) -> bool {
        false
    }

    /// Harvest one closed-caption payload, reporting per-channel presence.
    fn get_cc(&mut self, present: &mut [bool; 4]) -> Option<Block> {
        let _ = present;
        None
    }

    fn attachments(&self) -> Vec<Attachment> {
        Vec::new()
    }
}

/// Finds a codec module for a format; the engine's `module_need`.
pub trait CodecLoader: Send + Sync {
    /// Load a decoder (or, with `packetizer` set, a packetiser) for `fmt`.
    fn load(&self, fmt: &EsFormat, packetizer: bool) -> Option<Box<dyn Codec>>;
}

/// Capabilities the owner exposes to its codec.
///
/// Allocation calls renegotiate the downstream sink whenever the supplied
/// output format diverges from the live one, so a codec never talks to
/// sinks directly.
pub trait DecoderHost {
    /// Allocate an audio buffer for `samples` samples of `fmt`,
    /// renegotiating the audio sink if the format changed.
    fn new_audio_buffer(&self, fmt: &EsFormat, samples: u32) -> Option<Block>;

    /// Reserve an output picture for `fmt`, renegotiating the video sink if
    /// the geometry changed. Blocks while the heap is full.
    fn new_picture(&self, fmt: &EsFormat, extra_buffers: usize) -> Option<PictureRef>;

    /// Reserve a subpicture unit on the live video sink.
    fn new_subpicture(&self) -> Option<SubpictureRef>;

    /// Translate a stream timestamp to its display instant.
    fn display_date(&self, ts: Tick) -> Tick;

    /// The current playback rate.
    fn display_rate(&self) -> Rate;
}
