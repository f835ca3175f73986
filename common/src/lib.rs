//! Common types for the Kanade playback pipeline.
//!
//! This crate defines the data model shared between the demuxer side and the
//! engine (`kanade`): timestamps, playback rate, elementary-stream
//! categories, codec identifiers, compressed blocks, and the format
//! descriptors that travel with them.
//!
//! # Timestamps
//!
//! All timestamps are signed 64-bit microseconds ([`Tick`]). Zero is the
//! distinguished invalid sentinel ([`TICK_INVALID`]); every valid stamp is
//! strictly positive. Arithmetic on timestamps must check the sentinel
//! first; adding a delay to an invalid stamp keeps it invalid.
//!
//! # Examples
//!
//! ```
//! use common::{Block, EsCategory, EsFormat, codec};
//!
//! let fmt = EsFormat::new(EsCategory::Audio, codec::MP4A);
//! let block = Block::new(vec![0u8; 64]).with_pts(1_000);
//! assert!(block.has_pts());
//! assert_eq!(fmt.category, Some(EsCategory::Audio));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream/wall-clock timestamp in microseconds.
pub type Tick = i64;

/// The invalid timestamp sentinel. Valid timestamps are strictly positive.
pub const TICK_INVALID: Tick = 0;

/// Ticks per second.
pub const CLOCK_FREQ: Tick = 1_000_000;

/// Returns true when `ts` is a usable timestamp.
#[inline]
pub fn tick_is_valid(ts: Tick) -> bool {
    ts > TICK_INVALID
}

/// Playback rate. [`RATE_DEFAULT`] is normal speed; `2 * RATE_DEFAULT` is
/// half speed (the rate scales durations, not frequency).
pub type Rate = i32;

/// Normal playback speed.
pub const RATE_DEFAULT: Rate = 1000;

/// Audio accepts rates within `RATE_DEFAULT / RATIO ..= RATE_DEFAULT * RATIO`.
pub const AOUT_MAX_RATE_RATIO: Rate = 4;

/// Errors shared between the engine and its embedders.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum EngineError {
    #[error("picture heap is full")]
    HeapFull,

    #[error("no codec available for {0}")]
    CodecUnavailable(String),

    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("could not convert timestamp {0}")]
    TimestampConversion(Tick),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Elementary-stream category. Decides which output sink a decoder
/// addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EsCategory {
    Audio,
    Video,
    Subtitle,
}

/// Four-character codec identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecId(pub [u8; 4]);

impl CodecId {
    pub const fn new(tag: &[u8; 4]) -> Self {
        Self(*tag)
    }
}

impl fmt::Debug for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodecId({self})")
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() { b as char } else { '.' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl Default for CodecId {
    fn default() -> Self {
        codec::UNDF
    }
}

/// Well-known codec identifiers.
pub mod codec {
    use super::CodecId;

    pub const UNDF: CodecId = CodecId::new(b"undf");

    // Video
    pub const H264: CodecId = CodecId::new(b"h264");
    pub const HEVC: CodecId = CodecId::new(b"hevc");
    pub const DIRAC: CodecId = CodecId::new(b"drac");
    pub const VP5: CodecId = CodecId::new(b"VP50");
    pub const VP6: CodecId = CodecId::new(b"VP60");
    pub const VP6F: CodecId = CodecId::new(b"VP6F");
    pub const VP8: CodecId = CodecId::new(b"VP80");
    pub const MPGV: CodecId = CodecId::new(b"mpgv");

    // Audio
    pub const MP4A: CodecId = CodecId::new(b"mp4a");
    pub const MPGA: CodecId = CodecId::new(b"mpga");

    // Closed-caption channels
    pub const CC: [CodecId; 4] = [
        CodecId::new(b"cc1 "),
        CodecId::new(b"cc2 "),
        CodecId::new(b"cc3 "),
        CodecId::new(b"cc4 "),
    ];
}

/// Flags carried by a [`Block`].
///
/// The engine-owned bits (`core_flush`, `core_private`) are stripped before
/// a block reaches a codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFlags {
    /// Decode but do not present (seek preroll).
    pub preroll: bool,
    /// Timestamp discontinuity precedes this block.
    pub discontinuity: bool,
    /// Payload is damaged.
    pub corrupted: bool,
    /// Engine-internal flush sentinel.
    pub core_flush: bool,
    /// Reserved for engine-internal use.
    pub core_private: bool,
}

impl BlockFlags {
    /// Strip the engine-owned bits before handing the block to a codec.
    pub fn clear_core_private(&mut self) {
        self.core_flush = false;
        self.core_private = false;
    }
}

/// A compressed payload with timestamps, the unit of FIFO traffic.
///
/// Exclusively owned by the FIFO while queued and by the decoder worker
/// while being processed.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub data: Vec<u8>,
    pub dts: Tick,
    pub pts: Tick,
    pub duration: Tick,
    /// Audio only: number of samples carried.
    pub samples: u32,
    pub flags: BlockFlags,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            dts: TICK_INVALID,
            pts: TICK_INVALID,
            duration: 0,
            samples: 0,
            flags: BlockFlags::default(),
        }
    }

    pub fn with_dts(mut self, dts: Tick) -> Self {
        self.dts = dts;
        self
    }

    pub fn with_pts(mut self, pts: Tick) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_duration(mut self, duration: Tick) -> Self {
        self.duration = duration;
        self
    }

    /// The zeroed sentinel enqueued by flush. Codecs treat it as a
    /// discontinuity; the worker recognises it by `core_flush`.
    pub fn flush_sentinel() -> Self {
        let mut block = Self::new(vec![0u8; 128]);
        block.flags.discontinuity = true;
        block.flags.corrupted = true;
        block.flags.core_flush = true;
        block
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn has_dts(&self) -> bool {
        tick_is_valid(self.dts)
    }

    pub fn has_pts(&self) -> bool {
        tick_is_valid(self.pts)
    }
}

/// Pixel layout of a decoded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Planar YUV, chroma subsampled 2x2.
    Yuv420,
    /// Planar YUV, chroma subsampled horizontally.
    Yuv422,
    /// Planar YUV, full chroma.
    Yuv444,
    /// Packed 32-bit RGB.
    Rgb32,
}

impl PixelFormat {
    /// Chroma plane width for a luma width of `width`.
    pub fn chroma_width(self, width: u32) -> u32 {
        match self {
            Self::Yuv420 | Self::Yuv422 => width / 2,
            Self::Yuv444 => width,
            Self::Rgb32 => 0,
        }
    }

    /// Bytes needed to hold one picture of `width` x `height`.
    pub fn buffer_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            // Y plane plus two quarter-size chroma planes.
            Self::Yuv420 => w * h * 3 / 2,
            // Y plane plus two half-width chroma planes.
            Self::Yuv422 => w * h * 2,
            Self::Yuv444 => w * h * 3,
            Self::Rgb32 => w * h * 4,
        }
    }

    pub fn is_yuv(self) -> bool {
        !matches!(self, Self::Rgb32)
    }
}

/// Declared display aspect of a picture, used by the output scaler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleAspect {
    #[default]
    Square,
    Ratio4x3,
    Ratio16x9,
    Ratio221x100,
}

/// Picture orientation as signalled by the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Normal,
    Rotated90,
    Rotated180,
    Rotated270,
}

/// Visible sub-rectangle of a coded picture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Replay-gain metadata for one mode (track or album).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GainEntry {
    pub peak: Option<f32>,
    pub gain: Option<f32>,
}

/// Replay-gain metadata carried with an audio format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayGain {
    pub track: GainEntry,
    pub album: GainEntry,
}

impl ReplayGain {
    /// Fill entries this value does not carry from `other`.
    pub fn merge_missing(&mut self, other: &ReplayGain) {
        for (dst, src) in [
            (&mut self.track, &other.track),
            (&mut self.album, &other.album),
        ] {
            if dst.peak.is_none() {
                dst.peak = src.peak;
            }
            if dst.gain.is_none() {
                dst.gain = src.gain;
            }
        }
    }
}

/// Audio sample layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u32,
    /// `Some(true)` forces Dolby-Surround decoding of a stereo pair,
    /// `Some(false)` forces it off, `None` leaves the stream's choice.
    pub dolby_stereo: Option<bool>,
    pub bytes_per_frame: u32,
    pub frame_length: u32,
}

impl AudioFormat {
    /// True when the sinks would treat both formats identically.
    pub fn is_identical(&self, other: &AudioFormat) -> bool {
        self == other
    }
}

/// Video geometry and pixel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub pixel: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub visible: Rect,
    pub sar_num: u32,
    pub sar_den: u32,
    pub aspect: SampleAspect,
    pub orientation: Orientation,
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self {
            pixel: PixelFormat::Yuv420,
            width: 0,
            height: 0,
            visible: Rect::default(),
            sar_num: 0,
            sar_den: 0,
            aspect: SampleAspect::Square,
            orientation: Orientation::Normal,
        }
    }
}

impl VideoFormat {
    /// True when geometry, chroma, pixel aspect and orientation all match.
    /// Any difference forces the decoder to renegotiate its video sink.
    pub fn is_identical(&self, other: &VideoFormat) -> bool {
        self.pixel == other.pixel
            && self.width == other.width
            && self.height == other.height
            && self.visible == other.visible
            // Cross-multiplied so 1/1 and 2/2 compare equal.
            && self.sar_num as u64 * other.sar_den as u64
                == other.sar_num as u64 * self.sar_den as u64
            && self.orientation == other.orientation
    }
}

/// Immutable snapshot of an elementary stream's contract.
///
/// A decoder holds an input descriptor (from the demuxer) and an output
/// descriptor (towards the sink); a change in either triggers
/// renegotiation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EsFormat {
    pub category: Option<EsCategory>,
    pub codec: CodecId,
    /// True when blocks are already unit-framed and no packetiser is
    /// needed.
    pub packetized: bool,
    pub language: Option<String>,
    pub audio: AudioFormat,
    pub video: VideoFormat,
    pub replay_gain: ReplayGain,
    /// Free-form key/value description surfaced with format-change events.
    pub description: BTreeMap<String, String>,
}

impl EsFormat {
    pub fn new(category: EsCategory, codec: CodecId) -> Self {
        Self {
            category: Some(category),
            codec,
            ..Self::default()
        }
    }

    /// True when a codec loaded for `self` can keep decoding `other`
    /// without being reloaded.
    pub fn is_similar(&self, other: &EsFormat) -> bool {
        if self.category != other.category || self.codec != other.codec {
            return false;
        }
        match self.category {
            Some(EsCategory::Audio) => {
                self.audio.sample_rate == other.audio.sample_rate
                    && self.audio.channels == other.audio.channels
            }
            Some(EsCategory::Video) => {
                self.video.width == other.video.width
                    && self.video.height == other.video.height
                    && self.video.pixel == other.video.pixel
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_sentinel() {
        assert!(!tick_is_valid(TICK_INVALID));
        assert!(!tick_is_valid(-5));
        assert!(tick_is_valid(1));
    }

    #[test]
    fn test_flush_sentinel_flags() {
        let b = Block::flush_sentinel();
        assert!(b.flags.core_flush);
        assert!(b.flags.discontinuity);
        assert!(b.flags.corrupted);
        assert_eq!(b.len(), 128);
        assert!(b.data.iter().all(|&x| x == 0));
    }

    #[test]
    fn test_clear_core_private() {
        let mut flags = BlockFlags {
            preroll: true,
            core_flush: true,
            core_private: true,
            ..BlockFlags::default()
        };
        flags.clear_core_private();
        assert!(flags.preroll);
        assert!(!flags.core_flush);
        assert!(!flags.core_private);
    }

    #[test]
    fn test_pixel_format_sizes() {
        assert_eq!(PixelFormat::Yuv420.buffer_size(4, 4), 24);
        assert_eq!(PixelFormat::Yuv422.buffer_size(4, 4), 32);
        assert_eq!(PixelFormat::Yuv444.buffer_size(4, 4), 48);
        assert_eq!(PixelFormat::Rgb32.buffer_size(4, 4), 64);
        assert_eq!(PixelFormat::Yuv420.chroma_width(16), 8);
        assert_eq!(PixelFormat::Yuv444.chroma_width(16), 16);
    }

    #[test]
    fn test_video_format_sar_comparison() {
        let mut a = VideoFormat {
            width: 640,
            height: 480,
            sar_num: 1,
            sar_den: 1,
            ..VideoFormat::default()
        };
        let mut b = a;
        b.sar_num = 2;
        b.sar_den = 2;
        assert!(a.is_identical(&b));
        b.sar_den = 3;
        assert!(!a.is_identical(&b));
        a.sar_num = 0;
        a.sar_den = 0;
        b.sar_num = 0;
        b.sar_den = 0;
        assert!(a.is_identical(&b));
    }

    #[test]
    fn test_es_format_similarity() {
        let mut a = EsFormat::new(EsCategory::Video, codec::H264);
        a.video.width = 1280;
        a.video.height = 720;
        let mut b = a.clone();
        assert!(a.is_similar(&b));
        b.video.width = 1920;
        assert!(!a.is_similar(&b));
        b = a.clone();
        b.codec = codec::HEVC;
        assert!(!a.is_similar(&b));
    }

    #[test]
    fn test_replay_gain_merge() {
        let mut gain = ReplayGain::default();
        let other = ReplayGain {
            track: GainEntry {
                peak: Some(0.9),
                gain: Some(-3.0),
            },
            album: GainEntry::default(),
        };
        gain.track.gain = Some(1.0);
        gain.merge_missing(&other);
        assert_eq!(gain.track.peak, Some(0.9));
        assert_eq!(gain.track.gain, Some(1.0));
    }

    #[test]
    fn test_es_format_serialization() {
        let mut fmt = EsFormat::new(EsCategory::Audio, codec::MP4A);
        fmt.audio.sample_rate = 48_000;
        fmt.description
            .insert("encoder".to_string(), "test".to_string());
        let json = serde_json::to_string(&fmt).unwrap();
        let back: EsFormat = serde_json::from_str(&json).unwrap();
        assert_eq!(fmt, back);
    }

    #[test]
    fn test_codec_id_display() {
        assert_eq!(codec::H264.to_string(), "h264");
        assert_eq!(format!("{:?}", codec::CC[0]), "CodecId(cc1.)");
    }
}
