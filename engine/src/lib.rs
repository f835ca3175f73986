//! Kanade: the decoder-to-output core of a playback engine.
//!
//! The engine consumes compressed elementary-stream blocks and produces
//! timed audio, video and subtitles at their correct presentation
//! instants. It is organised around two long-running workers:
//!
//! - a **decoder worker** per elementary stream ([`decoder::Decoder`])
//!   that packetises blocks, drives a pluggable [`codec::Codec`], paces
//!   delivery against a shared [`clock::MasterClock`] and hands finished
//!   units to output sinks;
//! - a **video output worker** ([`vout::VideoOutput`]) that manages a
//!   bounded picture heap, renders the next due picture into an
//!   off-screen back buffer at its deadline and flips buffers.
//!
//! Codecs, audio devices, display surfaces and the resource pool are
//! collaborators supplied by the embedder through the traits in
//! [`codec`] and [`sink`].
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use kanade::config::EngineConfig;
//! use kanade::decoder::{Decoder, DecoderParams};
//! # fn collaborators() -> (Arc<dyn kanade::sink::ResourcePool>,
//! #                        Arc<dyn kanade::codec::CodecLoader>,
//! #                        Arc<dyn kanade::clock::MasterClock>) { unimplemented!() }
//!
//! let (pool, loader, clock) = collaborators();
//! let fmt = common::EsFormat::new(common::EsCategory::Audio, common::codec::MP4A);
//! let decoder = Decoder::new(DecoderParams {
//!     fmt,
//!     clock: Some(clock),
//!     pool,
//!     loader,
//!     stats: None,
//!     config: EngineConfig::default(),
//! })
//! .expect("codec available");
//!
//! decoder.enqueue(common::Block::new(vec![0; 64]).with_pts(1_000), true);
//! decoder.drain();
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod fifo;
pub mod sink;
pub mod stats;
pub mod vout;

pub use clock::MasterClock;
pub use config::EngineConfig;
pub use decoder::{Decoder, DecoderParams};
pub use fifo::BlockFifo;
pub use stats::{CounterDeltas, Counters, StatsSink};
pub use vout::VideoOutput;
