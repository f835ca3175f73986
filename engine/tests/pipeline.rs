/// End-to-end pipeline tests: mock codecs and sinks around real decoder
/// workers and a real video output, checking timing, ordering, preroll,
/// pacing and flush behaviour across the whole decode path.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{
    Block, CLOCK_FREQ, CodecId, EngineError, EsCategory, EsFormat, PixelFormat, RATE_DEFAULT,
    Rate, ReplayGain, Tick, codec,
};
use kanade::clock::{self, MasterClock, OffsetClock};
use kanade::codec::{Codec, CodecLoader, DecoderHost};
use kanade::config::EngineConfig;
use kanade::decoder::{Decoder, DecoderParams};
use kanade::sink::{AudioSink, NullBackend, ResourcePool, VideoSink};
use kanade::stats::{Counters, StatsSink};
use kanade::vout::VideoOutput;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_for(mut probe: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

// ---- Mock collaborators ----------------------------------------------------

#[derive(Default)]
struct RecordingAudioSink {
    played: Mutex<Vec<(Tick, Rate)>>,
    flushes: AtomicUsize,
    drains: AtomicUsize,
}

impl RecordingAudioSink {
    fn played(&self) -> Vec<(Tick, Rate)> {
        self.played.lock().unwrap().clone()
    }
}

impl AudioSink for RecordingAudioSink {
    fn play(&self, frame: Block, rate: Rate) -> Result<(), EngineError> {
        self.played.lock().unwrap().push((frame.pts, rate));
        Ok(())
    }

    fn flush(&self, wait: bool) {
        if wait {
            self.drains.fetch_add(1, Ordering::SeqCst);
        } else {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn change_pause(&self, _paused: bool, _date: Tick) {}

    fn reset_lost(&self) -> u64 {
        0
    }
}

struct TestPool {
    audio: Arc<RecordingAudioSink>,
    video: Mutex<Option<Arc<VideoOutput>>>,
    video_requests: AtomicUsize,
}

impl TestPool {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            audio: Arc::new(RecordingAudioSink::default()),
            video: Mutex::new(None),
            video_requests: AtomicUsize::new(0),
        })
    }
}

impl ResourcePool for TestPool {
    fn get_audio(
        &self,
        _fmt: &common::AudioFormat,
        _gain: &ReplayGain,
    ) -> Option<Arc<dyn AudioSink>> {
        Some(Arc::clone(&self.audio) as Arc<dyn AudioSink>)
    }

    fn put_audio(&self, _sink: Arc<dyn AudioSink>) {}

    fn request_video(
        &self,
        _previous: Option<Arc<dyn VideoSink>>,
        fmt: Option<&common::VideoFormat>,
        _dpb: usize,
        _recycle: bool,
    ) -> Option<Arc<dyn VideoSink>> {
        fmt?;
        self.video_requests.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.video.lock().unwrap();
        if slot.is_none() {
            *slot = Some(VideoOutput::new(
                64,
                64,
                &EngineConfig::default(),
                Box::new(NullBackend),
            ));
        }
        slot.clone().map(|v| v as Arc<dyn VideoSink>)
    }

    fn hold_video(&self) -> Option<Arc<dyn VideoSink>> {
        self.video
            .lock()
            .unwrap()
            .clone()
            .map(|v| v as Arc<dyn VideoSink>)
    }
}

struct TestLoader {
    loads: Mutex<Vec<(CodecId, bool)>>,
    factory: Box<dyn Fn(&EsFormat, bool) -> Option<Box<dyn Codec>> + Send + Sync>,
}

impl TestLoader {
    fn new(
        factory: impl Fn(&EsFormat, bool) -> Option<Box<dyn Codec>> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            loads: Mutex::new(Vec::new()),
            factory: Box::new(factory),
        })
    }

    fn decoder_loads(&self) -> Vec<CodecId> {
        self.loads
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, packetizer)| !packetizer)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl CodecLoader for TestLoader {
    fn load(&self, fmt: &EsFormat, packetizer: bool) -> Option<Box<dyn Codec>> {
        let module = (self.factory)(fmt, packetizer)?;
        self.loads.lock().unwrap().push((fmt.codec, packetizer));
        Some(module)
    }
}

/// Pass-through audio codec: one output frame per input block, allocated
/// through the host so sink negotiation happens like a real plugin.
struct PassAudio {
    fmt_out: EsFormat,
}

impl PassAudio {
    fn boxed(fmt_out: EsFormat) -> Box<dyn Codec> {
        Box::new(Self { fmt_out })
    }
}

impl Codec for PassAudio {
    fn output_format(&self) -> EsFormat {
        self.fmt_out.clone()
    }

    fn decode_audio(&mut self, host: &dyn DecoderHost, block: &mut Option<Block>) -> Option<Block> {
        let input = block.take()?;
        if input.flags.corrupted {
            return None;
        }
        let mut frame = host.new_audio_buffer(&self.fmt_out, input.samples.max(1))?;
        frame.pts = input.pts;
        frame.duration = input.duration;
        Some(frame)
    }
}

/// Pass-through video codec: one gray picture per input block.
struct PassVideo {
    fmt_out: EsFormat,
}

impl Codec for PassVideo {
    fn output_format(&self) -> EsFormat {
        self.fmt_out.clone()
    }

    fn decode_video(
        &mut self,
        host: &dyn DecoderHost,
        block: &mut Option<Block>,
    ) -> Option<kanade::vout::heap::PictureRef> {
        let input = block.take()?;
        if input.flags.corrupted {
            return None;
        }
        let mut pic = host.new_picture(&self.fmt_out, 0)?;
        pic.write(|data| data.fill(0x80));
        pic.date = input.pts;
        Some(pic)
    }
}

/// Packetiser that passes blocks through and flips its output codec after
/// the third one.
struct SwitchingPacketizer {
    fmt_a: EsFormat,
    fmt_b: EsFormat,
    emitted: usize,
}

impl Codec for SwitchingPacketizer {
    fn output_format(&self) -> EsFormat {
        if self.emitted <= 3 {
            self.fmt_a.clone()
        } else {
            self.fmt_b.clone()
        }
    }

    fn packetize(&mut self, block: &mut Option<Block>) -> Option<Vec<Block>> {
        let unit = block.take()?;
        if unit.flags.corrupted {
            return None;
        }
        self.emitted += 1;
        Some(vec![unit])
    }
}

fn audio_fmt(id: CodecId) -> EsFormat {
    let mut fmt = EsFormat::new(EsCategory::Audio, id);
    fmt.packetized = true;
    fmt.audio.sample_rate = 48_000;
    fmt.audio.channels = 2;
    fmt
}

fn video_fmt() -> EsFormat {
    let mut fmt = EsFormat::new(EsCategory::Video, codec::MPGV);
    fmt.packetized = true;
    fmt.video.pixel = PixelFormat::Yuv420;
    fmt.video.width = 32;
    fmt.video.height = 32;
    fmt
}

fn identity_clock() -> Option<Arc<dyn MasterClock>> {
    Some(Arc::new(OffsetClock::default()) as Arc<dyn MasterClock>)
}

fn audio_decoder(pool: Arc<TestPool>, loader: Arc<TestLoader>) -> Decoder {
    Decoder::new(DecoderParams {
        fmt: audio_fmt(codec::MP4A),
        clock: identity_clock(),
        pool,
        loader,
        stats: None,
        config: EngineConfig::default(),
    })
    .expect("audio codec available")
}

fn audio_block(pts: Tick) -> Block {
    let mut block = Block::new(vec![1u8; 16]).with_pts(pts).with_duration(1_000);
    block.samples = 48;
    block
}

// ---- Scenarios -------------------------------------------------------------

#[test]
fn test_monotone_audio_reaches_sink_in_order() {
    init_logging();
    let pool = TestPool::new();
    let loader = TestLoader::new(|fmt, packetizer| {
        (!packetizer).then(|| PassAudio::boxed(fmt.clone()))
    });
    let decoder = audio_decoder(Arc::clone(&pool), loader);

    for pts in [1_000, 2_000, 3_000, 4_000, 5_000] {
        decoder.enqueue(audio_block(pts), true);
    }
    decoder.drain();

    assert!(wait_for(|| decoder.is_empty(), Duration::from_secs(2)));
    // The identity clock translates every timestamp to itself, so order
    // and values carry through unchanged.
    let played = pool.audio.played();
    assert_eq!(
        played,
        vec![
            (1_000, RATE_DEFAULT),
            (2_000, RATE_DEFAULT),
            (3_000, RATE_DEFAULT),
            (4_000, RATE_DEFAULT),
            (5_000, RATE_DEFAULT),
        ]
    );
    assert_eq!(pool.audio.drains.load(Ordering::SeqCst), 1);

    // Empty stays empty until the next enqueue, which clears the drained
    // state until the stream drains again.
    assert!(decoder.is_empty());
    decoder.enqueue(audio_block(6_000), true);
    assert!(!decoder.is_empty());
    decoder.drain();
    assert!(wait_for(|| decoder.is_empty(), Duration::from_secs(2)));
    assert_eq!(pool.audio.played().len(), 6);
}

#[test]
fn test_flush_interrupts_wait_and_is_idempotent() {
    init_logging();
    let pool = TestPool::new();
    let loader = TestLoader::new(|fmt, packetizer| {
        (!packetizer).then(|| PassAudio::boxed(fmt.clone()))
    });
    let decoder = audio_decoder(Arc::clone(&pool), loader);

    // A buffer due well in the future parks the worker in its dated wait.
    let future_pts = clock::now() + 18 * CLOCK_FREQ / 10;
    decoder.enqueue(audio_block(future_pts), true);
    thread::sleep(Duration::from_millis(150));

    let start = Instant::now();
    decoder.flush();
    assert!(
        start.elapsed() < Duration::from_millis(500),
        "flush blocked on the dated wait: {:?}",
        start.elapsed()
    );
    assert!(pool.audio.played().is_empty());

    // Flushing again immediately observes the same state.
    let start = Instant::now();
    decoder.flush();
    assert!(start.elapsed() < Duration::from_millis(500));
    assert!(pool.audio.played().is_empty());
}

#[test]
fn test_preroll_skips_below_boundary_and_flushes_once() {
    init_logging();
    let pool = TestPool::new();
    let loader = TestLoader::new(|fmt, packetizer| {
        (!packetizer).then(|| PassAudio::boxed(fmt.clone()))
    });
    let decoder = audio_decoder(Arc::clone(&pool), loader);

    for pts in [1_000, 2_000, 3_000] {
        let mut block = audio_block(pts);
        block.flags.preroll = true;
        decoder.enqueue(block, true);
    }
    decoder.enqueue(audio_block(4_000), true);
    decoder.enqueue(audio_block(5_000), true);
    decoder.drain();

    assert!(wait_for(|| decoder.is_empty(), Duration::from_secs(2)));
    // Nothing below the boundary is presented; crossing it flushes the
    // sink exactly once.
    assert_eq!(
        pool.audio.played(),
        vec![(4_000, RATE_DEFAULT), (5_000, RATE_DEFAULT)]
    );
    assert_eq!(pool.audio.flushes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_packetizer_format_change_reloads_codec() {
    init_logging();
    let pool = TestPool::new();
    let fmt_a = audio_fmt(codec::MPGA);
    let fmt_b = audio_fmt(codec::MP4A);
    let loader = {
        let (fmt_a, fmt_b) = (fmt_a.clone(), fmt_b.clone());
        TestLoader::new(move |fmt, packetizer| {
            if packetizer {
                Some(Box::new(SwitchingPacketizer {
                    fmt_a: fmt_a.clone(),
                    fmt_b: fmt_b.clone(),
                    emitted: 0,
                }) as Box<dyn Codec>)
            } else {
                Some(PassAudio::boxed(fmt.clone()))
            }
        })
    };

    let mut input = audio_fmt(codec::MPGA);
    input.packetized = false;
    let decoder = Decoder::new(DecoderParams {
        fmt: input,
        clock: identity_clock(),
        pool: Arc::clone(&pool) as Arc<dyn ResourcePool>,
        loader: Arc::clone(&loader) as Arc<dyn CodecLoader>,
        stats: None,
        config: EngineConfig::default(),
    })
    .unwrap();

    for pts in [1_000, 2_000, 3_000, 4_000, 5_000] {
        decoder.enqueue(audio_block(pts), true);
    }
    decoder.drain();

    assert!(wait_for(|| decoder.is_empty(), Duration::from_secs(2)));
    // Blocks 4 and 5 decode through the reloaded codec.
    assert_eq!(pool.audio.played().len(), 5);
    assert_eq!(loader.decoder_loads(), vec![codec::MPGA, codec::MP4A]);
    assert!(!decoder.has_failed());
    assert!(decoder.format_changed().is_some());
}

#[test]
fn test_unsupported_format_errors_stream_but_flush_still_works() {
    init_logging();
    let pool = TestPool::new();
    let fmt_a = audio_fmt(codec::MPGA);
    let fmt_b = audio_fmt(codec::UNDF);
    let loader = {
        let (fmt_a, fmt_b) = (fmt_a.clone(), fmt_b.clone());
        TestLoader::new(move |fmt, packetizer| {
            if packetizer {
                Some(Box::new(SwitchingPacketizer {
                    fmt_a: fmt_a.clone(),
                    fmt_b: fmt_b.clone(),
                    emitted: 0,
                }) as Box<dyn Codec>)
            } else if fmt.codec == codec::UNDF {
                None
            } else {
                Some(PassAudio::boxed(fmt.clone()))
            }
        })
    };

    let mut input = audio_fmt(codec::MPGA);
    input.packetized = false;
    let decoder = Decoder::new(DecoderParams {
        fmt: input,
        clock: identity_clock(),
        pool: Arc::clone(&pool) as Arc<dyn ResourcePool>,
        loader: Arc::clone(&loader) as Arc<dyn CodecLoader>,
        stats: None,
        config: EngineConfig::default(),
    })
    .unwrap();

    for pts in [1_000, 2_000, 3_000, 4_000, 5_000] {
        decoder.enqueue(audio_block(pts), true);
    }

    assert!(wait_for(|| decoder.has_failed(), Duration::from_secs(2)));
    // The errored stream keeps accepting flush; the worker stays alive.
    decoder.flush();
    assert_eq!(pool.audio.played().len(), 3);
}

#[test]
fn test_paced_enqueue_blocks_until_worker_drains() {
    init_logging();
    let pool = TestPool::new();
    let loader = TestLoader::new(|fmt, packetizer| {
        (!packetizer).then(|| PassAudio::boxed(fmt.clone()))
    });
    let decoder = Arc::new(audio_decoder(Arc::clone(&pool), loader));

    // Pausing parks the worker mid-unit, so the FIFO backs up.
    decoder.change_pause(true, clock::now());

    let done = Arc::new(AtomicBool::new(false));
    let producer = {
        let decoder = Arc::clone(&decoder);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for pts in 1..=12 {
                decoder.enqueue(audio_block(pts * 1_000), true);
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(300));
    assert!(
        !done.load(Ordering::SeqCst),
        "paced producer should be blocked at the FIFO bound"
    );
    assert!(decoder.fifo_size() > 0);

    decoder.change_pause(false, clock::now());
    producer.join().unwrap();
    assert!(done.load(Ordering::SeqCst));

    decoder.drain();
    assert!(wait_for(|| decoder.is_empty(), Duration::from_secs(2)));
    assert_eq!(pool.audio.played().len(), 12);
}

#[test]
fn test_video_pipeline_displays_pictures() {
    init_logging();
    let pool = TestPool::new();
    let loader = TestLoader::new(|fmt, packetizer| {
        (!packetizer).then(|| Box::new(PassVideo { fmt_out: fmt.clone() }) as Box<dyn Codec>)
    });
    let stats = Arc::new(Counters::default());

    let decoder = Decoder::new(DecoderParams {
        fmt: video_fmt(),
        clock: identity_clock(),
        pool: Arc::clone(&pool) as Arc<dyn ResourcePool>,
        loader,
        stats: Some(Arc::clone(&stats) as Arc<dyn StatsSink>),
        config: EngineConfig::default(),
    })
    .unwrap();

    let base = clock::now() + CLOCK_FREQ / 10;
    for i in 0..3i64 {
        decoder.enqueue(
            Block::new(vec![2u8; 32]).with_pts(base + i * 40_000),
            true,
        );
    }

    assert!(wait_for(|| decoder.is_empty(), Duration::from_secs(3)));
    assert_eq!(stats.totals().video_decoded, 3);
    assert_eq!(pool.video_requests.load(Ordering::SeqCst), 1);
    drop(decoder);
}

#[test]
fn test_wait_gate_holds_output_until_released() {
    init_logging();
    let pool = TestPool::new();
    let loader = TestLoader::new(|fmt, packetizer| {
        (!packetizer).then(|| PassAudio::boxed(fmt.clone()))
    });
    let decoder = audio_decoder(Arc::clone(&pool), loader);

    decoder.start_wait();
    decoder.enqueue(audio_block(1_000), true);
    decoder.wait_until_data();

    // The gate is closed: the unit is decoded but not yet presented.
    assert!(pool.audio.played().is_empty());

    decoder.stop_wait();
    assert!(wait_for(
        || pool.audio.played().len() == 1,
        Duration::from_secs(2)
    ));
}
