// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The recording session and its lifecycle coordinator.
//!
//! A [`Session`] owns everything the stages share: the stop flag, the three
//! queues, the counters, the synchronizer, and the pts-delta diagnostics.
//! [`run_pipeline`] spawns one thread per role (five stages plus the signal,
//! timer, and stats helpers), then joins them in dependency order: capture
//! stages, encode, sinks, stats, signal, timer. Shutdown is cooperative:
//! [`Session::stop`] closes the queues, which unblocks every stage.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use base::clock::{Clocks, RealClocks};
use base::Error;
use base::ErrorKind;
use nix::sys::signal::{self, SigSet, Signal};
use nix::unistd::Pid;
use tracing::{error, info, warn};

use crate::audio::{self, AudioCaptureStage, PcmSource};
use crate::avsync::AvSync;
use crate::capture::{self, Camera, VideoCaptureStage};
use crate::config::Config;
use crate::encode::{self, EncodeStage, Encoder, EncoderConfig};
use crate::queue::Queue;
use crate::sink::{AudioSinkStage, FileWriter, VideoSinkStage};
use crate::stats::Stats;
use crate::types::{AudioChunk, EncodedPacket, VideoFrame};

/// Small on purpose: when the encoder falls behind, new raw frames are
/// dropped rather than ballooning memory.
pub const RAW_QUEUE_CAPACITY: usize = 8;
pub const ENCODED_QUEUE_CAPACITY: usize = 64;
pub const AUDIO_QUEUE_CAPACITY: usize = 256;

/// Shared state for one recording session. Owned by the coordinator; every
/// stage holds an `Arc`.
pub struct Session<C: Clocks + Clone> {
    pub(crate) clocks: C,
    stop: AtomicBool,
    failed: AtomicBool,
    pub(crate) q_raw: Queue<VideoFrame>,
    pub(crate) q_enc: Queue<EncodedPacket>,
    pub(crate) q_aud: Queue<AudioChunk>,
    pub(crate) stats: Stats,
    pub(crate) avsync: AvSync<C>,
    pub(crate) video_pts_delta_us: AtomicU64,
    pub(crate) audio_pts_delta_us: AtomicU64,
}

impl<C: Clocks + Clone> Session<C> {
    pub fn new(clocks: C, video_fps: u32) -> Self {
        Session {
            avsync: AvSync::new(clocks.clone(), video_fps),
            clocks,
            stop: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            q_raw: Queue::with_capacity(RAW_QUEUE_CAPACITY),
            q_enc: Queue::with_capacity(ENCODED_QUEUE_CAPACITY),
            q_aud: Queue::with_capacity(AUDIO_QUEUE_CAPACITY),
            stats: Stats::new(),
            video_pts_delta_us: AtomicU64::new(0),
            audio_pts_delta_us: AtomicU64::new(0),
        }
    }

    /// Requests shutdown: sets the stop flag and closes every queue so each
    /// blocked stage wakes and drains. Idempotent.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            info!("stop requested; closing queues");
        }
        self.q_raw.close();
        self.q_enc.close();
        self.q_aud.close();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Marks the session failed (the process will exit non-zero) and
    /// requests shutdown.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.stop();
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// The devices and outputs one pipeline run consumes.
pub struct PipelineDevices<W1: FileWriter, W2: FileWriter> {
    pub camera: Box<dyn Camera>,
    pub encoder: Box<dyn Encoder>,
    pub pcm: Box<dyn PcmSource>,
    pub video_out: W1,
    pub audio_out: W2,
}

pub struct PipelineOptions {
    /// 0 = run until a signal or failure stops the session.
    pub duration_sec: u32,
    /// Mask for the signal thread to wait on. The caller must have blocked
    /// it on the spawning thread already, so every pipeline thread inherits
    /// the block. `None` skips the signal thread entirely.
    pub signals: Option<SigSet>,
    pub spawn_stats: bool,
}

fn spawn<F: FnOnce() + Send + 'static>(name: &str, f: F) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(f)
        .expect("can't create thread")
}

fn signal_task<C: Clocks + Clone>(mask: SigSet, session: Arc<Session<C>>) {
    match mask.wait() {
        Ok(sig) => {
            // The coordinator self-delivers SIGTERM during shutdown to get
            // this thread out of the wait; stay quiet in that case.
            if !session.is_stopped() {
                info!(signal = sig.as_str(), "received signal; shutting down");
                session.stop();
            }
        }
        Err(e) => {
            warn!(err = %e, "sigwait failed; shutting down");
            session.stop();
        }
    }
}

fn timer_task<C: Clocks + Clone>(session: Arc<Session<C>>, duration_sec: u32) {
    for _ in 0..duration_sec {
        if session.is_stopped() {
            return;
        }
        session.clocks.sleep(Duration::from_secs(1));
    }
    if !session.is_stopped() {
        info!(duration_sec, "recording duration reached; shutting down");
    }
    session.stop();
}

fn fmt_delta(v: u64) -> String {
    if v == 0 {
        "n/a".to_owned()
    } else {
        v.to_string()
    }
}

fn stats_task<C: Clocks + Clone>(session: Arc<Session<C>>) {
    loop {
        session.clocks.sleep(Duration::from_secs(1));
        if session.is_stopped() {
            return;
        }
        let w = session.stats.take_window();
        info!(
            video_fps = w.video_frames,
            enc_kbps = w.enc_kbps(),
            audio_chunks_per_sec = w.audio_chunks,
            drops = w.drops,
            q_raw = session.q_raw.len(),
            q_enc = session.q_enc.len(),
            q_aud = session.q_aud.len(),
            video_pts_delta_us = %fmt_delta(session.video_pts_delta_us.load(Ordering::Relaxed)),
            audio_pts_delta_us = %fmt_delta(session.audio_pts_delta_us.load(Ordering::Relaxed)),
            "stats"
        );
        session
            .avsync
            .report_1s(session.clocks.monotonic_us())
            .log();
    }
}

/// Starts the camera, spawns the five pipeline stages plus the
/// signal/timer/stats helpers, and joins them all. Returns once the session
/// has fully shut down; any items still enqueued are released when the
/// session is dropped.
pub fn run_pipeline<C, W1, W2>(
    session: &Arc<Session<C>>,
    devices: PipelineDevices<W1, W2>,
    enc_cfg: &EncoderConfig,
    sample_rate: u32,
    channels: u16,
    opts: PipelineOptions,
) -> Result<(), Error>
where
    C: Clocks + Clone,
    W1: FileWriter,
    W2: FileWriter,
{
    let mut camera = devices.camera;
    camera.start()?;

    let h_signal = opts.signals.map(|mask| {
        let session = session.clone();
        spawn("signal", move || signal_task(mask, session))
    });
    let h_timer = (opts.duration_sec > 0).then(|| {
        let session = session.clone();
        let duration_sec = opts.duration_sec;
        spawn("timer", move || timer_task(session, duration_sec))
    });
    let h_stats = opts.spawn_stats.then(|| {
        let session = session.clone();
        spawn("stats", move || stats_task(session))
    });

    let vcap = VideoCaptureStage::new(session.clone(), camera, enc_cfg.width, enc_cfg.height);
    let venc = EncodeStage::new(session.clone(), devices.encoder, enc_cfg);
    let vsink = VideoSinkStage::new(session.clone(), devices.video_out);
    let acap = AudioCaptureStage::new(session.clone(), devices.pcm, sample_rate, channels);
    let asink = AudioSinkStage::new(session.clone(), devices.audio_out);

    let h_vcap = spawn("v-cap", move || vcap.run());
    let h_venc = spawn("v-enc", move || venc.run());
    let h_vsink = spawn("v-sink", move || vsink.run());
    let h_acap = spawn("a-cap", move || acap.run());
    let h_asink = spawn("a-sink", move || asink.run());

    // Join order: capture stages, then encode, then sinks, then the helpers.
    h_vcap.join().expect("video capture thread panicked");
    h_acap.join().expect("audio capture thread panicked");
    h_venc.join().expect("encode thread panicked");
    h_vsink.join().expect("video sink thread panicked");
    h_asink.join().expect("audio sink thread panicked");
    if let Some(h) = h_stats {
        h.join().expect("stats thread panicked");
    }
    if let Some(h) = h_signal {
        // The signal thread may still be blocked in sigwait; deliver one
        // final SIGTERM so it returns. If it already consumed a real signal
        // the extra one stays pending-blocked and dies with the process.
        if let Err(e) = signal::kill(Pid::this(), Signal::SIGTERM) {
            warn!(err = %e, "couldn't self-deliver SIGTERM");
        }
        h.join().expect("signal thread panicked");
    }
    if let Some(h) = h_timer {
        h.join().expect("timer thread panicked");
    }
    Ok(())
}

/// Records per the given configuration until the duration elapses or a
/// signal arrives. Returns the process exit code.
pub fn run(config: &Config) -> Result<i32, Error> {
    // Block the termination signals before any thread exists so every
    // thread inherits the mask and only the signal thread consumes them.
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block()
        .map_err(|e| Error::with_source(ErrorKind::Internal, "block signals", e))?;

    let camera = capture::open_camera(config)?;
    let enc_cfg = EncoderConfig::new(config.size, config.fps, config.bitrate_bps);
    let encoder = encode::open_encoder(&enc_cfg)?;
    let pcm = audio::open_pcm(config)?;
    let video_out = std::fs::File::create(&config.video_out).map_err(|e| {
        Error::with_source(
            ErrorKind::Unavailable,
            format!("create {}", config.video_out.display()),
            e,
        )
    })?;
    let audio_out = std::fs::File::create(&config.audio_out).map_err(|e| {
        Error::with_source(
            ErrorKind::Unavailable,
            format!("create {}", config.audio_out.display()),
            e,
        )
    })?;

    let session = Arc::new(Session::new(RealClocks {}, config.fps));
    run_pipeline(
        &session,
        PipelineDevices {
            camera,
            encoder,
            pcm,
            video_out,
            audio_out,
        },
        &enc_cfg,
        config.sample_rate,
        config.channels,
        PipelineOptions {
            duration_sec: config.duration_sec,
            signals: Some(mask),
            spawn_stats: true,
        },
    )?;

    let out_len = |p: &std::path::Path| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
    info!(
        video_out = %config.video_out.display(),
        video_bytes = out_len(&config.video_out),
        audio_out = %config.audio_out.display(),
        audio_bytes = out_len(&config.audio_out),
        "recording finished"
    );
    if session.is_failed() {
        error!("session ended after a failure");
        return Ok(1);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Size;
    use crate::testutil::{self, SharedWriter, SyntheticCamera, SyntheticEncoder, SyntheticPcm};
    use base::clock::SimulatedClocks;

    fn enc_cfg() -> EncoderConfig {
        EncoderConfig::new(
            Size {
                width: 64,
                height: 48,
            },
            30,
            1_000_000,
        )
    }

    fn packet_ids(bytes: &[u8], packet_len: usize) -> Vec<u64> {
        assert_eq!(bytes.len() % packet_len, 0);
        bytes
            .chunks_exact(packet_len)
            .map(|p| u64::from_le_bytes(p[..8].try_into().unwrap()))
            .collect()
    }

    #[test]
    fn stop_is_idempotent() {
        let session = Arc::new(Session::new(SimulatedClocks::new(), 30));
        assert!(!session.is_stopped());
        for _ in 0..3 {
            session.stop();
            assert!(session.is_stopped());
            assert!(session.q_raw.is_closed());
            assert!(session.q_enc.is_closed());
            assert!(session.q_aud.is_closed());
        }
        assert!(!session.is_failed());
    }

    /// A timed run with synthetic devices: every captured frame comes out
    /// the other end, in order, with nothing dropped, and the offset locks.
    #[test]
    fn clean_timed_run() {
        testutil::init();
        let session = Arc::new(Session::new(RealClocks {}, 30));
        let video_out = SharedWriter::new();
        let audio_out = SharedWriter::new();
        let video_bytes = video_out.bytes();
        let audio_bytes = audio_out.bytes();

        run_pipeline(
            &session,
            PipelineDevices {
                camera: Box::new(
                    SyntheticCamera::new(64, 48)
                        .with_frame_limit(45)
                        .with_interval(Duration::from_micros(33_333)),
                ),
                encoder: Box::new(SyntheticEncoder::new(16)),
                pcm: Box::new(SyntheticPcm::new(48_000, 2).with_real_pacing()),
                video_out,
                audio_out,
            },
            &enc_cfg(),
            48_000,
            2,
            PipelineOptions {
                duration_sec: 2,
                signals: None,
                spawn_stats: false,
            },
        )
        .unwrap();

        assert!(session.is_stopped());
        assert!(!session.is_failed());

        let w = session.stats.take_window();
        assert_eq!(w.video_frames, 45);
        assert_eq!(w.drops, 0);
        // ~93 chunks in 2 s at 1024 frames / 48 kHz; allow scheduling slack.
        assert!(
            (40..=110).contains(&w.audio_chunks),
            "audio_chunks = {}",
            w.audio_chunks
        );

        let video = video_bytes.lock().clone();
        let ids = packet_ids(&video, 16);
        assert_eq!(ids.len(), 45);
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "out of order: {ids:?}");
        assert_eq!(
            audio_bytes.lock().len() as u64,
            w.audio_chunks * 1024 * 4
        );

        // Both sinks reported, so the offset is locked and a report carries
        // an offset sample.
        assert!(session.avsync.offset_us().is_some());
        let r = session
            .avsync
            .report_1s(session.clocks.monotonic_us());
        assert!(r.av_offset_ms.is_some());
        assert!(r.offset_locked);
    }

    /// An encoder slower than the capture rate saturates the small raw queue;
    /// the capture stage drops the newest frames, and what does come out
    /// stays ordered by source pts.
    #[test]
    fn slow_encoder_drops_and_preserves_order() {
        testutil::init();
        let session = Arc::new(Session::new(RealClocks {}, 30));
        let video_out = SharedWriter::new();
        let video_bytes = video_out.bytes();

        run_pipeline(
            &session,
            PipelineDevices {
                camera: Box::new(
                    SyntheticCamera::new(64, 48)
                        .with_frame_limit(30)
                        .with_interval(Duration::from_micros(33_333)),
                ),
                encoder: Box::new(
                    SyntheticEncoder::new(16).with_delay(Duration::from_millis(50)),
                ),
                pcm: Box::new(SyntheticPcm::new(48_000, 2).with_real_pacing()),
                video_out,
                audio_out: SharedWriter::new(),
            },
            &enc_cfg(),
            48_000,
            2,
            PipelineOptions {
                duration_sec: 3,
                signals: None,
                spawn_stats: false,
            },
        )
        .unwrap();

        let w = session.stats.take_window();
        assert!(w.drops > 0, "expected drops, got {w:?}");
        let ids = packet_ids(&video_bytes.lock(), 16);
        assert_eq!(ids.len() as u64, w.video_frames);
        assert_eq!(w.video_frames + w.drops, 30);
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "out of order: {ids:?}");
    }

    /// Stopping mid-flow closes the queues and every stage exits promptly;
    /// whatever was in flight is either written or released on drop.
    #[test]
    fn external_stop_unblocks_all_stages() {
        testutil::init();
        let session = Arc::new(Session::new(RealClocks {}, 30));
        let stopper = {
            let session = session.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                session.stop();
            })
        };
        run_pipeline(
            &session,
            PipelineDevices {
                camera: Box::new(
                    SyntheticCamera::new(64, 48)
                        .with_interval(Duration::from_micros(33_333)),
                ),
                encoder: Box::new(SyntheticEncoder::new(16)),
                pcm: Box::new(SyntheticPcm::new(48_000, 2).with_real_pacing()),
                video_out: SharedWriter::new(),
                audio_out: SharedWriter::new(),
            },
            &enc_cfg(),
            48_000,
            2,
            PipelineOptions {
                duration_sec: 0,
                signals: None,
                spawn_stats: true,
            },
        )
        .unwrap();
        stopper.join().unwrap();
        assert!(session.is_stopped());
        assert!(!session.is_failed());
    }
}
