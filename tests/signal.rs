// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Signal-driven shutdown, end to end: a steady pipeline receives SIGINT
//! mid-run and every stage exits cleanly.
//!
//! This test runs without the libtest harness (`harness = false` in
//! Cargo.toml) so that `main` can block the signal mask before any other
//! thread exists; a process-directed SIGINT then stays pending until the
//! pipeline's signal thread consumes it, instead of killing the process.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use avrec::config::Size;
use avrec::encode::EncoderConfig;
use avrec::session::{run_pipeline, PipelineDevices, PipelineOptions, Session};
use avrec::testutil::{SharedWriter, SyntheticCamera, SyntheticEncoder, SyntheticPcm};
use base::clock::RealClocks;
use nix::sys::signal::{self, SigSet, Signal};
use nix::unistd::Pid;

fn main() {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block().expect("block signals");

    avrec::testutil::init();

    let session = Arc::new(Session::new(RealClocks {}, 30));
    let video_out = SharedWriter::new();
    let audio_out = SharedWriter::new();
    let video_bytes = video_out.bytes();
    let audio_bytes = audio_out.bytes();

    let killer = thread::spawn(|| {
        thread::sleep(Duration::from_millis(500));
        signal::kill(Pid::this(), Signal::SIGINT).expect("deliver SIGINT");
    });

    let started = std::time::Instant::now();
    run_pipeline(
        &session,
        PipelineDevices {
            camera: Box::new(
                SyntheticCamera::new(64, 48).with_interval(Duration::from_micros(33_333)),
            ),
            encoder: Box::new(SyntheticEncoder::new(16)),
            pcm: Box::new(SyntheticPcm::new(48_000, 2).with_real_pacing()),
            video_out,
            audio_out,
        },
        &EncoderConfig::new(
            Size {
                width: 64,
                height: 48,
            },
            30,
            1_000_000,
        ),
        48_000,
        2,
        PipelineOptions {
            duration_sec: 0,
            signals: Some(mask),
            spawn_stats: true,
        },
    )
    .expect("pipeline runs");
    let elapsed = started.elapsed();
    killer.join().expect("killer thread");

    assert!(session.is_stopped(), "signal must stop the session");
    assert!(!session.is_failed(), "signal shutdown is not a failure");
    // Shutdown promptly after the 500 ms signal; the queues closed and every
    // stage drained instead of deadlocking.
    assert!(
        elapsed < Duration::from_secs(5),
        "shutdown took {elapsed:?}"
    );
    assert!(
        !video_bytes.lock().is_empty(),
        "video flowed before the signal"
    );
    assert!(
        !audio_bytes.lock().is_empty(),
        "audio flowed before the signal"
    );
    println!("signal shutdown ok after {elapsed:?}");
}
