// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use avrec::config::{
    Config, Size, DEFAULT_AUDIO_DEVICE, DEFAULT_AUDIO_OUT, DEFAULT_BITRATE_BPS,
    DEFAULT_CHANNELS, DEFAULT_DURATION_SEC, DEFAULT_FPS, DEFAULT_SAMPLE_RATE, DEFAULT_SIZE,
    DEFAULT_VIDEO_DEVICE, DEFAULT_VIDEO_OUT,
};
use avrec::session;
use bpaf::{Bpaf, Parser};
use tracing::{debug, error};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn video_dev() -> impl Parser<String> {
    bpaf::long("video-dev")
        .help("Video capture device node.")
        .argument::<String>("PATH")
        .fallback(DEFAULT_VIDEO_DEVICE.to_owned())
        .debug_fallback()
}

fn size() -> impl Parser<Size> {
    bpaf::long("size")
        .help("Capture size as WxH.")
        .argument::<Size>("WxH")
        .fallback(DEFAULT_SIZE)
        .debug_fallback()
}

fn fps() -> impl Parser<u32> {
    bpaf::long("fps")
        .help("Capture frame rate.")
        .argument::<u32>("N")
        .fallback(DEFAULT_FPS)
        .debug_fallback()
}

fn bitrate() -> impl Parser<u32> {
    bpaf::long("bitrate")
        .help("H.264 target bitrate, bits per second.")
        .argument::<u32>("BPS")
        .fallback(DEFAULT_BITRATE_BPS)
        .debug_fallback()
}

fn audio_dev() -> impl Parser<String> {
    bpaf::long("audio-dev")
        .help("PCM capture device.")
        .argument::<String>("DEV")
        .fallback(DEFAULT_AUDIO_DEVICE.to_owned())
        .debug_fallback()
}

fn sr() -> impl Parser<u32> {
    bpaf::long("sr")
        .help("Audio sample rate, Hz.")
        .argument::<u32>("HZ")
        .fallback(DEFAULT_SAMPLE_RATE)
        .debug_fallback()
}

fn ch() -> impl Parser<u16> {
    bpaf::long("ch")
        .help("Audio channel count.")
        .argument::<u16>("N")
        .fallback(DEFAULT_CHANNELS)
        .debug_fallback()
}

fn sec() -> impl Parser<u32> {
    bpaf::long("sec")
        .help("Recording duration in seconds; 0 records until a signal.")
        .argument::<u32>("N")
        .fallback(DEFAULT_DURATION_SEC)
        .debug_fallback()
}

fn out_h264() -> impl Parser<PathBuf> {
    bpaf::long("out-h264")
        .help("Output file for the raw H.264 elementary stream.")
        .argument::<PathBuf>("FILE")
        .fallback(DEFAULT_VIDEO_OUT.into())
        .debug_fallback()
}

fn out_pcm() -> impl Parser<PathBuf> {
    bpaf::long("out-pcm")
        .help("Output file for the raw PCM samples.")
        .argument::<PathBuf>("FILE")
        .fallback(DEFAULT_AUDIO_OUT.into())
        .debug_fallback()
}

/// avrec: synchronized audio/video recorder with A/V timing metrics.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
struct Args {
    #[bpaf(external)]
    video_dev: String,
    #[bpaf(external)]
    size: Size,
    #[bpaf(external)]
    fps: u32,
    #[bpaf(external)]
    bitrate: u32,
    #[bpaf(external)]
    audio_dev: String,
    #[bpaf(external)]
    sr: u32,
    #[bpaf(external)]
    ch: u16,
    #[bpaf(external)]
    sec: u32,
    #[bpaf(external)]
    out_h264: PathBuf,
    #[bpaf(external)]
    out_pcm: PathBuf,
}

impl From<Args> for Config {
    fn from(a: Args) -> Config {
        Config {
            video_device: a.video_dev,
            size: a.size,
            fps: a.fps,
            bitrate_bps: a.bitrate,
            audio_device: a.audio_dev,
            sample_rate: a.sr,
            channels: a.ch,
            duration_sec: a.sec,
            video_out: a.out_h264,
            audio_out: a.out_pcm,
        }
    }
}

fn main() {
    // If using the clock will fail, find out now *before* trying to log
    // anything (with timestamps...) so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!("clock_gettime failed: {e}\n\nThis indicates a broken environment.");
        std::process::exit(1);
    }

    base::tracing_setup::install();

    let args = args().fallback_to_usage().run();
    tracing::trace!("parsed command-line arguments: {args:#?}");

    let mut config: Config = args.into();
    config.sanitize();
    config.log_summary();

    match session::run(&config) {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {rv}");
            std::process::exit(rv);
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }

    #[test]
    fn args_to_config() {
        let args = super::args()
            .run_inner(&["--size", "640x480", "--fps", "25", "--sec", "0"])
            .unwrap();
        let config: super::Config = args.into();
        assert_eq!(config.size.width, 640);
        assert_eq!(config.fps, 25);
        assert_eq!(config.duration_sec, 0);
        assert_eq!(config.video_device, super::DEFAULT_VIDEO_DEVICE);
        assert_eq!(config.video_out, std::path::PathBuf::from("output.h264"));
    }
}
