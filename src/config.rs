// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Recording session configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::{info, warn};

pub const DEFAULT_VIDEO_DEVICE: &str = "/dev/video0";
pub const DEFAULT_SIZE: Size = Size {
    width: 1280,
    height: 720,
};
pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_BITRATE_BPS: u32 = 2_000_000;
pub const DEFAULT_AUDIO_DEVICE: &str = "hw:0.0";
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_CHANNELS: u16 = 2;
pub const DEFAULT_DURATION_SEC: u32 = 20;
pub const DEFAULT_VIDEO_OUT: &str = "output.h264";
pub const DEFAULT_AUDIO_OUT: &str = "output.pcm";

/// Capture geometry, parsed from a `WxH` argument.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Size {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WxH, got {s:?}"))?;
        let width: u32 = w.parse().map_err(|_| format!("bad width {w:?}"))?;
        let height: u32 = h.parse().map_err(|_| format!("bad height {h:?}"))?;
        if width == 0 || height == 0 {
            return Err(format!("size must be positive, got {s:?}"));
        }
        Ok(Size { width, height })
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Everything a recording session needs to know, post-validation.
#[derive(Clone, Debug)]
pub struct Config {
    pub video_device: String,
    pub size: Size,
    pub fps: u32,
    pub bitrate_bps: u32,

    pub audio_device: String,
    pub sample_rate: u32,
    pub channels: u16,

    /// 0 means record until a signal arrives.
    pub duration_sec: u32,
    pub video_out: PathBuf,
    pub audio_out: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            video_device: DEFAULT_VIDEO_DEVICE.to_owned(),
            size: DEFAULT_SIZE,
            fps: DEFAULT_FPS,
            bitrate_bps: DEFAULT_BITRATE_BPS,
            audio_device: DEFAULT_AUDIO_DEVICE.to_owned(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            duration_sec: DEFAULT_DURATION_SEC,
            video_out: DEFAULT_VIDEO_OUT.into(),
            audio_out: DEFAULT_AUDIO_OUT.into(),
        }
    }
}

impl Config {
    /// Substitutes defaults for out-of-range numeric settings, warning about
    /// each. Geometry can't be repaired and is rejected at parse time.
    pub fn sanitize(&mut self) {
        if self.fps == 0 {
            warn!("fps must be positive; using {}", DEFAULT_FPS);
            self.fps = DEFAULT_FPS;
        }
        if self.bitrate_bps == 0 {
            warn!("bitrate must be positive; using {}", DEFAULT_BITRATE_BPS);
            self.bitrate_bps = DEFAULT_BITRATE_BPS;
        }
        if self.sample_rate == 0 {
            warn!("sample rate must be positive; using {}", DEFAULT_SAMPLE_RATE);
            self.sample_rate = DEFAULT_SAMPLE_RATE;
        }
        if self.channels == 0 {
            warn!("channel count must be positive; using {}", DEFAULT_CHANNELS);
            self.channels = DEFAULT_CHANNELS;
        }
    }

    /// Logs the effective configuration before the pipeline starts.
    pub fn log_summary(&self) {
        info!(
            "video: dev={} size={} fps={} bitrate={}",
            self.video_device, self.size, self.fps, self.bitrate_bps
        );
        info!(
            "audio: dev={} sr={} ch={}",
            self.audio_device, self.sample_rate, self.channels
        );
        info!(
            "out: h264={} pcm={} sec={}",
            self.video_out.display(),
            self.audio_out.display(),
            self.duration_sec
        );
    }
}
