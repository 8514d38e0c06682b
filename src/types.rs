// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The owned items that move through the pipeline queues.
//!
//! Each value has a single owner at every instant: the producing stage before
//! push, the queue while enqueued, the consuming stage after pop. Dropping a
//! value releases its buffer; nothing is shared.

use std::fmt;

/// A raw captured picture in the encoder's expected layout: the full luma
/// plane followed immediately by the interleaved chroma plane.
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,

    /// Monotonic time at which the capture stage dequeued this picture, µs.
    /// Carried unchanged through encoding; all downstream timing measurements
    /// key off this value.
    pub pts_us: u64,

    /// Monotonically increasing, assigned by the capture stage.
    pub frame_id: u64,
}

impl VideoFrame {
    /// Minimum byte size of a frame of the given geometry (4:2:0, 8-bit).
    pub fn expected_size(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3 / 2
    }
}

/// Custom `Debug` impl that skips the pixel payload.
impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("len", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("pts_us", &self.pts_us)
            .field("frame_id", &self.frame_id)
            .finish()
    }
}

/// One compressed video access unit as produced by the encoder.
pub struct EncodedPacket {
    pub data: Vec<u8>,

    /// Copied from the source [`VideoFrame`], never regenerated.
    pub pts_us: u64,

    /// `false` when the encoder doesn't report the flag.
    pub is_keyframe: bool,
}

impl fmt::Debug for EncodedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedPacket")
            .field("len", &self.data.len())
            .field("pts_us", &self.pts_us)
            .field("is_keyframe", &self.is_keyframe)
            .finish()
    }
}

/// One period of interleaved PCM samples.
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: u16,

    /// Per-channel frame count. `data.len()` is always
    /// `frames * channels * bytes_per_sample` (the final read may be short).
    pub frames: u32,

    /// Sample-counted: first chunk is stamped from the monotonic clock, each
    /// successor advances by its predecessors' frame total.
    pub pts_us: u64,
}

impl fmt::Debug for AudioChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioChunk")
            .field("len", &self.data.len())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("frames", &self.frames)
            .field("pts_us", &self.pts_us)
            .finish()
    }
}
