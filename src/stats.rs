// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Contention-free pipeline counters, drained once per second.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-second counters. Increments are relaxed; totals are approximate over
/// the one-second window, which is all the stats line needs.
#[derive(Default)]
pub struct Stats {
    video_frames: AtomicU64,
    enc_bytes: AtomicU64,
    audio_chunks: AtomicU64,
    drops: AtomicU64,
}

/// One drained window of counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatsWindow {
    pub video_frames: u64,
    pub enc_bytes: u64,
    pub audio_chunks: u64,
    pub drops: u64,
}

impl StatsWindow {
    /// Encoded bitrate over the window, in kbit/s.
    pub fn enc_kbps(&self) -> u64 {
        self.enc_bytes * 8 / 1000
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_video_frame(&self) {
        self.video_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_enc_bytes(&self, n: u64) {
        self.enc_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_audio_chunk(&self) {
        self.audio_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_drops(&self, n: u64) {
        self.drops.fetch_add(n, Ordering::Relaxed);
    }

    /// Atomically drains every counter to zero, returning the window totals.
    pub fn take_window(&self) -> StatsWindow {
        StatsWindow {
            video_frames: self.video_frames.swap(0, Ordering::Relaxed),
            enc_bytes: self.enc_bytes.swap(0, Ordering::Relaxed),
            audio_chunks: self.audio_chunks.swap(0, Ordering::Relaxed),
            drops: self.drops.swap(0, Ordering::Relaxed),
        }
    }
}
