// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! File sinks: append each stream's bytes to disk, feed the synchronizer,
//! and publish inter-packet pts deltas for the stats line.
//!
//! The sinks are the last observers of each stream, so their view of the
//! timestamps is what the synchronizer measures.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base::clock::{Clocks, TimerGuard};
use tracing::{info, warn};

use crate::session::Session;

/// As in `std::fs::File`, the two operations sinks need.
/// This is a trait for test injection.
pub trait FileWriter: Send + 'static {
    /// As in `std::io::Write::write`.
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error>;

    /// As in `std::fs::File::sync_all`.
    fn sync_all(&self) -> Result<(), io::Error>;
}

impl FileWriter for std::fs::File {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        io::Write::write(self, buf)
    }

    fn sync_all(&self) -> Result<(), io::Error> {
        std::fs::File::sync_all(self)
    }
}

/// Writes one buffer, warning and requesting shutdown on a short or failed
/// write. Returns whether the write was complete.
fn write_or_stop<C: Clocks + Clone, W: FileWriter>(
    session: &Session<C>,
    out: &mut W,
    label: &str,
    data: &[u8],
) -> bool {
    let _t = TimerGuard::new(&session.clocks, || {
        format!("writing {} bytes to {label}", data.len())
    });
    match out.write(data) {
        Ok(n) if n == data.len() => true,
        Ok(n) => {
            warn!(
                wrote = n,
                len = data.len(),
                "partial write to {label}; requesting shutdown"
            );
            session.stop();
            false
        }
        Err(e) => {
            warn!(err = %e, "write to {label} failed; requesting shutdown");
            session.stop();
            false
        }
    }
}

/// The video sink stage: encoded packets to the elementary-stream file.
pub struct VideoSinkStage<C: Clocks + Clone, W: FileWriter> {
    session: Arc<Session<C>>,
    out: W,
    last_pts_us: Option<u64>,
}

impl<C: Clocks + Clone, W: FileWriter> VideoSinkStage<C, W> {
    pub fn new(session: Arc<Session<C>>, out: W) -> Self {
        VideoSinkStage {
            session,
            out,
            last_pts_us: None,
        }
    }

    pub fn run(mut self) {
        info!("video sink running");
        while let Some(pkt) = self.session.q_enc.pop() {
            if let Some(prev) = self.last_pts_us {
                if pkt.pts_us > prev {
                    self.session
                        .video_pts_delta_us
                        .store(pkt.pts_us - prev, Ordering::Relaxed);
                }
            }
            self.last_pts_us = Some(pkt.pts_us);
            self.session.avsync.on_video(pkt.pts_us);
            write_or_stop(&self.session, &mut self.out, "video output", &pkt.data);
        }
        if let Err(e) = self.out.sync_all() {
            warn!(err = %e, "sync of video output failed");
        }
        info!("video sink exiting");
    }
}

/// The audio sink stage: PCM chunks to the raw sample file.
pub struct AudioSinkStage<C: Clocks + Clone, W: FileWriter> {
    session: Arc<Session<C>>,
    out: W,
    last_pts_us: Option<u64>,
}

impl<C: Clocks + Clone, W: FileWriter> AudioSinkStage<C, W> {
    pub fn new(session: Arc<Session<C>>, out: W) -> Self {
        AudioSinkStage {
            session,
            out,
            last_pts_us: None,
        }
    }

    pub fn run(mut self) {
        info!("audio sink running");
        while let Some(chunk) = self.session.q_aud.pop() {
            if let Some(prev) = self.last_pts_us {
                if chunk.pts_us > prev {
                    self.session
                        .audio_pts_delta_us
                        .store(chunk.pts_us - prev, Ordering::Relaxed);
                }
            }
            self.last_pts_us = Some(chunk.pts_us);
            self.session
                .avsync
                .on_audio(chunk.pts_us, chunk.frames, chunk.sample_rate);
            self.session.stats.inc_audio_chunk();
            write_or_stop(&self.session, &mut self.out, "audio output", &chunk.data);
        }
        if let Err(e) = self.out.sync_all() {
            warn!(err = %e, "sync of audio output failed");
        }
        info!("audio sink exiting");
    }
}
