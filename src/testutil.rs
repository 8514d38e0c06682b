// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Synthetic capture devices, encoders, and writers for tests.
//!
//! The synthetic camera embeds its running frame counter in the first eight
//! bytes of every picture, and the synthetic encoder copies the head of the
//! staged frame into its packet, so tests can verify ordering end-to-end by
//! parsing the written stream.

use std::sync::Arc;
use std::time::Duration;

use base::{err, Error, Mutex};

use crate::audio::{PcmSource, FRAMES_PER_PERIOD};
use crate::capture::{Camera, Dequeue};
use crate::encode::{EncodedBytes, Encoder};
use crate::sink::FileWriter;
use crate::types::VideoFrame;

static INIT: std::sync::Once = std::sync::Once::new();

/// Initializes test logging. Idempotent.
pub fn init() {
    INIT.call_once(base::tracing_setup::install_for_tests);
}

/// A camera that yields frames from memory, optionally paced in real time,
/// bounded, with scripted sequence numbers or a scripted fault.
pub struct SyntheticCamera {
    interval: Option<Duration>,
    limit: Option<u64>,
    sequences: Option<Vec<u32>>,
    fail_after: Option<u64>,
    produced: u64,
    buf: Vec<u8>,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        SyntheticCamera {
            interval: None,
            limit: None,
            sequences: None,
            fail_after: None,
            produced: 0,
            buf: vec![0x55; VideoFrame::expected_size(width, height)],
        }
    }

    /// Sleeps this long before each frame, like a real sensor cadence.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Reports not-ready after this many frames.
    pub fn with_frame_limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Yields exactly these driver sequence numbers, then not-ready.
    pub fn with_sequences(mut self, sequences: Vec<u32>) -> Self {
        self.sequences = Some(sequences);
        self
    }

    /// Fails fatally once this many frames have been delivered.
    pub fn failing_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl Camera for SyntheticCamera {
    fn start(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Dequeue<'_>, Error> {
        if let Some(f) = self.fail_after {
            if self.produced >= f {
                return Err(err!(Fault, "synthetic camera fault"));
            }
        }
        let limit = self
            .sequences
            .as_ref()
            .map(|s| s.len() as u64)
            .or(self.limit);
        if let Some(l) = limit {
            if self.produced >= l {
                return Ok(Dequeue::NotReady);
            }
        }
        if let Some(d) = self.interval {
            std::thread::sleep(d);
        }
        let sequence = match &self.sequences {
            Some(s) => s[self.produced as usize],
            None => self.produced as u32,
        };
        self.buf[..8].copy_from_slice(&self.produced.to_le_bytes());
        self.produced += 1;
        Ok(Dequeue::Frame {
            index: 0,
            data: &self.buf,
            sequence,
        })
    }

    fn requeue(&mut self, _index: usize) -> Result<(), Error> {
        Ok(())
    }
}

/// A one-in one-out "encoder" that copies the head of the staged frame into
/// a fixed-size packet. Optionally slow, optionally only periodically ready.
pub struct SyntheticEncoder {
    packet_len: usize,
    delay: Option<Duration>,
    ready_every: u64,
    submitted: u64,
}

impl SyntheticEncoder {
    pub fn new(packet_len: usize) -> Self {
        assert!(packet_len >= 8, "packets must fit the frame counter");
        SyntheticEncoder {
            packet_len,
            delay: None,
            ready_every: 1,
            submitted: 0,
        }
    }

    /// Sleeps this long per frame, simulating a slow encoder.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Produces output only on every `n`th submission; other cycles report
    /// "no packet ready".
    pub fn ready_every(mut self, n: u64) -> Self {
        assert!(n > 0);
        self.ready_every = n;
        self
    }
}

impl Encoder for SyntheticEncoder {
    fn encode(&mut self, staged: &[u8]) -> Result<Option<EncodedBytes>, Error> {
        if let Some(d) = self.delay {
            std::thread::sleep(d);
        }
        let i = self.submitted;
        self.submitted += 1;
        if i % self.ready_every != 0 {
            return Ok(None);
        }
        let mut data = vec![0u8; self.packet_len];
        let n = staged.len().min(self.packet_len);
        data[..n].copy_from_slice(&staged[..n]);
        Ok(Some(EncodedBytes {
            data,
            is_keyframe: i % 60 == 0,
        }))
    }
}

/// A PCM source producing silent full periods, optionally real-time paced,
/// bounded, with a scripted short read or error.
pub struct SyntheticPcm {
    sample_rate: u32,
    channels: u16,
    real_pacing: bool,
    limit: Option<u64>,
    short_read_at: Option<(u64, u32)>,
    error_at: Option<u64>,
    produced: u64,
}

impl SyntheticPcm {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        SyntheticPcm {
            sample_rate,
            channels,
            real_pacing: false,
            limit: None,
            short_read_at: None,
            error_at: None,
            produced: 0,
        }
    }

    /// Blocks for each period's nominal duration, like a real device.
    pub fn with_real_pacing(mut self) -> Self {
        self.real_pacing = true;
        self
    }

    /// Returns zero bytes (after a short block) once this many periods have
    /// been read.
    pub fn with_period_limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Delivers only `frames` frames on the given period index.
    pub fn with_short_read_at(mut self, index: u64, frames: u32) -> Self {
        self.short_read_at = Some((index, frames));
        self
    }

    /// Fails the read at the given period index.
    pub fn with_error_at(mut self, index: u64) -> Self {
        self.error_at = Some(index);
        self
    }
}

impl PcmSource for SyntheticPcm {
    fn read_period(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let bytes_per_frame = 2 * usize::from(self.channels);
        if let Some(l) = self.limit {
            if self.produced >= l {
                // Block briefly, as a silent device would.
                std::thread::sleep(Duration::from_millis(5));
                return Ok(0);
            }
        }
        let index = self.produced;
        self.produced += 1;
        if self.error_at == Some(index) {
            return Err(err!(Transient, "synthetic underrun"));
        }
        let frames = match self.short_read_at {
            Some((i, f)) if i == index => f as usize,
            _ => FRAMES_PER_PERIOD as usize,
        };
        let frames = frames.min(buf.len() / bytes_per_frame);
        if self.real_pacing {
            std::thread::sleep(Duration::from_micros(
                frames as u64 * 1_000_000 / u64::from(self.sample_rate),
            ));
        }
        let n = frames * bytes_per_frame;
        buf[..n].fill(0);
        Ok(n)
    }
}

/// A writer collecting everything into shared memory.
#[derive(Clone, Default)]
pub struct SharedWriter {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Arc<Mutex<Vec<u8>>> {
        self.bytes.clone()
    }
}

impl FileWriter for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn sync_all(&self) -> Result<(), std::io::Error> {
        Ok(())
    }
}

/// A writer that accepts only the first `n` bytes, then short-writes.
pub struct FailingWriter {
    remaining: usize,
}

impl FailingWriter {
    pub fn short_after(n: usize) -> Self {
        FailingWriter { remaining: n }
    }
}

impl FileWriter for FailingWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        let n = buf.len().min(self.remaining);
        self.remaining -= n;
        Ok(n)
    }

    fn sync_all(&self) -> Result<(), std::io::Error> {
        Ok(())
    }
}
