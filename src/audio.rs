// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Audio capture: the PCM capability and the audio capture stage.
//!
//! Audio timestamps are sample-counted: the first chunk is stamped from the
//! monotonic clock and every successor's pts is derived from the cumulative
//! frame count. The wall clock is consulted only by the synchronizer, for
//! arrival-jitter measurement.

use std::sync::Arc;
use std::time::Duration;

use base::clock::Clocks;
use base::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::queue::PushError;
use crate::session::Session;
use crate::types::AudioChunk;

/// Frames read per device transaction.
pub const FRAMES_PER_PERIOD: u32 = 1024;

/// S16LE.
pub const BYTES_PER_SAMPLE: u16 = 2;

/// How long to wait before retrying after a read error.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(1);

/// An opened PCM capture handle delivering interleaved S16LE samples.
/// This is a trait for test injection.
pub trait PcmSource: Send {
    /// Blocks until one period has been read into `buf`, returning the byte
    /// count (a short final read is legal). Implementations perform at most
    /// one recovery attempt after an underrun before reporting the error.
    fn read_period(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
}

/// Opens the configured PCM capture backend.
#[cfg(feature = "alsa")]
pub fn open_pcm(config: &Config) -> Result<Box<dyn PcmSource>, Error> {
    Ok(Box::new(alsa_impl::AlsaSource::open(
        &config.audio_device,
        config.sample_rate,
        config.channels,
    )?))
}

/// Opens the configured PCM capture backend.
#[cfg(not(feature = "alsa"))]
pub fn open_pcm(config: &Config) -> Result<Box<dyn PcmSource>, Error> {
    use base::bail;
    bail!(
        Unsupported,
        "built without the `alsa` feature; no PCM capture backend for {}",
        config.audio_device
    );
}

/// The audio capture stage: device periods in, timed owned chunks out.
pub struct AudioCaptureStage<C: Clocks + Clone> {
    session: Arc<Session<C>>,
    pcm: Box<dyn PcmSource>,
    sample_rate: u32,
    channels: u16,
}

impl<C: Clocks + Clone> AudioCaptureStage<C> {
    pub fn new(
        session: Arc<Session<C>>,
        pcm: Box<dyn PcmSource>,
        sample_rate: u32,
        channels: u16,
    ) -> Self {
        AudioCaptureStage {
            session,
            pcm,
            sample_rate,
            channels,
        }
    }

    pub fn run(mut self) {
        let bytes_per_frame = usize::from(BYTES_PER_SAMPLE) * usize::from(self.channels);
        let period_bytes = FRAMES_PER_PERIOD as usize * bytes_per_frame;
        let pts0_us = self.session.clocks.monotonic_us();
        let mut total_frames: u64 = 0;
        info!(
            sample_rate = self.sample_rate,
            channels = self.channels,
            period = FRAMES_PER_PERIOD,
            "audio capture running"
        );
        loop {
            if self.session.is_stopped() {
                break;
            }
            let mut buf = vec![0u8; period_bytes];
            let n_bytes = match self.pcm.read_period(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!(err = %e.chain(), "pcm read failed");
                    self.session.clocks.sleep(READ_ERROR_BACKOFF);
                    continue;
                }
            };
            let frames = (n_bytes / bytes_per_frame) as u32;
            if frames == 0 {
                continue;
            }
            buf.truncate(frames as usize * bytes_per_frame);
            let pts_us = pts0_us + total_frames * 1_000_000 / u64::from(self.sample_rate);
            total_frames += u64::from(frames);
            let chunk = AudioChunk {
                data: buf,
                sample_rate: self.sample_rate,
                channels: self.channels,
                bytes_per_sample: BYTES_PER_SAMPLE,
                frames,
                pts_us,
            };
            match self.session.q_aud.push(chunk) {
                Ok(()) => {}
                Err(PushError::Full(_)) => {
                    self.session.stats.add_drops(1);
                    warn!("audio queue full; dropping chunk");
                }
                Err(PushError::Closed(_)) => break,
            }
        }
        info!("audio capture exiting");
    }
}

#[cfg(feature = "alsa")]
mod alsa_impl {
    use super::{PcmSource, BYTES_PER_SAMPLE, FRAMES_PER_PERIOD};
    use alsa::pcm::{Access, Format, HwParams, PCM};
    use alsa::{Direction, ValueOr};
    use base::{Error, ErrorKind};
    use tracing::info;

    fn open_err(msg: &str, e: alsa::Error) -> Error {
        Error::with_source(ErrorKind::Unavailable, msg.to_owned(), e)
    }

    /// ALSA capture: interleaved S16LE at the requested rate and channel
    /// count, 1024-frame periods.
    pub struct AlsaSource {
        pcm: PCM,
        scratch: Vec<i16>,
        channels: usize,
    }

    impl AlsaSource {
        pub fn open(device: &str, sample_rate: u32, channels: u16) -> Result<Self, Error> {
            let pcm = PCM::new(device, Direction::Capture, false)
                .map_err(|e| open_err("snd_pcm_open", e))?;
            {
                let hwp = HwParams::any(&pcm).map_err(|e| open_err("hw_params_any", e))?;
                hwp.set_access(Access::RWInterleaved)
                    .map_err(|e| open_err("set_access", e))?;
                hwp.set_format(Format::S16LE)
                    .map_err(|e| open_err("set_format", e))?;
                hwp.set_channels(u32::from(channels))
                    .map_err(|e| open_err("set_channels", e))?;
                hwp.set_rate(sample_rate, ValueOr::Nearest)
                    .map_err(|e| open_err("set_rate", e))?;
                hwp.set_period_size_near(FRAMES_PER_PERIOD as alsa::pcm::Frames, ValueOr::Nearest)
                    .map_err(|e| open_err("set_period_size", e))?;
                pcm.hw_params(&hwp).map_err(|e| open_err("hw_params", e))?;
            }
            info!(
                device,
                sample_rate,
                channels,
                period = FRAMES_PER_PERIOD,
                "opened pcm capture"
            );
            Ok(AlsaSource {
                pcm,
                scratch: vec![0; FRAMES_PER_PERIOD as usize * usize::from(channels)],
                channels: usize::from(channels),
            })
        }
    }

    impl PcmSource for AlsaSource {
        fn read_period(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
            let bytes_per_frame = usize::from(BYTES_PER_SAMPLE) * self.channels;
            let frames_wanted = (buf.len() / bytes_per_frame)
                .min(FRAMES_PER_PERIOD as usize);
            if frames_wanted == 0 {
                return Ok(0);
            }
            let want = frames_wanted * self.channels;
            let io = self
                .pcm
                .io_i16()
                .map_err(|e| Error::with_source(ErrorKind::Fault, "pcm io", e))?;
            let frames = match io.readi(&mut self.scratch[..want]) {
                Ok(n) => n,
                Err(e) => {
                    // One recovery attempt covers underrun and paused states.
                    self.pcm
                        .try_recover(e, true)
                        .map_err(|e| Error::with_source(ErrorKind::Fault, "pcm recover", e))?;
                    io.readi(&mut self.scratch[..want])
                        .map_err(|e| Error::with_source(ErrorKind::Fault, "pcm read", e))?
                }
            };
            let samples = frames * self.channels;
            for (dst, s) in buf.chunks_exact_mut(2).zip(&self.scratch[..samples]) {
                dst.copy_from_slice(&s.to_le_bytes());
            }
            Ok(samples * usize::from(BYTES_PER_SAMPLE))
        }
    }
}
