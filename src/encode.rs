// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Video encoding: the encoder capability and the encode stage.
//!
//! The stage owns a hardware-aligned staging buffer; every raw frame is
//! copied into it (zero-padded or truncated to fit) before submission, and
//! the source frame's pts rides along unchanged onto the output packet.

use std::sync::Arc;

use base::clock::Clocks;
use base::{bail, Error};
use tracing::{info, warn};

use crate::config::Size;
use crate::queue::PushError;
use crate::session::Session;
use crate::types::EncodedPacket;

/// One encoded access unit handed back by an encoder.
pub struct EncodedBytes {
    pub data: Vec<u8>,
    /// `false` when the encoder doesn't expose an intra flag.
    pub is_keyframe: bool,
}

/// A configured one-in, at-most-one-out encoder session.
/// This is a trait for test injection.
pub trait Encoder: Send {
    /// Submits one staged frame and requests one output packet.
    /// `Ok(None)` means no packet was ready this cycle, which is not an
    /// error; the input is simply consumed.
    fn encode(&mut self, staged: &[u8]) -> Result<Option<EncodedBytes>, Error>;
}

/// Rate-control and geometry parameters derived from the session config.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bps_target: u32,
    pub bps_min: u32,
    pub bps_max: u32,
    pub gop: u32,
    /// Geometry rounded up to the 16-pixel alignment hardware encoders want.
    pub hor_stride: u32,
    pub ver_stride: u32,
}

fn ceil16(v: u32) -> u32 {
    (v + 15) & !15
}

impl EncoderConfig {
    pub fn new(size: Size, fps: u32, bps: u32) -> Self {
        let fps = if fps == 0 { 30 } else { fps };
        EncoderConfig {
            width: size.width,
            height: size.height,
            fps,
            bps_target: bps,
            bps_min: (u64::from(bps) * 15 / 16) as u32,
            bps_max: (u64::from(bps) * 17 / 16) as u32,
            gop: fps * 2,
            hor_stride: ceil16(size.width),
            ver_stride: ceil16(size.height),
        }
    }

    /// Byte size of the aligned staging buffer (4:2:0, 8-bit).
    pub fn staged_frame_size(&self) -> usize {
        self.hor_stride as usize * self.ver_stride as usize * 3 / 2
    }
}

/// Opens the configured encoder backend.
pub fn open_encoder(cfg: &EncoderConfig) -> Result<Box<dyn Encoder>, Error> {
    // Hardware H.264 encoders are vendor-specific and not part of this
    // build; deployments plug a backend in here.
    bail!(
        Unsupported,
        "no H.264 encoder backend is compiled into this build ({}x{} @ {} fps)",
        cfg.width,
        cfg.height,
        cfg.fps
    );
}

/// Copies a frame into the aligned staging buffer, zero-padding short input
/// and truncating oversized input.
fn stage_frame(staging: &mut [u8], frame: &[u8]) {
    let n = frame.len().min(staging.len());
    staging[..n].copy_from_slice(&frame[..n]);
    staging[n..].fill(0);
}

/// The encode stage: raw frames in, compressed packets out.
pub struct EncodeStage<C: Clocks + Clone> {
    session: Arc<Session<C>>,
    encoder: Box<dyn Encoder>,
    staging: Vec<u8>,
}

impl<C: Clocks + Clone> EncodeStage<C> {
    pub fn new(
        session: Arc<Session<C>>,
        encoder: Box<dyn Encoder>,
        cfg: &EncoderConfig,
    ) -> Self {
        EncodeStage {
            session,
            encoder,
            staging: vec![0; cfg.staged_frame_size()],
        }
    }

    pub fn run(mut self) {
        info!("video encode running");
        while let Some(frame) = self.session.q_raw.pop() {
            let pts_us = frame.pts_us;
            stage_frame(&mut self.staging, &frame.data);
            drop(frame);
            match self.encoder.encode(&self.staging) {
                Ok(Some(out)) => {
                    let len = out.data.len() as u64;
                    let packet = EncodedPacket {
                        data: out.data,
                        pts_us,
                        is_keyframe: out.is_keyframe,
                    };
                    match self.session.q_enc.push(packet) {
                        Ok(()) => {
                            self.session.stats.inc_video_frame();
                            self.session.stats.add_enc_bytes(len);
                        }
                        Err(PushError::Full(_)) => {
                            self.session.stats.add_drops(1);
                            warn!("encoded packet queue full; dropping packet");
                        }
                        Err(PushError::Closed(_)) => break,
                    }
                }
                // No output ready this cycle; the input is consumed.
                Ok(None) => {}
                Err(e) => {
                    self.session.stats.add_drops(1);
                    warn!(err = %e.chain(), "encode failed; dropping frame");
                }
            }
        }
        info!("video encode exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, SyntheticEncoder};
    use crate::types::VideoFrame;
    use base::clock::SimulatedClocks;

    fn frame(pts_us: u64, frame_id: u64, fill: u8) -> VideoFrame {
        VideoFrame {
            data: vec![fill; VideoFrame::expected_size(16, 16)],
            width: 16,
            height: 16,
            stride: 16,
            pts_us,
            frame_id,
        }
    }

    #[test]
    fn derived_rate_control_parameters() {
        let cfg = EncoderConfig::new(
            Size {
                width: 1280,
                height: 720,
            },
            30,
            2_000_000,
        );
        assert_eq!(cfg.bps_min, 1_875_000);
        assert_eq!(cfg.bps_max, 2_125_000);
        assert_eq!(cfg.gop, 60);
        assert_eq!(cfg.hor_stride, 1280);
        assert_eq!(cfg.ver_stride, 720);
        assert_eq!(cfg.staged_frame_size(), 1280 * 720 * 3 / 2);
    }

    #[test]
    fn unaligned_geometry_rounds_up() {
        let cfg = EncoderConfig::new(
            Size {
                width: 1000,
                height: 500,
            },
            0,
            1_000_000,
        );
        assert_eq!(cfg.fps, 30); // fallback
        assert_eq!(cfg.hor_stride, 1008);
        assert_eq!(cfg.ver_stride, 512);
    }

    #[test]
    fn stage_frame_pads_and_truncates() {
        let mut staging = vec![0xffu8; 8];
        stage_frame(&mut staging, &[1, 2, 3]);
        assert_eq!(staging, &[1, 2, 3, 0, 0, 0, 0, 0]);
        stage_frame(&mut staging, &[9; 12]);
        assert_eq!(staging, &[9; 8]);
    }

    /// Every packet carries its source frame's pts, in source order.
    #[test]
    fn pts_carry_and_order() {
        testutil::init();
        let session = std::sync::Arc::new(Session::new(SimulatedClocks::new(), 30));
        let cfg = EncoderConfig::new(
            Size {
                width: 16,
                height: 16,
            },
            30,
            1_000_000,
        );
        for (i, pts) in [5_000u64, 38_333, 71_666].iter().enumerate() {
            session.q_raw.push(frame(*pts, i as u64, i as u8)).unwrap();
        }
        session.q_raw.close();
        EncodeStage::new(session.clone(), Box::new(SyntheticEncoder::new(16)), &cfg).run();

        for pts in [5_000u64, 38_333, 71_666] {
            let pkt = session.q_enc.pop().expect("packet");
            assert_eq!(pkt.pts_us, pts);
            assert_eq!(pkt.data.len(), 16);
        }
        let w = session.stats.take_window();
        assert_eq!(w.video_frames, 3);
        assert_eq!(w.enc_bytes, 48);
        assert_eq!(w.drops, 0);
    }

    /// `Ok(None)` consumes the input without producing a packet or a drop.
    #[test]
    fn output_not_ready_skips_cycle() {
        testutil::init();
        let session = std::sync::Arc::new(Session::new(SimulatedClocks::new(), 30));
        let cfg = EncoderConfig::new(
            Size {
                width: 16,
                height: 16,
            },
            30,
            1_000_000,
        );
        for i in 0..4u64 {
            session.q_raw.push(frame(i * 33_333, i, 0)).unwrap();
        }
        session.q_raw.close();
        let encoder = SyntheticEncoder::new(16).ready_every(2);
        EncodeStage::new(session.clone(), Box::new(encoder), &cfg).run();
        assert_eq!(session.q_enc.len(), 2);
        let w = session.stats.take_window();
        assert_eq!(w.video_frames, 2);
        assert_eq!(w.drops, 0);
    }
}
