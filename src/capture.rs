// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Video capture: the camera capability and the capture stage.
//!
//! The capture stage copies each completed hardware buffer into an owned
//! [`VideoFrame`], stamps it from the monotonic clock, and try-pushes it onto
//! the raw queue. When the encoder can't keep up the queue fills and new
//! frames are dropped and counted; stability beats completeness here.

use std::sync::Arc;
use std::time::Duration;

use base::clock::Clocks;
use base::{bail, Error};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::queue::PushError;
use crate::session::Session;
use crate::types::VideoFrame;

/// How long to wait before retrying when the device has no frame yet.
const DEQUEUE_BACKOFF: Duration = Duration::from_millis(1);

/// One dequeue attempt's outcome.
pub enum Dequeue<'a> {
    /// A completed buffer. `data` is the contiguous picture (luma plane then
    /// chroma plane, `w*h*3/2` bytes); `sequence` is the driver's running
    /// frame counter, used to account for frames the driver dropped.
    Frame {
        index: usize,
        data: &'a [u8],
        sequence: u32,
    },
    /// Nothing completed yet; retry after [`DEQUEUE_BACKOFF`].
    NotReady,
}

/// An opened capture device, reduced to what the pipeline consumes.
/// This is a trait for test injection.
pub trait Camera: Send {
    /// Starts streaming. Buffers must already be allocated and submitted.
    fn start(&mut self) -> Result<(), Error>;

    /// Attempts to take one completed buffer. The returned data borrow ends
    /// when the caller is done copying; the buffer itself stays checked out
    /// until [`Camera::requeue`] hands it back to the driver.
    fn dequeue(&mut self) -> Result<Dequeue<'_>, Error>;

    /// Resubmits a buffer previously returned by [`Camera::dequeue`].
    fn requeue(&mut self, index: usize) -> Result<(), Error>;
}

/// Opens the configured camera backend.
pub fn open_camera(config: &Config) -> Result<Box<dyn Camera>, Error> {
    // The V4L2 multi-plane binding is target-specific and not part of this
    // build; deployments plug a backend in here.
    bail!(
        Unsupported,
        "no camera capture backend is compiled into this build (device {})",
        config.video_device
    );
}

/// The capture stage: hardware buffers in, owned raw frames out.
pub struct VideoCaptureStage<C: Clocks + Clone> {
    session: Arc<Session<C>>,
    camera: Box<dyn Camera>,
    width: u32,
    height: u32,
    last_sequence: Option<u32>,
    next_frame_id: u64,
}

impl<C: Clocks + Clone> VideoCaptureStage<C> {
    pub fn new(
        session: Arc<Session<C>>,
        camera: Box<dyn Camera>,
        width: u32,
        height: u32,
    ) -> Self {
        VideoCaptureStage {
            session,
            camera,
            width,
            height,
            last_sequence: None,
            next_frame_id: 0,
        }
    }

    pub fn run(mut self) {
        info!("video capture running");
        if let Err(e) = self.run_inner() {
            error!(err = %e.chain(), "video capture failed");
            self.session.fail();
        }
        info!("video capture exiting");
        // Dropping the camera closes the device and its mappings.
    }

    fn run_inner(&mut self) -> Result<(), Error> {
        loop {
            if self.session.is_stopped() {
                return Ok(());
            }
            let (index, frame) = match self.camera.dequeue()? {
                Dequeue::NotReady => {
                    self.session.clocks.sleep(DEQUEUE_BACKOFF);
                    continue;
                }
                Dequeue::Frame {
                    index,
                    data,
                    sequence,
                } => {
                    if let Some(last) = self.last_sequence {
                        if u64::from(sequence) > u64::from(last) + 1 {
                            let missed = u64::from(sequence) - u64::from(last) - 1;
                            self.session.stats.add_drops(missed);
                            warn!(missed, sequence, "capture sequence gap");
                        }
                    }
                    self.last_sequence = Some(sequence);
                    let pts_us = self.session.clocks.monotonic_us();
                    let frame = VideoFrame {
                        data: data.to_vec(),
                        width: self.width,
                        height: self.height,
                        stride: self.width,
                        pts_us,
                        frame_id: self.next_frame_id,
                    };
                    self.next_frame_id += 1;
                    (index, frame)
                }
            };
            match self.session.q_raw.push(frame) {
                Ok(()) => {}
                // Encoder is behind; drop the newest frame and count it.
                Err(PushError::Full(_frame)) => self.session.stats.add_drops(1),
                Err(PushError::Closed(_frame)) => {
                    self.camera.requeue(index)?;
                    return Ok(());
                }
            }
            self.camera.requeue(index)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, SyntheticCamera};
    use base::clock::SimulatedClocks;
    use std::thread;

    fn new_session() -> Arc<Session<SimulatedClocks>> {
        Arc::new(Session::new(SimulatedClocks::new(), 30))
    }

    /// Sequence numbers `100, 103, 104` account exactly two missed frames.
    #[test]
    fn sequence_gap_counts_drops() {
        testutil::init();
        let session = new_session();
        let camera = SyntheticCamera::new(16, 16).with_sequences(vec![100, 103, 104]);
        let stage = VideoCaptureStage::new(session.clone(), Box::new(camera), 16, 16);
        let h = thread::spawn(move || stage.run());

        for expected_id in 0..3u64 {
            let frame = session.q_raw.pop().expect("frame");
            assert_eq!(frame.frame_id, expected_id);
            assert_eq!(frame.data.len(), VideoFrame::expected_size(16, 16));
        }
        session.stop();
        h.join().unwrap();
        assert_eq!(session.stats.take_window().drops, 2);
        assert!(!session.is_failed());
    }

    /// With no consumer, a full raw queue drops the newest frames.
    #[test]
    fn full_queue_drops_newest() {
        testutil::init();
        let session = new_session();
        let camera = SyntheticCamera::new(16, 16).with_frame_limit(10);
        let stage = VideoCaptureStage::new(session.clone(), Box::new(camera), 16, 16);
        let h = thread::spawn(move || stage.run());

        // The camera yields its 10 frames immediately; wait for the stage to
        // work through them.
        for _ in 0..500 {
            if session.q_raw.len() == session.q_raw.capacity() {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        thread::sleep(Duration::from_millis(20));
        session.stop();
        h.join().unwrap();
        assert_eq!(session.q_raw.capacity(), 8);
        assert_eq!(session.q_raw.len(), 8);
        assert_eq!(session.stats.take_window().drops, 2);
    }

    /// A fatal device error marks the session failed.
    #[test]
    fn fatal_dequeue_fails_session() {
        testutil::init();
        let session = new_session();
        let camera = SyntheticCamera::new(16, 16).failing_after(2);
        let stage = VideoCaptureStage::new(session.clone(), Box::new(camera), 16, 16);
        stage.run();
        assert!(session.is_failed());
        assert!(session.is_stopped());
    }
}
