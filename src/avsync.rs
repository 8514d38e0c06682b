// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! A/V synchronization analysis from paired stream timestamps.
//!
//! Both sinks report every timestamp they see. From those this module derives,
//! once per second: the median offset between the streams, how far later
//! pairs deviate from the initial alignment (the aligned residual), the rate
//! of change of that residual (drift), and per-stream arrival jitter
//! percentiles.
//!
//! All math uses presentation timestamps from the shared monotonic clock;
//! wall-clock time is only consulted for audio arrival jitter.

use base::clock::Clocks;
use base::Mutex;
use tracing::info;

const MAX_VIDEO_JITTER_SAMPLES: usize = 128; // 30 fps -> <= 30/s
const MAX_AUDIO_JITTER_SAMPLES: usize = 256; // 48k/1024 -> ~46/s
const MAX_PAIR_SAMPLES: usize = 128;

const DEFAULT_FPS: u32 = 30;

/// Nearest-rank percentile of a sorted slice: rank `⌈q·n⌉`, clamped to
/// `[1, n]`.
fn percentile_nearest(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    if q <= 0.0 {
        return sorted[0];
    }
    if q >= 1.0 {
        return sorted[sorted.len() - 1];
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Bounded one-second window of millisecond samples. Samples past the bound
/// are discarded; percentiles over the survivors are representative enough.
struct SampleWindow {
    samples: Vec<f64>,
    cap: usize,
}

impl SampleWindow {
    fn new(cap: usize) -> Self {
        SampleWindow {
            samples: Vec::with_capacity(cap),
            cap,
        }
    }

    fn push(&mut self, v: f64) {
        if self.samples.len() < self.cap {
            self.samples.push(v);
        }
    }

    /// Sorts in place, returns `(p50, p95)`, and empties the window.
    fn take_percentiles(&mut self) -> Option<(f64, f64)> {
        if self.samples.is_empty() {
            return None;
        }
        self.samples.sort_unstable_by(f64::total_cmp);
        let p = (
            percentile_nearest(&self.samples, 0.50),
            percentile_nearest(&self.samples, 0.95),
        );
        self.samples.clear();
        Some(p)
    }
}

struct LastAudio {
    pts_us: u64,
    frames: u32,
    sample_rate: u32,
}

struct State {
    video0_us: Option<u64>,
    audio0_us: Option<u64>,

    /// `audio0 - video0`, latched exactly once, never recomputed.
    offset_us: Option<i64>,

    last_video_us: Option<u64>,
    last_audio: Option<LastAudio>,
    last_audio_arrival_us: Option<u64>,

    video_jitter: SampleWindow,
    audio_jitter: SampleWindow,
    pair_offset: SampleWindow,
    pair_residual: SampleWindow,

    /// `(t0_us, residual0_ms)`, latched on the first residual after lock.
    drift_base: Option<(u64, f64)>,
}

/// A/V synchronizer. One instance per recording session; both sink stages
/// feed it concurrently.
pub struct AvSync<C: Clocks> {
    clocks: C,
    expected_video_delta_us: u64,
    state: Mutex<State>,
}

impl<C: Clocks> AvSync<C> {
    pub fn new(clocks: C, video_fps: u32) -> Self {
        let fps = if video_fps == 0 { DEFAULT_FPS } else { video_fps };
        AvSync {
            clocks,
            expected_video_delta_us: 1_000_000 / u64::from(fps),
            state: Mutex::new(State {
                video0_us: None,
                audio0_us: None,
                offset_us: None,
                last_video_us: None,
                last_audio: None,
                last_audio_arrival_us: None,
                video_jitter: SampleWindow::new(MAX_VIDEO_JITTER_SAMPLES),
                audio_jitter: SampleWindow::new(MAX_AUDIO_JITTER_SAMPLES),
                pair_offset: SampleWindow::new(MAX_PAIR_SAMPLES),
                pair_residual: SampleWindow::new(MAX_PAIR_SAMPLES),
                drift_base: None,
            }),
        }
    }

    /// The latched offset, if both streams have been seen. Diagnostic only.
    pub fn offset_us(&self) -> Option<i64> {
        self.state.lock().offset_us
    }

    fn try_lock_offset(s: &mut State) {
        if s.offset_us.is_some() {
            return;
        }
        if let (Some(v0), Some(a0)) = (s.video0_us, s.audio0_us) {
            let offset = a0 as i64 - v0 as i64;
            s.offset_us = Some(offset);
            info!(
                offset_us = offset,
                audio0_us = a0,
                video0_us = v0,
                "locked a/v offset"
            );
        }
    }

    /// Records one video presentation timestamp, as seen by the video sink.
    pub fn on_video(&self, pts_us: u64) {
        let mut s = self.state.lock();

        if s.video0_us.is_none() {
            s.video0_us = Some(pts_us);
        }
        Self::try_lock_offset(&mut s);

        // Paired offset/residual on every video event, audio as reference.
        if let Some(audio_pts) = s.last_audio.as_ref().map(|a| a.pts_us) {
            let off_ms = (pts_us as i64 - audio_pts as i64) as f64 / 1000.0;
            s.pair_offset.push(off_ms);
            if let Some(offset) = s.offset_us {
                let res_ms = (pts_us as i64 + offset - audio_pts as i64) as f64 / 1000.0;
                s.pair_residual.push(res_ms);
            }
        }

        if let Some(last) = s.last_video_us {
            if pts_us > last {
                let delta_us = pts_us - last;
                let jitter_ms =
                    (delta_us as f64 - self.expected_video_delta_us as f64).abs() / 1000.0;
                s.video_jitter.push(jitter_ms);
            }
        }

        s.last_video_us = Some(pts_us);
    }

    /// Records one audio chunk's timestamp and metadata, as seen by the audio
    /// sink. A zero `sample_rate` is ignored.
    pub fn on_audio(&self, pts_us: u64, frames: u32, sample_rate: u32) {
        if sample_rate == 0 {
            return;
        }
        let now_us = self.clocks.monotonic_us();
        let mut s = self.state.lock();

        if s.audio0_us.is_none() {
            s.audio0_us = Some(pts_us);
            Self::try_lock_offset(&mut s);
        }

        // Arrival jitter against the previous chunk's nominal duration.
        if let (Some(prev_arrival), Some((prev_frames, prev_rate))) = (
            s.last_audio_arrival_us,
            s.last_audio.as_ref().map(|a| (a.frames, a.sample_rate)),
        ) {
            if now_us > prev_arrival {
                let delta_us = now_us - prev_arrival;
                let expected_us = u64::from(prev_frames) * 1_000_000 / u64::from(prev_rate);
                let jitter_ms = (delta_us as f64 - expected_us as f64).abs() / 1000.0;
                s.audio_jitter.push(jitter_ms);
            }
        }

        s.last_audio = Some(LastAudio {
            pts_us,
            frames,
            sample_rate,
        });
        s.last_audio_arrival_us = Some(now_us);
    }

    /// Computes the one-second report and resets every sample window.
    pub fn report_1s(&self, now_us: u64) -> Report {
        let mut s = self.state.lock();

        let video_jitter = s.video_jitter.take_percentiles();
        let audio_jitter = s.audio_jitter.take_percentiles();
        let av_offset_ms = s.pair_offset.take_percentiles().map(|(p50, _)| p50);
        let residual_ms = s.pair_residual.take_percentiles().map(|(p50, _)| p50);

        let offset_locked = s.offset_us.is_some();
        let mut drift_msps = None;
        if let (Some(res), true) = (residual_ms, offset_locked) {
            match s.drift_base {
                None => s.drift_base = Some((now_us, res)),
                Some((t0_us, residual0_ms)) if now_us > t0_us => {
                    let elapsed_s = (now_us - t0_us) as f64 / 1_000_000.0;
                    if elapsed_s > 0.0 {
                        drift_msps = Some((res - residual0_ms) / elapsed_s);
                    }
                }
                Some(_) => {}
            }
        }

        Report {
            av_offset_ms,
            residual_ms,
            drift_msps,
            offset_locked,
            video_jitter,
            audio_jitter,
        }
    }
}

/// One second's derived sync measurements.
#[derive(Clone, Copy, Debug)]
pub struct Report {
    /// p50 of this window's paired `(video - audio)` offsets, ms.
    pub av_offset_ms: Option<f64>,
    /// p50 of this window's aligned residuals, ms. Only meaningful once the
    /// offset is locked.
    pub residual_ms: Option<f64>,
    /// Rate of change of the aligned residual, ms per second of wall time.
    pub drift_msps: Option<f64>,
    pub offset_locked: bool,
    /// `(p50, p95)` video inter-frame jitter, ms.
    pub video_jitter: Option<(f64, f64)>,
    /// `(p50, p95)` audio arrival jitter, ms.
    pub audio_jitter: Option<(f64, f64)>,
}

fn fmt_ms(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{v:.3}"),
        None => "n/a".to_owned(),
    }
}

impl Report {
    pub fn drift_direction(&self) -> &'static str {
        match self.drift_msps {
            None => "n/a",
            Some(d) if d > 0.0 => "video_faster_or_audio_slower",
            Some(d) if d < 0.0 => "video_slower_or_audio_faster",
            Some(_) => "stable",
        }
    }

    /// Emits the per-second report line.
    pub fn log(&self) {
        let (v50, v95) = match self.video_jitter {
            Some((p50, p95)) => (fmt_ms(Some(p50)), fmt_ms(Some(p95))),
            None => (fmt_ms(None), fmt_ms(None)),
        };
        let (a50, a95) = match self.audio_jitter {
            Some((p50, p95)) => (fmt_ms(Some(p50)), fmt_ms(Some(p95))),
            None => (fmt_ms(None), fmt_ms(None)),
        };
        match self.av_offset_ms {
            None => info!(
                "av_offset_ms=n/a drift_msps=n/a | v_jitter_ms p50={v50} p95={v95} \
                 | a_jitter_ms p50={a50} p95={a95}"
            ),
            Some(off) if self.offset_locked => {
                // Once locked, a missing drift sample reads as zero drift;
                // the direction still reports "n/a" until one exists.
                let drift = self.drift_msps.unwrap_or(0.0);
                info!(
                    "av_offset_ms={off:.3} aligned_residual_ms={} drift_msps={drift:.6} ({}) \
                     | v_jitter_ms p50={v50} p95={v95} | a_jitter_ms p50={a50} p95={a95}",
                    fmt_ms(self.residual_ms),
                    self.drift_direction(),
                )
            }
            Some(off) => info!(
                "av_offset_ms={off:.3} drift_msps=n/a | v_jitter_ms p50={v50} p95={v95} \
                 | a_jitter_ms p50={a50} p95={a95}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use std::time::Duration;

    fn new_sync(fps: u32) -> AvSync<SimulatedClocks> {
        AvSync::new(SimulatedClocks::new(), fps)
    }

    #[test]
    fn percentile_single_element() {
        let v = [42.0];
        assert_eq!(percentile_nearest(&v, 0.50), 42.0);
        assert_eq!(percentile_nearest(&v, 0.95), 42.0);
    }

    #[test]
    fn percentile_nearest_rank() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile_nearest(&v, 0.50), 2.0); // ceil(2.0) = 2
        assert_eq!(percentile_nearest(&v, 0.95), 4.0); // ceil(3.8) = 4
        assert_eq!(percentile_nearest(&v, 0.0), 1.0);
        assert_eq!(percentile_nearest(&v, 1.0), 4.0);
    }

    #[test]
    fn offset_locks_once() {
        let s = new_sync(30);
        s.on_video(1_000);
        assert_eq!(s.offset_us(), None);
        s.on_audio(61_000, 1024, 48_000);
        assert_eq!(s.offset_us(), Some(60_000));
        // Later timestamps never move the lock.
        s.on_video(500_000);
        s.on_audio(400_000, 1024, 48_000);
        assert_eq!(s.offset_us(), Some(60_000));
    }

    #[test]
    fn zero_sample_rate_is_ignored() {
        let s = new_sync(30);
        s.on_audio(1_000, 1024, 0);
        s.on_video(2_000);
        assert_eq!(s.offset_us(), None);
        let r = s.report_1s(1_000_000);
        assert!(r.av_offset_ms.is_none());
        assert!(!r.offset_locked);
    }

    #[test]
    fn report_resets_windows() {
        let s = new_sync(30);
        s.on_audio(0, 1024, 48_000);
        s.on_video(0);
        s.on_video(33_333);
        s.on_audio(21_333, 1024, 48_000);
        let r = s.report_1s(1_000_000);
        assert!(r.av_offset_ms.is_some());
        assert!(r.video_jitter.is_some());
        // Everything was drained; an immediate second report is empty.
        let r2 = s.report_1s(2_000_000);
        assert!(r2.av_offset_ms.is_none());
        assert!(r2.residual_ms.is_none());
        assert!(r2.video_jitter.is_none());
        assert!(r2.audio_jitter.is_none());
    }

    #[test]
    fn exact_frame_cadence_has_zero_jitter() {
        let s = new_sync(30);
        for i in 0..5u64 {
            s.on_video(i * 33_333); // 1_000_000 / 30
        }
        let r = s.report_1s(1_000_000);
        assert_eq!(r.video_jitter, Some((0.0, 0.0)));
    }

    #[test]
    fn zero_fps_falls_back_to_30() {
        let s = new_sync(0);
        for i in 0..5u64 {
            s.on_video(i * 33_333);
        }
        let r = s.report_1s(1_000_000);
        assert_eq!(r.video_jitter, Some((0.0, 0.0)));
    }

    #[test]
    fn non_monotonic_video_pts_is_not_a_jitter_sample() {
        let s = new_sync(30);
        s.on_video(100_000);
        s.on_video(50_000); // backwards; skipped
        let r = s.report_1s(1_000_000);
        assert!(r.video_jitter.is_none());
    }

    #[test]
    fn audio_arrival_jitter_uses_previous_chunk_duration() {
        let clocks = SimulatedClocks::new();
        let s = AvSync::new(clocks.clone(), 30);
        // First chunk: 1024 frames at 48 kHz -> nominal 21333 us.
        s.on_audio(0, 1024, 48_000);
        // Second arrives 22333 us later: 1 ms late.
        clocks.sleep(Duration::from_micros(22_333));
        s.on_audio(21_333, 1024, 48_000);
        let r = s.report_1s(1_000_000);
        let (p50, p95) = r.audio_jitter.expect("one sample");
        assert!((p50 - 1.0).abs() < 1e-9, "p50 = {p50}");
        assert_eq!(p50, p95);
    }

    /// Audio pts advancing at 0.999x real time: the residual grows ~1 ms per
    /// second, so drift converges to +1 ms/s with the matching direction.
    #[test]
    fn drift_injection_slow_audio_clock() {
        let s = new_sync(30);
        let mut last = None;
        for k in 0..8u64 {
            let t = k * 1_000_000;
            s.on_audio(t * 999 / 1000, 1024, 48_000);
            s.on_video(t);
            last = Some(s.report_1s(t + 1_000_000));
        }
        let r = last.unwrap();
        assert!(r.offset_locked);
        let drift = r.drift_msps.expect("drift after >= 2 residual windows");
        assert!((drift - 1.0).abs() < 0.05, "drift = {drift}");
        assert_eq!(r.drift_direction(), "video_faster_or_audio_slower");
    }

    #[test]
    fn aligned_streams_report_stable() {
        let s = new_sync(30);
        let mut last = None;
        for k in 0..5u64 {
            let t = k * 1_000_000;
            s.on_audio(t + 20_000, 1024, 48_000);
            s.on_video(t + 20_500);
            last = Some(s.report_1s(t + 1_000_000));
        }
        let r = last.unwrap();
        assert!(r.offset_locked);
        assert_eq!(r.drift_msps, Some(0.0));
        assert_eq!(r.drift_direction(), "stable");
        // Residual stays at the initial alignment.
        assert!(r.residual_ms.unwrap().abs() < 1e-9);
    }
}
