// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Synchronized audio/video capture to raw elementary streams, with
//! continuous A/V timing analysis (offset, aligned residual, drift, jitter).
//!
//! The pipeline is five concurrent stages joined by three bounded queues:
//!
//! ```text
//! camera -> [capture] -> q_raw -> [encode] -> q_enc -> [video sink] -> .h264
//! pcm    -> [audio capture] ----------------> q_aud -> [audio sink] -> .pcm
//! ```
//!
//! Both sinks feed the [`avsync`] analyzer with the timestamps they observe;
//! every stage feeds the [`stats`] counters. A [`session::Session`] owns the
//! queues and the stop flag; [`session::run_pipeline`] spawns and joins the
//! stage threads plus the signal, timer, and stats helpers.

pub mod audio;
pub mod avsync;
pub mod capture;
pub mod config;
pub mod encode;
pub mod queue;
pub mod session;
pub mod sink;
pub mod stats;
pub mod testutil;
pub mod types;
