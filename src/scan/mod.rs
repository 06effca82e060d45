//! Continuous-scan state machine (§3, §4.4–§4.6): the session data model
//! shared by the controller, worker, and reader, plus the ring submodule
//! they all drive.

pub mod controller;
pub mod reader;
pub mod ring;
pub mod worker;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;

use bitflags::bitflags;

use crate::commands::CHANNEL_COUNT;

bitflags! {
    /// Scan-start option flags (§4.4).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScanOptions: u32 {
        /// Long-running ring-buffer mode; `samples_per_channel` is a floor
        /// on ring capacity rather than a total sample count.
        const CONTINUOUS = 0x01;
        /// Ask the device to arm its external trigger input rather than
        /// start sampling immediately.
        const EXTERNAL_TRIGGER = 0x02;
        /// Skip the final ×LSB scaling step.
        const NO_SCALE_DATA = 0x04;
        /// Skip the ×slope+offset calibration step.
        const NO_CALIBRATE_DATA = 0x08;
    }
}

/// Composite status bits returned by `scan_status` and `scan_read` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanStatus {
    pub running: bool,
    pub triggered: bool,
    pub hardware_overrun: bool,
    pub buffer_overrun: bool,
    pub samples_available: usize,
}

impl ScanStatus {
    pub fn is_error(&self) -> bool {
        self.hardware_overrun || self.buffer_overrun
    }
}

/// Per-scan atomic flags, published by the worker and observed by the
/// controller/reader (§5): one-shot booleans, each written from exactly one
/// side.
#[derive(Debug, Default)]
pub(crate) struct ScanFlags {
    pub scan_running: AtomicBool,
    pub thread_running: AtomicBool,
    pub stop_requested: AtomicBool,
    pub triggered: AtomicBool,
    pub hw_overrun: AtomicBool,
    pub buffer_overrun: AtomicBool,
    pub samples_transferred: AtomicU64,
}

/// All state belonging to one active scan (§3 "Scan session"). Owned
/// exclusively by the device handle; created by `scan_start`, torn down by
/// `scan_cleanup`.
pub struct ScanSession {
    pub(crate) producer: Option<ring::RingProducer>,
    pub(crate) consumer: ring::RingConsumer,
    pub(crate) capacity_per_channel: usize,
    pub(crate) channels: Vec<u8>,
    pub(crate) channel_count: usize,
    pub(crate) slopes: Vec<f64>,
    pub(crate) offsets: Vec<f64>,
    pub(crate) channel_index: AtomicU32,
    pub(crate) read_threshold: usize,
    pub(crate) options: ScanOptions,
    pub(crate) flags: std::sync::Arc<ScanFlags>,
    pub(crate) worker: Option<JoinHandle<()>>,
}

impl ScanSession {
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn buffer_size(&self) -> usize {
        self.capacity_per_channel
    }

    pub fn status(&self) -> ScanStatus {
        ScanStatus {
            running: self.flags.scan_running.load(Ordering::Acquire),
            triggered: self.flags.triggered.load(Ordering::Acquire),
            hardware_overrun: self.flags.hw_overrun.load(Ordering::Acquire),
            buffer_overrun: self.flags.buffer_overrun.load(Ordering::Acquire),
            samples_available: self.consumer.depth() / self.channel_count.max(1),
        }
    }
}

/// Tiered continuous-mode ring floor by per-channel rate (§4.4 step 5).
pub(crate) fn continuous_floor(rate_per_channel: f64) -> usize {
    if rate_per_channel <= 1024.0 {
        1000
    } else if rate_per_channel <= 10_240.0 {
        10_000
    } else {
        100_000
    }
}

/// Derive total ring capacity (samples, all channels interleaved) from the
/// requested scan shape (§4.4 step 5).
pub(crate) fn ring_capacity(
    options: ScanOptions,
    rate_per_channel: f64,
    samples_per_channel: i64,
    channel_count: usize,
) -> usize {
    let per_channel = if options.contains(ScanOptions::CONTINUOUS) {
        continuous_floor(rate_per_channel).max(samples_per_channel.max(0) as usize)
    } else {
        samples_per_channel.max(0) as usize
    };
    per_channel * channel_count
}

/// Derive the worker's read threshold (§4.4 step 6).
pub(crate) fn read_threshold(rate_per_channel: f64, channel_count: usize) -> usize {
    use crate::commands::MAX_DEVICE_READ_CHUNK;
    let raw = (rate_per_channel / 10.0).round().max(0.0) as usize;
    let clamped = raw.min(MAX_DEVICE_READ_CHUNK);
    let snapped = (clamped / channel_count) * channel_count;
    snapped.max(channel_count)
}
