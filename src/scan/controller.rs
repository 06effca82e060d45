//! Scan controller (§4.4): starts/stops a scan, allocates the host ring,
//! derives the read threshold and buffer size from the requested sample
//! rate, and owns the scan worker thread's lifecycle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::commands::{Command, CHANNEL_COUNT};
use crate::device::DeviceState;
use crate::error::{DaqError, Result};
use crate::scan::{ring, worker, ring_capacity, read_threshold, ScanFlags, ScanOptions, ScanSession, ScanStatus};

/// Back-off between sync-lock polls while waiting for the clock to settle
/// before a scan can start (§4.4 step 4).
const CLOCK_LOCK_BACKOFF: Duration = Duration::from_millis(100);

fn channels_from_mask(mask: u8) -> Vec<u8> {
    (0..CHANNEL_COUNT as u8)
        .filter(|bit| mask & (1 << bit) != 0)
        .collect()
}

pub fn scan_start(
    state: &Arc<Mutex<DeviceState>>,
    address: u8,
    channel_mask: u8,
    samples_per_channel: i64,
    options: ScanOptions,
) -> Result<()> {
    let max_mask = (1u8 << CHANNEL_COUNT) - 1;
    if channel_mask == 0 || channel_mask > max_mask {
        return Err(DaqError::bad_parameter(format!(
            "channel mask {channel_mask:#x} out of range 1..={max_mask:#x}"
        )));
    }
    if samples_per_channel <= 0 && !options.contains(ScanOptions::CONTINUOUS) {
        return Err(DaqError::bad_parameter(
            "samples_per_channel must be > 0 unless Continuous is set",
        ));
    }

    let mut guard = state.lock().unwrap();
    if guard.has_scan() {
        return Err(DaqError::Busy);
    }

    let channels = channels_from_mask(channel_mask);
    let channel_count = channels.len();
    let mut slopes = Vec::with_capacity(channel_count);
    let mut offsets = Vec::with_capacity(channel_count);
    for &ch in &channels {
        let (slope, offset) = guard.calibration_coefficient_read(ch as usize)?;
        slopes.push(slope);
        offsets.push(offset);
    }

    let rate_per_channel = loop {
        let clock = guard.a_in_clock_config_read()?;
        if clock.sync_locked {
            break clock.rate_per_channel;
        }
        drop(guard);
        std::thread::sleep(CLOCK_LOCK_BACKOFF);
        guard = state.lock().unwrap();
        if guard.has_scan() {
            // Another caller raced us while we slept without the lock.
            return Err(DaqError::Busy);
        }
    };

    let total_capacity = ring_capacity(options, rate_per_channel, samples_per_channel, channel_count);
    let threshold = read_threshold(rate_per_channel, channel_count);

    let scan_count: u32 = if options.contains(ScanOptions::CONTINUOUS) {
        0
    } else {
        samples_per_channel as u32
    };
    let mut mask_byte = channel_mask;
    if options.contains(ScanOptions::EXTERNAL_TRIGGER) {
        mask_byte |= 0x04;
    }
    let mut payload = Vec::with_capacity(5);
    payload.extend_from_slice(&scan_count.to_le_bytes());
    payload.push(mask_byte);

    guard.issue(Command::StartScan, &payload, 0)?;

    let (producer, consumer) = ring::ring(total_capacity, channel_count);
    let flags = Arc::new(ScanFlags::default());
    flags.scan_running.store(true, Ordering::Release);
    flags.thread_running.store(true, Ordering::Release);

    let mut session = ScanSession {
        producer: Some(producer),
        consumer,
        capacity_per_channel: total_capacity / channel_count,
        channels,
        channel_count,
        slopes,
        offsets,
        channel_index: AtomicU32::new(0),
        read_threshold: threshold,
        options,
        flags: Arc::clone(&flags),
        worker: None,
    };

    let producer = session.producer.take().expect("producer allocated above");
    let worker_params = worker::WorkerParams {
        state: Arc::clone(state),
        producer,
        flags: Arc::clone(&flags),
        options,
        read_threshold: threshold,
        channel_count,
        slopes: session.slopes.clone(),
        offsets: session.offsets.clone(),
    };

    let spawned = std::thread::Builder::new()
        .name(format!("daq-scan-worker-{address}"))
        .spawn(move || worker::run(worker_params));

    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            let _ = guard.issue(Command::ScanStop, &[], 0);
            return Err(DaqError::resource_unavail(format!(
                "failed to spawn scan worker thread: {e}"
            )));
        }
    };

    session.worker = Some(handle);
    guard.install_scan(session);
    Ok(())
}

/// Non-destructive: the worker observes the device-running bit drop and
/// winds itself down (§4.4 `scan_stop`).
pub fn scan_stop(state: &Arc<Mutex<DeviceState>>) -> Result<()> {
    let mut guard = state.lock().unwrap();
    if !guard.has_scan() {
        return Err(DaqError::resource_unavail("no scan running"));
    }
    guard.issue(Command::ScanStop, &[], 0)?;
    Ok(())
}

/// Join the worker and free the ring/session. Safe to call with no active
/// scan (§4.4 `scan_cleanup`).
pub fn scan_cleanup(state: &Arc<Mutex<DeviceState>>) {
    let taken = {
        let mut guard = state.lock().unwrap();
        if let Some(session) = guard.scan() {
            session.flags.stop_requested.store(true, Ordering::Release);
        }
        guard.take_scan()
    };

    if let Some(mut session) = taken {
        if let Some(handle) = session.worker.take() {
            let _ = handle.join();
        }
    }
}

pub fn scan_buffer_size(state: &Arc<Mutex<DeviceState>>) -> Result<usize> {
    let guard = state.lock().unwrap();
    guard
        .scan()
        .map(ScanSession::buffer_size)
        .ok_or_else(|| DaqError::resource_unavail("no scan running"))
}

pub fn scan_channel_count(state: &Arc<Mutex<DeviceState>>) -> Result<usize> {
    let guard = state.lock().unwrap();
    guard
        .scan()
        .map(ScanSession::channel_count)
        .ok_or_else(|| DaqError::resource_unavail("no scan running"))
}

/// §9 dual behaviour: `Result` signals `ResourceUnavail` with no scan
/// active, but `ScanStatus` is always returned — zeroed in that case rather
/// than omitted, so callers that only inspect the status word still see
/// sane output.
pub fn scan_status(state: &Arc<Mutex<DeviceState>>) -> (Result<()>, ScanStatus) {
    let guard = state.lock().unwrap();
    match guard.scan() {
        Some(session) => (Ok(()), session.status()),
        None => (
            Err(DaqError::resource_unavail("no scan running")),
            ScanStatus::default(),
        ),
    }
}
