//! Scan reader (consumer, §4.6): the bounded-wait read path called directly
//! from [`crate::device::Device::scan_read`]. Polls ring depth and scan
//! status under the device lock, copying out whatever is available and
//! waiting for more up to the caller's deadline.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::device::DeviceState;
use crate::error::{DaqError, Result};
use crate::scan::ScanStatus;

const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Result of one `scan_read` call (§6): the scan status snapshot taken at
/// the end of the read, plus how much of `out` was actually filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    pub status: ScanStatus,
    pub samples_read_per_channel: usize,
}

/// `wanted_samples_per_channel < 0` means "as many as currently fit in
/// `out`"; `timeout_seconds < 0.0` means "wait indefinitely"; `0.0` means
/// "return immediately with whatever is already buffered" (§4.6).
pub fn scan_read(
    state: &Arc<Mutex<DeviceState>>,
    wanted_samples_per_channel: i64,
    timeout_seconds: f64,
    out: &mut [f64],
) -> (Result<()>, ReadOutcome) {
    let (channel_count, available_now) = {
        let guard = state.lock().unwrap();
        match guard.scan() {
            Some(session) => (session.channel_count(), session.consumer.depth()),
            None => {
                return (
                    Err(DaqError::resource_unavail("no scan running")),
                    ReadOutcome::default(),
                )
            }
        }
    };

    // `wanted == -1` means "all currently available" (§4.6): the required
    // total is pinned to the ring's depth at call time, not to however much
    // room `out` has, so the read never blocks waiting for samples that
    // hadn't arrived yet when the caller asked.
    let wanted_total = if wanted_samples_per_channel < 0 {
        available_now
    } else {
        (wanted_samples_per_channel as usize).saturating_mul(channel_count)
    };
    let mut required = wanted_total.min(out.len());
    required -= required % channel_count.max(1);

    let deadline = if timeout_seconds < 0.0 {
        None
    } else {
        Some(Instant::now() + Duration::from_secs_f64(timeout_seconds))
    };

    let mut copied = 0usize;
    let mut last_status = ScanStatus::default();

    let outcome: Result<()> = loop {
        let (status, popped, worker_alive) = {
            let guard = state.lock().unwrap();
            match guard.scan() {
                Some(session) => {
                    let status = session.status();
                    let popped = if required > copied {
                        session
                            .consumer
                            .pop_into(&mut out[copied..], required - copied)
                    } else {
                        0
                    };
                    let alive = session.flags.thread_running.load(Ordering::Acquire);
                    (status, popped, alive)
                }
                None => break Ok(()),
            }
        };

        copied += popped;
        last_status = status;

        if last_status.is_error() {
            break Ok(());
        }
        if copied >= required {
            break Ok(());
        }
        if !worker_alive {
            break Ok(());
        }
        match deadline {
            Some(deadline) if Instant::now() >= deadline => break Err(DaqError::Timeout),
            _ => {}
        }

        std::thread::sleep(POLL_INTERVAL);
    };

    (
        outcome,
        ReadOutcome {
            status: last_status,
            samples_read_per_channel: copied / channel_count.max(1),
        },
    )
}
