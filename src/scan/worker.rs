//! Scan worker (producer, §4.5): the single background thread per active
//! scan that polls device status, drains its FIFO into the host ring, and
//! applies calibration/scaling on the way in.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::commands::{decode_sample, Command, LSB_SIZE, MAX_DEVICE_READ_CHUNK};
use crate::device::DeviceState;
use crate::scan::ring::RingProducer;
use crate::scan::{ScanFlags, ScanOptions};

const INITIAL_SLEEP: Duration = Duration::from_micros(200);
const MIN_SLEEP: Duration = Duration::from_micros(200);
const TRIGGER_WAIT_SLEEP: Duration = Duration::from_micros(1000);
/// `status_count` is incremented on every status poll, win or lose, and only
/// consulted (then reset) on a poll where a read was attempted. Since it is
/// always >= 1 by the time that check runs, `status_count < SPEEDUP_THRESHOLD`
/// can never hold — see the worker-loop comment below and DESIGN.md.
const SPEEDUP_THRESHOLD: u32 = 1;
const BACKOFF_THRESHOLD: u32 = 4;

pub(crate) struct WorkerParams {
    pub state: Arc<Mutex<DeviceState>>,
    pub producer: RingProducer,
    pub flags: Arc<ScanFlags>,
    pub options: ScanOptions,
    pub read_threshold: usize,
    pub channel_count: usize,
    pub slopes: Vec<f64>,
    pub offsets: Vec<f64>,
}

struct StatusReply {
    running: bool,
    triggered: bool,
    hw_overrun: bool,
    available: usize,
    max_chunk: usize,
}

fn parse_status(bytes: &[u8]) -> StatusReply {
    let flags = bytes[0];
    StatusReply {
        running: flags & 0x01 != 0,
        hw_overrun: flags & 0x02 != 0,
        triggered: flags & 0x04 != 0,
        available: u16::from_le_bytes([bytes[1], bytes[2]]) as usize,
        max_chunk: u16::from_le_bytes([bytes[3], bytes[4]]) as usize,
    }
}

pub(crate) fn run(params: WorkerParams) {
    let WorkerParams {
        state,
        producer,
        flags,
        options,
        read_threshold,
        channel_count,
        slopes,
        offsets,
    } = params;

    let mut sleep = INITIAL_SLEEP;
    let mut status_count: u32 = 0;
    let mut channel_index: usize = 0;

    'worker: loop {
        if flags.stop_requested.load(Ordering::Acquire) {
            break;
        }

        let status_bytes = state.lock().unwrap().issue(Command::ScanStatus, &[], 5);
        let status = match status_bytes {
            Ok(bytes) => parse_status(&bytes),
            Err(e) => {
                log::debug!("scan status poll failed, retrying: {e}");
                std::thread::sleep(sleep);
                continue;
            }
        };

        // Incremented on every successful status poll regardless of what
        // follows, mirroring the source's unconditional `status_count++`
        // right after decoding the status reply (§4.5 open question).
        status_count += 1;

        if status.hw_overrun {
            flags.hw_overrun.store(true, Ordering::Release);
            flags.scan_running.store(false, Ordering::Release);
            break;
        }

        if status.triggered {
            flags.triggered.store(true, Ordering::Release);
        } else {
            // Waiting for trigger: use the longer sleep and skip the data
            // path entirely (status_count keeps accumulating meanwhile).
            std::thread::sleep(TRIGGER_WAIT_SLEEP);
            continue;
        }

        let should_drain =
            !status.running || status.available >= read_threshold || status.available > status.max_chunk;

        let mut chunk = 0usize;
        if should_drain {
            chunk = status
                .available
                .min(status.max_chunk)
                .min(MAX_DEVICE_READ_CHUNK)
                .min(producer.contiguous_tail());
        }

        if chunk > 0 {
            let request = (chunk as u16).to_le_bytes();
            let data = state
                .lock()
                .unwrap()
                .issue(Command::ScanData, &request, chunk * 3);
            match data {
                Ok(bytes) => {
                    for raw in bytes.chunks_exact(3) {
                        let code = decode_sample([raw[0], raw[1], raw[2]]);
                        let mut value = code as f64;
                        if !options.contains(ScanOptions::NO_CALIBRATE_DATA) {
                            value = value * slopes[channel_index] + offsets[channel_index];
                        }
                        if !options.contains(ScanOptions::NO_SCALE_DATA) {
                            value *= LSB_SIZE;
                        }

                        let overrun = producer.push(value);
                        flags.samples_transferred.fetch_add(1, Ordering::Relaxed);
                        channel_index = (channel_index + 1) % channel_count.max(1);

                        if overrun {
                            flags.buffer_overrun.store(true, Ordering::Release);
                            flags.scan_running.store(false, Ordering::Release);
                            break 'worker;
                        }
                    }
                }
                Err(e) => {
                    log::debug!("scan data read failed, retrying: {e}");
                }
            }

            // Adaptive sleep (§4.5): consulted only on a poll where a read
            // was attempted, then unconditionally reset. Ported faithfully
            // from the source including the branch flagged in DESIGN.md as
            // likely dead: `status_count` was just incremented above, so it
            // is always >= 1 here and `< SPEEDUP_THRESHOLD` can never hold.
            if status_count > BACKOFF_THRESHOLD {
                sleep *= 2;
            } else if status_count < SPEEDUP_THRESHOLD {
                sleep = (sleep / 2).max(MIN_SLEEP);
            }
            status_count = 0;
        }

        if !status.running && chunk >= status.available {
            flags.scan_running.store(false, Ordering::Release);
            break;
        }

        std::thread::sleep(sleep);
    }

    if flags.scan_running.load(Ordering::Acquire) {
        let _ = state.lock().unwrap().issue(Command::ScanStop, &[], 0);
        flags.scan_running.store(false, Ordering::Release);
    }
    flags.thread_running.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationStore;
    use crate::hal::mock::{MockBus, MockBusLock, MockBusMux, MockDeviceState, MockEeprom, MockGpio};
    use crate::hal::Collaborators;
    use crate::scan::ring;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    fn harness(mock: Arc<StdMutex<MockDeviceState>>) -> Arc<Mutex<DeviceState>> {
        let collaborators = Collaborators {
            bus: Box::new(MockBus::new(Arc::clone(&mock))),
            lock: Box::new(MockBusLock::default()),
            mux: Box::new(MockBusMux::default()),
            gpio: Box::new(MockGpio::default()),
            eeprom: Box::new(MockEeprom::default()),
        };
        Arc::new(Mutex::new(DeviceState::new(
            0,
            collaborators,
            CalibrationStore::defaults(),
            0x0100,
        )))
    }

    fn wait_for_thread_exit(flags: &ScanFlags) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while flags.thread_running.load(Ordering::Acquire) {
            assert!(Instant::now() < deadline, "worker never exited");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn drains_queued_samples_and_marks_done_on_drain_complete() {
        let mock = Arc::new(StdMutex::new(MockDeviceState::default()));
        mock.lock().unwrap().queue_ramp(0, 10);
        mock.lock().unwrap().scan_running = true;
        let state = harness(Arc::clone(&mock));

        let (producer, consumer) = ring::ring(10, 1);
        let flags = Arc::new(ScanFlags::default());
        flags.scan_running.store(true, Ordering::Release);
        flags.thread_running.store(true, Ordering::Release);

        run(WorkerParams {
            state,
            producer,
            flags: Arc::clone(&flags),
            options: ScanOptions::empty(),
            read_threshold: 1,
            channel_count: 1,
            slopes: vec![1.0],
            offsets: vec![0.0],
        });

        assert_eq!(consumer.depth(), 10);
        assert!(!flags.scan_running.load(Ordering::Acquire));
        assert!(!flags.thread_running.load(Ordering::Acquire));
    }

    #[test]
    fn hardware_overrun_stops_worker_and_sets_flag() {
        let mock = Arc::new(StdMutex::new(MockDeviceState::default()));
        {
            let mut m = mock.lock().unwrap();
            m.scan_running = true;
            m.hw_overrun = true;
        }
        let state = harness(Arc::clone(&mock));
        let (producer, _consumer) = ring::ring(10, 1);
        let flags = Arc::new(ScanFlags::default());
        flags.scan_running.store(true, Ordering::Release);
        flags.thread_running.store(true, Ordering::Release);

        run(WorkerParams {
            state,
            producer,
            flags: Arc::clone(&flags),
            options: ScanOptions::empty(),
            read_threshold: 1,
            channel_count: 1,
            slopes: vec![1.0],
            offsets: vec![0.0],
        });

        assert!(flags.hw_overrun.load(Ordering::Acquire));
        assert!(!flags.scan_running.load(Ordering::Acquire));
    }

    #[test]
    fn buffer_overrun_stops_worker_once_ring_is_full() {
        let mock = Arc::new(StdMutex::new(MockDeviceState::default()));
        {
            let mut m = mock.lock().unwrap();
            m.scan_running = true;
            m.queue_ramp(0, 5);
        }
        let state = harness(Arc::clone(&mock));
        // Ring capacity smaller than queued samples forces an overrun.
        let (producer, _consumer) = ring::ring(2, 1);
        let flags = Arc::new(ScanFlags::default());
        flags.scan_running.store(true, Ordering::Release);
        flags.thread_running.store(true, Ordering::Release);

        run(WorkerParams {
            state,
            producer,
            flags: Arc::clone(&flags),
            options: ScanOptions::empty(),
            read_threshold: 1,
            channel_count: 1,
            slopes: vec![1.0],
            offsets: vec![0.0],
        });

        assert!(flags.buffer_overrun.load(Ordering::Acquire));
        assert!(!flags.scan_running.load(Ordering::Acquire));
    }

    #[test]
    fn calibration_bypass_yields_raw_code_exactly() {
        let mock = Arc::new(StdMutex::new(MockDeviceState::default()));
        {
            let mut m = mock.lock().unwrap();
            m.scan_running = true;
            m.push_samples(&[0x400000]); // positive mid-scale code
        }
        let state = harness(Arc::clone(&mock));
        let (producer, consumer) = ring::ring(1, 1);
        let flags = Arc::new(ScanFlags::default());
        flags.scan_running.store(true, Ordering::Release);
        flags.thread_running.store(true, Ordering::Release);

        run(WorkerParams {
            state,
            producer,
            flags,
            options: ScanOptions::NO_SCALE_DATA | ScanOptions::NO_CALIBRATE_DATA,
            read_threshold: 1,
            channel_count: 1,
            slopes: vec![1.0],
            offsets: vec![0.0],
        });

        let mut out = [0.0; 1];
        consumer.pop_into(&mut out, 1);
        assert_eq!(out[0], 4_194_304.0);
    }

    #[test]
    fn external_trigger_wait_holds_depth_at_zero_until_triggered() {
        let mock = Arc::new(StdMutex::new(MockDeviceState::default()));
        {
            let mut m = mock.lock().unwrap();
            m.scan_running = true;
            m.triggered = false;
            m.queue_ramp(0, 4);
        }
        let state = harness(Arc::clone(&mock));
        let (producer, consumer) = ring::ring(4, 1);
        let flags = Arc::new(ScanFlags::default());
        flags.scan_running.store(true, Ordering::Release);
        flags.thread_running.store(true, Ordering::Release);
        let flags_for_thread = Arc::clone(&flags);

        let mock_for_trigger = Arc::clone(&mock);
        let handle = std::thread::spawn(move || {
            run(WorkerParams {
                state,
                producer,
                flags: flags_for_thread,
                options: ScanOptions::EXTERNAL_TRIGGER,
                read_threshold: 1,
                channel_count: 1,
                slopes: vec![1.0],
                offsets: vec![0.0],
            });
        });

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(consumer.depth(), 0);

        mock_for_trigger.lock().unwrap().triggered = true;
        wait_for_thread_exit(&flags);
        handle.join().unwrap();
        assert_eq!(consumer.depth(), 4);
    }
}
