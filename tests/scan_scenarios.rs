//! Scenario-level integration tests (SPEC §8 "End-to-end scenarios"),
//! driven against the public `Device` API and the mock `hal` backend —
//! nothing here reaches into crate-private state.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use iepe_daq_core::hal::mock::{MockBus, MockBusLock, MockBusMux, MockDeviceState, MockEeprom, MockGpio};
use iepe_daq_core::hal::Collaborators;
use iepe_daq_core::{DaqError, Device, ScanOptions, ScanStatus};

fn open(address: u8, mock: Arc<Mutex<MockDeviceState>>) -> Device {
    let collaborators = Collaborators {
        bus: Box::new(MockBus::new(Arc::clone(&mock))),
        lock: Box::new(MockBusLock::default()),
        mux: Box::new(MockBusMux::default()),
        gpio: Box::new(MockGpio::default()),
        eeprom: Box::new(MockEeprom::default()),
    };
    Device::open(address, collaborators).expect("mock device opens cleanly")
}

/// Poll `scan_status` until `pred` holds or a 2-second deadline passes —
/// every scenario below waits this way rather than sleeping a fixed amount,
/// since the worker's adaptive poll interval is not something a caller
/// should need to know.
fn wait_for(device: &Device, mut pred: impl FnMut(ScanStatus) -> bool) -> ScanStatus {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let (_, status) = device.scan_status();
        if pred(status) || Instant::now() >= deadline {
            return status;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Scenario 1: finite scan, 1 channel, 100 samples.
#[test]
fn finite_scan_single_channel_drains_all_samples() {
    let mock = Arc::new(Mutex::new(MockDeviceState::default()));
    mock.lock().unwrap().queue_ramp(0, 100);
    let device = open(0, mock);

    device.scan_start(0b01, 100, ScanOptions::empty()).unwrap();
    assert_eq!(device.scan_buffer_size().unwrap(), 100);
    assert_eq!(device.scan_channel_count().unwrap(), 1);

    let status = wait_for(&device, |s| s.samples_available >= 100);
    assert_eq!(status.samples_available, 100);

    let mut out = [0.0; 100];
    let (result, outcome) = device.scan_read(-1, 1.0, &mut out);
    assert!(result.is_ok());
    assert_eq!(outcome.samples_read_per_channel, 100);
    assert!(outcome.status.triggered);

    device.scan_cleanup();
    device.close();
}

/// Scenario 2: two-channel interleaving — samples arrive ch0, ch1, ch0, ch1…
#[test]
fn two_channel_scan_interleaves_in_order() {
    let mock = Arc::new(Mutex::new(MockDeviceState::default()));
    // 8 raw codes; worker assigns channel 0,1,0,1,... as it converts them.
    mock.lock().unwrap().push_samples(&[10, 20, 30, 40, 50, 60, 70, 80]);
    let device = open(1, mock);

    device
        .scan_start(0b11, 4, ScanOptions::NO_CALIBRATE_DATA | ScanOptions::NO_SCALE_DATA)
        .unwrap();
    assert_eq!(device.scan_channel_count().unwrap(), 2);

    wait_for(&device, |s| s.samples_available >= 4);

    let mut out = [0.0; 8];
    let (result, outcome) = device.scan_read(-1, 1.0, &mut out);
    assert!(result.is_ok());
    assert_eq!(outcome.samples_read_per_channel, 4);
    assert_eq!(out, [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0]);

    device.scan_cleanup();
    device.close();
}

/// Scenario 3: external trigger wait — depth stays at zero until the device
/// reports triggered, then normal drain resumes.
#[test]
fn external_trigger_holds_until_device_reports_triggered() {
    let mock = Arc::new(Mutex::new(MockDeviceState::default()));
    {
        let mut m = mock.lock().unwrap();
        m.triggered = false;
        m.queue_ramp(0, 10);
    }
    let device = open(2, mock.clone());

    device
        .scan_start(0b01, 10, ScanOptions::EXTERNAL_TRIGGER)
        .unwrap();

    std::thread::sleep(Duration::from_millis(30));
    let (_, status) = device.scan_status();
    assert_eq!(status.samples_available, 0);
    assert!(!status.triggered);

    mock.lock().unwrap().triggered = true;
    wait_for(&device, |s| s.samples_available >= 10);

    let mut out = [0.0; 10];
    let (result, outcome) = device.scan_read(-1, 1.0, &mut out);
    assert!(result.is_ok());
    assert_eq!(outcome.samples_read_per_channel, 10);

    device.scan_cleanup();
    device.close();
}

/// Scenario 4: hardware-overrun status bit causes the worker to exit with
/// `scan_running` false, and `scan_read` reports it within one worker poll.
#[test]
fn hardware_overrun_is_surfaced_to_the_reader() {
    let mock = Arc::new(Mutex::new(MockDeviceState::default()));
    mock.lock().unwrap().hw_overrun = true;
    let device = open(3, mock);

    device.scan_start(0b01, 10, ScanOptions::empty()).unwrap();

    let status = wait_for(&device, |s| s.hardware_overrun && !s.running);
    assert!(status.hardware_overrun);
    assert!(!status.running);

    let mut out = [0.0; 10];
    let (result, outcome) = device.scan_read(-1, 0.1, &mut out);
    assert!(result.is_ok());
    assert!(outcome.status.hardware_overrun);

    device.scan_cleanup();
    device.close();
}

/// Scenario 5: lock contention — the bus lock times out and no transfer is
/// ever issued, so the public entry point surfaces `LockTimeout` directly.
#[test]
fn lock_contention_surfaces_lock_timeout_without_any_transfer() {
    let mock = Arc::new(Mutex::new(MockDeviceState::default()));
    let collaborators = Collaborators {
        bus: Box::new(MockBus::new(Arc::clone(&mock))),
        lock: Box::new(MockBusLock {
            always_times_out: true,
        }),
        mux: Box::new(MockBusMux::default()),
        gpio: Box::new(MockGpio::default()),
        eeprom: Box::new(MockEeprom::default()),
    };
    let err = Device::open(4, collaborators).unwrap_err();
    assert_eq!(err, DaqError::LockTimeout);
}

/// Scenario 6: calibration bypass — raw code 0x400000 (positive mid-scale)
/// arrives as 4194304.0 exactly with both NoCalibrateData and NoScaleData set.
#[test]
fn calibration_and_scale_bypass_yields_raw_code_exactly() {
    let mock = Arc::new(Mutex::new(MockDeviceState::default()));
    mock.lock().unwrap().push_samples(&[0x400000]);
    let device = open(5, mock);

    // Non-unity calibration so a pass-through would be distinguishable from
    // "slope applied and happened to cancel out".
    device.calibration_coefficient_write(0, 2.0, 100.0).unwrap();

    device
        .scan_start(
            0b01,
            1,
            ScanOptions::NO_SCALE_DATA | ScanOptions::NO_CALIBRATE_DATA,
        )
        .unwrap();

    wait_for(&device, |s| s.samples_available >= 1);

    let mut out = [0.0; 1];
    let (result, outcome) = device.scan_read(-1, 1.0, &mut out);
    assert!(result.is_ok());
    assert_eq!(outcome.samples_read_per_channel, 1);
    assert_eq!(out[0], 4_194_304.0);

    device.scan_cleanup();
    device.close();
}

/// Boundary behaviour: `scan_read` with `wanted == -1` returns exactly
/// `depth / channel_count` rows and leaves depth at zero, rather than
/// blocking to fill the whole output buffer.
#[test]
fn scan_read_wanted_minus_one_drains_exactly_whats_available() {
    let mock = Arc::new(Mutex::new(MockDeviceState::default()));
    mock.lock().unwrap().queue_ramp(0, 3);
    let device = open(6, mock);

    device.scan_start(0b01, 3, ScanOptions::empty()).unwrap();
    wait_for(&device, |s| s.samples_available >= 3);

    // Output buffer is deliberately larger than what's available.
    let mut out = [0.0; 16];
    let (result, outcome) = device.scan_read(-1, 0.0, &mut out);
    assert!(result.is_ok());
    assert_eq!(outcome.samples_read_per_channel, 3);

    let (_, status) = device.scan_status();
    assert_eq!(status.samples_available, 0);

    device.scan_cleanup();
    device.close();
}

/// `scan_start` on a handle that already has an active session returns
/// `Busy`, and a config write during a scan is rejected the same way.
#[test]
fn second_scan_start_and_config_write_are_rejected_while_running() {
    let mock = Arc::new(Mutex::new(MockDeviceState::default()));
    let device = open(7, mock);

    device.scan_start(0b01, 50, ScanOptions::empty()).unwrap();
    assert_eq!(
        device.scan_start(0b01, 50, ScanOptions::empty()).unwrap_err(),
        DaqError::Busy
    );
    assert_eq!(
        device.iepe_config_write(0, true).unwrap_err(),
        DaqError::Busy
    );

    device.scan_cleanup();
    device.close();
}
