//! Device session (§4.3): open/close reference counting, ID verification,
//! firmware-version cache, and the IEPE/clock/trigger configuration
//! passthroughs. [`DeviceState`] is the payload the process-wide
//! [`crate::table`] hands out as an `Arc<Mutex<_>>`; [`Device`] is the public
//! handle built on top of one such reference.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::calibration::CalibrationStore;
use crate::commands::{Command, CHANNEL_COUNT, MAX_SAMPLE_RATE, PRODUCT_ID};
use crate::error::{DaqError, Result};
use crate::hal::{Collaborators, GpioDirection, GpioLine};
use crate::scan::{self, reader::ReadOutcome, ScanOptions, ScanSession, ScanStatus};
use crate::table;

/// Config/ID transactions use a short fixed timeout; they are not in the hot
/// path the way scan status/data polls are.
const REPLY_TIMEOUT: Duration = Duration::from_millis(200);
const RETRY_INTERVAL: Duration = Duration::from_micros(50);

fn validate_channel(channel: usize) -> Result<()> {
    if channel >= CHANNEL_COUNT {
        Err(DaqError::bad_parameter(format!(
            "channel {channel} out of range 0..{CHANNEL_COUNT}"
        )))
    } else {
        Ok(())
    }
}

/// Device-reported clock configuration (§4.3 `a_in_clock_config_read`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockConfig {
    pub source: u8,
    pub rate_per_channel: f64,
    pub sync_locked: bool,
}

/// Divisor encoding: `divisor = round(MaxRate / requested)`, clamped to
/// `[1, 256]`; the device stores `divisor - 1` in one byte (§4.3).
pub(crate) fn clock_divisor(rate_per_channel: f64) -> u32 {
    if rate_per_channel <= 0.0 {
        return 256;
    }
    let raw = (MAX_SAMPLE_RATE / rate_per_channel).round();
    if raw.is_nan() {
        256
    } else {
        raw.clamp(1.0, 256.0) as u32
    }
}

/// Host-side copy of the trigger configuration, mirrored after every
/// successful write (§3 "current trigger source and mode").
#[derive(Debug, Clone, Copy, Default)]
struct TriggerConfig {
    source: u8,
    mode: u8,
}

/// Everything the process-wide table owns per open address (§3 "Device
/// handle"). Reference counting itself lives in [`table::DeviceTable`]; this
/// struct is the payload behind one slot's `Arc<Mutex<_>>`.
pub struct DeviceState {
    address: u8,
    collaborators: Collaborators,
    firmware_version: u16,
    trigger: TriggerConfig,
    calibration: CalibrationStore,
    scan: Option<ScanSession>,
}

impl DeviceState {
    pub fn new(
        address: u8,
        collaborators: Collaborators,
        calibration: CalibrationStore,
        firmware_version: u16,
    ) -> Self {
        DeviceState {
            address,
            collaborators,
            firmware_version,
            trigger: TriggerConfig::default(),
            calibration,
            scan: None,
        }
    }

    /// Funnel every wire transaction through the shared transport (§4.2).
    pub(crate) fn issue(&mut self, command: Command, tx: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        crate::transport::transfer(
            self.collaborators.bus.as_mut(),
            self.collaborators.lock.as_mut(),
            self.collaborators.mux.as_mut(),
            self.address,
            command,
            tx,
            expected_len,
            REPLY_TIMEOUT,
            RETRY_INTERVAL,
        )
    }

    fn verify_id(&mut self) -> Result<u16> {
        let mut last_err = None;
        for _ in 0..2 {
            match self.issue(Command::Id, &[], 4) {
                Ok(reply) => {
                    let product_id = u16::from_le_bytes([reply[0], reply[1]]);
                    if product_id != PRODUCT_ID {
                        return Err(DaqError::InvalidDevice);
                    }
                    return Ok(u16::from_le_bytes([reply[2], reply[3]]));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(DaqError::InvalidDevice))
    }

    pub fn has_scan(&self) -> bool {
        self.scan.is_some()
    }

    pub(crate) fn scan(&self) -> Option<&ScanSession> {
        self.scan.as_ref()
    }

    pub(crate) fn install_scan(&mut self, session: ScanSession) {
        debug_assert!(self.scan.is_none());
        self.scan = Some(session);
    }

    pub(crate) fn take_scan(&mut self) -> Option<ScanSession> {
        self.scan.take()
    }

    fn ensure_no_scan(&self) -> Result<()> {
        if self.scan.is_some() {
            Err(DaqError::Busy)
        } else {
            Ok(())
        }
    }

    pub fn firmware_version(&self) -> u16 {
        self.firmware_version
    }

    pub fn serial(&self) -> &str {
        self.calibration.serial()
    }

    pub fn calibration_date(&self) -> &str {
        self.calibration.calibration_date()
    }

    pub fn calibration_coefficient_read(&self, channel: usize) -> Result<(f64, f64)> {
        validate_channel(channel)?;
        Ok(self.calibration.read(channel))
    }

    pub fn calibration_coefficient_write(&mut self, channel: usize, slope: f64, offset: f64) -> Result<()> {
        validate_channel(channel)?;
        self.ensure_no_scan()?;
        self.calibration.write(channel, slope, offset);
        Ok(())
    }

    /// Read-modify-write over a single device-side bitmask byte (one bit
    /// per channel), so writing channel `c` leaves the other channel's bit
    /// untouched.
    pub fn iepe_config_write(&mut self, channel: usize, on: bool) -> Result<()> {
        validate_channel(channel)?;
        self.ensure_no_scan()?;
        let reply = self.issue(Command::IepeCfgRead, &[], 1)?;
        let mut mask = reply[0];
        if on {
            mask |= 1 << channel;
        } else {
            mask &= !(1 << channel);
        }
        self.issue(Command::IepeCfgWrite, &[mask], 0)?;
        Ok(())
    }

    pub fn iepe_config_read(&mut self, channel: usize) -> Result<bool> {
        validate_channel(channel)?;
        let reply = self.issue(Command::IepeCfgRead, &[], 1)?;
        Ok(reply[0] & (1 << channel) != 0)
    }

    pub fn a_in_clock_config_write(&mut self, source: u8, rate_per_channel: f64) -> Result<()> {
        if source > 2 {
            return Err(DaqError::bad_parameter("clock source must be <= 2"));
        }
        self.ensure_no_scan()?;
        let divisor = clock_divisor(rate_per_channel);
        self.issue(Command::ClockCfgWrite, &[source, (divisor - 1) as u8], 0)?;
        Ok(())
    }

    pub fn a_in_clock_config_read(&mut self) -> Result<ClockConfig> {
        let reply = self.issue(Command::ClockCfgRead, &[], 2)?;
        let source = reply[0] & 0x03;
        let sync_locked = reply[0] & 0x80 != 0;
        let divisor = reply[1] as u32 + 1;
        Ok(ClockConfig {
            source,
            rate_per_channel: MAX_SAMPLE_RATE / divisor as f64,
            sync_locked,
        })
    }

    /// Wire payload is one byte, `(mode << 2) | source`, matching the
    /// device's trigger-configure command.
    pub fn trigger_config_write(&mut self, source: u8, mode: u8) -> Result<()> {
        if source > 2 {
            return Err(DaqError::bad_parameter("trigger source must be <= 2"));
        }
        if mode > 3 {
            return Err(DaqError::bad_parameter("trigger mode must be <= 3"));
        }
        self.ensure_no_scan()?;
        let packed = (mode << 2) | source;
        self.issue(Command::TriggerCfgWrite, &[packed], 0)?;
        self.trigger = TriggerConfig { source, mode };
        Ok(())
    }

    pub fn trigger_config_read(&mut self) -> Result<(u8, u8)> {
        let reply = self.issue(Command::TriggerCfgRead, &[], 1)?;
        let source = reply[0] & 0x03;
        let mode = reply[0] >> 2;
        self.trigger = TriggerConfig { source, mode };
        Ok((self.trigger.source, self.trigger.mode))
    }
}

/// Public, address-scoped handle onto an open device (§3 "Device handle").
/// Every `Device::open` call for the same address shares the same
/// underlying [`DeviceState`] (wrapped behind one `Arc<Mutex<_>>` in
/// [`table`]) and bumps its reference count; dropping all handles for an
/// address without calling [`Device::close`] leaves the slot open, matching
/// the reference-counted-handle model in §3/§9.
pub struct Device {
    address: u8,
    state: Arc<Mutex<DeviceState>>,
}

impl Device {
    /// Open (or attach to an already-open) device at `address` (§4.3).
    ///
    /// `address` must be `0..8`. On a fresh open, `collaborators` supplies
    /// every external dependency (EEPROM, bus, lock, mux, GPIO); on an
    /// attach to an already-open slot `collaborators` is dropped unused —
    /// the existing handle's collaborators are reused.
    pub fn open(address: u8, mut collaborators: Collaborators) -> Result<Self> {
        if address as usize >= table::SLOT_COUNT {
            return Err(DaqError::bad_parameter(format!(
                "address {address} out of range 0..{}",
                table::SLOT_COUNT
            )));
        }

        if let Some(state) = table::global().acquire_existing(address) {
            return Ok(Device { address, state });
        }

        let (product_id, custom_data) = collaborators.eeprom.hat_info(address)?;
        if product_id != PRODUCT_ID {
            return Err(DaqError::InvalidDevice);
        }

        let calibration = CalibrationStore::from_factory_json(&custom_data).unwrap_or_else(|| {
            log::warn!("address {address}: factory data unreadable or incomplete, using defaults");
            CalibrationStore::defaults()
        });

        collaborators.gpio.gpio_dir(GpioLine::Reset, GpioDirection::Output)?;
        collaborators.gpio.gpio_write(GpioLine::Reset, false)?;
        collaborators.gpio.gpio_dir(GpioLine::Interrupt, GpioDirection::Input)?;

        let mut state = DeviceState::new(address, collaborators, calibration, 0);
        let firmware_version = match state.verify_id() {
            Ok(v) => v,
            Err(e) => return Err(e),
        };
        state.firmware_version = firmware_version;

        let arc = table::global().install(address, state);
        Ok(Device { address, state: arc })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Close this handle (§4.3 `close`): tears down any active scan first
    /// (idempotent if none is running), decrements the reference count, and
    /// frees the slot once the count reaches zero.
    pub fn close(self) {
        self.scan_cleanup();
        table::global().release(self.address);
    }

    pub fn firmware_version(&self) -> u16 {
        self.state.lock().unwrap().firmware_version()
    }

    pub fn serial(&self) -> String {
        self.state.lock().unwrap().serial().to_string()
    }

    pub fn calibration_date(&self) -> String {
        self.state.lock().unwrap().calibration_date().to_string()
    }

    pub fn calibration_coefficient_read(&self, channel: usize) -> Result<(f64, f64)> {
        self.state.lock().unwrap().calibration_coefficient_read(channel)
    }

    pub fn calibration_coefficient_write(&self, channel: usize, slope: f64, offset: f64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .calibration_coefficient_write(channel, slope, offset)
    }

    pub fn iepe_config_write(&self, channel: usize, on: bool) -> Result<()> {
        self.state.lock().unwrap().iepe_config_write(channel, on)
    }

    pub fn iepe_config_read(&self, channel: usize) -> Result<bool> {
        self.state.lock().unwrap().iepe_config_read(channel)
    }

    pub fn a_in_clock_config_write(&self, source: u8, rate_per_channel: f64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .a_in_clock_config_write(source, rate_per_channel)
    }

    pub fn a_in_clock_config_read(&self) -> Result<ClockConfig> {
        self.state.lock().unwrap().a_in_clock_config_read()
    }

    pub fn trigger_config_write(&self, source: u8, mode: u8) -> Result<()> {
        self.state.lock().unwrap().trigger_config_write(source, mode)
    }

    pub fn trigger_config_read(&self) -> Result<(u8, u8)> {
        self.state.lock().unwrap().trigger_config_read()
    }

    /// Start a continuous or finite scan (§4.4).
    pub fn scan_start(
        &self,
        channel_mask: u8,
        samples_per_channel: i64,
        options: ScanOptions,
    ) -> Result<()> {
        scan::controller::scan_start(&self.state, self.address, channel_mask, samples_per_channel, options)
    }

    /// Non-destructive stop request; the worker winds down on its own once
    /// it observes the device-running bit drop (§4.4).
    pub fn scan_stop(&self) -> Result<()> {
        scan::controller::scan_stop(&self.state)
    }

    /// Tear down the scan session, joining the worker. Safe to call with no
    /// active session (§4.4).
    pub fn scan_cleanup(&self) {
        scan::controller::scan_cleanup(&self.state);
    }

    pub fn scan_buffer_size(&self) -> Result<usize> {
        scan::controller::scan_buffer_size(&self.state)
    }

    pub fn scan_channel_count(&self) -> Result<usize> {
        scan::controller::scan_channel_count(&self.state)
    }

    /// §9 "dual behaviour": the `Result` signals `ResourceUnavail` when no
    /// scan is active, but `ScanStatus` is always returned zeroed in that
    /// case rather than omitted.
    pub fn scan_status(&self) -> (Result<()>, ScanStatus) {
        scan::controller::scan_status(&self.state)
    }

    /// Bounded-wait read (§4.6). `wanted_samples_per_channel == -1` means
    /// "all currently available"; `timeout_seconds < 0.0` means "wait
    /// indefinitely"; `0.0` means "return immediately".
    pub fn scan_read(
        &self,
        wanted_samples_per_channel: i64,
        timeout_seconds: f64,
        out: &mut [f64],
    ) -> (Result<()>, ReadOutcome) {
        scan::reader::scan_read(&self.state, wanted_samples_per_channel, timeout_seconds, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{MockBus, MockBusLock, MockBusMux, MockDeviceState, MockEeprom, MockGpio};
    use std::sync::Mutex as StdMutex;

    fn collaborators() -> Collaborators {
        let mock = Arc::new(StdMutex::new(MockDeviceState::default()));
        Collaborators {
            bus: Box::new(MockBus::new(mock)),
            lock: Box::new(MockBusLock::default()),
            mux: Box::new(MockBusMux::default()),
            gpio: Box::new(MockGpio::default()),
            eeprom: Box::new(MockEeprom::default()),
        }
    }

    #[test]
    fn open_reads_calibration_and_firmware_version() {
        let device = Device::open(0, collaborators()).unwrap();
        assert_eq!(device.serial(), "12345678");
        assert_eq!(device.calibration_date(), "2024-01-01");
        assert_eq!(device.firmware_version(), 0x0100);
        device.close();
    }

    #[test]
    fn open_rejects_wrong_product_id() {
        let mut c = collaborators();
        c.eeprom = Box::new(MockEeprom {
            product_id: 0xDEAD,
            corrupt: false,
            record_json: String::new(),
        });
        assert_eq!(Device::open(0, c).unwrap_err(), DaqError::InvalidDevice);
    }

    #[test]
    fn open_falls_back_to_defaults_on_corrupt_factory_data() {
        let mut c = collaborators();
        c.eeprom = Box::new(MockEeprom {
            corrupt: true,
            ..MockEeprom::default()
        });
        let device = Device::open(1, c).unwrap();
        assert_eq!(device.serial(), "00000000");
        assert_eq!(device.calibration_coefficient_read(0).unwrap(), (1.0, 0.0));
        device.close();
    }

    #[test]
    fn reopen_same_address_shares_state_and_bumps_ref_count() {
        let first = Device::open(2, collaborators()).unwrap();
        let second = Device::open(2, collaborators()).unwrap();
        first.calibration_coefficient_write(0, 2.0, 0.5).unwrap();
        assert_eq!(second.calibration_coefficient_read(0).unwrap(), (2.0, 0.5));
        first.close();
        // second handle still open; device state stays alive.
        assert_eq!(second.calibration_coefficient_read(0).unwrap(), (2.0, 0.5));
        second.close();
    }

    #[test]
    fn config_write_rejected_with_busy_while_scan_active() {
        let device = Device::open(3, collaborators()).unwrap();
        device.scan_start(0b01, 10, ScanOptions::empty()).unwrap();
        assert_eq!(
            device.iepe_config_write(0, true).unwrap_err(),
            DaqError::Busy
        );
        assert_eq!(
            device.calibration_coefficient_write(0, 1.0, 0.0).unwrap_err(),
            DaqError::Busy
        );
        device.scan_cleanup();
        device.close();
    }

    #[test]
    fn invalid_channel_is_bad_parameter() {
        let device = Device::open(4, collaborators()).unwrap();
        assert!(matches!(
            device.iepe_config_write(5, true),
            Err(DaqError::BadParameter(_))
        ));
        device.close();
    }

    #[test]
    fn clock_divisor_round_trips() {
        let device = Device::open(5, collaborators()).unwrap();
        device.a_in_clock_config_write(0, 1000.0).unwrap();
        let read_back = device.a_in_clock_config_read().unwrap();
        let expected_divisor = clock_divisor(1000.0);
        assert_eq!(read_back.rate_per_channel, MAX_SAMPLE_RATE / expected_divisor as f64);
        assert!(read_back.sync_locked);
        device.close();
    }

    #[test]
    fn trigger_config_round_trips_through_the_packed_wire_byte() {
        let device = Device::open(7, collaborators()).unwrap();
        device.trigger_config_write(2, 3).unwrap();
        assert_eq!(device.trigger_config_read().unwrap(), (2, 3));
        device.close();
    }

    #[test]
    fn iepe_write_leaves_other_channel_untouched() {
        let device = Device::open(6, collaborators()).unwrap();
        device.iepe_config_write(0, true).unwrap();
        assert!(device.iepe_config_read(0).unwrap());
        assert!(!device.iepe_config_read(1).unwrap());
        device.iepe_config_write(1, true).unwrap();
        assert!(device.iepe_config_read(0).unwrap());
        assert!(device.iepe_config_read(1).unwrap());
        device.close();
    }
}
