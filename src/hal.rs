//! External collaborator interfaces (§6 / §1.1).
//!
//! The continuous-scan core never touches `/dev/spidevN`, `/sys/class/gpio`,
//! `flock(2)`, or the HAT EEPROM directly — it only calls these traits. A
//! real Linux-backed implementation lives in [`linux`] (feature
//! `linux-backend`, built on the `spidev` and `gpio-cdev` crates); a
//! deterministic, scriptable implementation used by the test suite lives in
//! [`mock`].

use crate::error::Result;
use std::time::Duration;

/// A single half-duplex byte-oriented transaction primitive over the shared
/// serial bus (SPI mode 1, 8 bits/word, 20 MHz, no CS delay — §6).
pub trait Bus: Send {
    /// Full-duplex transfer: write `tx`, return exactly `tx.len()` bytes
    /// read back over the same clocking.
    fn transfer_full_duplex(&mut self, tx: &[u8]) -> Result<Vec<u8>>;

    /// Read a single byte (used by the busy-poll loop in the transport).
    fn read_byte(&mut self) -> Result<u8> {
        let rx = self.transfer_full_duplex(&[0u8])?;
        Ok(*rx.first().unwrap_or(&0))
    }

    /// Ensure bus mode (phase/polarity) is asserted; reconfigure if the
    /// last transaction on this bus changed it (§4.2 step 3). A no-op for
    /// backends that always drive a fixed mode.
    fn ensure_mode(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Cross-process mutual exclusion over the shared bus (§4.2 step 2).
pub trait BusLock: Send {
    /// Acquire the lock, blocking up to `timeout`. Returns
    /// [`crate::error::DaqError::LockTimeout`] on expiry.
    fn acquire(&mut self, timeout: Duration) -> Result<()>;
    fn release(&mut self);
}

/// Selects which of the up to eight stacked boards is addressed by the next
/// bus transaction (§4.2 step 3).
pub trait BusMux: Send {
    fn set_address(&mut self, address: u8) -> Result<()>;
}

/// Digital direction for a GPIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioDirection {
    Input,
    Output,
}

/// Reset line and firmware-ready/interrupt line control (§6).
pub trait Gpio: Send {
    fn gpio_dir(&mut self, line: GpioLine, dir: GpioDirection) -> Result<()>;
    fn gpio_write(&mut self, line: GpioLine, value: bool) -> Result<()>;
    fn gpio_status(&mut self, line: GpioLine) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioLine {
    Reset,
    Interrupt,
}

/// HAT EEPROM factory-data discovery (§6). Deliberately returns raw bytes;
/// JSON parsing of the factory record happens in [`crate::calibration`].
pub trait Eeprom: Send {
    /// Returns `(product_id, custom_data_json_bytes)`.
    fn hat_info(&mut self, address: u8) -> Result<(u16, Vec<u8>)>;
}

/// A bundle of collaborator implementations backing one open device handle.
/// Grouping them behind one `Box`-able trait keeps `DeviceHandle` from
/// having to juggle four separate trait objects with independent lifetimes.
pub struct Collaborators {
    pub bus: Box<dyn Bus>,
    pub lock: Box<dyn BusLock>,
    pub mux: Box<dyn BusMux>,
    pub gpio: Box<dyn Gpio>,
    pub eeprom: Box<dyn Eeprom>,
}

pub mod mock;

#[cfg(feature = "linux-backend")]
pub mod linux;
