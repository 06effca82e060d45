//! Host-side driver core for a two-channel 24-bit IEPE/voltage analog input
//! board (§1 overview): open/close session management, device configuration
//! (IEPE excitation, sample clock, trigger), and a continuous-scan subsystem
//! built from a background polling worker, a lock-free host-side ring
//! buffer, and a bounded-wait consumer read path.
//!
//! # Layout
//!
//! - [`error`] — the crate-wide [`DaqError`]/[`Result`] pair every public
//!   call returns.
//! - [`frame`] / [`transport`] — the half-duplex framed request/reply wire
//!   protocol and its busy-poll, retry, and lock-timeout handling (§4.2).
//! - [`commands`] — wire command codes and device-exposed constants (§6).
//! - [`calibration`] — factory-data JSON parsing into per-channel slope/offset
//!   pairs, with a logged fallback to unity defaults (§4.3.1).
//! - [`hal`] — the `Bus`/`BusLock`/`BusMux`/`Gpio`/`Eeprom` collaborator
//!   traits a [`Device`] is opened against, plus a Linux backend
//!   (`linux-backend` feature) and a deterministic `mock` used by every test
//!   in this crate.
//! - [`table`] — the process-wide, reference-counted device slot table that
//!   lets independent `Device::open` calls on the same address share one
//!   session (§9).
//! - [`device`] — [`Device`]/[`DeviceState`]: the open session itself.
//! - [`scan`] — the continuous-scan state machine: `controller` (start/stop),
//!   `worker` (the producer thread), `reader` (the consumer read path), and
//!   `ring` (the SPSC sample buffer).
//!
//! Every public entry point returns [`Result<T>`] = `Result<T, DaqError>`;
//! the wire protocol's own "success" status collapses into `Ok` rather than
//! being represented as a variant.

pub mod calibration;
pub mod commands;
pub mod device;
pub mod error;
pub mod frame;
pub mod hal;
pub mod scan;
pub mod table;
pub mod transport;

pub use commands::{
    CHANNEL_COUNT, LSB_SIZE, MAX_DEVICE_READ_CHUNK, MAX_SAMPLE_RATE, MAX_SPI_TRANSFER,
    PRODUCT_ID, RAW_CODE_MAX, RAW_CODE_MIN, VOLTAGE_RANGE,
};
pub use device::{ClockConfig, Device};
pub use error::{DaqError, Result};
pub use hal::{Bus, BusLock, BusMux, Collaborators, Eeprom, Gpio, GpioDirection, GpioLine};
pub use scan::reader::ReadOutcome;
pub use scan::{ScanOptions, ScanStatus};
pub use table::SLOT_COUNT;
