//! Shared error type for every public entry point in this crate.
//!
//! Mirrors the shape of a generic async device driver's `Error<TxError,
//! RxError>`: one flat enum, `Clone + PartialEq` so tests can assert on it
//! directly, propagated with `?` rather than unwound with panics.

use std::fmt;

/// Result alias used throughout the crate. "Success" in the wire protocol's
/// status byte collapses into `Ok(())` / `Ok(T)` here; `DaqError` only
/// carries the failure kinds from the wire and host-side validation.
pub type Result<T> = std::result::Result<T, DaqError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DaqError {
    /// Arguments out of range, or a null/zero-length sink passed to a read.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Device state forbids the operation (e.g. config change during a scan).
    #[error("device busy")]
    Busy,

    /// Deadline elapsed mid-transaction or mid-read.
    #[error("timeout")]
    Timeout,

    /// The cross-process bus lock was not acquired within its deadline.
    #[error("bus lock not acquired within the deadline")]
    LockTimeout,

    /// Allocation, fd open, thread spawn, or session-less access failed.
    #[error("resource unavailable: {0}")]
    ResourceUnavail(String),

    /// Wrong product id, or the EEPROM could not be read/parsed into a
    /// matching device identity.
    #[error("invalid device")]
    InvalidDevice,

    /// Lower-level ioctl failure or an unmapped firmware status byte.
    #[error("undefined device error: {0}")]
    Undefined(String),
}

impl DaqError {
    pub(crate) fn bad_parameter(msg: impl Into<String>) -> Self {
        DaqError::BadParameter(msg.into())
    }

    pub(crate) fn resource_unavail(msg: impl Into<String>) -> Self {
        DaqError::ResourceUnavail(msg.into())
    }

    pub(crate) fn undefined(msg: impl Into<String>) -> Self {
        DaqError::Undefined(msg.into())
    }
}

/// Reply status byte returned by the device in a frame header, mapped per
/// the transport's status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyStatus {
    Success,
    Undefined(u8),
    BadParameter,
    Busy,
    Timeout,
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyStatus::Success => write!(f, "success"),
            ReplyStatus::Undefined(b) => write!(f, "undefined status byte {b:#04x}"),
            ReplyStatus::BadParameter => write!(f, "bad parameter"),
            ReplyStatus::Busy => write!(f, "busy"),
            ReplyStatus::Timeout => write!(f, "timeout"),
        }
    }
}

impl From<u8> for ReplyStatus {
    fn from(byte: u8) -> Self {
        match byte {
            0 => ReplyStatus::Success,
            2 => ReplyStatus::BadParameter,
            3 => ReplyStatus::Busy,
            5 => ReplyStatus::Timeout,
            other => ReplyStatus::Undefined(other),
        }
    }
}

impl ReplyStatus {
    pub(crate) fn into_result(self) -> Result<()> {
        match self {
            ReplyStatus::Success => Ok(()),
            ReplyStatus::BadParameter => {
                Err(DaqError::bad_parameter("device reported bad parameter"))
            }
            ReplyStatus::Busy => Err(DaqError::Busy),
            ReplyStatus::Timeout => Err(DaqError::Timeout),
            ReplyStatus::Undefined(b) => Err(DaqError::undefined(format!("status byte {b:#04x}"))),
        }
    }
}
