//! Single request/reply transaction over the shared serial bus (§4.2).
//!
//! This is the layer above [`crate::frame`]: it owns device-busy polling,
//! cross-process bus locking, and bus-mode assertion, and maps the reply
//! status byte onto [`DaqError`]. Every public entry point elsewhere in the
//! crate that talks to the device funnels through [`transfer`].

use std::time::{Duration, Instant};

use crate::commands::Command;
use crate::error::{DaqError, Result};
use crate::frame::{self, ParseOutcome};
use crate::hal::{Bus, BusLock, BusMux};

/// The cross-process bus lock's own deadline; independent of the caller's
/// `reply_timeout` (§4.2 step 2).
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff between retries of the final framed drain when the bus returns
/// an I/O error or an incomplete frame mid-read (§4.2 step 7).
const DRAIN_RETRY_BACKOFF: Duration = Duration::from_micros(300);

/// Execute one request/reply transaction, addressed to `address`.
///
/// `expected_rx_payload_len` bounds how many payload bytes are read back;
/// on `Success` the returned `Vec` has exactly that length (or fewer, if
/// the device's declared payload was shorter).
#[allow(clippy::too_many_arguments)]
pub fn transfer(
    bus: &mut dyn Bus,
    lock: &mut dyn BusLock,
    mux: &mut dyn BusMux,
    address: u8,
    command: Command,
    tx_payload: &[u8],
    expected_rx_payload_len: usize,
    reply_timeout: Duration,
    retry_interval: Duration,
) -> Result<Vec<u8>> {
    lock.acquire(LOCK_TIMEOUT)?;
    let result = run_transaction(
        bus,
        mux,
        address,
        command,
        tx_payload,
        expected_rx_payload_len,
        reply_timeout,
        retry_interval,
    );
    lock.release();
    result
}

#[allow(clippy::too_many_arguments)]
fn run_transaction(
    bus: &mut dyn Bus,
    mux: &mut dyn BusMux,
    address: u8,
    command: Command,
    tx_payload: &[u8],
    expected_rx_payload_len: usize,
    reply_timeout: Duration,
    retry_interval: Duration,
) -> Result<Vec<u8>> {
    mux.set_address(address)?;
    bus.ensure_mode()?;

    let request = frame::encode(command as u8, tx_payload)?;
    bus.transfer_full_duplex(&request)?;

    if !retry_interval.is_zero() {
        std::thread::sleep(retry_interval);
    }

    // Deliberately captured here rather than before the lock/mux/initial
    // transfer: the source this is ported from starts its timeout clock
    // only once busy-polling begins, so lock contention and header
    // transfer time are not counted against `reply_timeout`. Preserved
    // faithfully rather than "fixed" (see DESIGN.md open question).
    let deadline = Instant::now() + reply_timeout;

    // The busy-poll loop only reads the first byte of the reply to test for
    // readiness (mcc172.c:481-510); that byte is the frame's start byte and
    // is already off the bus by the time it comes back non-zero, so it must
    // be kept and prepended to whatever the drain reads next rather than
    // discarded (mcc172.c:511-533) — otherwise the start byte never
    // reappears on the wire and `find_reply` can never locate a frame.
    let first_byte = loop {
        let byte = bus.read_byte()?;
        if byte != 0 {
            break byte;
        }
        if Instant::now() >= deadline {
            return Err(DaqError::Timeout);
        }
        std::thread::sleep(retry_interval);
    };

    let drain_len = frame::REPLY_HEADER_LEN + expected_rx_payload_len;
    let zeros = vec![0u8; drain_len - 1];

    let parsed = loop {
        match bus.transfer_full_duplex(&zeros) {
            Ok(rx) => {
                let mut buf = Vec::with_capacity(1 + rx.len());
                buf.push(first_byte);
                buf.extend_from_slice(&rx);
                match frame::find_reply(&buf) {
                    ParseOutcome::Frame { start, len } => {
                        break frame::parse_reply(&buf[start..start + len]);
                    }
                    ParseOutcome::Incomplete => {
                        if Instant::now() >= deadline {
                            return Err(DaqError::Timeout);
                        }
                        std::thread::sleep(DRAIN_RETRY_BACKOFF);
                    }
                }
            }
            Err(_) => {
                if Instant::now() >= deadline {
                    return Err(DaqError::Timeout);
                }
                std::thread::sleep(DRAIN_RETRY_BACKOFF);
            }
        }
    };

    if parsed.command != command as u8 {
        return Err(DaqError::bad_parameter(
            "reply command byte does not match request",
        ));
    }

    crate::error::ReplyStatus::from(parsed.status).into_result()?;

    let mut payload = parsed.payload;
    payload.truncate(expected_rx_payload_len);
    Ok(payload)
}
