//! Deterministic, scriptable `hal` backend used by the test suite.
//!
//! [`MockBus`] models enough of the wire protocol to drive the transport,
//! device-session, and scan state machines end to end without any real
//! hardware: it decodes request frames, holds per-command device state in a
//! shared [`MockDeviceState`], and replies the way the firmware would,
//! including the busy-byte padding the transport's poll loop expects.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::commands::{Command, PRODUCT_ID};
use crate::error::{DaqError, Result};
use crate::frame::{self, START_BYTE};
use crate::hal::{Bus, BusLock, BusMux, Eeprom, Gpio, GpioDirection, GpioLine};

/// Shared, mutable state of the simulated device. Tests reach into this
/// (via [`MockBus::state`]) to script scenarios: inject overruns, queue
/// synthetic samples, hold the sync-locked flag low, etc.
#[derive(Debug)]
pub struct MockDeviceState {
    pub firmware_version: u16,
    pub iepe: [bool; 2],
    pub clock_source: u8,
    pub clock_divisor: u16,
    pub sync_locked: bool,
    pub trigger_source: u8,
    pub trigger_mode: u8,

    pub scan_running: bool,
    pub scan_count: u32,
    pub scan_mask: u8,
    pub triggered: bool,
    pub hw_overrun: bool,
    /// Interleaved samples ready in the device FIFO, queued explicitly by
    /// the test via [`MockDeviceState::push_samples`] or generated as a
    /// ramp with [`MockDeviceState::queue_ramp`].
    pub fifo: VecDeque<i32>,
    /// Cap on how many samples a single `ScanData` reply will hand back,
    /// mirroring the firmware's own internal chunk limit.
    pub max_chunk: usize,

    /// Number of busy (`0x00`) bytes the bus will return before the reply
    /// becomes ready, per transaction. Reset after every completed
    /// transaction.
    pub busy_polls: u32,
}

impl Default for MockDeviceState {
    fn default() -> Self {
        MockDeviceState {
            firmware_version: 0x0100,
            iepe: [false, false],
            clock_source: 0,
            clock_divisor: 1,
            sync_locked: true,
            trigger_source: 0,
            trigger_mode: 0,
            scan_running: false,
            scan_count: 0,
            scan_mask: 0,
            triggered: true,
            hw_overrun: false,
            fifo: VecDeque::new(),
            max_chunk: crate::commands::MAX_DEVICE_READ_CHUNK,
            busy_polls: 0,
        }
    }
}

impl MockDeviceState {
    pub fn push_samples(&mut self, samples: &[i32]) {
        self.fifo.extend(samples.iter().copied());
    }

    /// Enqueue `count` synthetic samples counting up from `start`, useful
    /// for interleave/ordering assertions.
    pub fn queue_ramp(&mut self, start: i32, count: usize) {
        self.fifo.extend(start..start + count as i32);
    }
}

enum Pending {
    Idle,
    /// A request was decoded; `polls_left` busy bytes remain before the
    /// reply is ready to be clocked out.
    Busy { reply: Vec<u8>, polls_left: u32 },
    Ready { reply: Vec<u8> },
}

pub struct MockBus {
    state: Arc<Mutex<MockDeviceState>>,
    pending: Pending,
}

impl MockBus {
    pub fn new(state: Arc<Mutex<MockDeviceState>>) -> Self {
        MockBus {
            state,
            pending: Pending::Idle,
        }
    }

    pub fn state(&self) -> Arc<Mutex<MockDeviceState>> {
        Arc::clone(&self.state)
    }

    fn handle_request(&mut self, request: &[u8]) -> Result<()> {
        let frame::ParseOutcome::Frame { start, len } = peek_request(request) else {
            return Err(DaqError::undefined("malformed request frame from host"));
        };
        let req = &request[start..start + len];
        let command_byte = req[1];
        let count = u16::from_le_bytes([req[2], req[3]]) as usize;
        let payload = &req[4..4 + count];

        let mut state = self.state.lock().unwrap();
        let reply_payload = dispatch(command_byte, payload, &mut state);
        let reply = build_reply(command_byte, reply_payload);
        let polls_left = state.busy_polls;
        state.busy_polls = 0;
        drop(state);

        self.pending = Pending::Busy { reply, polls_left };
        Ok(())
    }
}

/// Parses a request frame out of a raw SPI write (no status byte, unlike a
/// reply): `[START, command, len_lo, len_hi, payload...]`.
fn peek_request(input: &[u8]) -> frame::ParseOutcome {
    let Some(start) = input.iter().position(|&b| b == START_BYTE) else {
        return frame::ParseOutcome::Incomplete;
    };
    let rest = &input[start..];
    if rest.len() < 4 {
        return frame::ParseOutcome::Incomplete;
    }
    let count = u16::from_le_bytes([rest[2], rest[3]]) as usize;
    let total = 4 + count;
    if rest.len() < total {
        return frame::ParseOutcome::Incomplete;
    }
    frame::ParseOutcome::Frame { start, len: total }
}

fn build_reply(command: u8, payload: Vec<u8>) -> Vec<u8> {
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(START_BYTE);
    out.push(command);
    out.push(0); // status: success
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

fn dispatch(command_byte: u8, payload: &[u8], state: &mut MockDeviceState) -> Vec<u8> {
    let Ok(command) = Command::try_from(command_byte) else {
        return Vec::new();
    };

    match command {
        Command::Id => {
            let mut out = Vec::new();
            out.extend_from_slice(&PRODUCT_ID.to_le_bytes());
            out.extend_from_slice(&state.firmware_version.to_le_bytes());
            out
        }
        Command::IepeCfgRead => {
            let mask = (state.iepe[0] as u8) | ((state.iepe[1] as u8) << 1);
            vec![mask]
        }
        Command::IepeCfgWrite => {
            let mask = payload[0];
            state.iepe[0] = mask & 0x01 != 0;
            state.iepe[1] = mask & 0x02 != 0;
            Vec::new()
        }
        Command::ClockCfgRead => {
            let mut byte0 = state.clock_source & 0x03;
            if state.sync_locked {
                byte0 |= 0x80;
            }
            let divisor_byte = state.clock_divisor.saturating_sub(1) as u8;
            vec![byte0, divisor_byte]
        }
        Command::ClockCfgWrite => {
            state.clock_source = payload[0];
            state.clock_divisor = payload[1] as u16 + 1;
            Vec::new()
        }
        Command::TriggerCfgRead => vec![(state.trigger_mode << 2) | state.trigger_source],
        Command::TriggerCfgWrite => {
            state.trigger_source = payload[0] & 0x03;
            state.trigger_mode = payload[0] >> 2;
            Vec::new()
        }
        Command::StartScan => {
            state.scan_count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            state.scan_mask = payload[4];
            state.scan_running = true;
            // A finite scan (`scan_count != 0`) whose full sample count is
            // already sitting in the simulated FIFO is modeled as having
            // finished production immediately: the bit 0x04 in the mask
            // byte is the external-trigger request, not a channel, so only
            // the low two bits count as channels.
            if state.scan_count != 0 {
                let channel_count = (state.scan_mask & 0x03).count_ones() as u64;
                let expected_total = channel_count * state.scan_count as u64;
                if expected_total > 0 && state.fifo.len() as u64 >= expected_total {
                    state.scan_running = false;
                }
            }
            Vec::new()
        }
        Command::ScanStop => {
            state.scan_running = false;
            Vec::new()
        }
        Command::ScanStatus => {
            // A finite/triggered scan's FIFO is exactly the samples the
            // device still has to hand over; once drained there is nothing
            // left running. Continuous scans are expected to keep feeding
            // the FIFO (via `push_samples`/`queue_ramp`) faster than the
            // worker drains it, so this never fires for them in practice.
            if state.scan_running && state.fifo.is_empty() {
                state.scan_running = false;
            }
            let mut flags = 0u8;
            if state.scan_running {
                flags |= 0x01;
            }
            if state.hw_overrun {
                flags |= 0x02;
            }
            if state.triggered {
                flags |= 0x04;
            }
            let available = state.fifo.len().min(u16::MAX as usize) as u16;
            let max_chunk = state.max_chunk.min(u16::MAX as usize) as u16;
            let mut out = vec![flags];
            out.extend_from_slice(&available.to_le_bytes());
            out.extend_from_slice(&max_chunk.to_le_bytes());
            out
        }
        Command::ScanData => {
            let want = u16::from_le_bytes([payload[0], payload[1]]) as usize;
            let take = want.min(state.fifo.len());
            let mut out = Vec::with_capacity(take * 3);
            for _ in 0..take {
                let code = state.fifo.pop_front().unwrap();
                let bytes = (code as u32 & 0x00FF_FFFF).to_be_bytes();
                out.extend_from_slice(&bytes[1..4]);
            }
            out
        }
        Command::Reset | Command::Blink | Command::TestSigRead | Command::TestSigWrite => {
            Vec::new()
        }
        Command::ReadReply => Vec::new(),
    }
}

impl Bus for MockBus {
    fn transfer_full_duplex(&mut self, tx: &[u8]) -> Result<Vec<u8>> {
        match std::mem::replace(&mut self.pending, Pending::Idle) {
            Pending::Idle => {
                self.handle_request(tx)?;
                Ok(vec![0u8; tx.len()])
            }
            Pending::Busy { reply, polls_left } => {
                // A second transfer before the reply is marked ready (via
                // read_byte polling) just re-arms busy padding.
                self.pending = Pending::Busy { reply, polls_left };
                Ok(vec![0u8; tx.len()])
            }
            Pending::Ready { reply } => {
                let mut out = reply.clone();
                out.resize(tx.len(), 0);
                out.truncate(tx.len());
                Ok(out)
            }
        }
    }

    fn read_byte(&mut self) -> Result<u8> {
        match std::mem::replace(&mut self.pending, Pending::Idle) {
            Pending::Idle => Ok(0),
            Pending::Busy { reply, polls_left } => {
                if polls_left == 0 {
                    let first = *reply.first().unwrap_or(&0);
                    // Mirrors real SPI hardware: the byte just clocked out
                    // to test for readiness is gone from the bus: only the
                    // remainder is left for the subsequent full-frame read.
                    let rest = reply.get(1..).unwrap_or(&[]).to_vec();
                    self.pending = Pending::Ready { reply: rest };
                    Ok(first)
                } else {
                    self.pending = Pending::Busy {
                        reply,
                        polls_left: polls_left - 1,
                    };
                    Ok(0)
                }
            }
            Pending::Ready { reply } => {
                let first = *reply.first().unwrap_or(&0);
                self.pending = Pending::Ready { reply };
                Ok(first)
            }
        }
    }
}

/// An in-process stand-in for the inter-process bus lock. `always_times_out`
/// lets a test exercise the lock-contention scenario without any real
/// contention.
pub struct MockBusLock {
    pub always_times_out: bool,
}

impl Default for MockBusLock {
    fn default() -> Self {
        MockBusLock {
            always_times_out: false,
        }
    }
}

impl BusLock for MockBusLock {
    fn acquire(&mut self, _timeout: Duration) -> Result<()> {
        if self.always_times_out {
            Err(DaqError::LockTimeout)
        } else {
            Ok(())
        }
    }

    fn release(&mut self) {}
}

#[derive(Default)]
pub struct MockBusMux {
    pub current: Option<u8>,
}

impl BusMux for MockBusMux {
    fn set_address(&mut self, address: u8) -> Result<()> {
        self.current = Some(address);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockGpio {
    pub reset: bool,
    pub interrupt: bool,
}

impl Gpio for MockGpio {
    fn gpio_dir(&mut self, _line: GpioLine, _dir: GpioDirection) -> Result<()> {
        Ok(())
    }

    fn gpio_write(&mut self, line: GpioLine, value: bool) -> Result<()> {
        match line {
            GpioLine::Reset => self.reset = value,
            GpioLine::Interrupt => self.interrupt = value,
        }
        Ok(())
    }

    fn gpio_status(&mut self, line: GpioLine) -> Result<bool> {
        Ok(match line {
            GpioLine::Reset => self.reset,
            GpioLine::Interrupt => self.interrupt,
        })
    }
}

/// Canned factory-data EEPROM. `corrupt` makes `hat_info` return bytes that
/// fail JSON parsing, exercising the defaults-and-warn fallback in
/// [`crate::calibration`].
pub struct MockEeprom {
    pub product_id: u16,
    pub corrupt: bool,
    pub record_json: String,
}

impl Default for MockEeprom {
    fn default() -> Self {
        MockEeprom {
            product_id: PRODUCT_ID,
            corrupt: false,
            record_json: r#"{"serial":"12345678","calibration":{"date":"2024-01-01","slopes":[1.0,1.0],"offsets":[0.0,0.0]}}"#.to_string(),
        }
    }
}

impl Eeprom for MockEeprom {
    fn hat_info(&mut self, _address: u8) -> Result<(u16, Vec<u8>)> {
        let bytes = if self.corrupt {
            b"not json".to_vec()
        } else {
            self.record_json.clone().into_bytes()
        };
        Ok((self.product_id, bytes))
    }
}
