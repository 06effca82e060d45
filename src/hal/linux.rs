//! Real Linux implementation of the `hal` traits: `spidev` for the bus,
//! `gpio-cdev` for the reset/interrupt lines, and an `flock(2)`'d file for
//! the cross-process bus lock. Compiled only with `--features
//! linux-backend`; the core crate never references these types directly.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use gpio_cdev::{Chip, LineRequestFlags};
use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

use crate::error::{DaqError, Result};
use crate::hal::{Bus, BusLock, BusMux, Eeprom, Gpio, GpioDirection, GpioLine};

/// SPI mode 1 (CPOL=0, CPHA=1), 8 bits/word, 20 MHz, no CS delay (§6).
pub struct SpidevBus {
    dev: Spidev,
}

impl SpidevBus {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut dev = Spidev::open(path.as_ref())
            .map_err(|e| DaqError::resource_unavail(format!("open {:?}: {e}", path.as_ref())))?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(20_000_000)
            .mode(SpiModeFlags::SPI_MODE_1)
            .build();
        dev.configure(&options)
            .map_err(|e| DaqError::undefined(format!("spidev configure: {e}")))?;
        Ok(SpidevBus { dev })
    }
}

impl Bus for SpidevBus {
    fn transfer_full_duplex(&mut self, tx: &[u8]) -> Result<Vec<u8>> {
        let mut rx = vec![0u8; tx.len()];
        {
            let mut transfer = SpidevTransfer::read_write(tx, &mut rx);
            self.dev
                .transfer(&mut transfer)
                .map_err(|e| DaqError::undefined(format!("spidev transfer: {e}")))?;
        }
        Ok(rx)
    }

    fn ensure_mode(&mut self) -> Result<()> {
        // Other processes may have reconfigured the controller between
        // transactions; re-assert mode unconditionally, matching §4.2 step 3.
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(20_000_000)
            .mode(SpiModeFlags::SPI_MODE_1)
            .build();
        self.dev
            .configure(&options)
            .map_err(|e| DaqError::undefined(format!("spidev reconfigure: {e}")))
    }
}

/// `flock(2)`-based cross-process lock over a fixed path under `/var/lock`,
/// one per bus (not per address — the bus itself is the shared resource).
pub struct FlockBusLock {
    path: PathBuf,
    file: Option<File>,
}

impl FlockBusLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FlockBusLock {
            path: path.into(),
            file: None,
        }
    }
}

impl BusLock for FlockBusLock {
    fn acquire(&mut self, timeout: Duration) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| DaqError::resource_unavail(format!("open lock file: {e}")))?;

        let deadline = Instant::now() + timeout;
        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                self.file = Some(file);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DaqError::LockTimeout);
            }
            std::thread::sleep(Duration::from_micros(500));
        }
    }

    fn release(&mut self) {
        if let Some(file) = self.file.take() {
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

impl Drop for FlockBusLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Address mux: asserts the bus-select address through whatever GPIO lines
/// or ioctl the carrier board exposes. Modeled here as a small set of
/// select lines driven directly via `gpio-cdev`, matching the "bus-address
/// chip-select driving" collaborator named in §1.
pub struct GpioBusMux {
    chip: Chip,
    select_lines: Vec<u32>,
}

impl GpioBusMux {
    pub fn open(chip_path: impl AsRef<Path>, select_lines: Vec<u32>) -> Result<Self> {
        let chip = Chip::new(chip_path.as_ref())
            .map_err(|e| DaqError::resource_unavail(format!("open gpio chip: {e}")))?;
        Ok(GpioBusMux { chip, select_lines })
    }
}

impl BusMux for GpioBusMux {
    fn set_address(&mut self, address: u8) -> Result<()> {
        for (bit, &offset) in self.select_lines.iter().enumerate() {
            let value = (address >> bit) & 1;
            let line = self
                .chip
                .get_line(offset)
                .map_err(|e| DaqError::undefined(format!("get gpio line {offset}: {e}")))?;
            let handle = line
                .request(LineRequestFlags::OUTPUT, value as u8, "iepe-daq-mux")
                .map_err(|e| DaqError::undefined(format!("request gpio line {offset}: {e}")))?;
            handle
                .set_value(value as u8)
                .map_err(|e| DaqError::undefined(format!("set gpio line {offset}: {e}")))?;
        }
        Ok(())
    }
}

/// Reset and interrupt/ready lines via `gpio-cdev`.
pub struct CdevGpio {
    chip: Chip,
    reset_offset: u32,
    interrupt_offset: u32,
}

impl CdevGpio {
    pub fn open(chip_path: impl AsRef<Path>, reset_offset: u32, interrupt_offset: u32) -> Result<Self> {
        let chip = Chip::new(chip_path.as_ref())
            .map_err(|e| DaqError::resource_unavail(format!("open gpio chip: {e}")))?;
        Ok(CdevGpio {
            chip,
            reset_offset,
            interrupt_offset,
        })
    }

    fn offset(&self, line: GpioLine) -> u32 {
        match line {
            GpioLine::Reset => self.reset_offset,
            GpioLine::Interrupt => self.interrupt_offset,
        }
    }
}

impl Gpio for CdevGpio {
    fn gpio_dir(&mut self, line: GpioLine, dir: GpioDirection) -> Result<()> {
        let offset = self.offset(line);
        let flags = match dir {
            GpioDirection::Input => LineRequestFlags::INPUT,
            GpioDirection::Output => LineRequestFlags::OUTPUT,
        };
        let gpio_line = self
            .chip
            .get_line(offset)
            .map_err(|e| DaqError::undefined(format!("get gpio line {offset}: {e}")))?;
        gpio_line
            .request(flags, 0, "iepe-daq")
            .map_err(|e| DaqError::undefined(format!("request gpio line {offset}: {e}")))?;
        Ok(())
    }

    fn gpio_write(&mut self, line: GpioLine, value: bool) -> Result<()> {
        let offset = self.offset(line);
        let gpio_line = self
            .chip
            .get_line(offset)
            .map_err(|e| DaqError::undefined(format!("get gpio line {offset}: {e}")))?;
        let handle = gpio_line
            .request(LineRequestFlags::OUTPUT, value as u8, "iepe-daq")
            .map_err(|e| DaqError::undefined(format!("request gpio line {offset}: {e}")))?;
        handle
            .set_value(value as u8)
            .map_err(|e| DaqError::undefined(format!("set gpio line {offset}: {e}")))
    }

    fn gpio_status(&mut self, line: GpioLine) -> Result<bool> {
        let offset = self.offset(line);
        let gpio_line = self
            .chip
            .get_line(offset)
            .map_err(|e| DaqError::undefined(format!("get gpio line {offset}: {e}")))?;
        let handle = gpio_line
            .request(LineRequestFlags::INPUT, 0, "iepe-daq")
            .map_err(|e| DaqError::undefined(format!("request gpio line {offset}: {e}")))?;
        Ok(handle
            .get_value()
            .map_err(|e| DaqError::undefined(format!("read gpio line {offset}: {e}")))?
            != 0)
    }
}

/// Reads factory data from the HAT EEPROM exposed by the kernel as a flat
/// file (the device-tree overlay maps it under `/proc/device-tree/hat/`).
pub struct SysfsEeprom {
    base: PathBuf,
}

impl SysfsEeprom {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        SysfsEeprom { base: base.into() }
    }
}

impl Eeprom for SysfsEeprom {
    fn hat_info(&mut self, _address: u8) -> Result<(u16, Vec<u8>)> {
        let product_id_raw = std::fs::read(self.base.join("product_id"))
            .map_err(|e| DaqError::resource_unavail(format!("read product_id: {e}")))?;
        if product_id_raw.len() < 2 {
            return Err(DaqError::InvalidDevice);
        }
        let product_id = u16::from_be_bytes([product_id_raw[0], product_id_raw[1]]);
        let custom_data = std::fs::read(self.base.join("custom_0"))
            .map_err(|e| DaqError::resource_unavail(format!("read custom_0: {e}")))?;
        Ok((product_id, custom_data))
    }
}
