//! Factory-data JSON parsing and the per-device calibration store (§3, §4.3.1).

use serde::Deserialize;

use crate::commands::CHANNEL_COUNT;

#[derive(Debug, Deserialize)]
pub(crate) struct FactoryRecord {
    pub serial: String,
    pub calibration: CalibrationSection,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CalibrationSection {
    pub date: String,
    pub slopes: [f64; CHANNEL_COUNT],
    pub offsets: [f64; CHANNEL_COUNT],
}

/// Per-channel slope/offset plus the factory identity fields, held once per
/// open device handle. Loaded at `open` time, mutable only while no scan
/// session exists (§4.3).
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    pub(crate) serial: String,
    pub(crate) calibration_date: String,
    pub(crate) slopes: [f64; CHANNEL_COUNT],
    pub(crate) offsets: [f64; CHANNEL_COUNT],
}

impl CalibrationStore {
    /// Defaults substituted when the factory record is missing, truncated,
    /// or not valid JSON (§4.3, §4.3.1): serial "00000000", cal_date
    /// "1970-01-01", slope 1.0 / offset 0.0 per channel.
    pub(crate) fn defaults() -> Self {
        CalibrationStore {
            serial: "00000000".to_string(),
            calibration_date: "1970-01-01".to_string(),
            slopes: [1.0; CHANNEL_COUNT],
            offsets: [0.0; CHANNEL_COUNT],
        }
    }

    /// Parse a factory record's JSON payload. Returns `None` (rather than
    /// an error) on any parse failure; the caller logs a warning and falls
    /// back to [`CalibrationStore::defaults`].
    pub(crate) fn from_factory_json(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        let record: FactoryRecord = serde_json::from_str(text).ok()?;
        Some(CalibrationStore {
            serial: record.serial,
            calibration_date: record.calibration.date,
            slopes: record.calibration.slopes,
            offsets: record.calibration.offsets,
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn calibration_date(&self) -> &str {
        &self.calibration_date
    }

    pub fn read(&self, channel: usize) -> (f64, f64) {
        (self.slopes[channel], self.offsets[channel])
    }

    pub fn write(&mut self, channel: usize, slope: f64, offset: f64) {
        self.slopes[channel] = slope;
        self.offsets[channel] = offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_record() {
        let json = br#"{"serial":"ABC12345","calibration":{"date":"2023-05-01","slopes":[1.01,0.99],"offsets":[0.002,-0.001]}}"#;
        let store = CalibrationStore::from_factory_json(json).unwrap();
        assert_eq!(store.serial(), "ABC12345");
        assert_eq!(store.calibration_date(), "2023-05-01");
        assert_eq!(store.read(0), (1.01, 0.002));
        assert_eq!(store.read(1), (0.99, -0.001));
    }

    #[test]
    fn falls_back_on_garbage() {
        assert!(CalibrationStore::from_factory_json(b"not json").is_none());
        let store = CalibrationStore::defaults();
        assert_eq!(store.serial(), "00000000");
        assert_eq!(store.calibration_date(), "1970-01-01");
        assert_eq!(store.read(0), (1.0, 0.0));
    }

    #[test]
    fn falls_back_on_missing_fields() {
        let json = br#"{"serial":"X"}"#;
        assert!(CalibrationStore::from_factory_json(json).is_none());
    }
}
