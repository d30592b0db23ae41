use std::fmt;
use std::str::FromStr;

use btleplug::api::BDAddr;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::protocol::{DeviceFamily, LOGGER_CAPACITY};
use crate::timeline::Timeline;

/// Hardware address of a Smart Gadget; the key for all per-device state.
///
/// Parsed from `AA:BB:CC:DD:EE:FF` (any case) or the undelimited
/// `AABBCCDDEEFF` form and always displayed upper-case with colons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(BDAddr);

impl DeviceId {
    pub fn address(&self) -> BDAddr {
        self.0
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BDAddr::from_str(s.trim())
            .map(DeviceId)
            .map_err(|_| Error::InvalidDeviceId(s.to_owned()))
    }
}

impl From<BDAddr> for DeviceId {
    fn from(addr: BDAddr) -> Self {
        DeviceId(addr)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // BDAddr's Display is already colon-delimited; normalise the case.
        write!(f, "{}", self.0.to_string().to_uppercase())
    }
}

/// One of the two logged quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Temperature,
    Humidity,
}

impl Stream {
    pub const ALL: [Stream; 2] = [Stream::Temperature, Stream::Humidity];
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Temperature => f.write_str("temperature"),
            Stream::Humidity => f.write_str("humidity"),
        }
    }
}

/// Which streams a download should fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSelection {
    pub temperature: bool,
    pub humidity: bool,
}

impl StreamSelection {
    pub const BOTH: StreamSelection = StreamSelection {
        temperature: true,
        humidity: true,
    };

    pub fn contains(&self, stream: Stream) -> bool {
        match stream {
            Stream::Temperature => self.temperature,
            Stream::Humidity => self.humidity,
        }
    }

    pub fn set(&mut self, stream: Stream, enabled: bool) {
        match stream {
            Stream::Temperature => self.temperature = enabled,
            Stream::Humidity => self.humidity = enabled,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.temperature && !self.humidity
    }

    pub fn streams(&self) -> impl Iterator<Item = Stream> + '_ {
        Stream::ALL.into_iter().filter(|s| self.contains(*s))
    }
}

impl Default for StreamSelection {
    fn default() -> Self {
        Self::BOTH
    }
}

/// A notification pushed by the device on a logged stream's characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub stream: Stream,
    pub value: Vec<u8>,
}

/// The `(interval, oldest, newest)` triple that shapes one download pass.
///
/// `oldest_ms` is an exclusive boundary: the device never sends the sample
/// at that timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadWindow {
    pub interval_ms: u32,
    pub oldest_ms: u64,
    pub newest_ms: u64,
}

impl DownloadWindow {
    /// Validate the window.  A zero interval or an empty/inverted range is a
    /// configuration error, and so is a window holding more values than the
    /// logger can store.
    pub fn new(interval_ms: u32, oldest_ms: u64, newest_ms: u64) -> Result<Self> {
        if interval_ms == 0 || newest_ms <= oldest_ms {
            return Err(Error::DegenerateWindow {
                interval_ms,
                oldest_ms,
                newest_ms,
            });
        }
        let slots = (newest_ms - oldest_ms) / u64::from(interval_ms);
        if slots > LOGGER_CAPACITY as u64 {
            return Err(Error::WindowTooLarge {
                slots,
                capacity: LOGGER_CAPACITY,
            });
        }
        Ok(Self {
            interval_ms,
            oldest_ms,
            newest_ms,
        })
    }

    /// Number of samples the window holds: `(newest − oldest) / interval`.
    pub fn len(&self) -> usize {
        ((self.newest_ms - self.oldest_ms) / u64::from(self.interval_ms)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How the device clock is synchronised before a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncTime {
    /// Write the host clock.
    #[default]
    Now,
    /// Write a specific time in ms since epoch.
    At(u64),
    /// Leave the device clock alone.
    Skip,
}

/// Requested download bounds.  The device treats them as hints and reports
/// the window it will actually send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowHints {
    pub sync: SyncTime,
    /// Oldest bound; `None` requests everything (written as 0).
    pub oldest_ms: Option<u64>,
    /// Newest bound; `None` leaves the device's newest timestamp untouched.
    pub newest_ms: Option<u64>,
}

/// Connection lifecycle of one device as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    FailedPermanently,
}

/// Current readout with the derived dew point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    /// °C
    pub temperature: f32,
    /// %RH
    pub humidity: f32,
    /// °C
    pub dewpoint: f64,
}

/// Everything a gadget can report about itself.
///
/// Logger fields are `None` for families without a data logger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GadgetInfo {
    pub address: String,
    pub family: DeviceFamily,
    pub device_name: String,
    pub manufacturer: String,
    pub model_number: String,
    pub serial_number: String,
    pub firmware_revision: String,
    pub hardware_revision: String,
    pub software_revision: String,
    pub system_id: u64,
    pub battery: u8,
    pub temperature: f32,
    pub humidity: f32,
    pub dewpoint: f64,
    pub logger_interval_ms: Option<u32>,
    pub oldest_timestamp_ms: Option<u64>,
    pub newest_timestamp_ms: Option<u64>,
}

/// Result of a logger download: one timeline per stream.
///
/// A stream that was not requested comes back as an empty timeline.  Slots
/// that no pass managed to receive stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedData {
    pub temperatures: Timeline,
    pub humidities: Timeline,
    /// Number of download passes that ran.
    pub passes: usize,
}

/// Outcome of a batch connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectReport {
    pub connected: Vec<DeviceId>,
    pub failed: Vec<DeviceId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_normalises_case() {
        let id: DeviceId = "c4:a1:2f:00:9e:31".parse().unwrap();
        assert_eq!(id.to_string(), "C4:A1:2F:00:9E:31");
        let same: DeviceId = "C4:A1:2F:00:9E:31".parse().unwrap();
        assert_eq!(id, same);
    }

    #[test]
    fn window_larger_than_the_logger_is_rejected() {
        assert!(matches!(
            DownloadWindow::new(1_000, 0, 1_760_000_000_000),
            Err(Error::WindowTooLarge { capacity: LOGGER_CAPACITY, .. })
        ));
        let full = DownloadWindow::new(1_000, 0, LOGGER_CAPACITY as u64 * 1_000).unwrap();
        assert_eq!(full.len(), LOGGER_CAPACITY);
    }

    #[test]
    fn device_id_rejects_garbage() {
        assert!(matches!(
            "not-a-mac".parse::<DeviceId>(),
            Err(Error::InvalidDeviceId(s)) if s == "not-a-mac"
        ));
    }

    #[test]
    fn degenerate_windows_are_rejected() {
        assert!(DownloadWindow::new(0, 0, 10).is_err());
        assert!(DownloadWindow::new(1000, 5000, 5000).is_err());
        assert!(DownloadWindow::new(1000, 6000, 5000).is_err());
        assert_eq!(DownloadWindow::new(10_000, 0, 30_000).unwrap().len(), 3);
        assert_eq!(DownloadWindow::new(10_000, 0, 35_000).unwrap().len(), 3);
    }

    #[test]
    fn selection_iterates_enabled_streams() {
        let mut sel = StreamSelection::BOTH;
        assert_eq!(sel.streams().collect::<Vec<_>>(), Stream::ALL);
        sel.set(Stream::Temperature, false);
        assert_eq!(sel.streams().collect::<Vec<_>>(), vec![Stream::Humidity]);
        sel.set(Stream::Humidity, false);
        assert!(sel.is_empty());
    }
}
