//! GATT UUIDs, value layouts, and firmware constants for Sensirion Smart Gadgets.
//!
//! Two device families are supported.  Rather than modelling them as a class
//! hierarchy, each [`DeviceFamily`] carries a static table mapping every
//! logical [`Characteristic`] to its UUID and wire [`Layout`]:
//!
//! | Family | Advertised name | Readout | Data logger |
//! |---|---|---|---|
//! | [`DeviceFamily::Sht3x`] | `Smart Humigadget` | separate `f32` temperature / humidity | ✓ |
//! | [`DeviceFamily::Shtc1`] | `SHTC1 smart gadget` | packed `i16` pair ÷ 100 | ✗ |
//!
//! Sensirion vendor UUIDs live in the `xxxxxxxx-b38d-4985-720e-0f993a68ee41`
//! namespace; device information uses the Bluetooth SIG 16-bit UUIDs.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

// ── Bluetooth SIG characteristics ─────────────────────────────────────────────

/// Expand a 16-bit Bluetooth SIG UUID into the 128-bit base UUID.
const fn sig(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

pub const DEVICE_NAME_CHARACTERISTIC: Uuid = sig(0x2a00);
pub const BATTERY_LEVEL_CHARACTERISTIC: Uuid = sig(0x2a19);
pub const SYSTEM_ID_CHARACTERISTIC: Uuid = sig(0x2a23);
pub const MODEL_NUMBER_CHARACTERISTIC: Uuid = sig(0x2a24);
pub const SERIAL_NUMBER_CHARACTERISTIC: Uuid = sig(0x2a25);
pub const FIRMWARE_REVISION_CHARACTERISTIC: Uuid = sig(0x2a26);
pub const HARDWARE_REVISION_CHARACTERISTIC: Uuid = sig(0x2a27);
pub const SOFTWARE_REVISION_CHARACTERISTIC: Uuid = sig(0x2a28);
pub const MANUFACTURER_NAME_CHARACTERISTIC: Uuid = sig(0x2a29);

// ── Sensirion SHT3x characteristics ───────────────────────────────────────────

/// Data logger service of the SHT3x Smart Humigadget.
pub const LOGGER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000f234_b38d_4985_720e_0f993a68ee41);

/// Host clock in ms since epoch (`u64`, write only).
pub const SYNC_TIME_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000f235_b38d_4985_720e_0f993a68ee41);
/// Oldest timestamp of the download window (`u64`, read + write).
pub const OLDEST_TIMESTAMP_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000f236_b38d_4985_720e_0f993a68ee41);
/// Newest timestamp of the download window (`u64`, read + write).
pub const NEWEST_TIMESTAMP_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000f237_b38d_4985_720e_0f993a68ee41);
/// Start (`1`) or stop (`0`) the logger download (`u8`, write only).
pub const START_LOGGER_DOWNLOAD_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000f238_b38d_4985_720e_0f993a68ee41);
/// Logger interval in ms (`u32`, read + write).  Writing clears the log memory.
pub const LOGGER_INTERVAL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000f239_b38d_4985_720e_0f993a68ee41);
/// Current humidity in %RH (`f32`); also carries humidity log notifications.
pub const HUMIDITY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00001235_b38d_4985_720e_0f993a68ee41);
/// Current temperature in °C (`f32`); also carries temperature log notifications.
pub const TEMPERATURE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002235_b38d_4985_720e_0f993a68ee41);

// ── Sensirion SHTC1 characteristics ───────────────────────────────────────────

/// Packed temperature + humidity readout of the SHTC1 gadget (`i16, i16` ÷ 100).
pub const TEMPERATURE_HUMIDITY_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000aa21_0000_1000_8000_00805f9b34fb);

// ── Logger constants ──────────────────────────────────────────────────────────

/// Written to [`START_LOGGER_DOWNLOAD_CHARACTERISTIC`] to begin streaming the log.
pub const START_DOWNLOAD: u8 = 1;
/// Written to [`START_LOGGER_DOWNLOAD_CHARACTERISTIC`] to end the download.
pub const STOP_DOWNLOAD: u8 = 0;

/// Bytes preceding the values of a bulk log notification (the `u32` run index).
pub const BULK_HEADER_LEN: usize = 4;

/// Run index carried by the *newest* value of a log download.
///
/// The Sensirion profile description says runs are numbered from 0, but
/// firmware 1.3 starts at 1.  Kept as a named constant because it may differ
/// between firmware revisions.
pub const RUN_INDEX_OFFSET: u32 = 1;

/// Consecutive single-value notifications, without new log data in between,
/// after which a stream is considered finished even if its oldest slot is
/// still missing.
pub const MAX_HEARTBEAT_REPEATS: u32 = 5;

/// How long one poll for the next notification may block.
pub const NOTIFICATION_POLL: Duration = Duration::from_secs(1);

/// Upper bound for one download pass.  Downloading a full log (15 872 values
/// per stream) takes about 80 s.
pub const PASS_TIMEOUT: Duration = Duration::from_secs(180);

/// Maximum number of values per stream the SHT3x logger can hold.
pub const LOGGER_CAPACITY: usize = 15_872;

// ── Logical characteristics ───────────────────────────────────────────────────

/// A characteristic addressed by meaning rather than by UUID.
///
/// [`DeviceFamily::uuid`] resolves it for a concrete device; families that do
/// not expose a characteristic return `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    DeviceName,
    BatteryLevel,
    SystemId,
    ModelNumber,
    SerialNumber,
    FirmwareRevision,
    HardwareRevision,
    SoftwareRevision,
    ManufacturerName,
    Temperature,
    Humidity,
    TemperatureHumidity,
    SyncTime,
    OldestTimestamp,
    NewestTimestamp,
    StartLoggerDownload,
    LoggerInterval,
}

/// Binary layout of a characteristic value (always little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    U8,
    U32,
    U64,
    F32,
    /// Two `i16` values scaled by 1/100.
    CentiPair,
    /// Raw ASCII without a terminator.
    Ascii,
}

impl Layout {
    /// Fixed payload size, or `None` for variable-length strings.
    pub fn size(self) -> Option<usize> {
        match self {
            Layout::U8 => Some(1),
            Layout::U32 | Layout::F32 | Layout::CentiPair => Some(4),
            Layout::U64 => Some(8),
            Layout::Ascii => None,
        }
    }
}

type RegisterMap = &'static [(Characteristic, Uuid, Layout)];

const DEVICE_INFORMATION: RegisterMap = &[
    (Characteristic::DeviceName, DEVICE_NAME_CHARACTERISTIC, Layout::Ascii),
    (Characteristic::BatteryLevel, BATTERY_LEVEL_CHARACTERISTIC, Layout::U8),
    (Characteristic::SystemId, SYSTEM_ID_CHARACTERISTIC, Layout::U64),
    (Characteristic::ModelNumber, MODEL_NUMBER_CHARACTERISTIC, Layout::Ascii),
    (Characteristic::SerialNumber, SERIAL_NUMBER_CHARACTERISTIC, Layout::Ascii),
    (Characteristic::FirmwareRevision, FIRMWARE_REVISION_CHARACTERISTIC, Layout::Ascii),
    (Characteristic::HardwareRevision, HARDWARE_REVISION_CHARACTERISTIC, Layout::Ascii),
    (Characteristic::SoftwareRevision, SOFTWARE_REVISION_CHARACTERISTIC, Layout::Ascii),
    (Characteristic::ManufacturerName, MANUFACTURER_NAME_CHARACTERISTIC, Layout::Ascii),
];

const SHT3X_REGISTERS: RegisterMap = &[
    (Characteristic::Temperature, TEMPERATURE_CHARACTERISTIC, Layout::F32),
    (Characteristic::Humidity, HUMIDITY_CHARACTERISTIC, Layout::F32),
    (Characteristic::SyncTime, SYNC_TIME_CHARACTERISTIC, Layout::U64),
    (Characteristic::OldestTimestamp, OLDEST_TIMESTAMP_CHARACTERISTIC, Layout::U64),
    (Characteristic::NewestTimestamp, NEWEST_TIMESTAMP_CHARACTERISTIC, Layout::U64),
    (Characteristic::StartLoggerDownload, START_LOGGER_DOWNLOAD_CHARACTERISTIC, Layout::U8),
    (Characteristic::LoggerInterval, LOGGER_INTERVAL_CHARACTERISTIC, Layout::U32),
];

const SHTC1_REGISTERS: RegisterMap = &[(
    Characteristic::TemperatureHumidity,
    TEMPERATURE_HUMIDITY_CHARACTERISTIC,
    Layout::CentiPair,
)];

// ── Device families ───────────────────────────────────────────────────────────

/// The supported Smart Gadget families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    #[default]
    Sht3x,
    Shtc1,
}

impl DeviceFamily {
    /// Advertised local name, equal to the value of the device-name characteristic.
    pub fn device_name(self) -> &'static str {
        match self {
            DeviceFamily::Sht3x => "Smart Humigadget",
            DeviceFamily::Shtc1 => "SHTC1 smart gadget",
        }
    }

    fn registers(self) -> RegisterMap {
        match self {
            DeviceFamily::Sht3x => SHT3X_REGISTERS,
            DeviceFamily::Shtc1 => SHTC1_REGISTERS,
        }
    }

    fn lookup(self, characteristic: Characteristic) -> Option<(Uuid, Layout)> {
        DEVICE_INFORMATION
            .iter()
            .chain(self.registers())
            .find(|(c, _, _)| *c == characteristic)
            .map(|&(_, uuid, layout)| (uuid, layout))
    }

    /// UUID of `characteristic` on this family, if the family exposes it.
    pub fn uuid(self, characteristic: Characteristic) -> Option<Uuid> {
        self.lookup(characteristic).map(|(uuid, _)| uuid)
    }

    /// Wire layout of `characteristic` on this family.
    pub fn layout(self, characteristic: Characteristic) -> Option<Layout> {
        self.lookup(characteristic).map(|(_, layout)| layout)
    }

    /// Reverse lookup used to route incoming notifications.
    pub fn characteristic_for(self, uuid: Uuid) -> Option<Characteristic> {
        DEVICE_INFORMATION
            .iter()
            .chain(self.registers())
            .find(|(_, u, _)| *u == uuid)
            .map(|&(c, _, _)| c)
    }

    /// Whether the family has an on-board data logger.
    pub fn has_logger(self) -> bool {
        self.uuid(Characteristic::StartLoggerDownload).is_some()
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFamily::Sht3x => f.write_str("SHT3x"),
            DeviceFamily::Shtc1 => f.write_str("SHTC1"),
        }
    }
}
