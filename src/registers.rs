//! Typed register operations over a [`GattSession`].
//!
//! Each function performs one logical read or write and decodes the wire
//! layout from [`crate::protocol`].  None of them retry; that is the
//! supervisor's job.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::dewpoint::dewpoint;
use crate::error::{Error, Result};
use crate::parse::{
    decode_ascii, decode_centi_pair, decode_f32, decode_u8, decode_u32, decode_u64, encode_u32,
    encode_u64,
};
use crate::protocol::{Characteristic, DeviceFamily, START_DOWNLOAD, STOP_DOWNLOAD};
use crate::session::GattSession;
use crate::types::{DeviceId, GadgetInfo, Reading, SyncTime};

/// Host wall clock in ms since the Unix epoch.
pub fn now_ms() -> u64 {
    // A clock before 1970 is reported as the epoch itself.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn require(family: DeviceFamily, characteristic: Characteristic) -> Result<()> {
    match family.uuid(characteristic) {
        Some(_) => Ok(()),
        None => Err(Error::Unsupported {
            characteristic,
            family,
        }),
    }
}

// ── Readouts ──────────────────────────────────────────────────────────────────

pub async fn battery<S: GattSession>(session: &mut S) -> Result<u8> {
    let raw = session.read(Characteristic::BatteryLevel).await?;
    decode_u8(&raw, "battery level")
}

/// Current `(temperature °C, humidity %RH)`.
///
/// SHT3x gadgets expose two `f32` characteristics; SHTC1 gadgets one packed
/// pair.
pub async fn temperature_humidity<S: GattSession>(session: &mut S) -> Result<(f32, f32)> {
    match session.family() {
        DeviceFamily::Sht3x => {
            let t = session.read(Characteristic::Temperature).await?;
            let h = session.read(Characteristic::Humidity).await?;
            Ok((decode_f32(&t, "temperature")?, decode_f32(&h, "humidity")?))
        }
        DeviceFamily::Shtc1 => {
            let raw = session.read(Characteristic::TemperatureHumidity).await?;
            decode_centi_pair(&raw, "temperature/humidity")
        }
    }
}

pub async fn temperature<S: GattSession>(session: &mut S) -> Result<f32> {
    match session.family() {
        DeviceFamily::Sht3x => {
            let raw = session.read(Characteristic::Temperature).await?;
            decode_f32(&raw, "temperature")
        }
        DeviceFamily::Shtc1 => Ok(temperature_humidity(session).await?.0),
    }
}

pub async fn humidity<S: GattSession>(session: &mut S) -> Result<f32> {
    match session.family() {
        DeviceFamily::Sht3x => {
            let raw = session.read(Characteristic::Humidity).await?;
            decode_f32(&raw, "humidity")
        }
        DeviceFamily::Shtc1 => Ok(temperature_humidity(session).await?.1),
    }
}

/// Temperature, humidity and the dew point derived from them.
pub async fn reading<S: GattSession>(session: &mut S) -> Result<Reading> {
    let (temperature, humidity) = temperature_humidity(session).await?;
    Ok(Reading {
        temperature,
        humidity,
        dewpoint: dewpoint(f64::from(temperature), f64::from(humidity))?,
    })
}

pub async fn string<S: GattSession>(session: &mut S, characteristic: Characteristic) -> Result<String> {
    let raw = session.read(characteristic).await?;
    Ok(decode_ascii(&raw))
}

pub async fn system_id<S: GattSession>(session: &mut S) -> Result<u64> {
    let raw = session.read(Characteristic::SystemId).await?;
    decode_u64(&raw, "system id")
}

// ── Logger registers ──────────────────────────────────────────────────────────

pub async fn logger_interval<S: GattSession>(session: &mut S) -> Result<u32> {
    let raw = session.read(Characteristic::LoggerInterval).await?;
    decode_u32(&raw, "logger interval")
}

/// Set the logger interval.  The gadget clears its log memory when this is
/// written.
pub async fn set_logger_interval<S: GattSession>(session: &mut S, interval_ms: u32) -> Result<()> {
    if interval_ms == 0 {
        return Err(Error::InvalidRequest("logger interval must be positive".into()));
    }
    session
        .write(Characteristic::LoggerInterval, &encode_u32(interval_ms))
        .await
}

pub async fn oldest_timestamp<S: GattSession>(session: &mut S) -> Result<u64> {
    let raw = session.read(Characteristic::OldestTimestamp).await?;
    decode_u64(&raw, "oldest timestamp")
}

pub async fn set_oldest_timestamp<S: GattSession>(session: &mut S, timestamp_ms: u64) -> Result<()> {
    session
        .write(Characteristic::OldestTimestamp, &encode_u64(timestamp_ms))
        .await
}

pub async fn newest_timestamp<S: GattSession>(session: &mut S) -> Result<u64> {
    let raw = session.read(Characteristic::NewestTimestamp).await?;
    decode_u64(&raw, "newest timestamp")
}

pub async fn set_newest_timestamp<S: GattSession>(session: &mut S, timestamp_ms: u64) -> Result<()> {
    session
        .write(Characteristic::NewestTimestamp, &encode_u64(timestamp_ms))
        .await
}

/// Synchronise the gadget clock.  Returns the time written, if any.
pub async fn sync_time<S: GattSession>(session: &mut S, sync: SyncTime) -> Result<Option<u64>> {
    let timestamp_ms = match sync {
        SyncTime::Skip => return Ok(None),
        SyncTime::Now => now_ms(),
        SyncTime::At(ms) => ms,
    };
    session
        .write(Characteristic::SyncTime, &encode_u64(timestamp_ms))
        .await?;
    Ok(Some(timestamp_ms))
}

pub async fn start_download<S: GattSession>(session: &mut S) -> Result<()> {
    session
        .write(Characteristic::StartLoggerDownload, &[START_DOWNLOAD])
        .await
}

pub async fn stop_download<S: GattSession>(session: &mut S) -> Result<()> {
    session
        .write(Characteristic::StartLoggerDownload, &[STOP_DOWNLOAD])
        .await
}

// ── Info ──────────────────────────────────────────────────────────────────────

/// Collect everything the gadget reports about itself.
pub async fn info<S: GattSession>(session: &mut S, id: DeviceId) -> Result<GadgetInfo> {
    let family = session.family();
    let reading = reading(session).await?;
    let (logger_interval_ms, oldest_timestamp_ms, newest_timestamp_ms) = if family.has_logger() {
        (
            Some(logger_interval(session).await?),
            Some(oldest_timestamp(session).await?),
            Some(newest_timestamp(session).await?),
        )
    } else {
        (None, None, None)
    };
    Ok(GadgetInfo {
        address: id.to_string(),
        family,
        device_name: string(session, Characteristic::DeviceName).await?,
        manufacturer: string(session, Characteristic::ManufacturerName).await?,
        model_number: string(session, Characteristic::ModelNumber).await?,
        serial_number: string(session, Characteristic::SerialNumber).await?,
        firmware_revision: string(session, Characteristic::FirmwareRevision).await?,
        hardware_revision: string(session, Characteristic::HardwareRevision).await?,
        software_revision: string(session, Characteristic::SoftwareRevision).await?,
        system_id: system_id(session).await?,
        battery: battery(session).await?,
        temperature: reading.temperature,
        humidity: reading.humidity,
        dewpoint: reading.dewpoint,
        logger_interval_ms,
        oldest_timestamp_ms,
        newest_timestamp_ms,
    })
}

/// Fail early with [`Error::Unsupported`] if the family has no data logger.
pub fn require_logger(family: DeviceFamily) -> Result<()> {
    require(family, Characteristic::StartLoggerDownload)
}
