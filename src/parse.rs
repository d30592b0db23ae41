//! Binary decoders and encoders for Smart Gadget characteristic payloads.
//!
//! All functions in this module are pure and safe to call from any context.
//! Every value on the wire is little-endian:
//!
//! | Function | Layout | Used for |
//! |---|---|---|
//! | [`decode_u8`] | `u8` | battery level, start/stop command |
//! | [`decode_u32`] | `u32` | logger interval (ms) |
//! | [`decode_u64`] | `u64` | timestamps (ms since epoch), system id |
//! | [`decode_f32`] | `f32` | current temperature / humidity |
//! | [`decode_centi_pair`] | `i16, i16` ÷ 100 | SHTC1 temperature + humidity |
//! | [`decode_ascii`] | raw ASCII | device information strings |
//! | [`parse_notification`] | `u32` run index + N × `f32` | logger download |

use crate::error::{Error, Result};
use crate::protocol::BULK_HEADER_LEN;

// ── Fixed-size values ─────────────────────────────────────────────────────────

/// Take exactly `N` bytes from `data`, or report a malformed payload.
fn exact<const N: usize>(data: &[u8], what: &'static str) -> Result<[u8; N]> {
    data.try_into().map_err(|_| Error::Payload {
        what,
        expected: N,
        got: data.len(),
    })
}

pub fn decode_u8(data: &[u8], what: &'static str) -> Result<u8> {
    exact::<1>(data, what).map(|b| b[0])
}

pub fn decode_u32(data: &[u8], what: &'static str) -> Result<u32> {
    exact::<4>(data, what).map(u32::from_le_bytes)
}

pub fn decode_u64(data: &[u8], what: &'static str) -> Result<u64> {
    exact::<8>(data, what).map(u64::from_le_bytes)
}

pub fn decode_f32(data: &[u8], what: &'static str) -> Result<f32> {
    exact::<4>(data, what).map(f32::from_le_bytes)
}

/// Decode the SHTC1 packed readout: two `i16` values in hundredths.
///
/// Returns `(temperature °C, humidity %RH)`.
pub fn decode_centi_pair(data: &[u8], what: &'static str) -> Result<(f32, f32)> {
    let b = exact::<4>(data, what)?;
    let t = i16::from_le_bytes([b[0], b[1]]);
    let h = i16::from_le_bytes([b[2], b[3]]);
    Ok((t as f32 / 100.0, h as f32 / 100.0))
}

/// Decode a device-information string.
///
/// The gadget sends raw ASCII without a terminator; trailing NULs that some
/// firmware pads with are stripped and non-ASCII bytes are replaced.
pub fn decode_ascii(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_owned()
}

pub fn encode_u32(value: u32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn encode_u64(value: u64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

// ── Logger notifications ──────────────────────────────────────────────────────

/// One bulk chunk of the data log.
///
/// `values[0]` belongs to `run_index`, `values[1]` to `run_index + 1`, and so
/// on; run indices grow from the newest sample towards the oldest.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkChunk {
    pub run_index: u32,
    pub values: Vec<f32>,
}

/// A notification on the temperature or humidity characteristic.
#[derive(Debug, Clone, PartialEq)]
pub enum LogNotification {
    /// Logged values, newest to oldest.
    Bulk(BulkChunk),
    /// A live single-value update (header-sized payload).  During a download
    /// it acts as a heartbeat and never carries logged data.
    Single(Option<f32>),
}

/// Classify and decode a notification payload.
///
/// ```text
/// bytes 0..4      : u32 run index         (bulk chunk)
/// bytes 4..4+4N   : N × f32 values
/// ```
///
/// A payload with no room for at least one value after the header is treated
/// as a single-value notification; if it is exactly four bytes it is decoded
/// as the live `f32` reading.  Trailing bytes that do not form a whole `f32`
/// are ignored.
pub fn parse_notification(data: &[u8]) -> LogNotification {
    let n = data.len().saturating_sub(BULK_HEADER_LEN) / 4;
    if n == 0 {
        return LogNotification::Single(decode_f32(data, "single value").ok());
    }
    let run_index = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let values = data[BULK_HEADER_LEN..BULK_HEADER_LEN + 4 * n]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    LogNotification::Bulk(BulkChunk { run_index, values })
}

/// Build a bulk notification payload; the inverse of [`parse_notification`].
pub fn encode_bulk(run_index: u32, values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BULK_HEADER_LEN + 4 * values.len());
    out.extend_from_slice(&run_index.to_le_bytes());
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_values_are_little_endian() {
        assert_eq!(decode_u8(&[87], "battery").unwrap(), 87);
        assert_eq!(decode_u32(&[0x10, 0x27, 0, 0], "interval").unwrap(), 10_000);
        assert_eq!(
            decode_u64(&1_571_000_000_123u64.to_le_bytes(), "timestamp").unwrap(),
            1_571_000_000_123
        );
        assert_eq!(decode_f32(&21.5f32.to_le_bytes(), "temperature").unwrap(), 21.5);
    }

    #[test]
    fn short_payload_is_reported() {
        let err = decode_u64(&[1, 2, 3], "oldest timestamp").unwrap_err();
        assert_eq!(
            err.to_string(),
            "malformed oldest timestamp payload: expected 8 bytes, got 3"
        );
    }

    #[test]
    fn centi_pair_handles_negative_temperatures() {
        let mut data = (-1234i16).to_le_bytes().to_vec();
        data.extend_from_slice(&4567i16.to_le_bytes());
        let (t, h) = decode_centi_pair(&data, "temperature/humidity").unwrap();
        assert!((t - -12.34).abs() < 1e-4);
        assert!((h - 45.67).abs() < 1e-4);
    }

    #[test]
    fn ascii_strings_have_no_terminator() {
        assert_eq!(decode_ascii(b"Sensirion AG"), "Sensirion AG");
        assert_eq!(decode_ascii(b"1.3\0\0"), "1.3");
    }

    #[test]
    fn bulk_chunk_carries_run_index_and_values() {
        let payload = encode_bulk(7, &[20.0, 20.5, 21.0]);
        assert_eq!(payload.len(), 16);
        assert_eq!(
            parse_notification(&payload),
            LogNotification::Bulk(BulkChunk {
                run_index: 7,
                values: vec![20.0, 20.5, 21.0],
            })
        );
    }

    #[test]
    fn header_sized_payload_is_a_single_value() {
        assert_eq!(
            parse_notification(&23.25f32.to_le_bytes()),
            LogNotification::Single(Some(23.25))
        );
        // Too short for a float, and too short for a chunk.
        assert_eq!(parse_notification(&[1, 2, 3, 4, 5, 6]), LogNotification::Single(None));
    }

    #[test]
    fn trailing_partial_value_is_ignored() {
        let mut payload = encode_bulk(1, &[1.0, 2.0]);
        payload.extend_from_slice(&[0xff, 0xff]);
        match parse_notification(&payload) {
            LogNotification::Bulk(chunk) => assert_eq!(chunk.values, vec![1.0, 2.0]),
            other => panic!("expected bulk chunk, got {other:?}"),
        }
    }
}
