//! The GATT seam between the engines and a radio.
//!
//! The supervisor and the download engine never touch `btleplug` directly;
//! they only see these two traits.  [`crate::btle`] implements them on top of
//! a real adapter and [`crate::sim`] on top of an in-memory gadget.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::protocol::{Characteristic, DeviceFamily};
use crate::types::{DeviceId, Notification, Stream};

/// An open connection to one gadget.
///
/// Any method may fail with a transient error (see [`crate::Error::is_transient`])
/// when the link drops; the session is then unusable and must be discarded.
pub trait GattSession: Send {
    fn family(&self) -> DeviceFamily;

    /// Read the raw value of `characteristic`.
    fn read(
        &mut self,
        characteristic: Characteristic,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Write `value` to `characteristic` with response.
    fn write(
        &mut self,
        characteristic: Characteristic,
        value: &[u8],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Enable notifications on the characteristic carrying `stream`.
    fn subscribe(&mut self, stream: Stream) -> impl Future<Output = Result<()>> + Send;

    fn unsubscribe(&mut self, stream: Stream) -> impl Future<Output = Result<()>> + Send;

    /// Wait up to `wait` for the next notification on a subscribed stream.
    ///
    /// `Ok(None)` means nothing arrived in time; a closed notification
    /// channel is an error.
    fn next_notification(
        &mut self,
        wait: Duration,
    ) -> impl Future<Output = Result<Option<Notification>>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Opens sessions by device id.
pub trait Connector: Send {
    type Session: GattSession;

    /// Family of the gadgets this connector talks to.
    fn family(&self) -> DeviceFamily;

    /// Make one connection attempt.  Retrying is the caller's business.
    fn open(&mut self, id: DeviceId) -> impl Future<Output = Result<Self::Session>> + Send;
}
