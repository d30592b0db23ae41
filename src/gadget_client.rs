//! The upward API: every gadget operation, addressed by [`DeviceId`].
//!
//! [`GadgetClient`] routes each call through its [`Supervisor`], so callers
//! never manage sessions.  A device that was never explicitly connected is
//! connected for the duration of one call and disconnected afterwards:
//!
//! ```no_run
//! use smartgadget_rs::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> smartgadget_rs::Result<()> {
//! let mut client = GadgetClient::bluetooth(BtleConfig::default(), GadgetClientConfig::default());
//! let id: DeviceId = "C4:A1:2F:00:9E:31".parse()?;
//!
//! // Keep the link open across calls; connecting takes several seconds.
//! client.connect(id, true).await?;
//! let reading = client.temperature_humidity_dewpoint(id).await?;
//! let log = client
//!     .fetch_logged_data(id, &FetchOptions { num_iterations: 3, ..Default::default() })
//!     .await?;
//! println!("{reading:?}, {} temperatures", log.temperatures.filled());
//! client.disconnect_all().await;
//! # Ok(())
//! # }
//! ```

use crate::btle::{BtleConfig, BtleConnector};
use crate::dewpoint;
use crate::download::DownloadConfig;
use crate::error::Result;
use crate::reconcile::{self, FetchOptions};
use crate::registers;
use crate::session::Connector;
use crate::supervisor::{Idempotency, Supervisor, SupervisorConfig};
use crate::types::{
    ConnectReport, ConnectionState, DeviceId, GadgetInfo, LoggedData, Reading, SyncTime,
};

#[derive(Debug, Clone, Default)]
pub struct GadgetClientConfig {
    pub supervisor: SupervisorConfig,
    pub download: DownloadConfig,
}

pub struct GadgetClient<C: Connector> {
    supervisor: Supervisor<C>,
    download: DownloadConfig,
}

impl GadgetClient<BtleConnector> {
    /// A client talking to real gadgets through the host's Bluetooth adapter.
    pub fn bluetooth(btle: BtleConfig, config: GadgetClientConfig) -> Self {
        Self::new(BtleConnector::new(btle), config)
    }
}

impl<C: Connector> GadgetClient<C> {
    pub fn new(connector: C, config: GadgetClientConfig) -> Self {
        Self {
            supervisor: Supervisor::new(connector, config.supervisor),
            download: config.download,
        }
    }

    // ── Connection management ────────────────────────────────────────────────

    /// Connect to `id` and keep the connection open until [`GadgetClient::disconnect`].
    ///
    /// Not required before other calls; it only saves reconnecting each time.
    pub async fn connect(&mut self, id: DeviceId, strict: bool) -> Result<bool> {
        self.supervisor.connect(id, strict).await
    }

    pub async fn connect_many(&mut self, ids: &[DeviceId], strict: bool) -> Result<ConnectReport> {
        self.supervisor.connect_many(ids, strict).await
    }

    pub async fn disconnect(&mut self, id: DeviceId) {
        self.supervisor.disconnect(id).await
    }

    pub async fn disconnect_all(&mut self) {
        self.supervisor.disconnect_all().await
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.supervisor.connected_devices()
    }

    pub fn state(&self, id: DeviceId) -> ConnectionState {
        self.supervisor.state(id)
    }

    pub fn max_attempts(&self) -> u32 {
        self.supervisor.max_attempts()
    }

    pub fn set_max_attempts(&mut self, max_attempts: u32) {
        self.supervisor.set_max_attempts(max_attempts)
    }

    // ── Readouts ─────────────────────────────────────────────────────────────

    /// Battery level in percent.
    pub async fn battery(&mut self, id: DeviceId) -> Result<u8> {
        self.supervisor
            .execute(id, Idempotency::Idempotent, async |s| registers::battery(s).await)
            .await
    }

    /// Current temperature in °C.
    pub async fn temperature(&mut self, id: DeviceId) -> Result<f32> {
        self.supervisor
            .execute(id, Idempotency::Idempotent, async |s| registers::temperature(s).await)
            .await
    }

    /// Current humidity in %RH.
    pub async fn humidity(&mut self, id: DeviceId) -> Result<f32> {
        self.supervisor
            .execute(id, Idempotency::Idempotent, async |s| registers::humidity(s).await)
            .await
    }

    pub async fn temperature_humidity(&mut self, id: DeviceId) -> Result<(f32, f32)> {
        self.supervisor
            .execute(id, Idempotency::Idempotent, async |s| {
                registers::temperature_humidity(s).await
            })
            .await
    }

    /// Dew point in °C.  Values that are not given are read from the gadget.
    pub async fn dewpoint(
        &mut self,
        id: DeviceId,
        temperature: Option<f32>,
        humidity: Option<f32>,
    ) -> Result<f64> {
        let (t, h) = match (temperature, humidity) {
            (Some(t), Some(h)) => (t, h),
            (Some(t), None) => (t, self.humidity(id).await?),
            (None, Some(h)) => (self.temperature(id).await?, h),
            (None, None) => self.temperature_humidity(id).await?,
        };
        dewpoint::dewpoint(f64::from(t), f64::from(h))
    }

    pub async fn temperature_humidity_dewpoint(&mut self, id: DeviceId) -> Result<Reading> {
        self.supervisor
            .execute(id, Idempotency::Idempotent, async |s| registers::reading(s).await)
            .await
    }

    pub async fn info(&mut self, id: DeviceId) -> Result<GadgetInfo> {
        self.supervisor
            .execute(id, Idempotency::Idempotent, async |s| registers::info(s, id).await)
            .await
    }

    // ── Data logger ──────────────────────────────────────────────────────────

    pub async fn logger_interval(&mut self, id: DeviceId) -> Result<u32> {
        registers::require_logger(self.supervisor.family())?;
        self.supervisor
            .execute(id, Idempotency::Idempotent, async |s| registers::logger_interval(s).await)
            .await
    }

    /// Set the logger interval.  **This clears the gadget's log memory.**
    ///
    /// Never re-sent after a dropped link: if the link drops while the write
    /// is in flight the call fails with [`crate::Error::Unconfirmed`] and the
    /// caller has to check [`GadgetClient::logger_interval`] to find out
    /// whether it landed.
    pub async fn set_logger_interval(&mut self, id: DeviceId, interval_ms: u32) -> Result<()> {
        registers::require_logger(self.supervisor.family())?;
        self.supervisor
            .execute(id, Idempotency::AtMostOnce("set_logger_interval"), async |s| {
                registers::set_logger_interval(s, interval_ms).await
            })
            .await
    }

    /// Oldest timestamp of the log, ms since epoch.
    pub async fn oldest_timestamp(&mut self, id: DeviceId) -> Result<u64> {
        registers::require_logger(self.supervisor.family())?;
        self.supervisor
            .execute(id, Idempotency::Idempotent, async |s| registers::oldest_timestamp(s).await)
            .await
    }

    pub async fn set_oldest_timestamp(&mut self, id: DeviceId, timestamp_ms: u64) -> Result<()> {
        registers::require_logger(self.supervisor.family())?;
        self.supervisor
            .execute(id, Idempotency::Idempotent, async |s| {
                registers::set_oldest_timestamp(s, timestamp_ms).await
            })
            .await
    }

    /// Newest timestamp of the log, ms since epoch.
    pub async fn newest_timestamp(&mut self, id: DeviceId) -> Result<u64> {
        registers::require_logger(self.supervisor.family())?;
        self.supervisor
            .execute(id, Idempotency::Idempotent, async |s| registers::newest_timestamp(s).await)
            .await
    }

    pub async fn set_newest_timestamp(&mut self, id: DeviceId, timestamp_ms: u64) -> Result<()> {
        registers::require_logger(self.supervisor.family())?;
        self.supervisor
            .execute(id, Idempotency::Idempotent, async |s| {
                registers::set_newest_timestamp(s, timestamp_ms).await
            })
            .await
    }

    /// Synchronise the gadget clock.  Returns the time written, if any.
    pub async fn set_sync_time(&mut self, id: DeviceId, sync: SyncTime) -> Result<Option<u64>> {
        registers::require_logger(self.supervisor.family())?;
        self.supervisor
            .execute(id, Idempotency::Idempotent, async |s| registers::sync_time(s, sync).await)
            .await
    }

    /// Download the data log, merging up to `options.num_iterations` passes.
    pub async fn fetch_logged_data(&mut self, id: DeviceId, options: &FetchOptions) -> Result<LoggedData> {
        registers::require_logger(self.supervisor.family())?;
        reconcile::fetch(&mut self.supervisor, id, options, &self.download).await
    }
}
