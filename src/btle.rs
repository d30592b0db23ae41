//! [`Connector`] and [`GattSession`] on top of a real Bluetooth adapter.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{
    BDAddr, Central, Characteristic as GattCharacteristic, Manager as _, Peripheral as _,
    ScanFilter, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream as FuturesStream, StreamExt};
use log::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{Characteristic, DeviceFamily};
use crate::session::{Connector, GattSession};
use crate::types::{DeviceId, Notification, Stream};

type NotificationStream = Pin<Box<dyn FuturesStream<Item = ValueNotification> + Send>>;

/// Timeouts and device family for [`BtleConnector`].
#[derive(Debug, Clone)]
pub struct BtleConfig {
    pub family: DeviceFamily,
    /// Hard limit on `connect()`. Default: 10 s.
    pub connect_timeout: Duration,
    /// Hard limit on GATT service discovery. Default: 15 s.
    pub discovery_timeout: Duration,
    /// How long to scan for a device the adapter has not seen yet. Default: 15 s.
    pub scan_timeout: Duration,
}

impl Default for BtleConfig {
    fn default() -> Self {
        Self {
            family: DeviceFamily::default(),
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(15),
            scan_timeout: Duration::from_secs(15),
        }
    }
}

// ── BtleConnector ─────────────────────────────────────────────────────────────

/// Opens [`BtleSession`]s on the first Bluetooth adapter of the host.
///
/// The adapter is acquired lazily on the first [`Connector::open`] and reused
/// afterwards.
pub struct BtleConnector {
    config: BtleConfig,
    adapter: Option<Adapter>,
}

impl BtleConnector {
    pub fn new(config: BtleConfig) -> Self {
        Self {
            config,
            adapter: None,
        }
    }

    async fn adapter(&mut self) -> Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Transport {
                transient: false,
                source: btleplug::Error::Other("no Bluetooth adapter found".into()),
            })?;

        // CoreBluetooth needs a moment to reach poweredOn after initialisation.
        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;
            use log::warn;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => break,
                    Ok(_) if tokio::time::Instant::now() >= deadline => {
                        warn!("macOS: adapter not PoweredOn after 3 s, proceeding anyway");
                        break;
                    }
                    Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
                    Err(e) => {
                        warn!("macOS: adapter_state() error: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }

        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }
}

async fn known_peripheral(adapter: &Adapter, address: BDAddr) -> Result<Option<Peripheral>> {
    Ok(adapter
        .peripherals()
        .await?
        .into_iter()
        .find(|p| p.address() == address))
}

/// Return the peripheral with `address`, scanning for it if the adapter has
/// not cached it yet.
async fn find_peripheral(adapter: &Adapter, id: DeviceId, scan_timeout: Duration) -> Result<Peripheral> {
    if let Some(p) = known_peripheral(adapter, id.address()).await? {
        return Ok(p);
    }

    info!("Scanning for {id} (timeout: {} s) …", scan_timeout.as_secs());
    adapter.start_scan(ScanFilter::default()).await?;
    let found = tokio::time::timeout(scan_timeout, async {
        loop {
            if let Ok(Some(p)) = known_peripheral(adapter, id.address()).await {
                return p;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await;
    adapter.stop_scan().await.ok();

    found.map_err(|_| Error::DeviceNotFound(id.to_string()))
}

impl Connector for BtleConnector {
    type Session = BtleSession;

    fn family(&self) -> DeviceFamily {
        self.config.family
    }

    async fn open(&mut self, id: DeviceId) -> Result<BtleSession> {
        let adapter = self.adapter().await?;
        let peripheral = find_peripheral(&adapter, id, self.config.scan_timeout).await?;

        // BlueZ's Device1.Connect can block forever when the device is out of range.
        let connect_timeout = self.config.connect_timeout;
        match tokio::time::timeout(connect_timeout, peripheral.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                peripheral.disconnect().await.ok();
                return Err(Error::Timeout {
                    what: "connect",
                    after: connect_timeout,
                });
            }
        }

        // BlueZ reports the connection before the remote GATT cache is
        // populated; discovering too early returns an empty set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        let discovery_timeout = self.config.discovery_timeout;
        tokio::time::timeout(discovery_timeout, peripheral.discover_services())
            .await
            .map_err(|_| Error::Timeout {
                what: "service discovery",
                after: discovery_timeout,
            })??;

        let family = self.config.family;
        let characteristics: HashMap<Characteristic, GattCharacteristic> = peripheral
            .characteristics()
            .into_iter()
            .filter_map(|c| family.characteristic_for(c.uuid).map(|logical| (logical, c)))
            .collect();
        info!(
            "Connected to {id} ({family}), {} known characteristics",
            characteristics.len()
        );

        let notifications = peripheral.notifications().await?;

        Ok(BtleSession {
            id,
            family,
            peripheral,
            characteristics,
            notifications,
        })
    }
}

// ── BtleSession ───────────────────────────────────────────────────────────────

pub struct BtleSession {
    id: DeviceId,
    family: DeviceFamily,
    peripheral: Peripheral,
    characteristics: HashMap<Characteristic, GattCharacteristic>,
    notifications: NotificationStream,
}

impl BtleSession {
    fn find_char(&self, characteristic: Characteristic) -> Result<GattCharacteristic> {
        self.characteristics
            .get(&characteristic)
            .cloned()
            .ok_or(Error::Unsupported {
                characteristic,
                family: self.family,
            })
    }
}

fn stream_characteristic(stream: Stream) -> Characteristic {
    match stream {
        Stream::Temperature => Characteristic::Temperature,
        Stream::Humidity => Characteristic::Humidity,
    }
}

impl GattSession for BtleSession {
    fn family(&self) -> DeviceFamily {
        self.family
    }

    async fn read(&mut self, characteristic: Characteristic) -> Result<Vec<u8>> {
        let c = self.find_char(characteristic)?;
        Ok(self.peripheral.read(&c).await?)
    }

    async fn write(&mut self, characteristic: Characteristic, value: &[u8]) -> Result<()> {
        let c = self.find_char(characteristic)?;
        self.peripheral
            .write(&c, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&mut self, stream: Stream) -> Result<()> {
        let c = self.find_char(stream_characteristic(stream))?;
        self.peripheral.subscribe(&c).await?;
        debug!("{}: subscribed to {stream}", self.id);
        Ok(())
    }

    async fn unsubscribe(&mut self, stream: Stream) -> Result<()> {
        let c = self.find_char(stream_characteristic(stream))?;
        self.peripheral.unsubscribe(&c).await?;
        debug!("{}: unsubscribed from {stream}", self.id);
        Ok(())
    }

    async fn next_notification(&mut self, wait: Duration) -> Result<Option<Notification>> {
        let received = match tokio::time::timeout(wait, self.notifications.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => return Err(Error::ChannelClosed),
            Ok(Some(n)) => n,
        };
        let stream = match self.family.characteristic_for(received.uuid) {
            Some(Characteristic::Temperature) => Stream::Temperature,
            Some(Characteristic::Humidity) => Stream::Humidity,
            _ => {
                debug!("{}: ignoring notification from {}", self.id, received.uuid);
                return Ok(None);
            }
        };
        Ok(Some(Notification {
            stream,
            value: received.value,
        }))
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.peripheral.disconnect().await?;
        info!("Disconnected from {}", self.id);
        Ok(())
    }
}
