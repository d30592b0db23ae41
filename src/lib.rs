//! # smartgadget-rs
//!
//! Async Rust library and command-line tool for reading and downloading the
//! data log of [Sensirion Smart Gadgets](https://sensirion.com/products/catalog/SHT3x-DIS-Smart-Gadget)
//! over Bluetooth Low Energy.
//!
//! ## Supported hardware
//!
//! | Gadget | Readout | Data logger | Notes |
//! |---|---|---|---|
//! | SHT3x Smart Humigadget | ✓ | ✓ | up to 15 872 values per stream |
//! | SHTC1 smart gadget | ✓ | ✗ | packed temperature + humidity readout |
//!
//! Every operation is addressed by a [`types::DeviceId`] (the gadget's MAC
//! address).  Connections are supervised: an operation on a device that is
//! not connected opens a transient connection, and a link that drops in the
//! middle of an idempotent operation is re-established and the operation
//! retried, up to a configurable number of attempts.
//!
//! Log downloads are lossy, because BLE notifications are not acknowledged.
//! [`gadget_client::GadgetClient::fetch_logged_data`] can run several passes
//! and merge them, re-requesting only the part of the log that still has
//! gaps.
//!
//! ## Quick start
//!
//! ```no_run
//! use smartgadget_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut client = GadgetClient::bluetooth(BtleConfig::default(), GadgetClientConfig::default());
//!     let id: DeviceId = "C4:A1:2F:00:9E:31".parse()?;
//!
//!     let options = FetchOptions { num_iterations: 3, ..Default::default() };
//!     let log = client.fetch_logged_data(id, &options).await?;
//!     for sample in log.temperatures.samples() {
//!         println!("{} {:?}", sample.timestamp_ms, sample.value);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Without hardware, swap the connector for a [`sim::SimulatedGadget`]:
//!
//! ```no_run
//! use smartgadget_rs::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> smartgadget_rs::Result<()> {
//! let gadget = SimulatedGadget::new(SimConfig::demo(DeviceFamily::Sht3x, 3_600_000));
//! let mut client = GadgetClient::new(gadget, GadgetClientConfig::default());
//! let reading = client.temperature_humidity_dewpoint("00:00:00:00:00:01".parse()?).await?;
//! println!("{reading:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`gadget_client`] | The [`gadget_client::GadgetClient`] API: readouts, logger registers, log download |
//! | [`supervisor`] | Connection registry, retry budget, and transient connections |
//! | [`reconcile`] | Multi-pass download and merging of passes |
//! | [`download`] | One download pass: notification routing and end-of-log detection |
//! | [`timeline`] | Fixed-interval sample series with gap tracking |
//! | [`registers`] | Typed reads and writes of individual characteristics |
//! | [`session`] | The [`session::GattSession`] / [`session::Connector`] transport seam |
//! | [`btle`] | `btleplug` implementation of the transport |
//! | [`sim`] | In-memory gadget with scripted faults |
//! | [`types`] | Device ids, windows, readouts, and results |
//! | [`protocol`] | GATT UUIDs, value layouts, and firmware constants |
//! | [`parse`] | Little-endian value codecs and the bulk notification format |
//! | [`dewpoint`] | Dew point from temperature and humidity |
//! | [`error`] | The crate [`Error`] type |

pub mod btle;
pub mod dewpoint;
pub mod download;
pub mod error;
pub mod gadget_client;
pub mod parse;
pub mod protocol;
pub mod reconcile;
pub mod registers;
pub mod session;
pub mod sim;
pub mod supervisor;
pub mod timeline;
pub mod types;

pub use error::{Error, Result};

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
///
/// ```no_run
/// use smartgadget_rs::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let mut client = GadgetClient::bluetooth(BtleConfig::default(), GadgetClientConfig::default());
/// let ids: Vec<DeviceId> = vec!["C4:A1:2F:00:9E:31".parse()?, "C4:A1:2F:00:9E:32".parse()?];
/// let report = client.connect_many(&ids, false).await?;
/// for id in report.connected {
///     println!("{id}: {} %", client.battery(id).await?);
/// }
/// client.disconnect_all().await;
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    // ── Client ────────────────────────────────────────────────────────────────
    pub use crate::gadget_client::{GadgetClient, GadgetClientConfig};
    pub use crate::reconcile::FetchOptions;

    // ── Transports ────────────────────────────────────────────────────────────
    pub use crate::btle::{BtleConfig, BtleConnector};
    pub use crate::session::{Connector, GattSession};
    pub use crate::sim::{LossModel, SimConfig, SimulatedGadget};

    // ── Configuration ─────────────────────────────────────────────────────────
    pub use crate::download::DownloadConfig;
    pub use crate::supervisor::SupervisorConfig;

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::protocol::DeviceFamily;
    pub use crate::timeline::{Sample, Timeline};
    pub use crate::types::{
        ConnectReport, ConnectionState, DeviceId, GadgetInfo, LoggedData, Reading,
        StreamSelection, SyncTime, WindowHints,
    };

    pub use crate::error::{Error, Result};
}
