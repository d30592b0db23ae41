//! An in-memory Smart Gadget.
//!
//! [`SimulatedGadget`] implements [`Connector`] without any radio.  It speaks
//! the same register protocol as the firmware: it answers reads with encoded
//! values, snaps requested download bounds onto its own timestamp grid and
//! streams its log as bulk notifications once the start command is written.
//!
//! Faults are deterministic so every test run sees the same behaviour:
//!
//! | Knob | Effect |
//! |---|---|
//! | `failing_connects` | the first N connection attempts fail (`u32::MAX` = always) |
//! | `drop_link_after` | the link drops on the N+1-th session operation, once |
//! | `loss` | bulk chunks that are never delivered, per pass |

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::parse::{decode_u8, decode_u32, decode_u64, encode_bulk, encode_u32, encode_u64};
use crate::protocol::{
    Characteristic, DeviceFamily, LOGGER_CAPACITY, RUN_INDEX_OFFSET, START_DOWNLOAD, STOP_DOWNLOAD,
};
use crate::session::{Connector, GattSession};
use crate::types::{DeviceId, Notification, Stream, StreamSelection};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Which bulk chunks the simulated radio loses.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LossModel {
    #[default]
    Lossless,
    /// `Scripted(passes)[p]` lists the chunk indices (per stream, newest
    /// first) dropped during download pass `p`.  Passes beyond the script
    /// are lossless.
    Scripted(Vec<Vec<usize>>),
    /// Drop roughly `rate` of all chunks, decided by a hash of
    /// `(seed, pass, stream, chunk)`.
    Hashed { rate: f64, seed: u64 },
}

/// Deterministic value in `[0, 1)`.
fn hash_unit(x: f64) -> f64 {
    ((x.sin() * 9973.1).fract() + 1.0).fract()
}

impl LossModel {
    fn drops(&self, pass: usize, stream: Stream, chunk: usize) -> bool {
        match self {
            LossModel::Lossless => false,
            LossModel::Scripted(passes) => passes
                .get(pass)
                .is_some_and(|dropped| dropped.contains(&chunk)),
            LossModel::Hashed { rate, seed } => {
                let lane = match stream {
                    Stream::Temperature => 0.0,
                    Stream::Humidity => 0.5,
                };
                let x = *seed as f64 * 7.31 + pass as f64 * 131.7 + chunk as f64 * 1.618 + lane;
                hash_unit(x) < *rate
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub family: DeviceFamily,
    pub interval_ms: u32,
    /// Timestamp of the last logged value.
    pub newest_ms: u64,
    /// Logged temperatures, oldest first; the last one is at `newest_ms`.
    pub temperatures: Vec<f32>,
    /// Logged humidities, oldest first.
    pub humidities: Vec<f32>,
    /// Values per bulk notification. Default: 4.
    pub values_per_chunk: usize,
    pub battery: u8,
    pub failing_connects: u32,
    pub drop_link_after: Option<usize>,
    pub loss: LossModel,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            family: DeviceFamily::Sht3x,
            interval_ms: 10_000,
            newest_ms: 0,
            temperatures: Vec::new(),
            humidities: Vec::new(),
            values_per_chunk: 4,
            battery: 87,
            failing_connects: 0,
            drop_link_after: None,
            loss: LossModel::Lossless,
        }
    }
}

impl SimConfig {
    /// One hour of plausible indoor data at a 10 s interval, ending at
    /// `now_ms`, with about 15 % of the chunks lost on every pass.
    pub fn demo(family: DeviceFamily, now_ms: u64) -> Self {
        let interval_ms = 10_000u32;
        let n = 360;
        let newest_ms = now_ms - now_ms % u64::from(interval_ms);
        let signal = |i: usize, base: f64, swing: f64, ch: f64| {
            let t = i as f64 / n as f64;
            let noise = ((t * 1000.7 + ch * 137.508).sin() * 9973.1).fract() - 0.5;
            let v = base + swing * (2.0 * PI * t).sin() + 0.2 * noise;
            ((v * 100.0).round() / 100.0) as f32
        };
        let (temperatures, humidities) = if family.has_logger() {
            (
                (0..n).map(|i| signal(i, 21.5, 1.5, 0.0)).collect(),
                (0..n).map(|i| signal(i, 45.0, 6.0, 1.0)).collect(),
            )
        } else {
            (vec![signal(n, 21.5, 1.5, 0.0)], vec![signal(n, 45.0, 6.0, 1.0)])
        };
        Self {
            family,
            interval_ms,
            newest_ms,
            temperatures,
            humidities,
            loss: LossModel::Hashed { rate: 0.15, seed: 7 },
            ..Self::default()
        }
    }
}

// ── Device state ──────────────────────────────────────────────────────────────

const MANUFACTURER: &str = "Sensirion AG";
const SYSTEM_ID: u64 = 0x00c4_a12f_009e_3100;

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    open_attempts: u32,
    connected: bool,
    operations: usize,
    link_dropped: bool,
    sync_time_ms: Option<u64>,
    requested_oldest_ms: u64,
    requested_newest_ms: Option<u64>,
    subscribed: StreamSelection,
    downloading: bool,
    passes: usize,
    queue: VecDeque<Notification>,
    heartbeat_turn: usize,
    writes: Vec<(Characteristic, Vec<u8>)>,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        Self {
            config,
            open_attempts: 0,
            connected: false,
            operations: 0,
            link_dropped: false,
            sync_time_ms: None,
            requested_oldest_ms: 0,
            requested_newest_ms: None,
            subscribed: StreamSelection {
                temperature: false,
                humidity: false,
            },
            downloading: false,
            passes: 0,
            queue: VecDeque::new(),
            heartbeat_turn: 0,
            writes: Vec::new(),
        }
    }

    fn close(&mut self) {
        self.connected = false;
        self.downloading = false;
        self.queue.clear();
        self.subscribed = StreamSelection {
            temperature: false,
            humidity: false,
        };
    }

    fn values(&self, stream: Stream) -> &[f32] {
        match stream {
            Stream::Temperature => &self.config.temperatures,
            Stream::Humidity => &self.config.humidities,
        }
    }

    fn current(&self, stream: Stream) -> f32 {
        let fallback = match stream {
            Stream::Temperature => 21.0,
            Stream::Humidity => 45.0,
        };
        self.values(stream).last().copied().unwrap_or(fallback)
    }

    fn logged_len(&self) -> usize {
        self.config.temperatures.len().max(self.config.humidities.len())
    }

    /// Largest grid timestamp `<= t`; the grid is `newest − j·interval`.
    fn snap_down(&self, t: u64) -> u64 {
        let newest = self.config.newest_ms;
        let interval = u64::from(self.config.interval_ms);
        if t >= newest || interval == 0 {
            return t.min(newest);
        }
        let steps = (newest - t).div_ceil(interval);
        newest.saturating_sub(steps * interval)
    }

    fn effective_newest(&self) -> u64 {
        let requested = self.requested_newest_ms.unwrap_or(self.config.newest_ms);
        self.snap_down(requested)
    }

    fn effective_oldest(&self) -> u64 {
        let interval = u64::from(self.config.interval_ms);
        let boundary = self
            .config
            .newest_ms
            .saturating_sub(self.logged_len().min(LOGGER_CAPACITY) as u64 * interval);
        self.snap_down(self.requested_oldest_ms).max(boundary)
    }

    /// Queue the log of every subscribed stream, newest value first.
    fn start_download(&mut self) {
        let pass = self.passes;
        self.passes += 1;
        self.downloading = true;
        self.queue.clear();

        let interval = u64::from(self.config.interval_ms);
        let newest = self.effective_newest();
        let oldest = self.effective_oldest();
        let per_chunk = self.config.values_per_chunk.max(1);

        let streams: Vec<Stream> = self.subscribed.streams().collect();
        let mut per_stream: Vec<Vec<Notification>> = Vec::new();
        for stream in streams {
            // A live value precedes the log, like the firmware does.
            let live = self.current(stream).to_le_bytes().to_vec();
            self.queue.push_back(Notification { stream, value: live });

            let values = self.values(stream);
            let mut run: Vec<f32> = Vec::new();
            let mut r = 0u64;
            while interval > 0 && newest >= r * interval && newest - r * interval > oldest {
                let ts = newest - r * interval;
                let back = ((self.config.newest_ms - ts) / interval) as usize;
                match values.len().checked_sub(back + 1).and_then(|i| values.get(i)) {
                    Some(v) => run.push(*v),
                    None => break,
                }
                r += 1;
            }

            let chunks = run
                .chunks(per_chunk)
                .enumerate()
                .filter(|(c, _)| !self.config.loss.drops(pass, stream, *c))
                .map(|(c, values)| Notification {
                    stream,
                    value: encode_bulk((c * per_chunk) as u32 + RUN_INDEX_OFFSET, values),
                })
                .collect();
            per_stream.push(chunks);
        }

        let longest = per_stream.iter().map(Vec::len).max().unwrap_or(0);
        for c in 0..longest {
            for chunks in &per_stream {
                if let Some(n) = chunks.get(c) {
                    self.queue.push_back(n.clone());
                }
            }
        }
        debug!(
            "sim: pass {pass} window ({oldest}, {newest}], {} notifications queued",
            self.queue.len()
        );
    }

    fn next_notification(&mut self) -> Option<Notification> {
        while let Some(n) = self.queue.pop_front() {
            if self.subscribed.contains(n.stream) {
                return Some(n);
            }
        }
        if !self.downloading {
            return None;
        }
        // Log exhausted: the firmware keeps sending live values.
        let streams: Vec<Stream> = self.subscribed.streams().collect();
        let stream = *streams.get(self.heartbeat_turn % streams.len().max(1))?;
        self.heartbeat_turn += 1;
        Some(Notification {
            stream,
            value: self.current(stream).to_le_bytes().to_vec(),
        })
    }

    fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>> {
        let family = self.config.family;
        let ascii = |s: &str| s.as_bytes().to_vec();
        Ok(match characteristic {
            Characteristic::DeviceName => ascii(family.device_name()),
            Characteristic::BatteryLevel => vec![self.config.battery],
            Characteristic::SystemId => encode_u64(SYSTEM_ID),
            Characteristic::ModelNumber => ascii(&format!("{family} Smart Gadget")),
            Characteristic::SerialNumber => ascii("SIM-0001"),
            Characteristic::FirmwareRevision => ascii("1.3"),
            Characteristic::HardwareRevision => ascii("1.0"),
            Characteristic::SoftwareRevision => ascii("1.3"),
            Characteristic::ManufacturerName => ascii(MANUFACTURER),
            Characteristic::Temperature => self.current(Stream::Temperature).to_le_bytes().to_vec(),
            Characteristic::Humidity => self.current(Stream::Humidity).to_le_bytes().to_vec(),
            Characteristic::TemperatureHumidity => {
                let centi = |v: f32| ((v * 100.0).round() as i16).to_le_bytes();
                let mut out = centi(self.current(Stream::Temperature)).to_vec();
                out.extend_from_slice(&centi(self.current(Stream::Humidity)));
                out
            }
            Characteristic::OldestTimestamp => encode_u64(self.effective_oldest()),
            Characteristic::NewestTimestamp => encode_u64(self.effective_newest()),
            Characteristic::StartLoggerDownload => vec![u8::from(self.downloading)],
            Characteristic::LoggerInterval => encode_u32(self.config.interval_ms),
            Characteristic::SyncTime => {
                return Err(Error::InvalidRequest("sync time is write-only".into()));
            }
        })
    }

    fn write(&mut self, characteristic: Characteristic, value: &[u8]) -> Result<()> {
        self.writes.push((characteristic, value.to_vec()));
        match characteristic {
            Characteristic::SyncTime => self.sync_time_ms = Some(decode_u64(value, "sync time")?),
            Characteristic::OldestTimestamp => {
                self.requested_oldest_ms = decode_u64(value, "oldest timestamp")?;
            }
            Characteristic::NewestTimestamp => {
                self.requested_newest_ms = Some(decode_u64(value, "newest timestamp")?);
            }
            Characteristic::LoggerInterval => {
                let interval = decode_u32(value, "logger interval")?;
                if interval == 0 {
                    return Err(Error::InvalidRequest("logger interval must be positive".into()));
                }
                // Changing the interval wipes the log memory.
                self.config.interval_ms = interval;
                self.config.temperatures.clear();
                self.config.humidities.clear();
                self.requested_oldest_ms = 0;
                self.requested_newest_ms = None;
            }
            Characteristic::StartLoggerDownload => match decode_u8(value, "download command")? {
                START_DOWNLOAD => self.start_download(),
                STOP_DOWNLOAD => {
                    self.downloading = false;
                    self.queue.clear();
                }
                other => {
                    return Err(Error::InvalidRequest(format!("unknown download command {other}")));
                }
            },
            other => {
                return Err(Error::InvalidRequest(format!("{other:?} is read-only")));
            }
        }
        Ok(())
    }
}

// ── Connector / session ───────────────────────────────────────────────────────

/// A simulated gadget shared between the connector and its sessions.
///
/// Cloning is cheap and every clone observes the same device, which lets
/// tests inspect the device after handing a clone to a supervisor.
#[derive(Debug, Clone)]
pub struct SimulatedGadget {
    state: Arc<Mutex<SimState>>,
    family: DeviceFamily,
}

impl SimulatedGadget {
    pub fn new(config: SimConfig) -> Self {
        let family = config.family;
        Self {
            state: Arc::new(Mutex::new(SimState::new(config))),
            family,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of connection attempts made so far.
    pub fn open_attempts(&self) -> u32 {
        self.lock().open_attempts
    }

    /// Number of download passes started so far.
    pub fn passes(&self) -> usize {
        self.lock().passes
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Every value written to `characteristic`, oldest first.
    pub fn writes_to(&self, characteristic: Characteristic) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .iter()
            .filter(|(c, _)| *c == characteristic)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Last host time written to the sync-time characteristic.
    pub fn sync_time(&self) -> Option<u64> {
        self.lock().sync_time_ms
    }
}

impl Connector for SimulatedGadget {
    type Session = SimSession;

    fn family(&self) -> DeviceFamily {
        self.family
    }

    async fn open(&mut self, id: DeviceId) -> Result<SimSession> {
        let mut state = self.lock();
        state.open_attempts += 1;
        if state.open_attempts <= state.config.failing_connects {
            debug!("sim: connection attempt {} to {id} fails", state.open_attempts);
            return Err(Error::Timeout {
                what: "connect",
                after: Duration::from_secs(10),
            });
        }
        state.close();
        state.connected = true;
        debug!("sim: connected to {id}");
        Ok(SimSession {
            state: Arc::clone(&self.state),
            family: self.family,
            id,
        })
    }
}

#[derive(Debug)]
pub struct SimSession {
    state: Arc<Mutex<SimState>>,
    family: DeviceFamily,
    id: DeviceId,
}

impl SimSession {
    /// Run `f` against the device if the link is up, injecting the scheduled
    /// link drop.
    fn with_link<T>(&self, f: impl FnOnce(&mut SimState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.connected {
            return Err(Error::Disconnected {
                device: self.id.to_string(),
                reason: "not connected".into(),
            });
        }
        state.operations += 1;
        if let Some(limit) = state.config.drop_link_after {
            if !state.link_dropped && state.operations > limit {
                state.link_dropped = true;
                state.close();
                return Err(Error::Disconnected {
                    device: self.id.to_string(),
                    reason: "link lost".into(),
                });
            }
        }
        f(&mut state)
    }

    fn require(&self, characteristic: Characteristic, value: Option<&[u8]>) -> Result<()> {
        let layout = self.family.layout(characteristic).ok_or(Error::Unsupported {
            characteristic,
            family: self.family,
        })?;
        if let (Some(value), Some(expected)) = (value, layout.size()) {
            if value.len() != expected {
                return Err(Error::Payload {
                    what: "write",
                    expected,
                    got: value.len(),
                });
            }
        }
        Ok(())
    }
}

fn stream_characteristic(stream: Stream) -> Characteristic {
    match stream {
        Stream::Temperature => Characteristic::Temperature,
        Stream::Humidity => Characteristic::Humidity,
    }
}

impl GattSession for SimSession {
    fn family(&self) -> DeviceFamily {
        self.family
    }

    async fn read(&mut self, characteristic: Characteristic) -> Result<Vec<u8>> {
        self.require(characteristic, None)?;
        self.with_link(|s| s.read(characteristic))
    }

    async fn write(&mut self, characteristic: Characteristic, value: &[u8]) -> Result<()> {
        self.require(characteristic, Some(value))?;
        self.with_link(|s| s.write(characteristic, value))
    }

    async fn subscribe(&mut self, stream: Stream) -> Result<()> {
        self.require(stream_characteristic(stream), None)?;
        self.with_link(|s| {
            s.subscribed.set(stream, true);
            Ok(())
        })
    }

    async fn unsubscribe(&mut self, stream: Stream) -> Result<()> {
        self.require(stream_characteristic(stream), None)?;
        self.with_link(|s| {
            s.subscribed.set(stream, false);
            Ok(())
        })
    }

    async fn next_notification(&mut self, wait: Duration) -> Result<Option<Notification>> {
        let next = self.with_link(|s| Ok(s.next_notification()))?;
        if next.is_none() {
            tokio::time::sleep(wait).await;
        }
        Ok(next)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
        Ok(())
    }
}
