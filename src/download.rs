//! One pass of the bulk log download.
//!
//! A pass has three phases:
//!
//! 1. **Prepare**: synchronise the clock, write the requested bounds and read
//!    back the window the gadget will actually send.
//! 2. **Receive**: subscribe the selected streams, write the start command
//!    and feed every notification to a [`DownloadPass`] until each stream is
//!    finished or the pass times out.
//! 3. **Finish**: write the stop command and unsubscribe.
//!
//! The gadget sends each stream newest value first, in bulk chunks that
//! carry the run index of their first value.  Chunks may be lost in transit,
//! so a pass usually leaves gaps; [`crate::reconcile`] fills them by running
//! more passes.
//!
//! [`DownloadPass`] holds all notification handling and never touches the
//! radio, so it can be driven directly in tests.

use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::parse::{LogNotification, parse_notification};
use crate::protocol::{
    LOGGER_CAPACITY, MAX_HEARTBEAT_REPEATS, NOTIFICATION_POLL, PASS_TIMEOUT, RUN_INDEX_OFFSET,
};
use crate::registers;
use crate::session::GattSession;
use crate::timeline::Timeline;
use crate::types::{DownloadWindow, Notification, Stream, StreamSelection, WindowHints};

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// How long one wait for a notification may block. Default: 1 s.
    pub poll_interval: Duration,
    /// Heartbeats after the last bulk chunk before a stream gives up on its
    /// oldest values. Default: 5.
    pub max_heartbeat_repeats: u32,
    /// Upper bound for the receive phase of one pass. Default: 180 s.
    pub pass_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            poll_interval: NOTIFICATION_POLL,
            max_heartbeat_repeats: MAX_HEARTBEAT_REPEATS,
            pass_timeout: PASS_TIMEOUT,
        }
    }
}

/// Timelines produced by one pass.  Unselected streams are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct PassOutcome {
    pub window: DownloadWindow,
    pub temperatures: Option<Timeline>,
    pub humidities: Option<Timeline>,
}

impl PassOutcome {
    pub fn timeline(&self, stream: Stream) -> Option<&Timeline> {
        match stream {
            Stream::Temperature => self.temperatures.as_ref(),
            Stream::Humidity => self.humidities.as_ref(),
        }
    }
}

// ── Pure notification handling ────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StreamProgress {
    timeline: Timeline,
    /// Heartbeats only count once the log has started arriving.
    bulk_seen: bool,
    heartbeats: u32,
    finished: bool,
}

impl StreamProgress {
    fn new(window: &DownloadWindow) -> Self {
        let timeline = Timeline::new(window);
        let finished = timeline.is_empty();
        Self {
            timeline,
            bulk_seen: false,
            heartbeats: 0,
            finished,
        }
    }

    fn oldest_received(&self) -> bool {
        self.timeline.get(0).is_some_and(|s| s.value.is_some())
    }
}

/// Receive-phase state of one pass.
///
/// A stream is finished when its oldest slot is filled, or when more than
/// `max_heartbeat_repeats` single-value notifications arrive in a row after
/// the log started.  The pass is complete when every selected stream is.
#[derive(Debug, Clone)]
pub struct DownloadPass {
    window: DownloadWindow,
    max_heartbeat_repeats: u32,
    temperature: Option<StreamProgress>,
    humidity: Option<StreamProgress>,
}

impl DownloadPass {
    pub fn new(window: DownloadWindow, selection: StreamSelection, max_heartbeat_repeats: u32) -> Self {
        let progress = |stream| selection.contains(stream).then(|| StreamProgress::new(&window));
        Self {
            window,
            max_heartbeat_repeats,
            temperature: progress(Stream::Temperature),
            humidity: progress(Stream::Humidity),
        }
    }

    pub fn window(&self) -> DownloadWindow {
        self.window
    }

    fn progress(&self, stream: Stream) -> Option<&StreamProgress> {
        match stream {
            Stream::Temperature => self.temperature.as_ref(),
            Stream::Humidity => self.humidity.as_ref(),
        }
    }

    fn progress_mut(&mut self, stream: Stream) -> Option<&mut StreamProgress> {
        match stream {
            Stream::Temperature => self.temperature.as_mut(),
            Stream::Humidity => self.humidity.as_mut(),
        }
    }

    pub fn timeline(&self, stream: Stream) -> Option<&Timeline> {
        self.progress(stream).map(|p| &p.timeline)
    }

    /// Unselected streams count as finished.
    pub fn is_finished(&self, stream: Stream) -> bool {
        self.progress(stream).is_none_or(|p| p.finished)
    }

    pub fn is_complete(&self) -> bool {
        Stream::ALL.iter().all(|s| self.is_finished(*s))
    }

    /// Selected streams that are still receiving.
    pub fn active_streams(&self) -> Vec<Stream> {
        Stream::ALL
            .into_iter()
            .filter(|s| !self.is_finished(*s))
            .collect()
    }

    /// Apply one notification.  Returns the streams it finished.
    ///
    /// Value `k` of a bulk chunk with run index `r` is `r − RUN_INDEX_OFFSET + k`
    /// intervals older than the newest timestamp.  Values older than the
    /// window are ignored; a run index below the offset, or a value that
    /// contradicts one already received, is an integrity violation.
    pub fn handle_notification(&mut self, notification: &Notification) -> Result<Vec<Stream>> {
        let stream = notification.stream;
        let window = self.window;
        let max_heartbeats = self.max_heartbeat_repeats;
        let Some(progress) = self.progress_mut(stream) else {
            debug!("{stream}: notification for an unselected stream ignored");
            return Ok(Vec::new());
        };
        if progress.finished {
            return Ok(Vec::new());
        }

        match parse_notification(&notification.value) {
            LogNotification::Single(_) => {
                if progress.bulk_seen {
                    progress.heartbeats += 1;
                    if progress.heartbeats > max_heartbeats {
                        debug!("{stream}: no log data after {} heartbeats", progress.heartbeats);
                        progress.finished = true;
                    }
                }
            }
            LogNotification::Bulk(chunk) => {
                progress.bulk_seen = true;
                progress.heartbeats = 0;

                let first_run = chunk.run_index.checked_sub(RUN_INDEX_OFFSET).ok_or_else(|| {
                    Error::Integrity(format!(
                        "{stream}: run index {} is below the first run index {RUN_INDEX_OFFSET}",
                        chunk.run_index
                    ))
                })?;
                let n = progress.timeline.len() as u64;
                let interval = u64::from(window.interval_ms);
                for (k, value) in chunk.values.iter().enumerate() {
                    let run = u64::from(first_run) + k as u64;
                    if run >= n {
                        debug!("{stream}: run {run} is older than the window, ignored");
                        continue;
                    }
                    let slot = (n - 1 - run) as usize;
                    progress
                        .timeline
                        .fill(slot, window.newest_ms - run * interval, *value)?;
                }
                progress.finished = progress.oldest_received();
            }
        }

        Ok(if progress.finished { vec![stream] } else { Vec::new() })
    }

    pub fn into_outcome(self) -> PassOutcome {
        PassOutcome {
            window: self.window,
            temperatures: self.temperature.map(|p| p.timeline),
            humidities: self.humidity.map(|p| p.timeline),
        }
    }
}

// ── Driver ────────────────────────────────────────────────────────────────────

/// Write the requested bounds and read back the window the gadget will send.
async fn prepare<S: GattSession>(session: &mut S, hints: &WindowHints) -> Result<DownloadWindow> {
    registers::sync_time(session, hints.sync).await?;
    registers::set_oldest_timestamp(session, hints.oldest_ms.unwrap_or(0)).await?;
    if let Some(newest) = hints.newest_ms {
        registers::set_newest_timestamp(session, newest).await?;
    }
    let interval = registers::logger_interval(session).await?;
    let oldest = registers::oldest_timestamp(session).await?;
    let newest = registers::newest_timestamp(session).await?;
    logger_window(interval, oldest, newest)
}

/// The reported window, cut down to the newest `LOGGER_CAPACITY` values.
///
/// The gadget cannot hold more; an older `oldest` means its bounds were
/// never initialised or the clock jumped.
fn logger_window(interval_ms: u32, oldest_ms: u64, newest_ms: u64) -> Result<DownloadWindow> {
    let floor = newest_ms.saturating_sub(LOGGER_CAPACITY as u64 * u64::from(interval_ms));
    let oldest = if interval_ms > 0 && oldest_ms < floor {
        warn!(
            "Gadget reports oldest={oldest_ms} for newest={newest_ms}, more than its logger holds; downloading from {floor}"
        );
        floor
    } else {
        oldest_ms
    };
    DownloadWindow::new(interval_ms, oldest, newest_ms)
}

async fn receive<S: GattSession>(
    session: &mut S,
    pass: &mut DownloadPass,
    subscribed: &mut Vec<Stream>,
    config: &DownloadConfig,
) -> Result<()> {
    registers::start_download(session).await?;
    let started = tokio::time::Instant::now();
    while !pass.is_complete() {
        if started.elapsed() >= config.pass_timeout {
            warn!(
                "Download pass timed out after {} s, keeping the values received so far",
                config.pass_timeout.as_secs()
            );
            break;
        }
        let Some(notification) = session.next_notification(config.poll_interval).await? else {
            continue;
        };
        for stream in pass.handle_notification(&notification)? {
            session.unsubscribe(stream).await?;
            subscribed.retain(|s| *s != stream);
        }
    }
    registers::stop_download(session).await
}

/// Run one download pass over `session`.
pub async fn run_pass<S: GattSession>(
    session: &mut S,
    hints: &WindowHints,
    selection: StreamSelection,
    config: &DownloadConfig,
) -> Result<PassOutcome> {
    registers::require_logger(session.family())?;
    if selection.is_empty() {
        return Err(Error::InvalidRequest("no stream selected for download".into()));
    }

    let window = prepare(session, hints).await?;
    info!(
        "Downloading up to {} values per stream, interval {} ms, window ({}, {}]",
        window.len(),
        window.interval_ms,
        window.oldest_ms,
        window.newest_ms
    );

    let mut pass = DownloadPass::new(window, selection, config.max_heartbeat_repeats);
    let mut subscribed = Vec::new();
    for stream in pass.active_streams() {
        session.subscribe(stream).await?;
        subscribed.push(stream);
    }

    if !pass.is_complete() {
        if let Err(e) = receive(session, &mut pass, &mut subscribed, config).await {
            // The link is still up after a protocol error; leave the gadget idle.
            if !e.is_transient() {
                if let Err(stop) = registers::stop_download(session).await {
                    debug!("stop command after failed pass not delivered: {stop}");
                }
            }
            return Err(e);
        }
    }
    for stream in subscribed {
        session.unsubscribe(stream).await?;
    }

    for stream in selection.streams() {
        if let Some(timeline) = pass.timeline(stream) {
            info!("{stream}: received {}/{} values", timeline.filled(), timeline.len());
        }
    }
    Ok(pass.into_outcome())
}
