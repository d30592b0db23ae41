//! Multi-pass log download.
//!
//! BLE notifications are not acknowledged, so a single pass typically loses a
//! few chunks.  [`fetch`] runs up to `num_iterations` passes and merges them
//! slot by slot, re-requesting only the part of the log that still has gaps.
//!
//! Between passes the [`Reconciler`] decides:
//!
//! * which streams are still worth downloading: a stream is dropped once its
//!   newest gap is older than the first slot of the latest pass, because the
//!   gadget no longer holds that data;
//! * the next window: the span of the remaining gaps widened by two
//!   intervals on each side;
//! * to leave the gadget clock alone, so every pass shares one timestamp grid.
//!
//! Gaps left after the last pass are returned as missing samples, not as an
//! error.

use std::time::{Duration, Instant};

use log::debug;

use crate::download::{DownloadConfig, PassOutcome, run_pass};
use crate::error::Result;
use crate::session::Connector;
use crate::supervisor::{Idempotency, Supervisor};
use crate::timeline::Timeline;
use crate::types::{DeviceId, LoggedData, Stream, StreamSelection, SyncTime, WindowHints};

/// What [`fetch`] should download.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    /// Bounds and clock sync of the first pass.
    pub hints: WindowHints,
    pub selection: StreamSelection,
    /// Maximum number of passes. Clamped to at least 1. Default: 1.
    pub num_iterations: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            hints: WindowHints::default(),
            selection: StreamSelection::BOTH,
            num_iterations: 1,
        }
    }
}

/// Accumulates passes and plans the next one.
#[derive(Debug, Clone)]
pub struct Reconciler {
    max_passes: usize,
    passes: usize,
    interval_ms: u32,
    temperatures: Option<Timeline>,
    humidities: Option<Timeline>,
    next: Option<(WindowHints, StreamSelection)>,
}

impl Reconciler {
    pub fn new(options: &FetchOptions) -> Self {
        let next = (!options.selection.is_empty()).then_some((options.hints, options.selection));
        Self {
            max_passes: options.num_iterations.max(1),
            passes: 0,
            interval_ms: 0,
            temperatures: None,
            humidities: None,
            next,
        }
    }

    /// Bounds and streams of the next pass, or `None` when done.
    pub fn next_request(&self) -> Option<(WindowHints, StreamSelection)> {
        self.next
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    fn accumulated(&self, stream: Stream) -> Option<&Timeline> {
        match stream {
            Stream::Temperature => self.temperatures.as_ref(),
            Stream::Humidity => self.humidities.as_ref(),
        }
    }

    fn accumulated_mut(&mut self, stream: Stream) -> &mut Option<Timeline> {
        match stream {
            Stream::Temperature => &mut self.temperatures,
            Stream::Humidity => &mut self.humidities,
        }
    }

    /// Merge one pass and plan the next.
    pub fn absorb(&mut self, outcome: &PassOutcome, elapsed: Duration) -> Result<()> {
        self.passes += 1;
        self.interval_ms = outcome.window.interval_ms;

        let mut selection = StreamSelection {
            temperature: false,
            humidity: false,
        };
        let mut gaps: Option<(u64, u64)> = None;

        for stream in Stream::ALL {
            let Some(latest) = outcome.timeline(stream) else {
                continue;
            };
            let slot = self.accumulated_mut(stream);
            match slot.as_mut() {
                Some(accumulated) => {
                    accumulated.merge_from(latest)?;
                }
                None => *slot = Some(latest.clone()),
            }
            let missing = slot
                .as_ref()
                .map(Timeline::missing_timestamps)
                .unwrap_or_default();
            debug!(
                "Iteration {} of {} -- fetched {} of {} {stream} values in {:.3} s, {} still missing",
                self.passes,
                self.max_passes,
                latest.filled(),
                latest.len(),
                elapsed.as_secs_f64(),
                missing.len()
            );

            let (Some(&first_gap), Some(&last_gap)) = (missing.first(), missing.last()) else {
                continue;
            };
            // The gadget only still holds what the latest pass started from.
            let retained = latest.first_timestamp().is_some_and(|first| last_gap >= first);
            if !retained {
                debug!("{stream}: remaining gaps are no longer in the gadget's memory");
                continue;
            }
            selection.set(stream, true);
            gaps = Some(match gaps {
                None => (first_gap, last_gap),
                Some((lo, hi)) => (lo.min(first_gap), hi.max(last_gap)),
            });
        }

        self.next = match gaps {
            Some((lo, hi)) if self.passes < self.max_passes => {
                let margin = 2 * u64::from(self.interval_ms);
                Some((
                    WindowHints {
                        sync: SyncTime::Skip,
                        oldest_ms: Some(lo.saturating_sub(margin)),
                        newest_ms: Some(hi.saturating_add(margin)),
                    },
                    selection,
                ))
            }
            _ => None,
        };
        Ok(())
    }

    pub fn finish(self) -> LoggedData {
        for stream in Stream::ALL {
            if let Some(t) = self.accumulated(stream) {
                debug!("Finished -- fetched {} of {} {stream} values", t.filled(), t.len());
            }
        }
        let interval = self.interval_ms;
        LoggedData {
            temperatures: self.temperatures.unwrap_or_else(|| Timeline::empty(interval)),
            humidities: self.humidities.unwrap_or_else(|| Timeline::empty(interval)),
            passes: self.passes,
        }
    }
}

/// Download the log of `id`, merging up to `options.num_iterations` passes.
///
/// Each pass is a separate supervised call with its own retry budget; a pass
/// interrupted by a dropped link is re-run from scratch.
pub async fn fetch<C: Connector>(
    supervisor: &mut Supervisor<C>,
    id: DeviceId,
    options: &FetchOptions,
    config: &DownloadConfig,
) -> Result<LoggedData> {
    let mut reconciler = Reconciler::new(options);
    while let Some((hints, selection)) = reconciler.next_request() {
        let started = Instant::now();
        let outcome = supervisor
            .execute(id, Idempotency::Idempotent, async |session| {
                run_pass(session, &hints, selection, config).await
            })
            .await?;
        reconciler.absorb(&outcome, started.elapsed())?;
    }
    Ok(reconciler.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::DownloadWindow;

    fn outcome(
        oldest: u64,
        newest: u64,
        temperatures: Option<&[Option<f32>]>,
        humidities: Option<&[Option<f32>]>,
    ) -> PassOutcome {
        let window = DownloadWindow::new(10_000, oldest, newest).unwrap();
        let build = |values: &[Option<f32>]| {
            let mut t = Timeline::new(&window);
            assert_eq!(t.len(), values.len());
            for (slot, v) in values.iter().enumerate() {
                if let Some(v) = v {
                    let ts = t.samples()[slot].timestamp_ms;
                    t.fill(slot, ts, *v).unwrap();
                }
            }
            t
        };
        PassOutcome {
            window,
            temperatures: temperatures.map(build),
            humidities: humidities.map(build),
        }
    }

    fn options(num_iterations: usize) -> FetchOptions {
        FetchOptions {
            num_iterations,
            ..FetchOptions::default()
        }
    }

    #[test]
    fn complete_first_pass_stops() {
        let mut r = Reconciler::new(&options(3));
        let full = [Some(1.0), Some(2.0), Some(3.0)];
        r.absorb(&outcome(0, 30_000, Some(&full), Some(&full)), Duration::ZERO)
            .unwrap();
        assert_eq!(r.next_request(), None);
        let data = r.finish();
        assert_eq!(data.passes, 1);
        assert!(data.temperatures.is_complete());
    }

    #[test]
    fn gaps_narrow_the_next_window_and_skip_sync() {
        let mut r = Reconciler::new(&options(3));
        let t = [Some(1.0), None, Some(3.0)];
        let h = [Some(4.0), Some(5.0), Some(6.0)];
        r.absorb(&outcome(0, 30_000, Some(&t), Some(&h)), Duration::ZERO)
            .unwrap();
        let (hints, selection) = r.next_request().unwrap();
        assert_eq!(
            hints,
            WindowHints {
                sync: SyncTime::Skip,
                oldest_ms: Some(0),
                newest_ms: Some(40_000),
            }
        );
        assert_eq!(
            selection,
            StreamSelection {
                temperature: true,
                humidity: false,
            }
        );

        r.absorb(&outcome(0, 30_000, Some(&[Some(1.0), Some(2.0), Some(3.0)]), None), Duration::ZERO)
            .unwrap();
        assert_eq!(r.next_request(), None);
        let data = r.finish();
        assert_eq!(data.passes, 2);
        assert!(data.temperatures.is_complete());
        assert!(data.humidities.is_complete());
    }

    #[test]
    fn iteration_limit_leaves_gaps_in_place() {
        let mut r = Reconciler::new(&options(0));
        let t = [None, Some(2.0), Some(3.0)];
        r.absorb(&outcome(0, 30_000, Some(&t), Some(&t)), Duration::ZERO)
            .unwrap();
        assert_eq!(r.next_request(), None);
        let data = r.finish();
        assert_eq!(data.passes, 1);
        assert_eq!(data.temperatures.missing_timestamps(), vec![10_000]);
    }

    #[test]
    fn gaps_older_than_the_latest_pass_are_abandoned() {
        let mut r = Reconciler::new(&options(5));
        let first = [None, Some(2.0), Some(3.0), None, Some(5.0)];
        r.absorb(&outcome(0, 50_000, Some(&first), None), Duration::ZERO)
            .unwrap();
        let (hints, _) = r.next_request().unwrap();
        assert_eq!(hints.oldest_ms, Some(0));
        assert_eq!(hints.newest_ms, Some(60_000));

        // The gadget has overwritten its oldest values; the second pass
        // starts at 30 000 and fills 40 000.
        r.absorb(&outcome(20_000, 50_000, Some(&[Some(3.0), Some(4.0), Some(5.0)]), None), Duration::ZERO)
            .unwrap();
        assert_eq!(r.next_request(), None);
        let data = r.finish();
        assert_eq!(data.temperatures.missing_timestamps(), vec![10_000]);
        assert_eq!(data.temperatures.len(), 5);
    }

    #[test]
    fn conflicting_passes_fail() {
        let mut r = Reconciler::new(&options(2));
        r.absorb(&outcome(0, 30_000, Some(&[Some(1.0), None, Some(3.0)]), None), Duration::ZERO)
            .unwrap();
        let err = r
            .absorb(&outcome(0, 30_000, Some(&[Some(9.0), Some(2.0), Some(3.0)]), None), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn empty_selection_runs_no_pass() {
        let r = Reconciler::new(&FetchOptions {
            selection: StreamSelection {
                temperature: false,
                humidity: false,
            },
            ..FetchOptions::default()
        });
        assert_eq!(r.next_request(), None);
        let data = r.finish();
        assert_eq!(data.passes, 0);
        assert!(data.temperatures.is_empty());
    }
}
