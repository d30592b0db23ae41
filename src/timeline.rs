//! The sparse time series a logger download fills in.
//!
//! A [`Timeline`] is allocated from a [`DownloadWindow`] before any data
//! arrives, with one [`Sample`] per expected log interval and every value
//! `None`.  Slots are anchored at the newest timestamp:
//!
//! ```text
//! slot i  →  newest − (n − 1 − i) · interval        n = (newest − oldest) / interval
//! ```
//!
//! so timestamps are strictly increasing by exactly one interval regardless
//! of the order in which the device delivers them.

use log::warn;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::DownloadWindow;

/// A timestamp in ms since epoch with a possibly-missing value.
///
/// `None` means "not received yet" and is distinct from a reading of `0.0`.
/// Serialised as the pair `[timestamp_ms, value]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(into = "(u64, Option<f32>)")]
pub struct Sample {
    pub timestamp_ms: u64,
    pub value: Option<f32>,
}

impl From<Sample> for (u64, Option<f32>) {
    fn from(s: Sample) -> Self {
        (s.timestamp_ms, s.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    interval_ms: u32,
    samples: Vec<Sample>,
}

/// Bitwise equality, so two identical NaN readings do not count as a conflict.
fn same_value(a: f32, b: f32) -> bool {
    a.to_bits() == b.to_bits()
}

impl Timeline {
    /// Allocate the expected slots of `window`, all missing.
    pub fn new(window: &DownloadWindow) -> Self {
        let n = window.len() as u64;
        let interval = u64::from(window.interval_ms);
        let samples = (0..n)
            .map(|i| Sample {
                timestamp_ms: window.newest_ms - (n - 1 - i) * interval,
                value: None,
            })
            .collect();
        Self {
            interval_ms: window.interval_ms,
            samples,
        }
    }

    /// A timeline with no slots, used for streams that were not requested.
    pub fn empty(interval_ms: u32) -> Self {
        Self {
            interval_ms,
            samples: Vec::new(),
        }
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn get(&self, slot: usize) -> Option<&Sample> {
        self.samples.get(slot)
    }

    /// Timestamp of the oldest slot.
    pub fn first_timestamp(&self) -> Option<u64> {
        self.samples.first().map(|s| s.timestamp_ms)
    }

    /// Number of slots that hold a value.
    pub fn filled(&self) -> usize {
        self.samples.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.samples.iter().all(|s| s.value.is_some())
    }

    /// Timestamps whose value is still missing, ascending.
    pub fn missing_timestamps(&self) -> Vec<u64> {
        self.samples
            .iter()
            .filter(|s| s.value.is_none())
            .map(|s| s.timestamp_ms)
            .collect()
    }

    /// Slot holding `timestamp_ms`, if it lies exactly on this timeline's grid.
    pub fn slot_of(&self, timestamp_ms: u64) -> Option<usize> {
        let first = self.first_timestamp()?;
        let offset = timestamp_ms.checked_sub(first)?;
        let interval = u64::from(self.interval_ms);
        if interval == 0 || offset % interval != 0 {
            return None;
        }
        let slot = (offset / interval) as usize;
        (slot < self.samples.len()).then_some(slot)
    }

    /// Store `value` in `slot`, which the caller expects to hold `timestamp_ms`.
    ///
    /// Returns `true` if the slot was missing and is now filled.  A timestamp
    /// that disagrees with the slot, an out-of-range slot, or a different
    /// value already in the slot are integrity violations.
    pub fn fill(&mut self, slot: usize, timestamp_ms: u64, value: f32) -> Result<bool> {
        let len = self.samples.len();
        let sample = self.samples.get_mut(slot).ok_or_else(|| {
            Error::Integrity(format!("slot {slot} is outside a timeline of {len} samples"))
        })?;
        if sample.timestamp_ms != timestamp_ms {
            return Err(Error::Integrity(format!(
                "slot {slot} expects timestamp {} but the notification implies {timestamp_ms}",
                sample.timestamp_ms
            )));
        }
        match sample.value {
            None => {
                sample.value = Some(value);
                Ok(true)
            }
            Some(existing) if same_value(existing, value) => Ok(false),
            Some(existing) => Err(Error::Integrity(format!(
                "slot {slot} at {timestamp_ms} already holds {existing}, received {value}"
            ))),
        }
    }

    /// Fill missing slots of `self` from `other`.
    ///
    /// Slots are matched by timestamp.  Filled slots are never overwritten,
    /// and both timelines holding different values for the same slot is an
    /// integrity violation, raised before anything is modified.  Slots of
    /// `other` outside this timeline are ignored.  Returns the number of
    /// slots filled.
    ///
    /// A pass whose grid is shifted by less than one interval (the gadget
    /// clock was re-synchronised in between) cannot be matched by timestamp.
    /// It is aligned instead at the slot offset, within two of the nearest
    /// one, where all values present in both timelines agree; if no such
    /// offset exists the merge fails.
    pub fn merge_from(&mut self, other: &Timeline) -> Result<usize> {
        let (Some(ours), Some(theirs)) = (self.first_timestamp(), other.first_timestamp()) else {
            return Ok(0);
        };
        if other.interval_ms != self.interval_ms {
            return Err(Error::Integrity(format!(
                "cannot merge a pass logged every {} ms into one logged every {} ms",
                other.interval_ms, self.interval_ms
            )));
        }
        let interval = i128::from(self.interval_ms.max(1));
        let delta = i128::from(theirs) - i128::from(ours);

        let fills = if delta % interval == 0 {
            self.fills_at(other, delta / interval)?
        } else {
            self.fills_off_grid(other, delta, interval)?
        };
        for &(slot, value) in &fills {
            self.samples[slot].value = Some(value);
        }
        Ok(fills.len())
    }

    /// Values of `other` that fill gaps when its slot `j` lands on slot
    /// `j + shift` of `self`.
    fn fills_at(&self, other: &Timeline, shift: i128) -> Result<Vec<(usize, f32)>> {
        let mut fills = Vec::new();
        for (j, theirs) in other.samples.iter().enumerate() {
            let Some(value) = theirs.value else { continue };
            let Ok(slot) = usize::try_from(j as i128 + shift) else {
                continue;
            };
            let Some(ours) = self.samples.get(slot) else {
                continue;
            };
            match ours.value {
                None => fills.push((slot, value)),
                Some(existing) if same_value(existing, value) => {}
                Some(existing) => {
                    return Err(Error::Integrity(format!(
                        "merging value mismatch at {}: {existing} != {value}",
                        ours.timestamp_ms
                    )));
                }
            }
        }
        Ok(fills)
    }

    fn fills_off_grid(&self, other: &Timeline, delta: i128, interval: i128) -> Result<Vec<(usize, f32)>> {
        let nearest = (2 * delta + interval).div_euclid(2 * interval);
        let mut first_error = None;
        for shift in [nearest, nearest - 1, nearest + 1, nearest - 2, nearest + 2] {
            match self.fills_at(other, shift) {
                Ok(fills) => {
                    warn!(
                        "Pass is {delta} ms off the accumulated grid; aligned by value at a shift of {shift} slot(s)"
                    );
                    return Ok(fills);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or_else(|| {
            Error::Integrity(format!("no alignment for a pass {delta} ms off the grid"))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn window(interval: u32, oldest: u64, newest: u64) -> DownloadWindow {
        DownloadWindow::new(interval, oldest, newest).unwrap()
    }

    fn timeline_with(values: &[Option<f32>]) -> Timeline {
        let n = values.len() as u64;
        let mut t = Timeline::new(&window(10_000, 0, n * 10_000));
        for (i, v) in values.iter().enumerate() {
            if let Some(v) = v {
                t.fill(i, (i as u64 + 1) * 10_000, *v).unwrap();
            }
        }
        t
    }

    #[test]
    fn three_slot_window_skips_the_oldest_boundary() {
        let t = Timeline::new(&window(10_000, 0, 30_000));
        let ts: Vec<u64> = t.samples().iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(ts, vec![10_000, 20_000, 30_000]);
        assert!(t.samples().iter().all(|s| s.value.is_none()));
    }

    #[test]
    fn slots_are_anchored_at_the_newest_timestamp() {
        let t = Timeline::new(&window(10_000, 0, 35_000));
        let ts: Vec<u64> = t.samples().iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(ts, vec![15_000, 25_000, 35_000]);
    }

    #[test]
    fn zero_is_a_value_not_a_gap() {
        let t = timeline_with(&[Some(0.0), None]);
        assert_eq!(t.filled(), 1);
        assert_eq!(t.missing_timestamps(), vec![20_000]);
    }

    #[test]
    fn fill_rejects_a_timestamp_mismatch() {
        let mut t = Timeline::new(&window(10_000, 0, 30_000));
        assert!(matches!(t.fill(1, 25_000, 1.0), Err(Error::Integrity(_))));
        assert!(matches!(t.fill(3, 40_000, 1.0), Err(Error::Integrity(_))));
        assert!(t.fill(1, 20_000, 1.0).unwrap());
        assert!(!t.fill(1, 20_000, 1.0).unwrap());
        assert!(matches!(t.fill(1, 20_000, 2.0), Err(Error::Integrity(_))));
    }

    #[test]
    fn merge_fills_gaps_and_keeps_existing_values() {
        let mut first = timeline_with(&[Some(50.1), None, Some(50.3)]);
        let second = timeline_with(&[Some(50.1), Some(55.5), None]);
        assert_eq!(first.merge_from(&second).unwrap(), 1);
        let values: Vec<Option<f32>> = first.samples().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![Some(50.1), Some(55.5), Some(50.3)]);
    }

    #[test]
    fn merge_aligns_by_timestamp_across_windows() {
        let mut wide = Timeline::new(&window(1_000, 0, 10_000));
        let mut narrow = Timeline::new(&window(1_000, 4_000, 7_000));
        narrow.fill(0, 5_000, 1.5).unwrap();
        narrow.fill(2, 7_000, 2.5).unwrap();
        assert_eq!(wide.merge_from(&narrow).unwrap(), 2);
        assert_eq!(wide.get(4).unwrap().value, Some(1.5));
        assert_eq!(wide.get(6).unwrap().value, Some(2.5));
        assert_eq!(wide.filled(), 2);
    }

    #[test]
    fn conflicting_merge_leaves_the_target_untouched() {
        let mut a = timeline_with(&[None, Some(1.0)]);
        let b = timeline_with(&[Some(9.0), Some(2.0)]);
        let before = a.clone();
        assert!(matches!(a.merge_from(&b), Err(Error::Integrity(_))));
        assert_eq!(a, before);
    }

    fn filled(window: DownloadWindow, values: &[f32]) -> Timeline {
        let mut t = Timeline::new(&window);
        for (slot, v) in values.iter().enumerate() {
            let ts = t.samples()[slot].timestamp_ms;
            t.fill(slot, ts, *v).unwrap();
        }
        t
    }

    #[test]
    fn pass_shifted_by_less_than_an_interval_still_merges() {
        let mut t = timeline_with(&[Some(1.0), None, Some(3.0)]);
        let shifted = filled(window(10_000, 500, 40_500), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(shifted.first_timestamp(), Some(10_500));
        assert_eq!(t.merge_from(&shifted).unwrap(), 1);
        assert!(t.is_complete());
        assert_eq!(t.get(1).unwrap().value, Some(2.0));
        assert_eq!(t.get(1).unwrap().timestamp_ms, 20_000);
    }

    #[test]
    fn off_grid_pass_is_aligned_by_agreeing_values() {
        let mut t = timeline_with(&[Some(1.0), Some(2.0), None, Some(4.0), Some(5.0)]);
        // First slot at 24 000: nearest to slot 1, but only slot 2 agrees.
        let shifted = filled(window(10_000, 14_000, 44_000), &[3.0, 4.0, 5.0]);
        assert_eq!(t.merge_from(&shifted).unwrap(), 1);
        assert_eq!(t.get(2).unwrap().value, Some(3.0));
    }

    #[test]
    fn off_grid_pass_without_agreement_is_rejected() {
        let mut t = timeline_with(&[Some(1.0), Some(2.0), Some(3.0)]);
        let before = t.clone();
        let shifted = filled(window(10_000, 500, 30_500), &[7.0, 8.0, 9.0]);
        assert!(matches!(t.merge_from(&shifted), Err(Error::Integrity(_))));
        assert_eq!(t, before);
    }

    #[test]
    fn passes_with_different_intervals_do_not_merge() {
        let mut t = timeline_with(&[None, Some(2.0)]);
        let other = filled(window(5_000, 0, 20_000), &[1.0, 1.5, 2.0, 2.5]);
        assert!(matches!(t.merge_from(&other), Err(Error::Integrity(_))));
    }

    #[test]
    fn samples_serialise_as_pairs() {
        let t = timeline_with(&[Some(21.5), None]);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["samples"], serde_json::json!([[10000, 21.5], [20000, null]]));
    }

    fn sparse_values(len: usize) -> impl Strategy<Value = Vec<Option<f32>>> {
        prop::collection::vec(prop::option::of(-40.0f32..125.0), len)
    }

    /// Two passes over the same slots that never disagree: each slot is
    /// missing in one, the other, both, or holds the same value in both.
    fn compatible_pair() -> impl Strategy<Value = (Vec<Option<f32>>, Vec<Option<f32>>)> {
        prop::collection::vec((-40.0f32..125.0, 0u8..4), 1..60).prop_map(|slots| {
            slots
                .into_iter()
                .map(|(v, mask)| match mask {
                    0 => (Some(v), None),
                    1 => (None, Some(v)),
                    2 => (Some(v), Some(v)),
                    _ => (None, None),
                })
                .unzip()
        })
    }

    proptest! {
        #[test]
        fn shape_matches_the_window(interval in 1u32..100_000, oldest in 0u64..1_000_000_000, slots in 1u64..2_000, rest in 0u64..100_000) {
            let span = slots * u64::from(interval) + rest % u64::from(interval);
            let w = window(interval, oldest, oldest + span);
            let t = Timeline::new(&w);
            prop_assert_eq!(t.len() as u64, slots);
            for pair in t.samples().windows(2) {
                prop_assert_eq!(pair[1].timestamp_ms - pair[0].timestamp_ms, u64::from(interval));
            }
            if let Some(last) = t.samples().last() {
                prop_assert_eq!(last.timestamp_ms, oldest + span);
                prop_assert!(t.samples()[0].timestamp_ms > oldest);
            }
        }

        #[test]
        fn merging_with_itself_is_identity(values in sparse_values(40)) {
            let mut t = timeline_with(&values);
            let copy = t.clone();
            prop_assert_eq!(t.merge_from(&copy).unwrap(), 0);
            prop_assert_eq!(t, copy);
        }

        #[test]
        fn merge_order_does_not_matter((a, b) in compatible_pair()) {
            let mut ab = timeline_with(&a);
            ab.merge_from(&timeline_with(&b)).unwrap();
            let mut ba = timeline_with(&b);
            ba.merge_from(&timeline_with(&a)).unwrap();
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn merge_never_loses_values((a, b) in compatible_pair()) {
            let mut t = timeline_with(&a);
            let before = t.filled();
            let added = t.merge_from(&timeline_with(&b)).unwrap();
            prop_assert_eq!(t.filled(), before + added);
            prop_assert!(t.filled() >= before);
        }

        #[test]
        fn disagreement_is_always_detected(values in sparse_values(20), slot in 0usize..20, delta in 0.5f32..10.0) {
            let mut a = values.clone();
            let mut b = values;
            let v = a[slot].unwrap_or(1.0);
            a[slot] = Some(v);
            b[slot] = Some(v + delta);
            let mut t = timeline_with(&a);
            prop_assert!(matches!(t.merge_from(&timeline_with(&b)), Err(Error::Integrity(_))));
        }
    }
}
