//! Per-run index of missing hours.
//!
//! Keyed by hour (or by a sorted run of hours for batch sources) rather than
//! by meter, so one vendor request can serve every meter missing that key.
//! Owned by the run and rebuilt from the destination store every time.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use hbd_core::MeterDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MissedKey {
    Hour(DateTime<Utc>),
    Range(HourRange),
}

/// Sorted, de-duplicated, non-empty run of hours. Only built through
/// [`MissedKey::range`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HourRange {
    hours: Vec<DateTime<Utc>>,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
}

impl HourRange {
    pub fn hours(&self) -> &[DateTime<Utc>] {
        &self.hours
    }
}

impl MissedKey {
    /// Build a range key; `None` when `hours` is empty. A single hour
    /// still yields a range so the request shape stays batch-style.
    pub fn range(mut hours: Vec<DateTime<Utc>>) -> Option<Self> {
        hours.sort_unstable();
        hours.dedup();
        let (first, last) = (*hours.first()?, *hours.last()?);
        Some(MissedKey::Range(HourRange { hours, first, last }))
    }

    pub fn hours(&self) -> Vec<DateTime<Utc>> {
        match self {
            MissedKey::Hour(h) => vec![*h],
            MissedKey::Range(range) => range.hours.clone(),
        }
    }

    pub fn first(&self) -> DateTime<Utc> {
        match self {
            MissedKey::Hour(h) => *h,
            MissedKey::Range(range) => range.first,
        }
    }

    pub fn last(&self) -> DateTime<Utc> {
        match self {
            MissedKey::Hour(h) => *h,
            MissedKey::Range(range) => range.last,
        }
    }
}

/// Missing hour (or range) → FIFO of meters still lacking it.
#[derive(Debug, Default)]
pub struct MissedHoursIndex {
    entries: Mutex<BTreeMap<MissedKey, VecDeque<MeterDescriptor>>>,
}

impl MissedHoursIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<MissedKey, VecDeque<MeterDescriptor>>> {
        // Entries are plain data; a panicked writer cannot leave them torn.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn register(&self, key: MissedKey, meter: MeterDescriptor) {
        self.lock().entry(key).or_default().push_back(meter);
    }

    /// Remove and return the earliest entry with all its meters.
    pub fn pop(&self) -> Option<(MissedKey, Vec<MeterDescriptor>)> {
        self.lock()
            .pop_first()
            .map(|(key, meters)| (key, meters.into_iter().collect()))
    }

    /// Remove every entry, earliest first.
    pub fn drain(&self) -> Vec<(MissedKey, Vec<MeterDescriptor>)> {
        std::mem::take(&mut *self.lock())
            .into_iter()
            .map(|(key, meters)| (key, meters.into_iter().collect()))
            .collect()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Key → meter names, for logging and assertions.
    pub fn snapshot(&self) -> BTreeMap<MissedKey, Vec<String>> {
        self.lock()
            .iter()
            .map(|(k, meters)| (k.clone(), meters.iter().map(|m| m.name.clone()).collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hbd_core::{ReadingType, StorageLocation};

    fn meter(name: &str) -> MeterDescriptor {
        MeterDescriptor::new(
            name,
            format!("urn:{name}"),
            ReadingType::Electricity,
            StorageLocation::new("std", name),
        )
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn groups_meters_by_hour_fifo() {
        let index = MissedHoursIndex::new();
        index.register(MissedKey::Hour(hour(3)), meter("b"));
        index.register(MissedKey::Hour(hour(1)), meter("a"));
        index.register(MissedKey::Hour(hour(3)), meter("c"));

        assert_eq!(index.len(), 2);
        let (key, meters) = index.pop().unwrap();
        assert_eq!(key, MissedKey::Hour(hour(1)));
        assert_eq!(meters.len(), 1);

        let (_, meters) = index.pop().unwrap();
        let names: Vec<_> = meters.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert!(index.pop().is_none());
    }

    #[test]
    fn clear_and_drain() {
        let index = MissedHoursIndex::new();
        index.register(MissedKey::Hour(hour(1)), meter("a"));
        index.clear();
        assert!(index.is_empty());

        index.register(MissedKey::Hour(hour(2)), meter("a"));
        index.register(MissedKey::Hour(hour(1)), meter("a"));
        let drained = index.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, MissedKey::Hour(hour(1)));
        assert!(index.is_empty());
    }

    #[test]
    fn range_keys_are_sorted() {
        let key = MissedKey::range(vec![hour(5), hour(2), hour(5)]).unwrap();
        assert_eq!(key.hours(), vec![hour(2), hour(5)]);
        assert_eq!((key.first(), key.last()), (hour(2), hour(5)));
        assert!(MissedKey::range(vec![]).is_none());

        let single = MissedKey::range(vec![hour(7)]).unwrap();
        assert!(matches!(&single, MissedKey::Range(r) if r.hours() == [hour(7)]));
        assert_eq!((single.first(), single.last()), (hour(7), hour(7)));
    }
}
