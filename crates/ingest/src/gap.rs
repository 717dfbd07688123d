//! Gap detection: which expected hours lack a standardized file.
//!
//! Truth is re-derived from the destination store on every run, so a crashed
//! or repeated run heals itself.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use tracing::{error, info};

use hbd_core::hours::{expected_hours, hour_file_name, parse_hour_file_name};
use hbd_core::{FetchStrategy, MeterDescriptor};
use hbd_queue::WorkerPool;
use hbd_storage::{StorageEngine, StorageError};

use crate::index::{MissedHoursIndex, MissedKey};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapReport {
    pub meters_checked: usize,
    pub meters_up_to_date: usize,
    pub meters_failed: usize,
    /// Distinct keys in the index after detection.
    pub missed_entries: usize,
}

/// Expected hours in the window ending at `run_time` with no file under the
/// meter's standardized location. Ascending.
pub async fn missing_hours(
    store: &StorageEngine,
    meter: &MeterDescriptor,
    run_time: DateTime<Utc>,
    window: u32,
) -> Result<Vec<DateTime<Utc>>, StorageError> {
    let expected = expected_hours(run_time, window);
    let (Some(first), Some(last)) = (expected.first(), expected.last()) else {
        return Ok(Vec::new());
    };

    let present: BTreeSet<DateTime<Utc>> = store
        .list_with_prefix(
            &meter.standardized,
            Some(&hour_file_name(*first)),
            Some(&hour_file_name(*last)),
        )
        .await?
        .into_iter()
        .filter_map(|blob| parse_hour_file_name(&blob.name))
        .collect();

    Ok(expected.into_iter().filter(|h| !present.contains(h)).collect())
}

/// Group hours into one range key per calendar month.
pub fn monthly_ranges(hours: &[DateTime<Utc>]) -> Vec<MissedKey> {
    let mut months: BTreeMap<(i32, u32), Vec<DateTime<Utc>>> = BTreeMap::new();
    for h in hours {
        months.entry((h.year(), h.month())).or_default().push(*h);
    }
    months.into_values().filter_map(MissedKey::range).collect()
}

pub struct GapDetector {
    store: Arc<StorageEngine>,
    index: Arc<MissedHoursIndex>,
    window: u32,
    strategy: FetchStrategy,
    replicas: usize,
}

impl GapDetector {
    pub fn new(
        store: Arc<StorageEngine>,
        index: Arc<MissedHoursIndex>,
        window: u32,
        strategy: FetchStrategy,
        replicas: usize,
    ) -> Self {
        Self { store, index, window, strategy, replicas }
    }

    /// Clear the index and refill it from the store. A meter whose listing
    /// fails is logged and skipped.
    pub async fn run(&self, meters: &[MeterDescriptor], run_time: DateTime<Utc>) -> GapReport {
        self.index.clear();
        let up_to_date = Arc::new(AtomicUsize::new(0));

        let store = self.store.clone();
        let index = self.index.clone();
        let counter = up_to_date.clone();
        let (window, strategy) = (self.window, self.strategy);

        let pool = WorkerPool::run_items("gaps", self.replicas, meters.to_vec(), move |meter: MeterDescriptor| {
            let store = store.clone();
            let index = index.clone();
            let counter = counter.clone();
            async move {
                let missing = missing_hours(&store, &meter, run_time, window).await.map_err(|e| {
                    error!(meter = %meter.name, error = %e, "cannot list standardized files, skipping meter");
                    e
                })?;

                if missing.is_empty() {
                    info!(meter = %meter.name, "meter is up to date");
                    counter.fetch_add(1, Ordering::SeqCst);
                    return Ok::<_, StorageError>(());
                }

                info!(meter = %meter.name, missing = missing.len(), "found missing hours");
                match strategy {
                    FetchStrategy::Hourly => {
                        for hour in missing {
                            index.register(MissedKey::Hour(hour), meter.clone());
                        }
                    }
                    FetchStrategy::Batch => {
                        for key in monthly_ranges(&missing) {
                            index.register(key, meter.clone());
                        }
                    }
                }
                Ok(())
            }
        })
        .await;

        let report = GapReport {
            meters_checked: meters.len(),
            meters_up_to_date: up_to_date.load(Ordering::SeqCst),
            meters_failed: pool.failed + pool.panicked.len(),
            missed_entries: self.index.len(),
        };
        info!(
            meters = report.meters_checked,
            up_to_date = report.meters_up_to_date,
            failed = report.meters_failed,
            missed = report.missed_entries,
            "gap detection finished"
        );
        report
    }
}
