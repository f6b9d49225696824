use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use qtrack_adapters::{AdapterContext, SchemaMerger, SourceAdapter};
use qtrack_core::{CollectionUnit, DateRange, SourceKind};
use qtrack_storage::PartitionStore;
use tracing::{info, warn};
use uuid::Uuid;

/// Cooperative cancellation flag, checked between dates.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Walks a date range one day at a time: fetch, merge, upsert.
pub struct Scheduler {
    run_id: Uuid,
    adapter: Arc<dyn SourceAdapter>,
    merger: SchemaMerger,
    store: Arc<PartitionStore>,
    stop: StopSignal,
}

impl Scheduler {
    pub fn new(
        run_id: Uuid,
        adapter: Arc<dyn SourceAdapter>,
        merger: SchemaMerger,
        store: Arc<PartitionStore>,
        stop: StopSignal,
    ) -> Self {
        Self {
            run_id,
            adapter,
            merger,
            store,
            stop,
        }
    }

    pub fn source(&self) -> SourceKind {
        self.adapter.source()
    }

    /// One unit per date in `range`, in calendar order.
    ///
    /// Dates not reached before the stop signal fires stay `Pending`.
    pub async fn run(&self, range: DateRange) -> Vec<CollectionUnit> {
        let source = self.source();
        let mut units: Vec<CollectionUnit> = range
            .days()
            .map(|date| CollectionUnit::pending(date, source))
            .collect();

        for slot in units.iter_mut() {
            if self.stop.is_triggered() {
                warn!(%source, date = %slot.date, "stop requested; remaining dates left pending");
                break;
            }
            let finished = self.collect(slot.clone()).await;
            match &finished.error {
                None => info!(
                    run_id = %self.run_id,
                    %source,
                    date = %finished.date,
                    status = "success",
                    records = finished.record_count,
                    dropped = finished.dropped_count,
                    "collected date"
                ),
                Some(error) => warn!(
                    run_id = %self.run_id,
                    %source,
                    date = %finished.date,
                    status = "failed",
                    %error,
                    "date collection failed"
                ),
            }
            *slot = finished;
        }
        units
    }

    async fn collect(&self, unit: CollectionUnit) -> CollectionUnit {
        let ctx = AdapterContext::new(self.run_id);
        let raw = match self.adapter.fetch(&ctx, unit.date).await {
            Ok(raw) => raw,
            Err(err) => return unit.fail(err.to_string()),
        };

        let outcome = self.merger.merge(&raw, unit.date);
        let dropped = outcome.dropped;
        match self.store.upsert(outcome.records).await {
            Ok(written) => unit.succeed(written, dropped),
            Err(err) => unit.fail(err.to_string()),
        }
    }
}
