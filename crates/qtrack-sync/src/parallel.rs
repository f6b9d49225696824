use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use qtrack_adapters::SchemaMerger;
use qtrack_core::{CollectionUnit, DateRange, GapReport, SourceKind};
use qtrack_storage::PartitionStore;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::ConfigError;
use crate::gaps;
use crate::scheduler::{Scheduler, StopSignal};
use crate::AdapterFactory;

/// What one year's worker produced.
#[derive(Debug, Clone)]
pub struct YearOutcome {
    pub year: i32,
    pub range: DateRange,
    pub units: Vec<CollectionUnit>,
    /// Set when the worker could not run; every date is then a failed unit.
    pub worker_error: Option<String>,
}

impl YearOutcome {
    fn worker_failed(year: i32, range: DateRange, source: SourceKind, error: String) -> Self {
        let units = range
            .days()
            .map(|date| CollectionUnit::pending(date, source).fail(error.clone()))
            .collect();
        Self {
            year,
            range,
            units,
            worker_error: Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParallelReport {
    pub source: SourceKind,
    pub outcomes: Vec<YearOutcome>,
    /// First requested date to last; years in between may not be requested.
    pub span: DateRange,
    /// Gaps of every year, in date order; `requested` lists each year's range.
    pub gaps: GapReport,
}

impl ParallelReport {
    pub fn units(&self) -> impl Iterator<Item = &CollectionUnit> {
        self.outcomes.iter().flat_map(|o| o.units.iter())
    }
}

/// Knobs shared by every worker of one parallel run.
#[derive(Clone)]
pub struct ParallelRun {
    pub run_id: Uuid,
    pub source: SourceKind,
    pub data_dir: PathBuf,
    pub max_workers: usize,
    pub today: NaiveDate,
    pub stop: StopSignal,
}

/// Collect each distinct year in its own task, at most `max_workers` at a time.
///
/// Workers share nothing but the data directory; each builds its own adapter,
/// merger and store. Outcomes come back ordered by year.
pub async fn run_parallel(
    run: ParallelRun,
    years: &[i32],
    factory: Arc<dyn AdapterFactory>,
) -> Result<ParallelReport, ConfigError> {
    let years: BTreeSet<i32> = years.iter().copied().collect();
    let (Some(&first), Some(&last)) = (years.first(), years.last()) else {
        return Err(ConfigError::NoYears);
    };
    let mut planned = Vec::with_capacity(years.len());
    for year in &years {
        planned.push((*year, DateRange::for_year(*year, run.today)?));
    }
    let span = DateRange::new(
        DateRange::for_year(first, run.today)?.start,
        DateRange::for_year(last, run.today)?.end,
    )?;

    let limit = Arc::new(Semaphore::new(run.max_workers.max(1)));
    let mut handles = Vec::with_capacity(planned.len());
    for (year, range) in planned {
        let limit = limit.clone();
        let factory = factory.clone();
        let run = run.clone();
        let span = info_span!("year_worker", year, source = %run.source);
        let handle = tokio::spawn(
            async move {
                let _permit = match limit.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(err) => {
                        return YearOutcome::worker_failed(year, range, run.source, err.to_string())
                    }
                };
                collect_year(run, year, range, factory.as_ref()).await
            }
            .instrument(span),
        );
        handles.push((year, range, handle));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (year, range, handle) in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                error!(year, error = %join_err, "year worker aborted");
                YearOutcome::worker_failed(
                    year,
                    range,
                    run.source,
                    format!("year worker aborted: {join_err}"),
                )
            }
        };
        outcomes.push(outcome);
    }

    let mut consolidated = GapReport {
        source: run.source,
        data_dir: run.data_dir.clone(),
        requested: Vec::with_capacity(outcomes.len()),
        gaps: Vec::new(),
    };
    for outcome in &outcomes {
        let report = gaps::detect(&outcome.range, &outcome.units, run.source, &run.data_dir);
        consolidated.requested.extend(report.requested);
        consolidated.gaps.extend(report.gaps);
    }

    Ok(ParallelReport {
        source: run.source,
        outcomes,
        span,
        gaps: consolidated,
    })
}

async fn collect_year(
    run: ParallelRun,
    year: i32,
    range: DateRange,
    factory: &dyn AdapterFactory,
) -> YearOutcome {
    let adapter = match factory.adapter(run.source) {
        Ok(adapter) => adapter,
        Err(err) => return YearOutcome::worker_failed(year, range, run.source, err.to_string()),
    };
    info!(year, %range, "year worker started");

    let scheduler = Scheduler::new(
        run.run_id,
        adapter,
        SchemaMerger::default(),
        Arc::new(PartitionStore::new(run.data_dir.clone())),
        run.stop.clone(),
    );
    let units = scheduler.run(range).await;
    let succeeded = units.iter().filter(|u| u.is_success()).count();
    info!(year, succeeded, total = units.len(), "year worker finished");

    YearOutcome {
        year,
        range,
        units,
        worker_error: None,
    }
}
