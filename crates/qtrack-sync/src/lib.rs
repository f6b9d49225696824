//! Collection runs: configuration, date-range scheduling, gap reporting and
//! the per-year parallel runner.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};
use qtrack_adapters::{CurrentAdapter, HistoricalAdapter, SchemaMerger, SourceAdapter};
use qtrack_core::{CollectionUnit, DateRange, GapReport, SourceKind, UnitStatus};
use qtrack_storage::{HttpFetcher, PartitionCensus, PartitionStore};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod artifacts;
pub mod config;
pub mod gaps;
pub mod integrity;
pub mod parallel;
pub mod scheduler;

pub use artifacts::RunArtifacts;
pub use config::{ConfigError, SourceConfig, SourceRegistry, SyncConfig};
pub use integrity::{IntegrityReport, PartitionDelta};
pub use parallel::{ParallelReport, ParallelRun, YearOutcome};
pub use scheduler::{Scheduler, StopSignal};

pub const CRATE_NAME: &str = "qtrack-sync";

/// Builds a fresh adapter per call so concurrent workers never share one.
pub trait AdapterFactory: Send + Sync {
    fn adapter(&self, source: SourceKind) -> Result<Arc<dyn SourceAdapter>, ConfigError>;
}

/// Live USAJobs adapters, each with its own HTTP client and pacer.
#[derive(Debug, Clone)]
pub struct HttpAdapterFactory {
    config: SyncConfig,
    registry: SourceRegistry,
}

impl HttpAdapterFactory {
    pub fn new(config: SyncConfig, registry: SourceRegistry) -> Self {
        Self { config, registry }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        let registry = SourceRegistry::load(&config.registry_path)?;
        Ok(Self::new(config.clone(), registry))
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn adapter(&self, source: SourceKind) -> Result<Arc<dyn SourceAdapter>, ConfigError> {
        let credential = match source {
            SourceKind::Current => Some(self.config.credential()?),
            SourceKind::Historical => None,
        };
        let http = HttpFetcher::new(self.config.http_client_config())
            .map_err(|e| ConfigError::HttpClient(format!("{e:#}")))?;
        let http = Arc::new(http);
        let endpoint = self.registry.endpoint(source);

        let adapter: Arc<dyn SourceAdapter> = match credential {
            Some(credential) => Arc::new(CurrentAdapter::new(http, endpoint, credential)),
            None => Arc::new(HistoricalAdapter::new(http, endpoint)),
        };
        Ok(adapter)
    }
}

/// The default `current` window: `lookback_days` days ending `today`.
pub fn recent_range(today: NaiveDate, lookback_days: u32) -> DateRange {
    let span = u64::from(lookback_days.max(1) - 1);
    let start = today.checked_sub_days(Days::new(span)).unwrap_or(today);
    DateRange { start, end: today }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: SourceKind,
    /// First to last requested date; `gaps.requested` holds the exact ranges.
    pub span: DateRange,
    pub requested_days: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
    pub records_written: usize,
    pub records_dropped: usize,
    /// `None` when a census could not be taken.
    pub integrity: Option<IntegrityReport>,
    pub gaps: GapReport,
    pub manifest: Option<PathBuf>,
    pub run_log: Option<PathBuf>,
    pub gap_log: Option<PathBuf>,
}

impl RunSummary {
    pub fn data_loss(&self) -> bool {
        self.integrity
            .as_ref()
            .is_some_and(IntegrityReport::has_data_loss)
    }

    /// Human-readable run report for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} {} ({} days): {} succeeded, {} failed, {} not attempted",
            self.source,
            self.gaps.requested_label(),
            self.requested_days,
            self.succeeded,
            self.failed,
            self.pending
        );
        let _ = writeln!(
            out,
            "records written: {} (dropped by merge: {})",
            self.records_written, self.records_dropped
        );
        match &self.integrity {
            Some(report) => {
                for delta in report.grown() {
                    let _ = writeln!(
                        out,
                        "  {}: {} jobs added (was {}, now {})",
                        delta.file,
                        delta.added(),
                        delta.before,
                        delta.after
                    );
                }
                for delta in report.shrunk() {
                    let _ = writeln!(
                        out,
                        "  {} LOST JOBS: {} -> {}",
                        delta.file, delta.before, delta.after
                    );
                }
                if report.grown().next().is_none() && !report.has_data_loss() {
                    let _ = writeln!(out, "  no partition changed size");
                }
            }
            None => {
                let _ = writeln!(out, "  partition census unavailable");
            }
        }
        if self.gaps.is_empty() {
            let _ = writeln!(out, "no gaps");
        } else {
            let _ = writeln!(out, "{} gap(s); retry with:", self.gaps.gaps.len());
            for gap in &self.gaps.gaps {
                let _ = writeln!(out, "  {}", gap.retry_command);
            }
        }
        for (label, path) in [
            ("manifest", &self.manifest),
            ("run log", &self.run_log),
            ("gap log", &self.gap_log),
        ] {
            if let Some(path) = path {
                let _ = writeln!(out, "{label}: {}", path.display());
            }
        }
        out
    }
}

/// One configured collector: scheduling, integrity bookkeeping and artifacts.
pub struct Pipeline {
    config: SyncConfig,
    factory: Arc<dyn AdapterFactory>,
    stop: StopSignal,
}

impl Pipeline {
    /// `data_dir` is made absolute so retry commands work from any directory.
    pub fn new(mut config: SyncConfig, factory: Arc<dyn AdapterFactory>, stop: StopSignal) -> Self {
        match std::path::absolute(&config.data_dir) {
            Ok(abs) => config.data_dir = abs,
            Err(err) => warn!(
                data_dir = %config.data_dir.display(),
                error = %err,
                "could not resolve data directory; retry commands keep it as given"
            ),
        }
        Self {
            config,
            factory,
            stop,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Collect `range` for `source`, one date at a time.
    ///
    /// Only configuration problems are errors; failed dates end up as gaps.
    pub async fn collect(&self, source: SourceKind, range: DateRange) -> Result<RunSummary, ConfigError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let adapter = self.factory.adapter(source)?;
        let store = Arc::new(PartitionStore::new(self.config.data_dir.clone()));
        let before = take_census(&store).await;

        info!(%run_id, %source, %range, data_dir = %self.config.data_dir.display(), "collection run started");
        let scheduler = Scheduler::new(
            run_id,
            adapter,
            SchemaMerger::default(),
            store.clone(),
            self.stop.clone(),
        );
        let units = scheduler.run(range).await;
        let gaps = gaps::detect(&range, &units, source, &self.config.data_dir);

        Ok(self
            .finish(run_id, source, range, started_at, &store, before, units, gaps)
            .await)
    }

    /// Collect whole years concurrently, one worker per distinct year.
    pub async fn collect_years(
        &self,
        source: SourceKind,
        years: &[i32],
        today: NaiveDate,
        max_workers: usize,
    ) -> Result<(ParallelReport, RunSummary), ConfigError> {
        // surface credential problems before any worker starts
        self.factory.adapter(source)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let store = Arc::new(PartitionStore::new(self.config.data_dir.clone()));
        let before = take_census(&store).await;

        let report = parallel::run_parallel(
            ParallelRun {
                run_id,
                source,
                data_dir: self.config.data_dir.clone(),
                max_workers,
                today,
                stop: self.stop.clone(),
            },
            years,
            self.factory.clone(),
        )
        .await?;

        let units: Vec<CollectionUnit> = report.units().cloned().collect();
        let summary = self
            .finish(
                run_id,
                source,
                report.span,
                started_at,
                &store,
                before,
                units,
                report.gaps.clone(),
            )
            .await;
        Ok((report, summary))
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        run_id: Uuid,
        source: SourceKind,
        span: DateRange,
        started_at: DateTime<Utc>,
        store: &PartitionStore,
        before: Option<PartitionCensus>,
        units: Vec<CollectionUnit>,
        gaps: GapReport,
    ) -> RunSummary {
        let after = take_census(store).await;
        let integrity = match (before, after) {
            (Some(before), Some(after)) => Some(IntegrityReport::compare(&before, &after)),
            _ => None,
        };
        if let Some(report) = &integrity {
            for delta in report.shrunk() {
                error!(
                    file = %delta.file,
                    before = delta.before,
                    after = delta.after,
                    "partition lost rows during run"
                );
            }
        }

        let manifest = match store.write_manifest().await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(error = %err, "could not write partition manifest");
                None
            }
        };

        let count = |status: UnitStatus| units.iter().filter(|u| u.status == status).count();
        let mut summary = RunSummary {
            run_id,
            source,
            span,
            requested_days: gaps.requested_days(),
            started_at,
            finished_at: Utc::now(),
            succeeded: count(UnitStatus::Success),
            failed: count(UnitStatus::Failed),
            pending: count(UnitStatus::Pending),
            records_written: units.iter().map(|u| u.record_count).sum(),
            records_dropped: units.iter().map(|u| u.dropped_count).sum(),
            integrity,
            gaps,
            manifest,
            run_log: None,
            gap_log: None,
        };

        let artifacts = RunArtifacts::new(&self.config.logs_dir, source, &span, started_at);
        match artifacts.write(&units, &summary, &summary.gaps).await {
            Ok(()) => {
                summary.run_log = Some(artifacts.run_log);
                summary.gap_log = Some(artifacts.gap_log);
            }
            Err(err) => warn!(error = %format!("{err:#}"), "could not write run artifacts"),
        }

        info!(
            %run_id,
            %source,
            succeeded = summary.succeeded,
            failed = summary.failed,
            pending = summary.pending,
            records = summary.records_written,
            gaps = summary.gaps.gaps.len(),
            data_loss = summary.data_loss(),
            "collection run finished"
        );
        summary
    }
}

async fn take_census(store: &PartitionStore) -> Option<PartitionCensus> {
    match store.census().await {
        Ok(census) => Some(census),
        Err(err) => {
            warn!(error = %err, "partition census failed; integrity check skipped");
            None
        }
    }
}
