use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use qtrack_adapters::{AdapterContext, AdapterError, RawRecord, SourceAdapter};
use qtrack_core::{DateRange, SourceKind, UnitStatus};
use qtrack_storage::PartitionStore;
use qtrack_sync::{AdapterFactory, ConfigError, Pipeline, StopSignal, SyncConfig};
use serde_json::json;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// Two postings per productive date; `failing` dates always time out.
#[derive(Clone, Default)]
struct Scripted {
    failing: HashSet<NaiveDate>,
    panic_on: Option<NaiveDate>,
    first_of_month_only: bool,
}

#[async_trait]
impl SourceAdapter for Scripted {
    fn source(&self) -> SourceKind {
        SourceKind::Historical
    }

    async fn fetch(
        &self,
        _ctx: &AdapterContext,
        date: NaiveDate,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        if self.panic_on == Some(date) {
            panic!("scripted adapter blew up on {date}");
        }
        if self.failing.contains(&date) {
            return Err(AdapterError::Transient(format!(
                "request to historicjoa for {date} timed out after 4 attempts"
            )));
        }
        if self.first_of_month_only && date.day() != 1 {
            return Ok(Vec::new());
        }
        Ok((0..2)
            .map(|n| {
                let item = json!({
                    "usajobsControlNumber": format!("{}{n}", date.format("%Y%m%d")),
                    "positionTitle": "Contract Specialist",
                    "positionOpenDate": date.to_string(),
                    "questionnaireUrl": "https://apply.example/q/1"
                });
                match item {
                    serde_json::Value::Object(map) => RawRecord::Historical(map),
                    _ => unreachable!(),
                }
            })
            .collect())
    }
}

struct ScriptedFactory(Scripted);

impl AdapterFactory for ScriptedFactory {
    fn adapter(&self, source: SourceKind) -> Result<Arc<dyn SourceAdapter>, ConfigError> {
        match source {
            SourceKind::Historical => Ok(Arc::new(self.0.clone())),
            SourceKind::Current => Err(ConfigError::MissingCredential("USAJOBS_API_TOKEN")),
        }
    }
}

fn pipeline(root: &Path, adapter: Scripted) -> Pipeline {
    let config = SyncConfig {
        data_dir: root.join("data"),
        logs_dir: root.join("logs"),
        ..SyncConfig::default()
    };
    Pipeline::new(config, Arc::new(ScriptedFactory(adapter)), StopSignal::new())
}

#[tokio::test]
async fn transient_failure_becomes_a_single_gap() {
    let root = tempfile::tempdir().unwrap();
    let adapter = Scripted {
        failing: HashSet::from([d(2024, 1, 2)]),
        ..Scripted::default()
    };
    let pipeline = pipeline(root.path(), adapter);
    let range = DateRange::new(d(2024, 1, 1), d(2024, 1, 3)).unwrap();

    let summary = pipeline.collect(SourceKind::Historical, range).await.unwrap();
    assert_eq!((summary.succeeded, summary.failed, summary.pending), (2, 1, 0));
    assert_eq!(summary.records_written, 4);

    let store = PartitionStore::new(root.path().join("data"));
    let stored = store.read(SourceKind::Historical, 2024).await.unwrap();
    let dates: HashSet<NaiveDate> = stored.iter().map(|r| r.posted_date).collect();
    assert_eq!(dates, HashSet::from([d(2024, 1, 1), d(2024, 1, 3)]));
    assert!(stored
        .iter()
        .all(|r| r.native.contains_key("questionnaireUrl")));

    assert_eq!(summary.gaps.gap_dates(), vec![d(2024, 1, 2)]);
    let command = &summary.gaps.gaps[0].retry_command;
    assert!(command.starts_with("qtrack collect --source historical"));
    assert!(command.contains("--start-date 2024-01-02 --end-date 2024-01-02"));
    assert!(command.contains(&root.path().join("data").display().to_string()));

    let gap_log = std::fs::read_to_string(summary.gap_log.as_ref().unwrap()).unwrap();
    assert!(gap_log.lines().any(|line| line == command));
    let run_log = std::fs::read_to_string(summary.run_log.as_ref().unwrap()).unwrap();
    let events: Vec<serde_json::Value> = run_log
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(events.len(), 4);
    assert_eq!(events[1]["status"], "failed");
    assert_eq!(events[3]["event"], "summary");

    assert!(root.path().join("data/manifest.json").exists());
    let integrity = summary.integrity.unwrap();
    assert!(!integrity.has_data_loss());
    assert_eq!(integrity.total_added(), 4);
}

#[tokio::test]
async fn rerunning_a_range_is_idempotent() {
    let root = tempfile::tempdir().unwrap();
    let pipeline = pipeline(root.path(), Scripted::default());
    let range = DateRange::new(d(2023, 12, 30), d(2024, 1, 2)).unwrap();
    let partition = root.path().join("data/historical_jobs_2024.parquet");

    pipeline.collect(SourceKind::Historical, range).await.unwrap();
    let first = std::fs::read(&partition).unwrap();
    let second_summary = pipeline.collect(SourceKind::Historical, range).await.unwrap();
    let second = std::fs::read(&partition).unwrap();

    assert_eq!(first, second);
    let integrity = second_summary.integrity.unwrap();
    assert_eq!(integrity.total_added(), 0);
    assert!(!integrity.has_data_loss());
    assert!(root.path().join("data/historical_jobs_2023.parquet").exists());
}

#[tokio::test]
async fn missing_credential_fails_before_any_work() {
    let root = tempfile::tempdir().unwrap();
    let pipeline = pipeline(root.path(), Scripted::default());
    let err = pipeline
        .collect(SourceKind::Current, DateRange::single(d(2025, 3, 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigError::MissingCredential(_)));
    assert!(!root.path().join("logs").exists());
}

#[tokio::test]
async fn parallel_years_are_deduplicated_and_ordered() {
    let root = tempfile::tempdir().unwrap();
    let pipeline = pipeline(
        root.path(),
        Scripted {
            first_of_month_only: true,
            ..Scripted::default()
        },
    );

    let (report, summary) = pipeline
        .collect_years(SourceKind::Historical, &[2023, 2021, 2023], d(2024, 6, 1), 2)
        .await
        .unwrap();

    let years: Vec<_> = report.outcomes.iter().map(|o| o.year).collect();
    assert_eq!(years, vec![2021, 2023]);
    assert!(report.gaps.is_empty());
    assert_eq!(summary.succeeded, 365 + 365);
    assert_eq!(summary.records_written, 2 * 12 * 2);

    let store = PartitionStore::new(root.path().join("data"));
    assert_eq!(store.read(SourceKind::Historical, 2021).await.unwrap().len(), 24);
    assert!(store.read(SourceKind::Historical, 2022).await.unwrap().is_empty());
}

#[tokio::test]
async fn non_contiguous_years_only_count_requested_days() {
    let root = tempfile::tempdir().unwrap();
    let pipeline = pipeline(
        root.path(),
        Scripted {
            first_of_month_only: true,
            ..Scripted::default()
        },
    );

    let (report, summary) = pipeline
        .collect_years(SourceKind::Historical, &[2021, 2023], d(2024, 6, 1), 2)
        .await
        .unwrap();

    assert_eq!(report.gaps.requested.len(), 2);
    assert_eq!(report.gaps.requested_days(), 730);
    assert_eq!(summary.requested_days, summary.succeeded + summary.gaps.gaps.len());
    assert_eq!(report.span, DateRange::new(d(2021, 1, 1), d(2023, 12, 31)).unwrap());

    let gap_log = std::fs::read_to_string(summary.gap_log.as_ref().unwrap()).unwrap();
    assert!(gap_log.starts_with(
        "# historical gaps for 2021-01-01..2021-12-31, 2023-01-01..2023-12-31 (0 of 730 days)"
    ));
}

#[test]
fn relative_data_dir_yields_absolute_retry_commands() {
    let root = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        data_dir: PathBuf::from("relative-data"),
        logs_dir: root.path().join("logs"),
        ..SyncConfig::default()
    };
    let pipeline = Pipeline::new(config, Arc::new(ScriptedFactory(Scripted::default())), StopSignal::new());
    assert!(pipeline.config().data_dir.is_absolute());
    assert!(pipeline.config().data_dir.ends_with("relative-data"));

    let command = qtrack_sync::gaps::retry_command(
        SourceKind::Historical,
        d(2024, 1, 2),
        &pipeline.config().data_dir,
    );
    let dir = command.rsplit("--data-dir ").next().unwrap().trim_matches('\'');
    assert!(Path::new(dir).is_absolute(), "{command}");
}

#[tokio::test]
async fn current_year_is_clipped_to_today() {
    let root = tempfile::tempdir().unwrap();
    let pipeline = pipeline(
        root.path(),
        Scripted {
            first_of_month_only: true,
            ..Scripted::default()
        },
    );

    let (report, _) = pipeline
        .collect_years(SourceKind::Historical, &[2024], d(2024, 3, 10), 4)
        .await
        .unwrap();
    assert_eq!(report.outcomes[0].range.end, d(2024, 3, 10));
    assert_eq!(report.outcomes[0].units.len(), 70);
}

#[tokio::test]
async fn a_crashed_worker_reports_its_whole_year_as_gaps() {
    let root = tempfile::tempdir().unwrap();
    let pipeline = pipeline(
        root.path(),
        Scripted {
            panic_on: Some(d(2021, 3, 1)),
            first_of_month_only: true,
            ..Scripted::default()
        },
    );

    let (report, summary) = pipeline
        .collect_years(SourceKind::Historical, &[2021, 2022], d(2024, 6, 1), 2)
        .await
        .unwrap();

    let crashed = &report.outcomes[0];
    assert_eq!(crashed.year, 2021);
    assert!(crashed.worker_error.is_some());
    assert!(crashed.units.iter().all(|u| u.status == UnitStatus::Failed));
    assert!(report.outcomes[1].worker_error.is_none());

    assert_eq!(report.gaps.gaps.len(), 365);
    assert!(report.gaps.gaps.iter().all(|g| g.date.year() == 2021));
    assert_eq!(summary.failed, 365);
}
