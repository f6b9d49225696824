use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use qtrack_core::{CollectionUnit, DateRange, GapReport, SourceKind};
use serde::Serialize;
use tokio::fs;

use crate::gaps::render_gap_log;
use crate::RunSummary;

/// Per-run log files under the logs directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifacts {
    pub run_log: PathBuf,
    pub gap_log: PathBuf,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RunLogLine<'a> {
    Unit(&'a CollectionUnit),
    Summary(&'a RunSummary),
}

impl RunArtifacts {
    /// `<source>_<start>_<end>_<stamp>.log` and its `_gaps.log` sibling.
    pub fn new(logs_dir: &Path, source: SourceKind, range: &DateRange, stamp: DateTime<Utc>) -> Self {
        let base = format!(
            "{}_{}_{}_{}",
            source.slug(),
            range.start,
            range.end,
            stamp.format("%Y%m%dT%H%M%SZ")
        );
        Self {
            run_log: logs_dir.join(format!("{base}.log")),
            gap_log: logs_dir.join(format!("{base}_gaps.log")),
        }
    }

    /// One JSON line per unit, then the summary line.
    pub fn render_run_log(units: &[CollectionUnit], summary: &RunSummary) -> Result<String> {
        let mut out = String::new();
        for line in units
            .iter()
            .map(RunLogLine::Unit)
            .chain(std::iter::once(RunLogLine::Summary(summary)))
        {
            out.push_str(&serde_json::to_string(&line).context("serializing run log line")?);
            out.push('\n');
        }
        Ok(out)
    }

    pub async fn write(
        &self,
        units: &[CollectionUnit],
        summary: &RunSummary,
        gaps: &GapReport,
    ) -> Result<()> {
        if let Some(dir) = self.run_log.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        fs::write(&self.run_log, Self::render_run_log(units, summary)?)
            .await
            .with_context(|| format!("writing {}", self.run_log.display()))?;
        fs::write(&self.gap_log, render_gap_log(gaps))
            .await
            .with_context(|| format!("writing {}", self.gap_log.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    #[test]
    fn artifact_names_encode_source_range_and_stamp() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
        )
        .unwrap();
        let stamp = Utc.with_ymd_and_hms(2026, 2, 24, 6, 30, 0).single().unwrap();
        let artifacts = RunArtifacts::new(Path::new("logs"), SourceKind::Historical, &range, stamp);
        assert_eq!(
            artifacts.run_log,
            PathBuf::from("logs/historical_2024-01-01_2024-01-03_20260224T063000Z.log")
        );
        assert_eq!(
            artifacts.gap_log,
            PathBuf::from("logs/historical_2024-01-01_2024-01-03_20260224T063000Z_gaps.log")
        );
    }
}
