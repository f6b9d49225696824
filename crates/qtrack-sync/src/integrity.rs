use std::collections::BTreeSet;

use qtrack_core::PartitionKey;
use qtrack_storage::PartitionCensus;
use serde::Serialize;

/// Row counts of one partition file before and after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionDelta {
    pub file: String,
    pub partition: PartitionKey,
    pub before: usize,
    pub after: usize,
}

impl PartitionDelta {
    pub fn added(&self) -> usize {
        self.after.saturating_sub(self.before)
    }

    pub fn lost(&self) -> usize {
        self.before.saturating_sub(self.after)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub deltas: Vec<PartitionDelta>,
}

impl IntegrityReport {
    /// Compare two censuses; partitions present in either appear once, in key order.
    pub fn compare(before: &PartitionCensus, after: &PartitionCensus) -> Self {
        let keys: BTreeSet<PartitionKey> =
            before.rows.keys().chain(after.rows.keys()).copied().collect();
        let deltas = keys
            .into_iter()
            .map(|key| PartitionDelta {
                file: key.file_name(),
                partition: key,
                before: before.rows_for(&key),
                after: after.rows_for(&key),
            })
            .collect();
        Self { deltas }
    }

    pub fn shrunk(&self) -> impl Iterator<Item = &PartitionDelta> {
        self.deltas.iter().filter(|d| d.after < d.before)
    }

    pub fn has_data_loss(&self) -> bool {
        self.shrunk().next().is_some()
    }

    pub fn grown(&self) -> impl Iterator<Item = &PartitionDelta> {
        self.deltas.iter().filter(|d| d.after > d.before)
    }

    pub fn total_added(&self) -> usize {
        self.deltas.iter().map(PartitionDelta::added).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qtrack_core::SourceKind;

    fn census(rows: &[(SourceKind, i32, usize)]) -> PartitionCensus {
        let mut census = PartitionCensus::default();
        for (source, year, n) in rows {
            census.rows.insert(PartitionKey::new(*source, *year), *n);
        }
        census
    }

    #[test]
    fn additions_and_new_files_are_reported_per_partition() {
        let before = census(&[(SourceKind::Historical, 2023, 10)]);
        let after = census(&[(SourceKind::Historical, 2023, 14), (SourceKind::Historical, 2024, 3)]);
        let report = IntegrityReport::compare(&before, &after);

        assert!(!report.has_data_loss());
        assert_eq!(report.total_added(), 7);
        let grown: Vec<_> = report.grown().map(|d| (d.file.as_str(), d.added())).collect();
        assert_eq!(
            grown,
            vec![("historical_jobs_2023.parquet", 4), ("historical_jobs_2024.parquet", 3)]
        );
    }

    #[test]
    fn shrinking_or_vanished_partitions_are_data_loss() {
        let before = census(&[(SourceKind::Current, 2025, 8), (SourceKind::Current, 2024, 2)]);
        let after = census(&[(SourceKind::Current, 2025, 5)]);
        let report = IntegrityReport::compare(&before, &after);

        assert!(report.has_data_loss());
        let lost: Vec<_> = report.shrunk().map(|d| (d.partition.year, d.lost())).collect();
        assert_eq!(lost, vec![(2024, 2), (2025, 3)]);
    }

    #[test]
    fn unchanged_partitions_are_neither_grown_nor_shrunk() {
        let both = census(&[(SourceKind::Historical, 2020, 4)]);
        let report = IntegrityReport::compare(&both, &both);
        assert_eq!(report.deltas.len(), 1);
        assert_eq!(report.grown().count() + report.shrunk().count(), 0);
    }
}
