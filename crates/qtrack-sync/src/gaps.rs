//! Gap detection over a finished run plus the retry-command log.

use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use qtrack_core::{CollectionUnit, DateRange, Gap, GapReason, GapReport, SourceKind, UnitStatus};

pub const BINARY_NAME: &str = "qtrack";

/// Shell command re-running exactly `date` for `source` into `data_dir`.
pub fn retry_command(source: SourceKind, date: NaiveDate, data_dir: &Path) -> String {
    let subcommand = match source {
        SourceKind::Historical => "collect --source historical",
        SourceKind::Current => "current",
    };
    format!(
        "{BINARY_NAME} {subcommand} --start-date {date} --end-date {date} --data-dir {}",
        shell_quote(&data_dir.display().to_string())
    )
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=@,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Every date in `range` without a successful unit, in calendar order.
///
/// Dates missing from `units` count as not attempted.
pub fn detect(
    range: &DateRange,
    units: &[CollectionUnit],
    source: SourceKind,
    data_dir: &Path,
) -> GapReport {
    let by_date: HashMap<NaiveDate, &CollectionUnit> = units
        .iter()
        .filter(|u| u.source == source)
        .map(|u| (u.date, u))
        .collect();

    let gaps = range
        .days()
        .filter_map(|date| {
            let reason = match by_date.get(&date) {
                Some(unit) if unit.status == UnitStatus::Success => return None,
                Some(unit) if unit.status == UnitStatus::Failed => GapReason::Failed(
                    unit.error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                ),
                _ => GapReason::NotAttempted,
            };
            Some(Gap {
                date,
                reason,
                retry_command: retry_command(source, date, data_dir),
            })
        })
        .collect();

    GapReport {
        source,
        data_dir: data_dir.to_path_buf(),
        requested: vec![*range],
        gaps,
    }
}

/// Gap log body: a comment line per gap followed by its retry command.
pub fn render_gap_log(report: &GapReport) -> String {
    let mut out = format!(
        "# {} gaps for {} ({} of {} days)\n",
        report.source,
        report.requested_label(),
        report.gaps.len(),
        report.requested_days()
    );
    for gap in &report.gaps {
        out.push_str(&format!("# {}: {}\n", gap.date, gap.reason));
        out.push_str(&gap.retry_command);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn range(a: u32, b: u32) -> DateRange {
        DateRange::new(d(a), d(b)).unwrap()
    }

    #[test]
    fn gaps_and_successes_partition_the_request() {
        let units = vec![
            CollectionUnit::pending(d(1), SourceKind::Historical).succeed(3, 0),
            CollectionUnit::pending(d(2), SourceKind::Historical).fail("http status 503"),
            CollectionUnit::pending(d(3), SourceKind::Historical),
            CollectionUnit::pending(d(5), SourceKind::Historical).succeed(0, 0),
        ];
        let report = detect(&range(1, 5), &units, SourceKind::Historical, Path::new("data"));

        assert_eq!(report.gap_dates(), vec![d(2), d(3), d(4)]);
        assert_eq!(report.gaps[0].reason, GapReason::Failed("http status 503".into()));
        assert_eq!(report.gaps[1].reason, GapReason::NotAttempted);
        assert_eq!(report.gaps[2].reason, GapReason::NotAttempted);

        let succeeded = units.iter().filter(|u| u.is_success()).count();
        assert_eq!(succeeded + report.gaps.len(), report.requested_days());
    }

    #[test]
    fn retry_commands_target_one_date() {
        let data_dir = PathBuf::from("/var/lib/qtrack");
        assert_eq!(
            retry_command(SourceKind::Historical, d(2), &data_dir),
            "qtrack collect --source historical --start-date 2024-01-02 --end-date 2024-01-02 --data-dir /var/lib/qtrack"
        );
        assert_eq!(
            retry_command(SourceKind::Current, d(2), &data_dir),
            "qtrack current --start-date 2024-01-02 --end-date 2024-01-02 --data-dir /var/lib/qtrack"
        );
        assert!(retry_command(SourceKind::Historical, d(2), Path::new("my data")).ends_with("'my data'"));
    }

    #[test]
    fn units_of_another_source_do_not_close_gaps() {
        let units = vec![CollectionUnit::pending(d(1), SourceKind::Current).succeed(1, 0)];
        let report = detect(&range(1, 1), &units, SourceKind::Historical, Path::new("data"));
        assert_eq!(report.gap_dates(), vec![d(1)]);
    }

    #[test]
    fn gap_log_lists_commands_verbatim() {
        let units = vec![CollectionUnit::pending(d(2), SourceKind::Historical).fail("auth error: 403")];
        let report = detect(&range(2, 2), &units, SourceKind::Historical, Path::new("data"));
        let log = render_gap_log(&report);
        let commands: Vec<_> = log.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(commands, vec![report.gaps[0].retry_command.as_str()]);
        assert!(log.contains("# 2024-01-02: failed: auth error: 403"));
    }

    #[test]
    fn gap_log_header_counts_only_requested_ranges() {
        let mut report = detect(&range(1, 2), &[], SourceKind::Historical, Path::new("data"));
        let later = detect(&range(10, 10), &[], SourceKind::Historical, Path::new("data"));
        report.requested.extend(later.requested);
        report.gaps.extend(later.gaps);

        let log = render_gap_log(&report);
        assert!(log.starts_with(
            "# historical gaps for 2024-01-01..2024-01-02, 2024-01-10..2024-01-10 (3 of 3 days)\n"
        ));
    }
}
