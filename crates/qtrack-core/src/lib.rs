//! Core domain model for qtrack: job records, collection units, partitions and gap reports.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "qtrack-core";

/// The calendar date used for every "today" decision: range defaults, year
/// clipping and the Search API look-back.
pub fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

/// Canonical field names, as published by the Historic JOA API.
///
/// Every stored [`JobRecord`] carries all of these in `core`, null-valued when
/// the upstream record had nothing to offer.
pub const CANON_FIELDS: [&str; 40] = [
    "usajobsControlNumber",
    "hiringAgencyCode",
    "hiringAgencyName",
    "hiringDepartmentCode",
    "hiringDepartmentName",
    "agencyLevel",
    "agencyLevelSort",
    "appointmentType",
    "workSchedule",
    "payScale",
    "salaryType",
    "vendor",
    "travelRequirement",
    "teleworkEligible",
    "serviceType",
    "securityClearanceRequired",
    "securityClearance",
    "whoMayApply",
    "announcementClosingTypeCode",
    "announcementClosingTypeDescription",
    "positionOpenDate",
    "positionCloseDate",
    "positionExpireDate",
    "announcementNumber",
    "hiringSubelementName",
    "positionTitle",
    "minimumGrade",
    "maximumGrade",
    "promotionPotential",
    "minimumSalary",
    "maximumSalary",
    "supervisoryStatus",
    "drugTestRequired",
    "relocationExpensesReimbursed",
    "totalOpenings",
    "disableApplyOnline",
    "positionOpeningStatus",
    "hiringPaths",
    "jobCategories",
    "positionLocations",
];

/// Canon field holding the record identity.
pub const JOB_ID_FIELD: &str = "usajobsControlNumber";

/// Tracked policy-priorities essay question, matched case-insensitively.
pub const ESSAY_PHRASE: &str = "executive orders";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Historical,
    Current,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Historical, SourceKind::Current];

    pub fn slug(&self) -> &'static str {
        match self {
            SourceKind::Historical => "historical",
            SourceKind::Current => "current",
        }
    }

    /// File-name prefix of this source's partitions.
    pub fn partition_prefix(&self) -> &'static str {
        match self {
            SourceKind::Historical => "historical_jobs",
            SourceKind::Current => "current_jobs",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Error)]
#[error("unknown source `{0}` (expected `historical` or `current`)")]
pub struct UnknownSource(pub String);

impl FromStr for SourceKind {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "historical" | "historic" => Ok(SourceKind::Historical),
            "current" => Ok(SourceKind::Current),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

/// One questionnaire-bearing job announcement in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub source: SourceKind,
    pub posted_date: NaiveDate,
    /// Canon field name -> flattened value.
    pub core: BTreeMap<String, Option<String>>,
    /// Upstream fields kept verbatim.
    pub native: BTreeMap<String, JsonValue>,
    pub essay_flag: bool,
}

impl JobRecord {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey {
            source: self.source,
            year: self.posted_date.year(),
        }
    }

    pub fn core_value(&self, name: &str) -> Option<&str> {
        self.core.get(name).and_then(|v| v.as_deref())
    }
}

/// Identity of one year's partition file for one source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub source: SourceKind,
    pub year: i32,
}

impl PartitionKey {
    pub const EXTENSION: &'static str = "parquet";

    pub fn new(source: SourceKind, year: i32) -> Self {
        Self { source, year }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.{}",
            self.source.partition_prefix(),
            self.year,
            Self::EXTENSION
        )
    }

    /// Inverse of [`PartitionKey::file_name`]; `None` for anything else.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(&format!(".{}", Self::EXTENSION))?;
        SourceKind::ALL.into_iter().find_map(|source| {
            let year = stem
                .strip_prefix(source.partition_prefix())?
                .strip_prefix('_')?;
            if year.len() != 4 || !year.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            Some(Self {
                source,
                year: year.parse().ok()?,
            })
        })
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.source.partition_prefix(), self.year)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("end date {end} is before start date {start}")]
    Inverted { start: NaiveDate, end: NaiveDate },
    #[error("year {0} is outside the supported calendar")]
    InvalidYear(i32),
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, RangeError> {
        if end < start {
            return Err(RangeError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Jan 1..Dec 31 of `year`, clipped so it never runs past `today`.
    pub fn for_year(year: i32, today: NaiveDate) -> Result<Self, RangeError> {
        let start = NaiveDate::from_ymd_opt(year, 1, 1).ok_or(RangeError::InvalidYear(year))?;
        let end = NaiveDate::from_ymd_opt(year, 12, 31).ok_or(RangeError::InvalidYear(year))?;
        Self::new(start, end.min(today))
    }

    /// Every date in the range, in calendar order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    pub fn len_days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Pending,
    Success,
    Failed,
}

/// One calendar date's collection attempt for one source.
///
/// Transitions consume the unit, so a finished unit cannot be moved back to
/// `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionUnit {
    pub date: NaiveDate,
    pub source: SourceKind,
    pub status: UnitStatus,
    pub record_count: usize,
    pub dropped_count: usize,
    pub error: Option<String>,
}

impl CollectionUnit {
    pub fn pending(date: NaiveDate, source: SourceKind) -> Self {
        Self {
            date,
            source,
            status: UnitStatus::Pending,
            record_count: 0,
            dropped_count: 0,
            error: None,
        }
    }

    pub fn succeed(self, record_count: usize, dropped_count: usize) -> Self {
        Self {
            status: UnitStatus::Success,
            record_count,
            dropped_count,
            error: None,
            ..self
        }
    }

    pub fn fail(self, error: impl Into<String>) -> Self {
        Self {
            status: UnitStatus::Failed,
            error: Some(error.into()),
            ..self
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UnitStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum GapReason {
    Failed(String),
    NotAttempted,
}

impl fmt::Display for GapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GapReason::Failed(err) => write!(f, "failed: {err}"),
            GapReason::NotAttempted => f.write_str("not attempted"),
        }
    }
}

/// A requested date with no successful collection, plus how to retry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub date: NaiveDate,
    pub reason: GapReason,
    pub retry_command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapReport {
    pub source: SourceKind,
    pub data_dir: PathBuf,
    /// Disjoint ranges in calendar order; only these dates were asked for.
    pub requested: Vec<DateRange>,
    pub gaps: Vec<Gap>,
}

impl GapReport {
    pub fn is_empty(&self) -> bool {
        self.gaps.is_empty()
    }

    pub fn requested_days(&self) -> usize {
        self.requested.iter().map(DateRange::len_days).sum()
    }

    /// `2021-01-01..2021-12-31, 2023-01-01..2023-12-31`
    pub fn requested_label(&self) -> String {
        self.requested
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn gap_dates(&self) -> Vec<NaiveDate> {
        self.gaps.iter().map(|g| g.date).collect()
    }
}
