//! Projection of raw Historic JOA / Search records onto the canonical schema.
//!
//! Historic JOA names *are* the canon, so those records are only flattened;
//! values a text cell cannot reproduce also stay native in their raw form.
//! Search records are overlaid through [`FieldMap`]: mapped values land in the
//! canonical columns while the untouched raw record is kept as native fields.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use qtrack_core::{JobRecord, SourceKind, CANON_FIELDS, ESSAY_PHRASE, JOB_ID_FIELD};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use crate::{JsonMap, RawRecord};

/// Search API path (`/`-separated, numeric segments index arrays) -> canon field.
pub const CURRENT_FIELD_MAP: &[(&str, &str)] = &[
    ("MatchedObjectId", "usajobsControlNumber"),
    ("MatchedObjectDescriptor/PositionID", "announcementNumber"),
    ("MatchedObjectDescriptor/PositionTitle", "positionTitle"),
    ("MatchedObjectDescriptor/OrganizationName", "hiringAgencyName"),
    ("MatchedObjectDescriptor/DepartmentName", "hiringDepartmentName"),
    ("MatchedObjectDescriptor/PublicationStartDate", "positionOpenDate"),
    ("MatchedObjectDescriptor/ApplicationCloseDate", "positionCloseDate"),
    ("MatchedObjectDescriptor/PositionEndDate", "positionExpireDate"),
    ("MatchedObjectDescriptor/PositionSchedule/0/Name", "workSchedule"),
    ("MatchedObjectDescriptor/PositionOfferingType/0/Name", "appointmentType"),
    ("MatchedObjectDescriptor/JobGrade/0/Code", "payScale"),
    ("MatchedObjectDescriptor/PositionRemuneration/0/MinimumRange", "minimumSalary"),
    ("MatchedObjectDescriptor/PositionRemuneration/0/MaximumRange", "maximumSalary"),
    ("MatchedObjectDescriptor/PositionRemuneration/0/Description", "salaryType"),
    ("MatchedObjectDescriptor/JobCategory", "jobCategories"),
    ("MatchedObjectDescriptor/PositionLocation", "positionLocations"),
    ("MatchedObjectDescriptor/UserArea/Details/LowGrade", "minimumGrade"),
    ("MatchedObjectDescriptor/UserArea/Details/HighGrade", "maximumGrade"),
    ("MatchedObjectDescriptor/UserArea/Details/PromotionPotential", "promotionPotential"),
    ("MatchedObjectDescriptor/UserArea/Details/HiringPath", "hiringPaths"),
    ("MatchedObjectDescriptor/UserArea/Details/SubAgencyName", "hiringSubelementName"),
    ("MatchedObjectDescriptor/UserArea/Details/WhoMayApply/Name", "whoMayApply"),
    ("MatchedObjectDescriptor/UserArea/Details/SecurityClearance", "securityClearance"),
    ("MatchedObjectDescriptor/UserArea/Details/DrugTestRequired", "drugTestRequired"),
    ("MatchedObjectDescriptor/UserArea/Details/TeleworkEligible", "teleworkEligible"),
    ("MatchedObjectDescriptor/UserArea/Details/TravelCode", "travelRequirement"),
    ("MatchedObjectDescriptor/UserArea/Details/ServiceType", "serviceType"),
    ("MatchedObjectDescriptor/UserArea/Details/Relocation", "relocationExpensesReimbursed"),
    ("MatchedObjectDescriptor/UserArea/Details/TotalOpenings", "totalOpenings"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMap {
    entries: Vec<(String, String)>,
}

impl FieldMap {
    pub fn new<S, T>(entries: impl IntoIterator<Item = (S, T)>) -> Self
    where
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(path, canon)| (path.into(), canon.into()))
                .collect(),
        }
    }

    pub fn current_to_historical() -> Self {
        Self::new(CURRENT_FIELD_MAP.iter().copied())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Follow `path` into `raw`; `None` if any segment is missing.
    pub fn lookup<'a>(raw: &'a JsonMap, path: &str) -> Option<&'a JsonValue> {
        let mut segments = path.split('/');
        let mut cur = raw.get(segments.next()?)?;
        for segment in segments {
            cur = match cur {
                JsonValue::Object(map) => map.get(segment)?,
                JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("{kind} record has no usable `{id_field}`")]
    MissingJobId { kind: SourceKind, id_field: String },
    #[error("{kind} item is not a JSON object")]
    NotAnObject { kind: SourceKind },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub records: Vec<JobRecord>,
    pub dropped: usize,
}

/// Flatten a JSON value into one canonical cell.
///
/// Scalars render as text, non-empty lists of scalars join with `", "`, and
/// anything else (including `[]`) is kept as compact JSON.
pub fn flatten_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(items) => {
            if items.is_empty() {
                return Some(value.to_string());
            }
            let scalars: Option<Vec<String>> = items.iter().map(scalar_text).collect();
            match scalars {
                Some(parts) => Some(parts.join(", ")),
                None => Some(value.to_string()),
            }
        }
        JsonValue::Object(_) => Some(value.to_string()),
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Plain scalars are reproduced exactly by their flattened cell.
fn flattens_verbatim(value: &JsonValue) -> bool {
    matches!(
        value,
        JsonValue::String(_) | JsonValue::Number(_) | JsonValue::Bool(_)
    )
}

fn is_question_key(key: &str) -> bool {
    key.to_ascii_lowercase().contains("question")
}

fn any_text_contains(value: &JsonValue, needle: &str) -> bool {
    match value {
        JsonValue::String(s) => s.to_lowercase().contains(needle),
        JsonValue::Array(items) => items.iter().any(|v| any_text_contains(v, needle)),
        JsonValue::Object(map) => map.values().any(|v| any_text_contains(v, needle)),
        _ => false,
    }
}

/// True when a questionnaire field anywhere under `value` mentions `needle`.
fn questionnaire_mentions(value: &JsonValue, needle: &str) -> bool {
    match value {
        JsonValue::Object(map) => map.iter().any(|(k, v)| {
            if is_question_key(k) {
                any_text_contains(v, needle)
            } else {
                questionnaire_mentions(v, needle)
            }
        }),
        JsonValue::Array(items) => items.iter().any(|v| questionnaire_mentions(v, needle)),
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct SchemaMerger {
    canon: Vec<String>,
    id_field: String,
    field_map: FieldMap,
    essay_phrase: String,
}

impl Default for SchemaMerger {
    fn default() -> Self {
        Self::with_schema(CANON_FIELDS, JOB_ID_FIELD, FieldMap::current_to_historical())
    }
}

impl SchemaMerger {
    pub fn with_schema<S: Into<String>>(
        canon: impl IntoIterator<Item = S>,
        id_field: impl Into<String>,
        field_map: FieldMap,
    ) -> Self {
        Self {
            canon: canon.into_iter().map(Into::into).collect(),
            id_field: id_field.into(),
            field_map,
            essay_phrase: ESSAY_PHRASE.to_lowercase(),
        }
    }

    pub fn canon(&self) -> &[String] {
        &self.canon
    }

    /// Map targets that are not canonical names; those entries are never applied.
    pub fn unknown_targets(&self) -> Vec<&str> {
        self.field_map
            .entries()
            .iter()
            .map(|(_, canon)| canon.as_str())
            .filter(|canon| !self.canon.iter().any(|c| c == canon))
            .collect()
    }

    /// Project a batch; records without a job id are dropped and counted.
    ///
    /// A later record repeating a job id replaces the earlier one in place.
    pub fn merge(&self, raw: &[RawRecord], posted_date: NaiveDate) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for record in raw {
            match self.merge_one(record, posted_date) {
                Ok(job) => match positions.get(&job.job_id) {
                    Some(&idx) => outcome.records[idx] = job,
                    None => {
                        positions.insert(job.job_id.clone(), outcome.records.len());
                        outcome.records.push(job);
                    }
                },
                Err(err) => {
                    warn!(%posted_date, error = %err, "dropping unmergeable record");
                    outcome.dropped += 1;
                }
            }
        }
        outcome
    }

    pub fn merge_one(&self, raw: &RawRecord, posted_date: NaiveDate) -> Result<JobRecord, MergeError> {
        let mut core: BTreeMap<String, Option<String>> =
            self.canon.iter().map(|name| (name.clone(), None)).collect();
        let mut native: BTreeMap<String, JsonValue> = BTreeMap::new();

        match raw {
            RawRecord::Historical(fields) => {
                for (key, value) in fields {
                    match core.get_mut(key) {
                        Some(slot) => {
                            *slot = flatten_value(value);
                            if !flattens_verbatim(value) {
                                native.insert(key.clone(), value.clone());
                            }
                        }
                        None => {
                            native.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
            RawRecord::Current(fields) => {
                for (path, canon) in self.field_map.entries() {
                    let Some(slot) = core.get_mut(canon) else {
                        continue;
                    };
                    if let Some(value) = FieldMap::lookup(fields, path) {
                        *slot = flatten_value(value);
                    }
                }
                native.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            RawRecord::Unusable { source, .. } => {
                return Err(MergeError::NotAnObject { kind: *source });
            }
        }

        let job_id = core
            .get(&self.id_field)
            .cloned()
            .flatten()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| MergeError::MissingJobId {
                kind: raw.source(),
                id_field: self.id_field.clone(),
            })?;

        let essay_flag = self.essay_flag(&core, &native);

        Ok(JobRecord {
            job_id,
            source: raw.source(),
            posted_date,
            core,
            native,
            essay_flag,
        })
    }

    fn essay_flag(
        &self,
        core: &BTreeMap<String, Option<String>>,
        native: &BTreeMap<String, JsonValue>,
    ) -> bool {
        let needle = self.essay_phrase.as_str();
        let in_core = core.iter().any(|(key, value)| {
            is_question_key(key)
                && value
                    .as_deref()
                    .is_some_and(|text| text.to_lowercase().contains(needle))
        });
        in_core
            || native.iter().any(|(key, value)| {
                if is_question_key(key) {
                    any_text_contains(value, needle)
                } else {
                    questionnaire_mentions(value, needle)
                }
            })
    }
}
