//! Year-partitioned Parquet store with keyed upsert and atomic file replacement.
//!
//! One file per `(source kind, year)`, e.g. `historical_jobs_2024.parquet`.
//! Files are only ever replaced wholesale through a temp file + rename in the
//! same directory, so a reader sees either the previous or the next version.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{Array, BooleanArray, RecordBatch, StringArray};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use parquet::file::reader::{FileReader, SerializedFileReader};
use qtrack_core::{JobRecord, PartitionKey, SourceKind};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

const COL_JOB_ID: &str = "job_id";
const COL_SOURCE: &str = "source";
const COL_POSTED_DATE: &str = "posted_date";
const COL_ESSAY_FLAG: &str = "essay_flag";
const COL_NATIVE_JSON: &str = "native_json";
const RESERVED_COLUMNS: [&str; 5] = [
    COL_JOB_ID,
    COL_SOURCE,
    COL_POSTED_DATE,
    COL_ESSAY_FLAG,
    COL_NATIVE_JSON,
];

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parquet error on {path}: {source}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: ParquetError,
    },
    #[error("arrow error on {path}: {source}")]
    Arrow {
        path: PathBuf,
        #[source]
        source: ArrowError,
    },
    #[error("unexpected partition layout in {path}: {detail}")]
    Layout { path: PathBuf, detail: String },
    #[error("json error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn parquet_err(path: &Path) -> impl FnOnce(ParquetError) -> StorageError + '_ {
    move |source| StorageError::Parquet {
        path: path.to_path_buf(),
        source,
    }
}

fn arrow_err(path: &Path) -> impl FnOnce(ArrowError) -> StorageError + '_ {
    move |source| StorageError::Arrow {
        path: path.to_path_buf(),
        source,
    }
}

fn layout_err(path: &Path, detail: impl Into<String>) -> StorageError {
    StorageError::Layout {
        path: path.to_path_buf(),
        detail: detail.into(),
    }
}

/// Row count per partition file at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionCensus {
    pub rows: BTreeMap<PartitionKey, usize>,
}

impl PartitionCensus {
    pub fn rows_for(&self, key: &PartitionKey) -> usize {
        self.rows.get(key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.rows.values().sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub partition: PartitionKey,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Owner of every partition file under one data directory.
#[derive(Debug)]
pub struct PartitionStore {
    root: PathBuf,
    locks: Mutex<HashMap<PartitionKey, Arc<Mutex<()>>>>,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    async fn partition_lock(&self, key: PartitionKey) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Insert or overwrite `records` by `job_id`, partition by partition.
    ///
    /// Returns the number of incoming records written. A later record in
    /// `records` wins over an earlier one with the same `job_id`.
    pub async fn upsert(&self, records: Vec<JobRecord>) -> Result<usize, StorageError> {
        let mut grouped: BTreeMap<PartitionKey, Vec<JobRecord>> = BTreeMap::new();
        for record in records {
            grouped.entry(record.partition_key()).or_default().push(record);
        }

        let mut written = 0usize;
        for (key, batch) in grouped {
            written += self.upsert_partition(key, batch).await?;
        }
        Ok(written)
    }

    async fn upsert_partition(
        &self,
        key: PartitionKey,
        incoming: Vec<JobRecord>,
    ) -> Result<usize, StorageError> {
        let lock = self.partition_lock(key).await;
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(io_err(&self.root))?;

        let path = self.partition_path(&key);
        let mut by_id: BTreeMap<String, JobRecord> = if path.exists() {
            read_partition_file(&path)?
                .into_iter()
                .map(|r| (r.job_id.clone(), r))
                .collect()
        } else {
            BTreeMap::new()
        };

        let written = incoming.len();
        let mut inserted = 0usize;
        let mut updated = 0usize;
        for record in incoming {
            match by_id.insert(record.job_id.clone(), record) {
                Some(_) => updated += 1,
                None => inserted += 1,
            }
        }

        let rows: Vec<&JobRecord> = by_id.values().collect();
        write_partition_file(&path, &rows)?;
        info!(
            partition = %key,
            inserted,
            updated,
            total = rows.len(),
            "partition upserted"
        );
        Ok(written)
    }

    /// All records of one partition; empty when the partition does not exist yet.
    pub async fn read(&self, source: SourceKind, year: i32) -> Result<Vec<JobRecord>, StorageError> {
        let key = PartitionKey::new(source, year);
        let lock = self.partition_lock(key).await;
        let _guard = lock.lock().await;

        let path = self.partition_path(&key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_partition_file(&path)
    }

    pub async fn list_partitions(&self) -> Result<Vec<PartitionKey>, StorageError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(io_err(&self.root))?;
        let mut keys = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.root))? {
            if let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(PartitionKey::parse_file_name)
            {
                keys.insert(key);
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Row counts read from Parquet footers, without decoding any rows.
    pub async fn census(&self) -> Result<PartitionCensus, StorageError> {
        let mut census = PartitionCensus::default();
        for key in self.list_partitions().await? {
            let path = self.partition_path(&key);
            census.rows.insert(key, count_rows(&path)?);
        }
        Ok(census)
    }

    /// Rewrite `manifest.json` describing every partition file.
    pub async fn write_manifest(&self) -> Result<PathBuf, StorageError> {
        let mut files = Vec::new();
        for key in self.list_partitions().await? {
            let path = self.partition_path(&key);
            let bytes = tokio::fs::read(&path).await.map_err(io_err(&path))?;
            files.push(ManifestFile {
                name: key.file_name(),
                partition: key,
                sha256: hex::encode(Sha256::digest(&bytes)),
                bytes: bytes.len() as u64,
                rows: count_rows(&path)?,
            });
        }

        let manifest = PartitionManifest {
            schema_version: 1,
            generated_at: Utc::now(),
            files,
        };
        let manifest_path = self.root.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(&manifest).map_err(|source| StorageError::Json {
            path: manifest_path.clone(),
            source,
        })?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(io_err(&self.root))?;
        replace_atomically(&manifest_path, |file| {
            use std::io::Write;
            let mut file = file;
            file.write_all(&bytes).map_err(io_err(&manifest_path))?;
            file.flush().map_err(io_err(&manifest_path))
        })?;
        Ok(manifest_path)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4()))
}

/// Write through a sibling temp file, then rename over `path`.
fn replace_atomically(
    path: &Path,
    write: impl FnOnce(File) -> Result<(), StorageError>,
) -> Result<(), StorageError> {
    let temp_path = temp_path_for(path);
    let file = File::create(&temp_path).map_err(io_err(&temp_path))?;
    if let Err(err) = write(file) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }
    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(StorageError::Io {
            path: path.to_path_buf(),
            source: err,
        });
    }
    Ok(())
}

fn partition_schema(core_columns: &[String]) -> Arc<Schema> {
    let mut fields = vec![
        ArrowField::new(COL_JOB_ID, DataType::Utf8, false),
        ArrowField::new(COL_SOURCE, DataType::Utf8, false),
        ArrowField::new(COL_POSTED_DATE, DataType::Utf8, false),
        ArrowField::new(COL_ESSAY_FLAG, DataType::Boolean, false),
    ];
    fields.extend(
        core_columns
            .iter()
            .map(|name| ArrowField::new(name.as_str(), DataType::Utf8, true)),
    );
    fields.push(ArrowField::new(COL_NATIVE_JSON, DataType::Utf8, false));
    Arc::new(Schema::new(fields))
}

fn write_partition_file(path: &Path, rows: &[&JobRecord]) -> Result<(), StorageError> {
    let core_columns: Vec<String> = rows
        .iter()
        .flat_map(|r| r.core.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if let Some(clash) = core_columns
        .iter()
        .find(|c| RESERVED_COLUMNS.contains(&c.as_str()))
    {
        return Err(layout_err(path, format!("core field `{clash}` clashes with a reserved column")));
    }

    let schema = partition_schema(&core_columns);

    let job_ids = StringArray::from(rows.iter().map(|r| Some(r.job_id.as_str())).collect::<Vec<_>>());
    let sources = StringArray::from(rows.iter().map(|r| Some(r.source.slug())).collect::<Vec<_>>());
    let posted = StringArray::from(
        rows.iter()
            .map(|r| Some(r.posted_date.format("%Y-%m-%d").to_string()))
            .collect::<Vec<_>>(),
    );
    let essay = BooleanArray::from(rows.iter().map(|r| r.essay_flag).collect::<Vec<_>>());

    let mut columns: Vec<Arc<dyn Array>> = vec![
        Arc::new(job_ids),
        Arc::new(sources),
        Arc::new(posted),
        Arc::new(essay),
    ];
    for name in &core_columns {
        let values = rows
            .iter()
            .map(|r| r.core_value(name))
            .collect::<Vec<_>>();
        columns.push(Arc::new(StringArray::from(values)));
    }

    let mut native = Vec::with_capacity(rows.len());
    for row in rows {
        native.push(serde_json::to_string(&row.native).map_err(|source| StorageError::Json {
            path: path.to_path_buf(),
            source,
        })?);
    }
    columns.push(Arc::new(StringArray::from(native)));

    let batch = RecordBatch::try_new(schema, columns).map_err(arrow_err(path))?;

    replace_atomically(path, |file| {
        let mut writer =
            ArrowWriter::try_new(file, batch.schema(), None).map_err(parquet_err(path))?;
        writer.write(&batch).map_err(parquet_err(path))?;
        writer.close().map_err(parquet_err(path))?;
        Ok(())
    })
}

fn count_rows(path: &Path) -> Result<usize, StorageError> {
    let file = File::open(path).map_err(io_err(path))?;
    let reader = SerializedFileReader::new(file).map_err(parquet_err(path))?;
    Ok(reader.metadata().file_metadata().num_rows().max(0) as usize)
}

fn col_string<'a>(path: &Path, batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, StorageError> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|_| layout_err(path, format!("missing column `{name}`")))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| layout_err(path, format!("column `{name}` is not utf8")))
}

fn col_bool<'a>(path: &Path, batch: &'a RecordBatch, name: &str) -> Result<&'a BooleanArray, StorageError> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|_| layout_err(path, format!("missing column `{name}`")))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| layout_err(path, format!("column `{name}` is not boolean")))
}

fn opt_str(array: &StringArray, row: usize) -> Option<String> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row).to_string())
    }
}

pub(crate) fn read_partition_file(path: &Path) -> Result<Vec<JobRecord>, StorageError> {
    let file = File::open(path).map_err(io_err(path))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(parquet_err(path))?
        .build()
        .map_err(parquet_err(path))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.map_err(arrow_err(path))?;
        let job_ids = col_string(path, &batch, COL_JOB_ID)?;
        let sources = col_string(path, &batch, COL_SOURCE)?;
        let posted = col_string(path, &batch, COL_POSTED_DATE)?;
        let essay = col_bool(path, &batch, COL_ESSAY_FLAG)?;
        let native = col_string(path, &batch, COL_NATIVE_JSON)?;

        let schema = batch.schema();
        let mut core_columns = Vec::new();
        for field in schema.fields() {
            if RESERVED_COLUMNS.contains(&field.name().as_str()) {
                continue;
            }
            core_columns.push((field.name().clone(), col_string(path, &batch, field.name())?));
        }

        for row in 0..batch.num_rows() {
            let source: SourceKind = sources
                .value(row)
                .parse()
                .map_err(|e| layout_err(path, format!("row {row}: {e}")))?;
            let posted_date = NaiveDate::parse_from_str(posted.value(row), "%Y-%m-%d")
                .map_err(|e| layout_err(path, format!("row {row}: bad posted_date: {e}")))?;
            let native: BTreeMap<String, JsonValue> = serde_json::from_str(native.value(row))
                .map_err(|source| StorageError::Json {
                    path: path.to_path_buf(),
                    source,
                })?;
            let core = core_columns
                .iter()
                .map(|(name, array)| (name.clone(), opt_str(array, row)))
                .collect();

            records.push(JobRecord {
                job_id: job_ids.value(row).to_string(),
                source,
                posted_date,
                core,
                native,
                essay_flag: essay.value(row),
            });
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(source: SourceKind, job_id: &str, date: (i32, u32, u32), title: &str) -> JobRecord {
        let mut core = BTreeMap::new();
        core.insert("usajobsControlNumber".to_string(), Some(job_id.to_string()));
        core.insert("positionTitle".to_string(), Some(title.to_string()));
        core.insert("hiringAgencyName".to_string(), None);
        let mut native = BTreeMap::new();
        native.insert("raw".to_string(), json!({ "nested": [1, 2, 3], "title": title }));
        JobRecord {
            job_id: job_id.to_string(),
            source,
            posted_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            core,
            native,
            essay_flag: title.contains("essay"),
        }
    }

    #[tokio::test]
    async fn upsert_round_trips_every_field() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let original = record(SourceKind::Historical, "700001", (2024, 3, 5), "essay analyst");

        let written = store.upsert(vec![original.clone()]).await.expect("upsert");
        assert_eq!(written, 1);
        assert!(dir.path().join("historical_jobs_2024.parquet").exists());

        let stored = store.read(SourceKind::Historical, 2024).await.expect("read");
        assert_eq!(stored, vec![original]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_into_one_partition_keep_every_row() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(PartitionStore::new(dir.path()));

        let handles: Vec<_> = (0..16)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move {
                    let id = format!("9000{n:02}");
                    store
                        .upsert(vec![record(SourceKind::Historical, &id, (2024, 6, 1), "parallel")])
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.expect("join").expect("upsert"), 1);
        }

        let stored = store.read(SourceKind::Historical, 2024).await.expect("read");
        assert_eq!(stored.len(), 16);
        let census = store.census().await.expect("census");
        assert_eq!(census.total(), 16);
    }

    #[tokio::test]
    async fn reinserting_a_job_id_overwrites_instead_of_duplicating() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());

        store
            .upsert(vec![
                record(SourceKind::Current, "1", (2025, 1, 1), "first"),
                record(SourceKind::Current, "2", (2025, 1, 1), "other"),
            ])
            .await
            .expect("first upsert");
        store
            .upsert(vec![record(SourceKind::Current, "1", (2025, 1, 2), "second")])
            .await
            .expect("second upsert");

        let stored = store.read(SourceKind::Current, 2025).await.expect("read");
        assert_eq!(stored.len(), 2);
        let first = stored.iter().find(|r| r.job_id == "1").unwrap();
        assert_eq!(first.core_value("positionTitle"), Some("second"));
        assert_eq!(first.posted_date, NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
    }

    #[tokio::test]
    async fn repeated_upserts_are_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let batch = vec![
            record(SourceKind::Historical, "10", (2023, 6, 1), "a"),
            record(SourceKind::Historical, "11", (2023, 6, 1), "b"),
        ];

        store.upsert(batch.clone()).await.expect("first");
        let path = store.partition_path(&PartitionKey::new(SourceKind::Historical, 2023));
        let first_bytes = std::fs::read(&path).unwrap();
        store.upsert(batch).await.expect("second");
        let second_bytes = std::fs::read(&path).unwrap();

        assert_eq!(first_bytes, second_bytes);
        assert_eq!(store.census().await.unwrap().total(), 2);
    }

    #[tokio::test]
    async fn writing_one_year_leaves_neighbouring_partitions_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        store
            .upsert(vec![
                record(SourceKind::Historical, "a", (2022, 12, 31), "x"),
                record(SourceKind::Historical, "b", (2024, 1, 1), "y"),
            ])
            .await
            .unwrap();
        let before_2022 = std::fs::read(dir.path().join("historical_jobs_2022.parquet")).unwrap();
        let before_2024 = std::fs::read(dir.path().join("historical_jobs_2024.parquet")).unwrap();

        store
            .upsert(vec![record(SourceKind::Historical, "c", (2023, 7, 4), "z")])
            .await
            .unwrap();

        assert_eq!(before_2022, std::fs::read(dir.path().join("historical_jobs_2022.parquet")).unwrap());
        assert_eq!(before_2024, std::fs::read(dir.path().join("historical_jobs_2024.parquet")).unwrap());
        assert_eq!(
            store.list_partitions().await.unwrap(),
            vec![
                PartitionKey::new(SourceKind::Historical, 2022),
                PartitionKey::new(SourceKind::Historical, 2023),
                PartitionKey::new(SourceKind::Historical, 2024),
            ]
        );
    }

    #[tokio::test]
    async fn sources_never_share_a_partition_file() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        store
            .upsert(vec![
                record(SourceKind::Historical, "same", (2025, 5, 5), "hist"),
                record(SourceKind::Current, "same", (2025, 5, 5), "cur"),
            ])
            .await
            .unwrap();

        let hist = store.read(SourceKind::Historical, 2025).await.unwrap();
        let cur = store.read(SourceKind::Current, 2025).await.unwrap();
        assert_eq!(hist[0].core_value("positionTitle"), Some("hist"));
        assert_eq!(cur[0].core_value("positionTitle"), Some("cur"));
    }

    #[tokio::test]
    async fn manifest_lists_partitions_with_hashes_and_rows() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        store
            .upsert(vec![
                record(SourceKind::Current, "1", (2025, 2, 1), "a"),
                record(SourceKind::Current, "2", (2025, 2, 1), "b"),
            ])
            .await
            .unwrap();

        let manifest_path = store.write_manifest().await.unwrap();
        let manifest: PartitionManifest =
            serde_json::from_slice(&std::fs::read(manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].name, "current_jobs_2025.parquet");
        assert_eq!(manifest.files[0].rows, 2);
        assert_eq!(manifest.files[0].sha256.len(), 64);
    }

    #[tokio::test]
    async fn temp_files_are_not_left_behind() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        store
            .upsert(vec![record(SourceKind::Historical, "1", (2021, 1, 1), "a")])
            .await
            .unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
