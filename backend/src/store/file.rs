//! File-backed stores.
//!
//! Dictionaries can be seeded from JSON arrays of documents or from the
//! UK Biobank showcase exports (`Data_Dictionary_Showcase.csv`, `Codings.csv`).
//! The format is chosen from the file extension.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{DictionarySource, RecordSink};
use crate::error::{SinkResult, StoreError, StoreResult};
use crate::models::{CodingEntry, CurationRecord, FieldDictionaryEntry, ValueType};

/// Dictionary documents read from disk on every fetch.
#[derive(Debug, Clone)]
pub struct FileDictionarySource {
    fields_path: PathBuf,
    codings_path: PathBuf,
}

impl FileDictionarySource {
    pub fn new(fields_path: impl Into<PathBuf>, codings_path: impl Into<PathBuf>) -> Self {
        Self {
            fields_path: fields_path.into(),
            codings_path: codings_path.into(),
        }
    }

    pub fn fields_path(&self) -> &Path {
        &self.fields_path
    }

    pub fn codings_path(&self) -> &Path {
        &self.codings_path
    }
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
}

async fn read(path: &Path) -> StoreResult<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StoreError::Unavailable(format!("{} does not exist", path.display()))
        } else {
            StoreError::Io(e)
        }
    })
}

/// Row of `Data_Dictionary_Showcase.csv`; other columns are ignored.
#[derive(Debug, Deserialize)]
struct ShowcaseFieldRow {
    #[serde(rename = "FieldID")]
    field_id: u32,
    #[serde(rename = "Field", default)]
    title: Option<String>,
    #[serde(rename = "ValueType")]
    value_type: String,
    #[serde(rename = "Instances")]
    instances: u32,
    #[serde(rename = "Array")]
    array: u32,
    #[serde(rename = "Coding", default)]
    coding: Option<u32>,
}

/// Row of `Codings.csv`. Values stay strings so codes like `01` survive.
#[derive(Debug, Deserialize)]
struct ShowcaseCodingRow {
    #[serde(rename = "Coding")]
    coding: u32,
    #[serde(rename = "Value")]
    value: String,
    #[serde(rename = "Meaning")]
    meaning: String,
}

fn parse_showcase_fields(bytes: &[u8]) -> StoreResult<Vec<FieldDictionaryEntry>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::Headers).from_reader(bytes);
    let mut entries = Vec::new();
    for row in reader.deserialize::<ShowcaseFieldRow>() {
        let row = row?;
        let value_type: ValueType = row.value_type.parse().map_err(|e: String| {
            StoreError::Unavailable(format!("field {}: {}", row.field_id, e))
        })?;
        entries.push(FieldDictionaryEntry {
            field_id: row.field_id,
            value_type,
            instance_count: row.instances,
            array_count: row.array,
            coding_id: row.coding,
            title: row.title.filter(|t| !t.is_empty()),
        });
    }
    Ok(entries)
}

fn parse_showcase_codings(bytes: &[u8]) -> StoreResult<Vec<CodingEntry>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::Headers).from_reader(bytes);
    reader
        .deserialize::<ShowcaseCodingRow>()
        .map(|row| {
            let row = row?;
            Ok(CodingEntry {
                coding_id: row.coding,
                value: row.value,
                meaning: row.meaning,
            })
        })
        .collect()
}

#[async_trait]
impl DictionarySource for FileDictionarySource {
    async fn fetch_fields(&self) -> StoreResult<Vec<FieldDictionaryEntry>> {
        let bytes = read(&self.fields_path).await?;
        if is_csv(&self.fields_path) {
            parse_showcase_fields(&bytes)
        } else {
            Ok(serde_json::from_slice(&bytes)?)
        }
    }

    async fn fetch_codings(&self) -> StoreResult<Vec<CodingEntry>> {
        let bytes = read(&self.codings_path).await?;
        if is_csv(&self.codings_path) {
            parse_showcase_codings(&bytes)
        } else {
            Ok(serde_json::from_slice(&bytes)?)
        }
    }
}

/// Appends each record as one JSON line.
#[derive(Debug)]
pub struct NdjsonSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl NdjsonSink {
    /// Open `path` for appending, creating it and its parent directory if needed.
    pub async fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for NdjsonSink {
    async fn insert_many(&self, records: &[CurationRecord]) -> SinkResult<usize> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordLayout;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_showcase_csv_dictionaries() {
        let dir = tempdir().unwrap();
        let fields = dir.path().join("Data_Dictionary_Showcase.csv");
        let codings = dir.path().join("Codings.csv");
        std::fs::write(
            &fields,
            "Path,Category,FieldID,Field,Participants,ValueType,Instances,Array,Coding\n\
             Population > Baseline,100094,31,Sex,502000,Categorical single,1,1,9\n\
             Physical > Body,100010,21001,Body mass index (BMI),499000,Continuous,4,1,\n",
        )
        .unwrap();
        std::fs::write(
            &codings,
            "Coding,Value,Meaning\n9,0,Female\n9,1,Male\n100,01,January\n",
        )
        .unwrap();

        let source = FileDictionarySource::new(&fields, &codings);
        let fields = source.fetch_fields().await.unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].coding_id, Some(9));
        assert_eq!(fields[1].value_type, ValueType::Float);
        assert_eq!(fields[1].coding_id, None);
        assert_eq!(fields[1].instance_count, 4);

        let codings = source.fetch_codings().await.unwrap();
        assert_eq!(codings.len(), 3);
        assert_eq!(codings[2].value, "01");
    }

    #[tokio::test]
    async fn test_json_dictionaries() {
        let dir = tempdir().unwrap();
        let fields = dir.path().join("fields.json");
        let codings = dir.path().join("codings.json");
        std::fs::write(
            &fields,
            r#"[{"fieldId": 40, "valueType": "float", "instanceCount": 2, "arrayCount": 2}]"#,
        )
        .unwrap();
        std::fs::write(&codings, r#"[{"Coding": 5, "Value": 1, "Meaning": "Male"}]"#).unwrap();

        let source = FileDictionarySource::new(&fields, &codings);
        assert_eq!(source.fetch_fields().await.unwrap()[0].array_count, 2);
        assert_eq!(source.fetch_codings().await.unwrap()[0].value, "1");
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let dir = tempdir().unwrap();
        let source = FileDictionarySource::new(dir.path().join("none.json"), dir.path().join("none.csv"));
        let err = source.fetch_fields().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_ndjson_sink_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("records.ndjson");
        let sink = NdjsonSink::create(&path).await.unwrap();

        let a = CurationRecord::new("A", "j", "s", RecordLayout::FieldMajor);
        let b = CurationRecord::new("B", "j", "s", RecordLayout::FieldMajor);
        assert_eq!(sink.insert_many(&[a, b]).await.unwrap(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: CurationRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.subject_id, "A");
    }
}
