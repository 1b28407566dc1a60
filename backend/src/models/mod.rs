//! Domain models for the curation pipeline.
//!
//! This module contains the core data structures used throughout the pipeline:
//!
//! - [`FieldDescriptor`] - `<fieldId>-<instance>.<arrayIndex>` header cell
//! - [`ValueType`] - UK Biobank value types (showcase names and codes)
//! - [`FieldDictionaryEntry`] / [`CodingEntry`] - dictionary documents
//! - [`ResolvedColumn`] - per-column header resolution result
//! - [`CuratedValue`] / [`Slot`] / [`CurationRecord`] - curated output
//! - [`CurationJob`] / [`JobStatus`] - external job tracking record

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::HeaderError;

/// Study identifier used when none is configured.
pub const DEFAULT_STUDY_ID: &str = "UKBIOBANK";

// =============================================================================
// Field Descriptor
// =============================================================================

static DESCRIPTOR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)-(\d+)\.(\d+)$").expect("descriptor pattern is valid"));

/// A parsed header cell such as `40-1.2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub field_id: u32,
    pub instance: u32,
    pub array_index: u32,
}

impl FieldDescriptor {
    pub fn new(field_id: u32, instance: u32, array_index: u32) -> Self {
        Self { field_id, instance, array_index }
    }
}

impl fmt::Display for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}.{}", self.field_id, self.instance, self.array_index)
    }
}

impl FromStr for FieldDescriptor {
    type Err = ();

    /// Parses `<fieldId>-<instance>.<arrayIndex>`. Any other shape, including
    /// components that overflow `u32`, is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = DESCRIPTOR_PATTERN.captures(s).ok_or(())?;
        let part = |i: usize| caps[i].parse::<u32>().map_err(|_| ());
        Ok(Self::new(part(1)?, part(2)?, part(3)?))
    }
}

// =============================================================================
// Value Type
// =============================================================================

/// Value type of a UK Biobank field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawValueType")]
pub enum ValueType {
    Integer,
    Float,
    Text,
    Date,
    Time,
    CategoricalSingle,
    CategoricalMultiple,
    Compound,
}

impl ValueType {
    /// Whether cells of this type must parse as numbers when not decoded by a coding.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Map a UK Biobank showcase value-type code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            11 => Some(Self::Integer),
            21 => Some(Self::CategoricalSingle),
            22 => Some(Self::CategoricalMultiple),
            31 => Some(Self::Float),
            41 => Some(Self::Text),
            51 => Some(Self::Date),
            61 => Some(Self::Time),
            101 => Some(Self::Compound),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Text => "text",
            Self::Date => "date",
            Self::Time => "time",
            Self::CategoricalSingle => "categoricalSingle",
            Self::CategoricalMultiple => "categoricalMultiple",
            Self::Compound => "compound",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(code) = trimmed.parse::<u32>() {
            return Self::from_code(code).ok_or_else(|| format!("unknown value type code: {}", code));
        }
        let normalized: String = trimmed
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "integer" => Ok(Self::Integer),
            "float" | "continuous" => Ok(Self::Float),
            "text" => Ok(Self::Text),
            "date" => Ok(Self::Date),
            "time" => Ok(Self::Time),
            "categoricalsingle" => Ok(Self::CategoricalSingle),
            "categoricalmultiple" => Ok(Self::CategoricalMultiple),
            "compound" => Ok(Self::Compound),
            _ => Err(format!("unknown value type: {}", s)),
        }
    }
}

/// Value types arrive either as showcase codes or as names.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawValueType {
    Code(u32),
    Name(String),
}

impl TryFrom<RawValueType> for ValueType {
    type Error = String;

    fn try_from(raw: RawValueType) -> Result<Self, Self::Error> {
        match raw {
            RawValueType::Code(code) => {
                Self::from_code(code).ok_or_else(|| format!("unknown value type code: {}", code))
            }
            RawValueType::Name(name) => name.parse(),
        }
    }
}

// =============================================================================
// Dictionary Documents
// =============================================================================

/// One field of the field dictionary.
///
/// Accepts both camelCase keys and the UK Biobank showcase column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDictionaryEntry {
    #[serde(alias = "FieldID")]
    pub field_id: u32,
    #[serde(alias = "ValueType")]
    pub value_type: ValueType,
    #[serde(alias = "Instances")]
    pub instance_count: u32,
    #[serde(alias = "Array")]
    pub array_count: u32,
    #[serde(default, alias = "Coding", skip_serializing_if = "Option::is_none")]
    pub coding_id: Option<u32>,
    #[serde(default, alias = "Field", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One `(coding, raw value) -> meaning` row of a coding table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodingEntry {
    #[serde(alias = "Coding")]
    pub coding_id: u32,
    #[serde(alias = "Value", deserialize_with = "string_or_number")]
    pub value: String,
    #[serde(alias = "Meaning")]
    pub meaning: String,
}

/// Raw value to meaning lookup for a single coding.
pub type CodingTable = HashMap<String, String>;

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(i) => i.to_string(),
        Raw::Float(f) => f.to_string(),
    })
}

// =============================================================================
// Resolved Header
// =============================================================================

/// Header metadata for one resolvable data column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    /// Zero-based position of the column in the CSV row.
    pub position: usize,
    /// Header text as it appeared in the file.
    pub header: String,
    pub descriptor: FieldDescriptor,
    pub value_type: ValueType,
    pub coding: Option<Arc<CodingTable>>,
    /// Array count declared by the dictionary for this field.
    pub total_array_count: u32,
}

/// Result of resolving one header cell.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedColumn {
    Invalid(HeaderError),
    Resolved(ColumnSpec),
}

impl ResolvedColumn {
    pub fn as_resolved(&self) -> Option<&ColumnSpec> {
        match self {
            Self::Resolved(spec) => Some(spec),
            Self::Invalid(_) => None,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }

    pub fn header(&self) -> &str {
        match self {
            Self::Resolved(spec) => &spec.header,
            Self::Invalid(err) => err.header(),
        }
    }
}

// =============================================================================
// Curated Output
// =============================================================================

/// A coerced cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CuratedValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for CuratedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Storage slot for one `(field, instance)` pair.
///
/// Fields declaring a single array element are stored as a bare scalar;
/// all others are keyed by array index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Slot {
    Scalar(CuratedValue),
    Array(BTreeMap<u32, CuratedValue>),
}

/// Nesting order of curated values inside a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordLayout {
    /// `fields[fieldId][instance][arrayIndex]`
    #[default]
    FieldMajor,
    /// `fields[instance][fieldId][arrayIndex]`
    InstanceMajor,
}

impl RecordLayout {
    /// Outer and inner map keys for a descriptor under this layout.
    pub fn keys(&self, descriptor: &FieldDescriptor) -> (u32, u32) {
        match self {
            Self::FieldMajor => (descriptor.field_id, descriptor.instance),
            Self::InstanceMajor => (descriptor.instance, descriptor.field_id),
        }
    }
}

impl fmt::Display for RecordLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FieldMajor => "field-major",
            Self::InstanceMajor => "instance-major",
        })
    }
}

impl FromStr for RecordLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "field-major" | "field" => Ok(Self::FieldMajor),
            "instance-major" | "instance" => Ok(Self::InstanceMajor),
            other => Err(format!("unknown record layout: {}", other)),
        }
    }
}

/// One curated document per data row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurationRecord {
    pub subject_id: String,
    pub job_id: String,
    pub study_id: String,
    pub layout: RecordLayout,
    /// Outer key is the field id under [`RecordLayout::FieldMajor`] and the
    /// instance under [`RecordLayout::InstanceMajor`].
    pub fields: BTreeMap<u32, BTreeMap<u32, Slot>>,
}

impl CurationRecord {
    pub fn new(
        subject_id: impl Into<String>,
        job_id: impl Into<String>,
        study_id: impl Into<String>,
        layout: RecordLayout,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            job_id: job_id.into(),
            study_id: study_id.into(),
            layout,
            fields: BTreeMap::new(),
        }
    }

    /// Look up the slot for a descriptor regardless of layout.
    pub fn slot(&self, field_id: u32, instance: u32) -> Option<&Slot> {
        let (outer, inner) = self.layout.keys(&FieldDescriptor::new(field_id, instance, 0));
        self.fields.get(&outer).and_then(|m| m.get(&inner))
    }

    /// Look up a single value regardless of layout and slot shape.
    pub fn value(&self, descriptor: &FieldDescriptor) -> Option<&CuratedValue> {
        match self.slot(descriptor.field_id, descriptor.instance)? {
            Slot::Scalar(v) => Some(v),
            Slot::Array(values) => values.get(&descriptor.array_index),
        }
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// Lifecycle status of a curation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Finished,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Job tracking record, owned by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurationJob {
    pub id: String,
    pub study_id: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub received_files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CurationJob {
    /// Create a queued job with a fresh id.
    pub fn new(study_id: impl Into<String>, received_files: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            study_id: study_id.into(),
            status: JobStatus::Queued,
            error: None,
            received_files,
            created_at: now,
            updated_at: now,
        }
    }
}
