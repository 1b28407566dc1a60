//! Field and coding dictionaries.
//!
//! Both dictionaries are loaded from a [`DictionarySource`] and then shared
//! read-only between curation runs. A reload builds both tables off to the
//! side and swaps the pair in one step, so readers never observe a
//! half-loaded table or new fields next to old codings. Runs take a
//! [`DictionarySnapshot`] up front and keep using it even if the
//! dictionaries are reloaded mid-run.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{DictionaryError, DictionaryResult};
use crate::models::{CodingEntry, CodingTable, FieldDictionaryEntry};
use crate::store::DictionarySource;

/// Field id to field metadata.
#[derive(Debug, Clone, Default)]
pub struct FieldDictionary {
    table: HashMap<u32, FieldDictionaryEntry>,
}

impl FieldDictionary {
    /// Validate `entries` and index them by field id.
    pub fn from_entries(entries: Vec<FieldDictionaryEntry>) -> DictionaryResult<Self> {
        let mut table = HashMap::with_capacity(entries.len());
        for entry in entries {
            if entry.instance_count == 0 || entry.array_count == 0 {
                return Err(DictionaryError::InvalidEntry {
                    field_id: entry.field_id,
                    message: format!(
                        "instance count ({}) and array count ({}) must be at least 1",
                        entry.instance_count, entry.array_count
                    ),
                });
            }
            if let Some(previous) = table.insert(entry.field_id, entry) {
                tracing::warn!(field_id = previous.field_id, "Duplicate field dictionary entry, keeping the last one");
            }
        }
        Ok(Self { table })
    }

    /// Fetch every field document.
    pub async fn load(source: &dyn DictionarySource) -> DictionaryResult<Self> {
        Self::from_entries(source.fetch_fields().await?)
    }

    pub fn get(&self, field_id: u32) -> Option<&FieldDictionaryEntry> {
        self.table.get(&field_id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Coding id to raw value to meaning.
#[derive(Debug, Clone, Default)]
pub struct CodingDictionary {
    tables: HashMap<u32, Arc<CodingTable>>,
}

impl CodingDictionary {
    /// Group rows by coding id.
    pub fn from_entries(entries: Vec<CodingEntry>) -> Self {
        let mut grouped: HashMap<u32, CodingTable> = HashMap::new();
        for entry in entries {
            grouped
                .entry(entry.coding_id)
                .or_default()
                .insert(entry.value, entry.meaning);
        }
        Self {
            tables: grouped.into_iter().map(|(id, t)| (id, Arc::new(t))).collect(),
        }
    }

    /// Fetch every coding row.
    pub async fn load(source: &dyn DictionarySource) -> DictionaryResult<Self> {
        Ok(Self::from_entries(source.fetch_codings().await?))
    }

    pub fn get_coding(&self, coding_id: u32) -> Option<Arc<CodingTable>> {
        self.tables.get(&coding_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Both dictionaries, loaded and swapped together.
#[derive(Debug, Default)]
pub struct Dictionaries {
    current: RwLock<Option<DictionarySnapshot>>,
}

impl Dictionaries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build loaded dictionaries from in-memory documents.
    pub fn from_entries(
        fields: Vec<FieldDictionaryEntry>,
        codings: Vec<CodingEntry>,
    ) -> DictionaryResult<Self> {
        let dicts = Self::new();
        dicts.replace(
            FieldDictionary::from_entries(fields)?,
            CodingDictionary::from_entries(codings),
        );
        Ok(dicts)
    }

    /// Load both dictionaries. Nothing is replaced unless both fetches succeed.
    pub async fn load(&self, source: &dyn DictionarySource) -> DictionaryResult<(usize, usize)> {
        let fields = FieldDictionary::load(source).await?;
        let codings = CodingDictionary::load(source).await?;
        Ok(self.replace(fields, codings))
    }

    /// Swap in a new pair of tables. Returns their sizes.
    pub fn replace(&self, fields: FieldDictionary, codings: CodingDictionary) -> (usize, usize) {
        let sizes = (fields.len(), codings.len());
        let snapshot = DictionarySnapshot {
            fields: Arc::new(fields),
            codings: Arc::new(codings),
        };
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        tracing::info!(fields = sizes.0, codings = sizes.1, "Dictionaries loaded");
        sizes
    }

    pub fn is_loaded(&self) -> bool {
        self.current.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Number of fields and codings, zero when unloaded.
    pub fn sizes(&self) -> (usize, usize) {
        self.snapshot()
            .map_or((0, 0), |s| (s.fields.len(), s.codings.len()))
    }

    /// Consistent view of both dictionaries for one curation run.
    pub fn snapshot(&self) -> DictionaryResult<DictionarySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DictionaryError::NotLoaded)
    }
}

/// Immutable dictionary view held by a single run.
#[derive(Debug, Clone)]
pub struct DictionarySnapshot {
    fields: Arc<FieldDictionary>,
    codings: Arc<CodingDictionary>,
}

impl DictionarySnapshot {
    pub fn get(&self, field_id: u32) -> Option<&FieldDictionaryEntry> {
        self.fields.get(field_id)
    }

    pub fn get_coding(&self, coding_id: u32) -> Option<Arc<CodingTable>> {
        self.codings.get_coding(coding_id)
    }

    pub fn fields(&self) -> &FieldDictionary {
        &self.fields
    }

    pub fn codings(&self) -> &CodingDictionary {
        &self.codings
    }
}
