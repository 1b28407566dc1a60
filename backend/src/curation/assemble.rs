//! Folding one data row into a [`CurationRecord`].

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use super::coerce::ValueCoercer;
use crate::error::RowError;
use crate::models::{ColumnSpec, CuratedValue, CurationRecord, RecordLayout, Slot};

/// Builds one record per data row for a single job.
#[derive(Debug, Clone)]
pub struct RecordAssembler {
    layout: RecordLayout,
    job_id: String,
    study_id: String,
}

impl RecordAssembler {
    pub fn new(layout: RecordLayout, job_id: impl Into<String>, study_id: impl Into<String>) -> Self {
        Self {
            layout,
            job_id: job_id.into(),
            study_id: study_id.into(),
        }
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Build the record for data row `row_number` (1-based, header is row 1).
    ///
    /// `columns` are the resolved data columns; `cells[0]` is the subject id.
    pub fn assemble(
        &self,
        row_number: usize,
        cells: &[String],
        columns: &[ColumnSpec],
        coercer: &ValueCoercer,
    ) -> Result<CurationRecord, RowError> {
        let expected = columns.len() + 1;
        if cells.len() != expected {
            return Err(RowError::ColumnCount {
                row: row_number,
                expected,
                found: cells.len(),
            });
        }

        let mut record = CurationRecord::new(&cells[0], &self.job_id, &self.study_id, self.layout);
        for column in columns {
            let raw = &cells[column.position];
            if let Some(value) = coercer.coerce(column, raw, row_number)? {
                self.insert(&mut record, column, value, row_number)?;
            }
        }
        Ok(record)
    }

    /// Place `value` in its slot. A slot is written at most once.
    pub fn insert(
        &self,
        record: &mut CurationRecord,
        column: &ColumnSpec,
        value: CuratedValue,
        row_number: usize,
    ) -> Result<(), RowError> {
        let duplicate = || RowError::DuplicateValue {
            row: row_number,
            column: column.position,
            header: column.header.clone(),
        };

        let (outer, inner) = self.layout.keys(&column.descriptor);
        let slots = record.fields.entry(outer).or_default();

        if column.total_array_count == 1 {
            return match slots.entry(inner) {
                Entry::Vacant(e) => {
                    e.insert(Slot::Scalar(value));
                    Ok(())
                }
                Entry::Occupied(_) => Err(duplicate()),
            };
        }

        match slots.entry(inner).or_insert_with(|| Slot::Array(BTreeMap::new())) {
            Slot::Array(values) => match values.entry(column.descriptor.array_index) {
                Entry::Vacant(e) => {
                    e.insert(value);
                    Ok(())
                }
                Entry::Occupied(_) => Err(duplicate()),
            },
            Slot::Scalar(_) => Err(duplicate()),
        }
    }
}
