//! Header row resolution.
//!
//! Every header cell after the subject identifier must be a
//! `<fieldId>-<instance>.<arrayIndex>` descriptor naming a dictionary field
//! within its declared bounds. All columns are resolved even after a failure
//! so the job reports every bad column at once.

use crate::dictionary::DictionarySnapshot;
use crate::error::{HeaderError, InvalidHeaders};
use crate::models::{ColumnSpec, FieldDescriptor, ResolvedColumn};

/// Outcome of resolving one header row.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedHeader {
    /// Text of column 0.
    pub subject_header: String,
    /// One entry per data column, in column order (column 0 excluded).
    pub columns: Vec<ResolvedColumn>,
}

impl ResolvedHeader {
    /// Number of columns in the header row, identifier column included.
    pub fn width(&self) -> usize {
        self.columns.len() + 1
    }

    pub fn errors(&self) -> Vec<HeaderError> {
        self.columns
            .iter()
            .filter_map(|c| match c {
                ResolvedColumn::Invalid(err) => Some(err.clone()),
                ResolvedColumn::Resolved(_) => None,
            })
            .collect()
    }

    pub fn is_valid(&self) -> bool {
        !self.columns.is_empty() && self.columns.iter().all(|c| !c.is_invalid())
    }

    /// Column specs of a fully valid header, or every reason it is not.
    pub fn into_specs(self) -> Result<Vec<ColumnSpec>, InvalidHeaders> {
        if self.columns.is_empty() {
            return Err(InvalidHeaders::NoFieldColumns);
        }
        let errors = self.errors();
        if !errors.is_empty() {
            return Err(InvalidHeaders::Columns(errors));
        }
        Ok(self
            .columns
            .into_iter()
            .filter_map(|c| match c {
                ResolvedColumn::Resolved(spec) => Some(spec),
                ResolvedColumn::Invalid(_) => None,
            })
            .collect())
    }
}

/// Maps header cells to dictionary metadata.
#[derive(Debug, Clone)]
pub struct HeaderResolver {
    dictionaries: DictionarySnapshot,
}

impl HeaderResolver {
    pub fn new(dictionaries: DictionarySnapshot) -> Self {
        Self { dictionaries }
    }

    /// Resolve a whole header row.
    pub fn resolve(&self, header: &[String]) -> Result<ResolvedHeader, InvalidHeaders> {
        let (subject, rest) = header.split_first().ok_or(InvalidHeaders::Empty)?;
        let columns = rest
            .iter()
            .enumerate()
            .map(|(i, cell)| self.resolve_cell(i + 1, cell))
            .collect();

        Ok(ResolvedHeader {
            subject_header: subject.trim_start_matches('\u{feff}').to_string(),
            columns,
        })
    }

    /// Resolve the cell at `position` (zero-based, never 0).
    pub fn resolve_cell(&self, position: usize, cell: &str) -> ResolvedColumn {
        match self.try_resolve(position, cell) {
            Ok(spec) => ResolvedColumn::Resolved(spec),
            Err(err) => ResolvedColumn::Invalid(err),
        }
    }

    fn try_resolve(&self, position: usize, cell: &str) -> Result<ColumnSpec, HeaderError> {
        let header = cell.to_string();
        let descriptor: FieldDescriptor = cell
            .trim_matches(|c: char| c.is_ascii_whitespace())
            .parse()
            .map_err(|_| HeaderError::Malformed {
                position,
                header: header.clone(),
            })?;

        let field_id = descriptor.field_id;
        let entry = self
            .dictionaries
            .get(field_id)
            .ok_or_else(|| HeaderError::UnknownField {
                position,
                header: header.clone(),
                field_id,
            })?;

        if descriptor.instance > entry.instance_count {
            return Err(HeaderError::InstanceOutOfBounds {
                position,
                header,
                field_id,
                instance: descriptor.instance,
                max: entry.instance_count,
            });
        }
        if descriptor.array_index > entry.array_count {
            return Err(HeaderError::ArrayOutOfBounds {
                position,
                header,
                field_id,
                array_index: descriptor.array_index,
                max: entry.array_count,
            });
        }

        let coding = entry.coding_id.and_then(|id| {
            let table = self.dictionaries.get_coding(id);
            if table.is_none() {
                tracing::warn!(field_id, coding_id = id, "Field references a coding that is not loaded");
            }
            table
        });

        Ok(ColumnSpec {
            position,
            header,
            descriptor,
            value_type: entry.value_type,
            coding,
            total_array_count: entry.array_count,
        })
    }
}
