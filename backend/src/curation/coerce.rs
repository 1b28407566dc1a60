//! Cell value coercion.

use crate::error::RowError;
use crate::models::{ColumnSpec, CuratedValue, ValueType};

/// Converts raw cells to [`CuratedValue`]s.
#[derive(Debug, Clone, Default)]
pub struct ValueCoercer {
    null_markers: Vec<String>,
}

impl ValueCoercer {
    /// `null_markers` are cell values treated like an empty cell.
    pub fn new(null_markers: Vec<String>) -> Self {
        Self { null_markers }
    }

    fn is_null(&self, raw: &str) -> bool {
        raw.is_empty() || self.null_markers.iter().any(|m| m == raw)
    }

    /// Coerce one cell of `column`. `row` is only used for diagnostics.
    ///
    /// Order of precedence: null markers, coding lookup, numeric parse for
    /// integer and float columns, raw text otherwise.
    pub fn coerce(
        &self,
        column: &ColumnSpec,
        raw: &str,
        row: usize,
    ) -> Result<Option<CuratedValue>, RowError> {
        if self.is_null(raw) {
            return Ok(None);
        }

        if let Some(meaning) = column.coding.as_ref().and_then(|c| c.get(raw)) {
            return Ok(Some(CuratedValue::Text(meaning.clone())));
        }

        let value = match column.value_type {
            ValueType::Integer => parse_integer(raw),
            ValueType::Float => parse_float(raw).map(CuratedValue::Float),
            _ => return Ok(Some(CuratedValue::Text(raw.to_string()))),
        };

        value.map(Some).ok_or_else(|| RowError::NotNumeric {
            row,
            column: column.position,
            header: column.header.clone(),
            value: raw.to_string(),
        })
    }
}

fn parse_integer(raw: &str) -> Option<CuratedValue> {
    match raw.parse::<i64>() {
        Ok(i) => Some(CuratedValue::Integer(i)),
        Err(_) => parse_float(raw).map(CuratedValue::Float),
    }
}

/// Plain decimal numbers only. Rust's float grammar also accepts `inf` and
/// `NaN`, which are not numbers here.
fn parse_float(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|f| f.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CodingTable, FieldDescriptor};
    use std::sync::Arc;

    fn column(value_type: ValueType, coding: Option<&[(&str, &str)]>) -> ColumnSpec {
        ColumnSpec {
            position: 1,
            header: "40-1.0".into(),
            descriptor: FieldDescriptor::new(40, 1, 0),
            value_type,
            coding: coding.map(|pairs| {
                Arc::new(
                    pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<CodingTable>(),
                )
            }),
            total_array_count: 2,
        }
    }

    #[test]
    fn test_empty_and_null_markers() {
        let coercer = ValueCoercer::new(vec!["NA".into()]);
        let col = column(ValueType::Float, None);
        assert_eq!(coercer.coerce(&col, "", 2).unwrap(), None);
        assert_eq!(coercer.coerce(&col, "NA", 2).unwrap(), None);
        assert!(ValueCoercer::default().coerce(&col, "NA", 2).is_err());
    }

    #[test]
    fn test_coding_takes_precedence() {
        let coercer = ValueCoercer::default();
        let col = column(ValueType::Integer, Some(&[("-1", "Do not know"), ("1", "Yes")]));
        assert_eq!(
            coercer.coerce(&col, "-1", 2).unwrap(),
            Some(CuratedValue::Text("Do not know".into()))
        );
        // not in the table: falls back to the numeric path
        assert_eq!(coercer.coerce(&col, "7", 2).unwrap(), Some(CuratedValue::Integer(7)));
    }

    #[test]
    fn test_numeric_parsing() {
        let coercer = ValueCoercer::default();
        let int = column(ValueType::Integer, None);
        let float = column(ValueType::Float, None);
        assert_eq!(coercer.coerce(&int, "-12", 2).unwrap(), Some(CuratedValue::Integer(-12)));
        assert_eq!(coercer.coerce(&int, "+3", 2).unwrap(), Some(CuratedValue::Integer(3)));
        assert_eq!(coercer.coerce(&int, "2.5", 2).unwrap(), Some(CuratedValue::Float(2.5)));
        assert_eq!(coercer.coerce(&float, "3.5", 2).unwrap(), Some(CuratedValue::Float(3.5)));
        assert_eq!(coercer.coerce(&float, "-.5", 2).unwrap(), Some(CuratedValue::Float(-0.5)));
        assert_eq!(coercer.coerce(&float, "4", 2).unwrap(), Some(CuratedValue::Float(4.0)));
    }

    #[test]
    fn test_non_numeric_is_row_error() {
        let coercer = ValueCoercer::default();
        let col = column(ValueType::Float, None);
        for bad in ["abc", "1,000", "inf", "NaN", " 3"] {
            let err = coercer.coerce(&col, bad, 7).unwrap_err();
            assert_eq!(
                err,
                RowError::NotNumeric {
                    row: 7,
                    column: 1,
                    header: "40-1.0".into(),
                    value: bad.into(),
                }
            );
        }
    }

    #[test]
    fn test_other_types_keep_raw_text() {
        let coercer = ValueCoercer::default();
        let col = column(ValueType::Date, None);
        assert_eq!(
            coercer.coerce(&col, "2009-01-12", 2).unwrap(),
            Some(CuratedValue::Text("2009-01-12".into()))
        );
        let col = column(ValueType::CategoricalMultiple, Some(&[("1", "Yes")]));
        assert_eq!(coercer.coerce(&col, "9", 2).unwrap(), Some(CuratedValue::Text("9".into())));
    }
}
