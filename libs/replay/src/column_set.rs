use std::sync::Arc;

use arrow::{
    array::{Array, ArrayRef, Float64Array, RecordBatch},
    datatypes::{DataType, Field, Schema},
};

use crate::Error;

/// Column-oriented query result. Column 0 is the relative time index, the
/// remaining columns are values. Every column holds the same number of rows.
#[derive(Clone, Debug)]
pub struct ColumnSet {
    batch: RecordBatch,
}

impl ColumnSet {
    pub fn try_new<S: AsRef<str>>(names: &[S], columns: Vec<Vec<f64>>) -> Result<Self, Error> {
        if names.is_empty() || names.len() != columns.len() {
            return Err(Error::ColumnCount {
                expected: names.len().max(1),
                actual: columns.len(),
            });
        }
        let fields: Vec<Field> = names
            .iter()
            .map(|name| Field::new(name.as_ref(), DataType::Float64, false))
            .collect();
        let arrays: Vec<ArrayRef> = columns
            .into_iter()
            .map(|column| Arc::new(Float64Array::from(column)) as ArrayRef)
            .collect();
        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;
        Ok(ColumnSet { batch })
    }

    /// Zero-row set with the given column names.
    pub fn empty<S: AsRef<str>>(names: &[S]) -> Result<Self, Error> {
        Self::try_new(names, names.iter().map(|_| Vec::new()).collect())
    }

    pub fn row_count(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn column_count(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.batch
            .schema_ref()
            .fields()
            .iter()
            .map(|field| field.name().as_str())
    }

    pub fn column(&self, index: usize) -> Option<&Float64Array> {
        self.batch
            .columns()
            .get(index)?
            .as_any()
            .downcast_ref::<Float64Array>()
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Float64Array> {
        self.batch
            .column_by_name(name)?
            .as_any()
            .downcast_ref::<Float64Array>()
    }

    pub fn time(&self) -> &Float64Array {
        self.column(0).expect("column set always has a time column")
    }

    pub fn value(&self, column: usize, row: usize) -> Result<f64, Error> {
        let array = self
            .column(column)
            .ok_or_else(|| Error::ColumnNotFound(format!("#{column}")))?;
        if row >= array.len() {
            return Err(Error::RowOutOfBounds {
                row,
                len: array.len(),
            });
        }
        Ok(array.value(row))
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }
}
