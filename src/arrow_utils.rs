use std::sync::Arc;

use deltalake::arrow::array::{Array, ArrayRef, AsArray, Float64Array, StringArray};
use deltalake::arrow::compute::cast;
use deltalake::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use deltalake::arrow::error::ArrowError;
use deltalake::arrow::record_batch::RecordBatch;

use crate::types::{
    MeasurementRow, PRICE_COLUMN, SOURCE_FILE_COLUMN, SUBJECT_COLUMN, TIMESTAMP_COLUMN,
};

pub const BRONZE_CREATED_AT_COLUMN: &str = "bronze_created_at";
pub const BRONZE_CREATED_BY_COLUMN: &str = "bronze_created_by";

pub struct StagingColumns {
    pub timestamp: StringArray,
    pub price: Float64Array,
    pub subject_id: StringArray,
    pub source_file: Option<StringArray>,
}

pub fn get_array<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, ArrowError> {
    let idx = batch.schema().index_of(name)?;
    let array = batch.column(idx);
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ArrowError::SchemaError(format!("column {} has unexpected type", name)))
}

pub fn column_as(batch: &RecordBatch, name: &str, data_type: &DataType) -> Result<ArrayRef, ArrowError> {
    let idx = batch.schema().index_of(name)?;
    let array = batch.column(idx);
    if array.data_type() == data_type {
        return Ok(array.clone());
    }
    cast(array, data_type)
}

fn utf8_column(batch: &RecordBatch, name: &str) -> Result<StringArray, ArrowError> {
    Ok(column_as(batch, name, &DataType::Utf8)?.as_string::<i32>().clone())
}

/// Unparseable text prices become nulls rather than failing the batch.
pub fn price_as_f64(array: &ArrayRef) -> Result<Float64Array, ArrowError> {
    let casted = if array.data_type() == &DataType::Float64 {
        array.clone()
    } else {
        cast(array, &DataType::Float64)?
    };
    casted
        .as_any()
        .downcast_ref::<Float64Array>()
        .cloned()
        .ok_or_else(|| ArrowError::CastError("price did not cast to Float64".to_string()))
}

pub fn staging_columns(batch: &RecordBatch) -> Result<StagingColumns, ArrowError> {
    let price_idx = batch.schema().index_of(PRICE_COLUMN)?;
    let source_file = match batch.schema().index_of(SOURCE_FILE_COLUMN) {
        Ok(_) => Some(utf8_column(batch, SOURCE_FILE_COLUMN)?),
        Err(_) => None,
    };
    Ok(StagingColumns {
        timestamp: utf8_column(batch, TIMESTAMP_COLUMN)?,
        price: price_as_f64(batch.column(price_idx))?,
        subject_id: utf8_column(batch, SUBJECT_COLUMN)?,
        source_file,
    })
}

fn opt_string(array: &StringArray, row: usize) -> Option<String> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row).to_string())
    }
}

pub fn row_from_columns(cols: &StagingColumns, row: usize, fallback_source: &str) -> MeasurementRow {
    let source_file = cols
        .source_file
        .as_ref()
        .and_then(|array| opt_string(array, row))
        .unwrap_or_else(|| fallback_source.to_string());
    MeasurementRow {
        timestamp: opt_string(&cols.timestamp, row),
        price: if cols.price.is_null(row) {
            None
        } else {
            Some(cols.price.value(row))
        },
        subject_id: opt_string(&cols.subject_id, row),
        source_file,
    }
}

pub fn rows_from_batch(batch: &RecordBatch, fallback_source: &str) -> Result<Vec<MeasurementRow>, ArrowError> {
    let cols = staging_columns(batch)?;
    Ok((0..batch.num_rows())
        .map(|row| row_from_columns(&cols, row, fallback_source))
        .collect())
}

/// Schema of a bronze file derived from the raw CSV schema: `price` becomes
/// Float64, every other raw column is kept, and provenance columns are
/// appended.
pub fn bronze_schema(raw: &Schema) -> SchemaRef {
    let mut fields: Vec<Field> = raw
        .fields()
        .iter()
        .filter(|field| {
            field.name() != SOURCE_FILE_COLUMN
                && field.name() != BRONZE_CREATED_AT_COLUMN
                && field.name() != BRONZE_CREATED_BY_COLUMN
        })
        .map(|field| {
            if field.name() == PRICE_COLUMN {
                Field::new(PRICE_COLUMN, DataType::Float64, true)
            } else {
                Field::new(field.name(), field.data_type().clone(), true)
            }
        })
        .collect();
    fields.push(Field::new(SOURCE_FILE_COLUMN, DataType::Utf8, false));
    fields.push(Field::new(BRONZE_CREATED_AT_COLUMN, DataType::Utf8, false));
    fields.push(Field::new(BRONZE_CREATED_BY_COLUMN, DataType::Utf8, false));
    Arc::new(Schema::new(fields))
}

pub fn build_bronze_batch(
    raw: &RecordBatch,
    schema: &SchemaRef,
    source_file: &str,
    created_at: &str,
    created_by: &str,
) -> Result<RecordBatch, ArrowError> {
    let rows = raw.num_rows();
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let array: ArrayRef = match field.name().as_str() {
            SOURCE_FILE_COLUMN => Arc::new(StringArray::from(vec![source_file; rows])),
            BRONZE_CREATED_AT_COLUMN => Arc::new(StringArray::from(vec![created_at; rows])),
            BRONZE_CREATED_BY_COLUMN => Arc::new(StringArray::from(vec![created_by; rows])),
            PRICE_COLUMN => {
                let idx = raw.schema().index_of(PRICE_COLUMN)?;
                Arc::new(price_as_f64(raw.column(idx))?)
            }
            name => column_as(raw, name, field.data_type())?,
        };
        arrays.push(array);
    }
    RecordBatch::try_new(schema.clone(), arrays)
}
