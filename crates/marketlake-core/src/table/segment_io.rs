//! Arrow/Parquet encoding of row segments.
//!
//! Rows map onto Arrow columns by the table's declared schema:
//! `date` → `Date32`, `timestamp` → `Timestamp(Millisecond)`, `utf8` →
//! `Utf8`, `int64` → `Int64`, `float64` → `Float64`. Every column is
//! nullable; key columns are checked before rows ever get here.

use std::{path::Path, sync::Arc};

use arrow::{
    array::{
        Array, ArrayRef, Date32Array, Date32Builder, Float64Array, Float64Builder, Int64Array,
        Int64Builder, RecordBatch, StringArray, StringBuilder, TimestampMillisecondArray,
        TimestampMillisecondBuilder,
    },
    datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit},
};
use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDate};
use parquet::{arrow::ArrowWriter, arrow::arrow_reader::ParquetRecordBatchReaderBuilder};
use parquet::file::properties::WriterProperties;
use snafu::prelude::*;

use crate::{
    dataset::{ColumnSpec, ColumnType},
    row::{Row, Value},
    storage::{self, TableLocation},
    table::error::{
        ArrowSnafu, CorruptSegmentSnafu, ParquetReadSnafu, ParquetWriteSnafu, StorageSnafu,
        TableError,
    },
    transaction_log::{SegmentId, SegmentMeta},
};

fn epoch_day() -> NaiveDate {
    DateTime::UNIX_EPOCH.date_naive()
}

fn data_type(ty: ColumnType) -> DataType {
    match ty {
        ColumnType::Date => DataType::Date32,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Millisecond, None),
        ColumnType::Utf8 => DataType::Utf8,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
    }
}

/// Arrow schema for a declared column list.
pub(crate) fn arrow_schema(columns: &[ColumnSpec]) -> SchemaRef {
    Arc::new(Schema::new(
        columns
            .iter()
            .map(|c| Field::new(&c.name, data_type(c.column_type), true))
            .collect::<Vec<_>>(),
    ))
}

/// Build one record batch from rows.
pub(crate) fn rows_to_batch(
    columns: &[ColumnSpec],
    rows: &[Row],
) -> Result<RecordBatch, TableError> {
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .map(|spec| column_array(spec, rows))
        .collect();
    RecordBatch::try_new(arrow_schema(columns), arrays).context(ArrowSnafu)
}

fn column_array(spec: &ColumnSpec, rows: &[Row]) -> ArrayRef {
    let name = spec.name.as_str();
    match spec.column_type {
        ColumnType::Date => {
            let mut b = Date32Builder::with_capacity(rows.len());
            for row in rows {
                match row.value(name) {
                    Value::Date(d) => b.append_value((*d - epoch_day()).num_days() as i32),
                    Value::Timestamp(ts) => {
                        b.append_value((ts.date() - epoch_day()).num_days() as i32)
                    }
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        ColumnType::Timestamp => {
            let mut b = TimestampMillisecondBuilder::with_capacity(rows.len());
            for row in rows {
                match row.value(name).as_datetime() {
                    Some(ts) => b.append_value(ts.and_utc().timestamp_millis()),
                    None => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        ColumnType::Utf8 => {
            let mut b = StringBuilder::with_capacity(rows.len(), rows.len() * 8);
            for row in rows {
                match row.value(name) {
                    Value::Null => b.append_null(),
                    Value::Str(s) => b.append_value(s),
                    other => b.append_value(other.to_string()),
                }
            }
            Arc::new(b.finish())
        }
        ColumnType::Int64 => {
            let mut b = Int64Builder::with_capacity(rows.len());
            for row in rows {
                match row.value(name) {
                    Value::Int(i) => b.append_value(*i),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        ColumnType::Float64 => {
            let mut b = Float64Builder::with_capacity(rows.len());
            for row in rows {
                match row.value(name) {
                    Value::Float(f) => b.append_value(*f),
                    Value::Int(i) => b.append_value(*i as f64),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
    }
}

macro_rules! downcast_column {
    ($col:expr, $arr:ty, $path:expr, $name:expr) => {
        $col.as_any()
            .downcast_ref::<$arr>()
            .context(CorruptSegmentSnafu {
                path: $path,
                column: $name,
                found: $col.data_type().to_string(),
            })?
    };
}

/// Decode a record batch back into rows. Columns absent from the file read
/// as nulls.
pub(crate) fn batch_to_rows(
    columns: &[ColumnSpec],
    batch: &RecordBatch,
    path: &str,
) -> Result<Vec<Row>, TableError> {
    let mut rows = vec![Row::new(); batch.num_rows()];
    let schema = batch.schema();

    for spec in columns {
        let name = spec.name.as_str();
        let Ok(idx) = schema.index_of(name) else {
            for row in rows.iter_mut() {
                row.insert(name, Value::Null);
            }
            continue;
        };
        let col = batch.column(idx);

        match spec.column_type {
            ColumnType::Date => {
                let arr = downcast_column!(col, Date32Array, path, name);
                fill(&mut rows, name, arr, |i| {
                    Value::Date(epoch_day() + Duration::days(i64::from(arr.value(i))))
                });
            }
            ColumnType::Timestamp => {
                let arr = downcast_column!(col, TimestampMillisecondArray, path, name);
                fill(&mut rows, name, arr, |i| {
                    DateTime::from_timestamp_millis(arr.value(i))
                        .map(|dt| Value::Timestamp(dt.naive_utc()))
                        .unwrap_or(Value::Null)
                });
            }
            ColumnType::Utf8 => {
                let arr = downcast_column!(col, StringArray, path, name);
                fill(&mut rows, name, arr, |i| Value::Str(arr.value(i).to_string()));
            }
            ColumnType::Int64 => {
                let arr = downcast_column!(col, Int64Array, path, name);
                fill(&mut rows, name, arr, |i| Value::Int(arr.value(i)));
            }
            ColumnType::Float64 => {
                let arr = downcast_column!(col, Float64Array, path, name);
                fill(&mut rows, name, arr, |i| Value::Float(arr.value(i)));
            }
        }
    }

    Ok(rows)
}

fn fill(rows: &mut [Row], name: &str, arr: &dyn Array, value_at: impl Fn(usize) -> Value) {
    for (i, row) in rows.iter_mut().enumerate() {
        let value = if arr.is_valid(i) { value_at(i) } else { Value::Null };
        row.insert(name, value);
    }
}

/// Encode `rows` as a new Parquet segment file and describe it.
///
/// `rows` must be non-empty and carry a time key under `time_column`.
pub(crate) async fn write_segment(
    location: &TableLocation,
    segment_id: SegmentId,
    columns: &[ColumnSpec],
    time_column: &str,
    rows: &[Row],
    entities: Option<Vec<String>>,
) -> Result<SegmentMeta, TableError> {
    let path = segment_id.data_path();
    let batch = rows_to_batch(columns, rows)?;

    let mut buf = Vec::new();
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))
        .context(ParquetWriteSnafu { path: path.clone() })?;
    writer
        .write(&batch)
        .context(ParquetWriteSnafu { path: path.clone() })?;
    writer
        .close()
        .context(ParquetWriteSnafu { path: path.clone() })?;

    storage::write_new(location, Path::new(&path), &buf)
        .await
        .context(StorageSnafu)?;

    let mut times = rows.iter().filter_map(|r| r.time_key(time_column));
    let first = times.next().unwrap_or_default();
    let (ts_min, ts_max) = times.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t)));

    Ok(SegmentMeta {
        segment_id,
        path,
        ts_min,
        ts_max,
        row_count: rows.len() as u64,
        entities,
    })
}

/// Read every row of a segment.
pub(crate) async fn read_segment(
    location: &TableLocation,
    segment: &SegmentMeta,
    columns: &[ColumnSpec],
) -> Result<Vec<Row>, TableError> {
    let bytes = storage::read_all_bytes(location, Path::new(&segment.path))
        .await
        .context(StorageSnafu)?;

    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
        .context(ParquetReadSnafu {
            path: segment.path.clone(),
        })?
        .build()
        .context(ParquetReadSnafu {
            path: segment.path.clone(),
        })?;

    let mut rows = Vec::with_capacity(segment.row_count as usize);
    for batch in reader {
        let batch = batch.context(ArrowSnafu)?;
        rows.extend(batch_to_rows(columns, &batch, &segment.path)?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_util::{daily_quotes, date};
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn segment_preserves_values_and_nulls() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let ds = daily_quotes();

        let rows = vec![
            Row::new()
                .with("date", date(2020, 1, 3))
                .with("code", "000001")
                .with("name", "Ping An")
                .with("close", 12.5)
                .with("volume", 100_i64),
            Row::new()
                .with("date", date(2020, 1, 2))
                .with("code", "000002")
                .with("name", Value::Null)
                .with("close", Value::Null)
                .with("volume", Value::Null),
        ];

        let meta = write_segment(
            &location,
            SegmentId("seg-test".to_string()),
            &ds.columns,
            &ds.date_column,
            &rows,
            None,
        )
        .await?;

        assert_eq!(meta.row_count, 2);
        assert_eq!(meta.ts_min.date(), date(2020, 1, 2));
        assert_eq!(meta.ts_max.date(), date(2020, 1, 3));
        assert_eq!(meta.path, "data/seg-test.parquet");

        let back = read_segment(&location, &meta, &ds.columns).await?;
        assert_eq!(back, rows);
        Ok(())
    }

    #[test]
    fn timestamps_keep_millisecond_precision() -> TestResult {
        let columns = vec![
            ColumnSpec::new("ts", ColumnType::Timestamp),
            ColumnSpec::new("v", ColumnType::Int64),
        ];
        let ts = date(2021, 3, 4).and_hms_milli_opt(10, 11, 12, 345).ok_or("bad time")?;
        let rows = vec![Row::new().with("ts", ts).with("v", 7_i64)];

        let batch = rows_to_batch(&columns, &rows)?;
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch_to_rows(&columns, &batch, "mem")?, rows);
        Ok(())
    }

    #[test]
    fn missing_file_column_reads_as_null() -> TestResult {
        let written = vec![ColumnSpec::new("d", ColumnType::Date)];
        let batch = rows_to_batch(&written, &[Row::new().with("d", date(2020, 1, 1))])?;

        let mut wider = written.clone();
        wider.push(ColumnSpec::new("extra", ColumnType::Utf8));
        let rows = batch_to_rows(&wider, &batch, "mem")?;
        assert!(rows[0].value("extra").is_null());
        Ok(())
    }
}
