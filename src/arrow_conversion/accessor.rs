//! Lazy per-cell reads from Arrow column vectors.
//!
//! Nothing is converted up front: a cell is checked against the column's
//! validity bitmap and then downcast and converted only when it is read.

use crate::error::ConversionError;
use crate::types::{format_decimal, SqlType, TypeMapper, TypedValue};
use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    DataType, Date32Type, Date64Type, Float16Type, Float32Type, Float64Type, Int16Type,
    Int32Type, Int64Type, Int8Type, Time32MillisecondType, Time32SecondType,
    Time64MicrosecondType, Time64NanosecondType, TimeUnit, TimestampMicrosecondType,
    TimestampMillisecondType, TimestampNanosecondType, TimestampSecondType, UInt16Type,
    UInt32Type, UInt64Type, UInt8Type,
};
use chrono::{NaiveDateTime, NaiveTime};

/// Position of the cell being read, used to build errors.
#[derive(Debug, Clone, Copy)]
struct Cell<'a> {
    row: usize,
    column: usize,
    physical: &'a DataType,
    target: SqlType,
}

impl Cell<'_> {
    fn mismatch(&self) -> ConversionError {
        ConversionError::TypeMismatch {
            column: self.column,
            physical: self.physical.to_string(),
            requested: self.target.to_string(),
        }
    }

    fn overflow(&self) -> ConversionError {
        ConversionError::NumericOverflow {
            row: self.row,
            column: self.column,
            target: self.target.to_string(),
        }
    }

    fn invalid(&self, what: &str) -> ConversionError {
        ConversionError::InvalidFormat(format!(
            "{} at row {}, column {}",
            what, self.row, self.column
        ))
    }
}

/// Read one cell in its natural SQL type.
pub fn read_natural(
    array: &dyn Array,
    row: usize,
    column: usize,
) -> Result<TypedValue, ConversionError> {
    if matches!(array.data_type(), DataType::Null) {
        return Ok(TypedValue::Null);
    }
    let target = TypeMapper::arrow_to_sql(array.data_type())?;
    read_value(array, row, column, target)
}

/// Read one cell as the requested SQL type.
///
/// # Errors
/// Returns `ConversionError::TypeMismatch` if the column's physical type cannot
/// produce `target`, and `ConversionError::NumericOverflow` if the value does
/// not fit.
pub fn read_value(
    array: &dyn Array,
    row: usize,
    column: usize,
    target: SqlType,
) -> Result<TypedValue, ConversionError> {
    if row >= array.len() {
        return Err(ConversionError::InvalidFormat(format!(
            "row {} out of range for column {} with {} rows",
            row,
            column,
            array.len()
        )));
    }

    let physical = array.data_type();
    let cell = Cell {
        row,
        column,
        physical,
        target,
    };

    if matches!(physical, DataType::Null) || array.is_null(row) {
        return Ok(TypedValue::Null);
    }

    match physical {
        DataType::Boolean => from_boolean(array.as_boolean().value(row), cell),
        DataType::Int8 => from_integer(i64::from(array.as_primitive::<Int8Type>().value(row)), cell),
        DataType::Int16 => {
            from_integer(i64::from(array.as_primitive::<Int16Type>().value(row)), cell)
        }
        DataType::Int32 => {
            from_integer(i64::from(array.as_primitive::<Int32Type>().value(row)), cell)
        }
        DataType::Int64 => from_integer(array.as_primitive::<Int64Type>().value(row), cell),
        DataType::UInt8 => {
            from_integer(i64::from(array.as_primitive::<UInt8Type>().value(row)), cell)
        }
        DataType::UInt16 => {
            from_integer(i64::from(array.as_primitive::<UInt16Type>().value(row)), cell)
        }
        DataType::UInt32 => {
            from_integer(i64::from(array.as_primitive::<UInt32Type>().value(row)), cell)
        }
        DataType::UInt64 => {
            let value = array.as_primitive::<UInt64Type>().value(row);
            let value = i64::try_from(value).map_err(|_| cell.overflow())?;
            from_integer(value, cell)
        }
        DataType::Float16 => {
            let value = array.as_primitive::<Float16Type>().value(row);
            from_float(f64::from(value.to_f32()), cell)
        }
        DataType::Float32 => {
            from_float(f64::from(array.as_primitive::<Float32Type>().value(row)), cell)
        }
        DataType::Float64 => from_float(array.as_primitive::<Float64Type>().value(row), cell),
        DataType::Decimal128(precision, scale) => {
            let value = array
                .as_primitive::<arrow::datatypes::Decimal128Type>()
                .value(row);
            from_decimal(value, *precision, *scale, cell)
        }
        DataType::Utf8 => from_text(array.as_string::<i32>().value(row), cell),
        DataType::LargeUtf8 => from_text(array.as_string::<i64>().value(row), cell),
        DataType::Binary => from_bytes(array.as_binary::<i32>().value(row), cell),
        DataType::LargeBinary => from_bytes(array.as_binary::<i64>().value(row), cell),
        DataType::FixedSizeBinary(_) => from_bytes(array.as_fixed_size_binary().value(row), cell),
        DataType::Date32 => {
            let value = array.as_primitive::<Date32Type>().value_as_datetime(row);
            from_date(value.ok_or_else(|| cell.invalid("invalid date"))?, cell)
        }
        DataType::Date64 => {
            let value = array.as_primitive::<Date64Type>().value_as_datetime(row);
            from_date(value.ok_or_else(|| cell.invalid("invalid date"))?, cell)
        }
        DataType::Time32(unit) | DataType::Time64(unit) => {
            let value = time_at(array, unit, row).ok_or_else(|| cell.invalid("invalid time"))?;
            from_time(value, cell)
        }
        DataType::Timestamp(unit, tz) => {
            let value = timestamp_at(array, unit, row)
                .ok_or_else(|| cell.invalid("invalid timestamp"))?;
            from_timestamp(value, tz.is_some(), cell)
        }
        DataType::List(_) => {
            if target != SqlType::Array {
                return Err(cell.mismatch());
            }
            let values = array.as_list::<i32>().value(row);
            read_elements(values.as_ref(), column)
        }
        DataType::LargeList(_) => {
            if target != SqlType::Array {
                return Err(cell.mismatch());
            }
            let values = array.as_list::<i64>().value(row);
            read_elements(values.as_ref(), column)
        }
        other => Err(ConversionError::UnsupportedType {
            data_type: other.to_string(),
        }),
    }
}

fn read_elements(values: &dyn Array, column: usize) -> Result<TypedValue, ConversionError> {
    let elements = (0..values.len())
        .map(|index| read_natural(values, index, column))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(TypedValue::Array(elements))
}

fn time_at(array: &dyn Array, unit: &TimeUnit, row: usize) -> Option<NaiveTime> {
    match (array.data_type(), unit) {
        (DataType::Time32(_), TimeUnit::Second) => {
            array.as_primitive::<Time32SecondType>().value_as_time(row)
        }
        (DataType::Time32(_), TimeUnit::Millisecond) => {
            array.as_primitive::<Time32MillisecondType>().value_as_time(row)
        }
        (DataType::Time64(_), TimeUnit::Microsecond) => {
            array.as_primitive::<Time64MicrosecondType>().value_as_time(row)
        }
        (DataType::Time64(_), TimeUnit::Nanosecond) => {
            array.as_primitive::<Time64NanosecondType>().value_as_time(row)
        }
        _ => None,
    }
}

fn timestamp_at(array: &dyn Array, unit: &TimeUnit, row: usize) -> Option<NaiveDateTime> {
    match unit {
        TimeUnit::Second => array
            .as_primitive::<TimestampSecondType>()
            .value_as_datetime(row),
        TimeUnit::Millisecond => array
            .as_primitive::<TimestampMillisecondType>()
            .value_as_datetime(row),
        TimeUnit::Microsecond => array
            .as_primitive::<TimestampMicrosecondType>()
            .value_as_datetime(row),
        TimeUnit::Nanosecond => array
            .as_primitive::<TimestampNanosecondType>()
            .value_as_datetime(row),
    }
}

fn from_integer(value: i64, cell: Cell<'_>) -> Result<TypedValue, ConversionError> {
    match cell.target {
        SqlType::TinyInt => i8::try_from(value)
            .map(TypedValue::TinyInt)
            .map_err(|_| cell.overflow()),
        SqlType::SmallInt => i16::try_from(value)
            .map(TypedValue::SmallInt)
            .map_err(|_| cell.overflow()),
        SqlType::Integer => i32::try_from(value)
            .map(TypedValue::Integer)
            .map_err(|_| cell.overflow()),
        SqlType::BigInt => Ok(TypedValue::BigInt(value)),
        SqlType::Real => Ok(TypedValue::Real(value as f32)),
        SqlType::Double => Ok(TypedValue::Double(value as f64)),
        SqlType::Decimal => Ok(TypedValue::Decimal {
            value: i128::from(value),
            precision: 19,
            scale: 0,
        }),
        SqlType::Varchar => Ok(TypedValue::Varchar(value.to_string())),
        SqlType::Boolean => Ok(TypedValue::Boolean(value != 0)),
        _ => Err(cell.mismatch()),
    }
}

fn from_boolean(value: bool, cell: Cell<'_>) -> Result<TypedValue, ConversionError> {
    match cell.target {
        SqlType::Boolean => Ok(TypedValue::Boolean(value)),
        SqlType::Varchar => Ok(TypedValue::Varchar(value.to_string())),
        target if target.is_integer() => from_integer(i64::from(value), cell),
        _ => Err(cell.mismatch()),
    }
}

fn from_float(value: f64, cell: Cell<'_>) -> Result<TypedValue, ConversionError> {
    match cell.target {
        SqlType::Real => Ok(TypedValue::Real(value as f32)),
        SqlType::Double => Ok(TypedValue::Double(value)),
        SqlType::Varchar => Ok(TypedValue::Varchar(value.to_string())),
        _ => Err(cell.mismatch()),
    }
}

fn from_decimal(
    value: i128,
    precision: u8,
    scale: i8,
    cell: Cell<'_>,
) -> Result<TypedValue, ConversionError> {
    match cell.target {
        SqlType::Decimal => Ok(TypedValue::Decimal {
            value,
            precision,
            scale,
        }),
        SqlType::Double => {
            let factor = 10f64.powi(i32::from(scale));
            Ok(TypedValue::Double(value as f64 / factor))
        }
        SqlType::Varchar => Ok(TypedValue::Varchar(format_decimal(value, scale))),
        target if target.is_integer() => {
            let factor = 10i128
                .checked_pow(u32::from(scale.unsigned_abs()))
                .ok_or_else(|| cell.overflow())?;
            let integral = if scale >= 0 {
                if value % factor != 0 {
                    return Err(cell.invalid("decimal value is not integral"));
                }
                value / factor
            } else {
                value.checked_mul(factor).ok_or_else(|| cell.overflow())?
            };
            let integral = i64::try_from(integral).map_err(|_| cell.overflow())?;
            from_integer(integral, cell)
        }
        _ => Err(cell.mismatch()),
    }
}

fn from_text(value: &str, cell: Cell<'_>) -> Result<TypedValue, ConversionError> {
    match cell.target {
        SqlType::Varchar => Ok(TypedValue::Varchar(value.to_string())),
        _ => Err(cell.mismatch()),
    }
}

fn from_bytes(value: &[u8], cell: Cell<'_>) -> Result<TypedValue, ConversionError> {
    match cell.target {
        SqlType::Binary => Ok(TypedValue::Binary(value.to_vec())),
        _ => Err(cell.mismatch()),
    }
}

fn from_date(value: NaiveDateTime, cell: Cell<'_>) -> Result<TypedValue, ConversionError> {
    match cell.target {
        SqlType::Date => Ok(TypedValue::Date(value.date())),
        SqlType::Timestamp => Ok(TypedValue::Timestamp(value)),
        SqlType::Varchar => Ok(TypedValue::Varchar(value.date().to_string())),
        _ => Err(cell.mismatch()),
    }
}

fn from_time(value: NaiveTime, cell: Cell<'_>) -> Result<TypedValue, ConversionError> {
    match cell.target {
        SqlType::Time => Ok(TypedValue::Time(value)),
        SqlType::Varchar => Ok(TypedValue::Varchar(value.to_string())),
        _ => Err(cell.mismatch()),
    }
}

fn from_timestamp(
    value: NaiveDateTime,
    with_timezone: bool,
    cell: Cell<'_>,
) -> Result<TypedValue, ConversionError> {
    match (cell.target, with_timezone) {
        (SqlType::Timestamp, _) => Ok(TypedValue::Timestamp(value)),
        (SqlType::TimestampWithTimezone, true) => {
            Ok(TypedValue::TimestampWithTimezone(value.and_utc()))
        }
        (SqlType::Date, false) => Ok(TypedValue::Date(value.date())),
        (SqlType::Time, false) => Ok(TypedValue::Time(value.time())),
        (SqlType::Varchar, true) => Ok(TypedValue::Varchar(value.and_utc().to_rfc3339())),
        (SqlType::Varchar, false) => Ok(TypedValue::Varchar(value.to_string())),
        _ => Err(cell.mismatch()),
    }
}
