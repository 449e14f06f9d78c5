//! Type mapping between Apache Arrow physical types and SQL types.

use crate::error::ConversionError;
use arrow_schema::DataType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::fmt;

/// SQL type a cell can be read as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Decimal,
    Varchar,
    Binary,
    Date,
    Time,
    Timestamp,
    TimestampWithTimezone,
    Array,
}

impl SqlType {
    /// Whether this is one of the integer types.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer | SqlType::BigInt
        )
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::TinyInt => "TINYINT",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Real => "REAL",
            SqlType::Double => "DOUBLE",
            SqlType::Decimal => "DECIMAL",
            SqlType::Varchar => "VARCHAR",
            SqlType::Binary => "BINARY",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::TimestampWithTimezone => "TIMESTAMP_WITH_TIMEZONE",
            SqlType::Array => "ARRAY",
        };
        f.write_str(name)
    }
}

/// A single converted cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Null,
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    /// Unscaled value with its precision and scale
    Decimal {
        value: i128,
        precision: u8,
        scale: i8,
    },
    Varchar(String),
    Binary(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampWithTimezone(DateTime<Utc>),
    Array(Vec<TypedValue>),
}

impl TypedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null)
    }

    /// SQL type of the value, `None` for NULL.
    pub fn sql_type(&self) -> Option<SqlType> {
        let sql_type = match self {
            TypedValue::Null => return None,
            TypedValue::Boolean(_) => SqlType::Boolean,
            TypedValue::TinyInt(_) => SqlType::TinyInt,
            TypedValue::SmallInt(_) => SqlType::SmallInt,
            TypedValue::Integer(_) => SqlType::Integer,
            TypedValue::BigInt(_) => SqlType::BigInt,
            TypedValue::Real(_) => SqlType::Real,
            TypedValue::Double(_) => SqlType::Double,
            TypedValue::Decimal { .. } => SqlType::Decimal,
            TypedValue::Varchar(_) => SqlType::Varchar,
            TypedValue::Binary(_) => SqlType::Binary,
            TypedValue::Date(_) => SqlType::Date,
            TypedValue::Time(_) => SqlType::Time,
            TypedValue::Timestamp(_) => SqlType::Timestamp,
            TypedValue::TimestampWithTimezone(_) => SqlType::TimestampWithTimezone,
            TypedValue::Array(_) => SqlType::Array,
        };
        Some(sql_type)
    }
}

/// Render an unscaled decimal as text.
pub fn format_decimal(value: i128, scale: i8) -> String {
    if scale <= 0 {
        let zeros = "0".repeat(scale.unsigned_abs() as usize);
        return if value == 0 {
            "0".to_string()
        } else {
            format!("{}{}", value, zeros)
        };
    }

    let scale = scale as usize;
    let digits = value.unsigned_abs().to_string();
    let padded = if digits.len() <= scale {
        format!("{}{}", "0".repeat(scale - digits.len() + 1), digits)
    } else {
        digits
    };
    let (int_part, frac_part) = padded.split_at(padded.len() - scale);
    let sign = if value < 0 { "-" } else { "" };
    format!("{}{}.{}", sign, int_part, frac_part)
}

/// Type mapper for Arrow physical types.
pub struct TypeMapper;

impl TypeMapper {
    /// The SQL type a column of this Arrow type is read as by default.
    ///
    /// # Errors
    /// Returns `ConversionError::UnsupportedType` if the type has no SQL mapping
    pub fn arrow_to_sql(data_type: &DataType) -> Result<SqlType, ConversionError> {
        let sql_type = match data_type {
            DataType::Null => SqlType::Varchar,
            DataType::Boolean => SqlType::Boolean,
            DataType::Int8 => SqlType::TinyInt,
            DataType::Int16 | DataType::UInt8 => SqlType::SmallInt,
            DataType::Int32 | DataType::UInt16 => SqlType::Integer,
            DataType::Int64 | DataType::UInt32 => SqlType::BigInt,
            DataType::Float16 | DataType::Float32 => SqlType::Real,
            DataType::Float64 => SqlType::Double,
            DataType::Decimal128(_, _) => SqlType::Decimal,
            DataType::Utf8 | DataType::LargeUtf8 => SqlType::Varchar,
            DataType::Binary | DataType::LargeBinary | DataType::FixedSizeBinary(_) => {
                SqlType::Binary
            }
            DataType::Date32 | DataType::Date64 => SqlType::Date,
            DataType::Time32(_) | DataType::Time64(_) => SqlType::Time,
            DataType::Timestamp(_, None) => SqlType::Timestamp,
            DataType::Timestamp(_, Some(_)) => SqlType::TimestampWithTimezone,
            DataType::List(_) | DataType::LargeList(_) => SqlType::Array,
            other => {
                return Err(ConversionError::UnsupportedType {
                    data_type: other.to_string(),
                })
            }
        };
        Ok(sql_type)
    }

    /// JDBC-style precision for a column: digits for numbers, characters for
    /// text and temporal values, bytes for binary.
    pub fn precision(data_type: &DataType) -> Result<u32, ConversionError> {
        let precision = match Self::arrow_to_sql(data_type)? {
            SqlType::Boolean => 1,
            SqlType::TinyInt => 3,
            SqlType::SmallInt => 5,
            SqlType::Integer => 10,
            SqlType::BigInt => 19,
            SqlType::Real => 8,
            SqlType::Double => 17,
            SqlType::Decimal => match data_type {
                DataType::Decimal128(precision, _) => u32::from(*precision),
                _ => 38,
            },
            SqlType::Date => 13,
            SqlType::Time => 15,
            SqlType::Timestamp => 29,
            SqlType::TimestampWithTimezone => 35,
            SqlType::Binary => match data_type {
                DataType::FixedSizeBinary(size) => u32::try_from(*size).unwrap_or(0),
                _ => i32::MAX as u32,
            },
            SqlType::Varchar | SqlType::Array => i32::MAX as u32,
        };
        Ok(precision)
    }

    /// Digits after the decimal point, zero for non-decimal types.
    pub fn scale(data_type: &DataType) -> i8 {
        match data_type {
            DataType::Decimal128(_, scale) => *scale,
            _ => 0,
        }
    }
}
