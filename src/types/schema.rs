//! Column metadata derived from Arrow result schemas.

use crate::error::ConversionError;
use crate::types::{SqlType, TypeMapper};
use arrow_schema::{DataType, Field, Schema};

/// Metadata of one result column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMetadata {
    /// Column name
    pub name: String,
    /// Arrow physical type
    pub data_type: DataType,
    /// Default SQL type for reads
    pub sql_type: SqlType,
    /// Whether the column is nullable
    pub nullable: bool,
    pub precision: u32,
    pub scale: i8,
}

impl ColumnMetadata {
    /// Build metadata for an Arrow field.
    ///
    /// # Errors
    /// Returns `ConversionError::UnsupportedType` if the field type cannot be mapped
    pub fn from_field(field: &Field) -> Result<Self, ConversionError> {
        let data_type = field.data_type().clone();
        Ok(Self {
            name: field.name().clone(),
            sql_type: TypeMapper::arrow_to_sql(&data_type)?,
            precision: TypeMapper::precision(&data_type)?,
            scale: TypeMapper::scale(&data_type),
            nullable: field.is_nullable(),
            data_type,
        })
    }

    /// Maximum width in characters when rendered as text.
    pub fn display_size(&self) -> u32 {
        match self.sql_type {
            SqlType::Decimal => {
                // sign and decimal point
                let point = if self.scale > 0 { 1 } else { 0 };
                self.precision + 1 + point
            }
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer | SqlType::BigInt => {
                self.precision + 1
            }
            _ => self.precision,
        }
    }
}

/// Column metadata for every field of a result schema.
pub fn columns_from_schema(schema: &Schema) -> Result<Vec<ColumnMetadata>, ConversionError> {
    schema
        .fields()
        .iter()
        .map(|field| ColumnMetadata::from_field(field))
        .collect()
}
