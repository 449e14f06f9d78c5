//! Row-oriented access to streamed results.
//!
//! [`RowCursor`] walks the batches of a [`QueryExecution`] one row at a time.
//! Only the current batch is held; cells are converted when they are read.

use super::execution::{Batch, CancelHandle, ExecutionState, QueryExecution};
use crate::arrow_conversion::{read_natural, read_value};
use crate::error::{ConversionError, HyperError, QueryError};
use crate::types::{columns_from_schema, ColumnMetadata, SqlType, TypedValue};
use arrow::array::{Array, RecordBatch};
use arrow::datatypes::SchemaRef;

/// One row of the current batch.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    batch: &'a RecordBatch,
    index: usize,
    row_number: u64,
}

impl<'a> Row<'a> {
    /// 1-based position of the row within the whole result.
    pub fn row_number(&self) -> u64 {
        self.row_number
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a cell as the requested SQL type.
    ///
    /// # Errors
    /// Returns `ConversionError::TypeMismatch` if the column cannot produce
    /// `sql_type`, or `ConversionError::ColumnOutOfRange` for a bad index.
    pub fn get(&self, column: usize, sql_type: SqlType) -> Result<TypedValue, ConversionError> {
        read_value(self.column(column)?, self.index, column, sql_type)
    }

    /// Read a cell in the column's natural SQL type.
    pub fn value(&self, column: usize) -> Result<TypedValue, ConversionError> {
        read_natural(self.column(column)?, self.index, column)
    }

    /// Check the null bitmap of a cell.
    pub fn is_null(&self, column: usize) -> Result<bool, ConversionError> {
        Ok(self.column(column)?.is_null(self.index))
    }

    /// Every cell in its natural SQL type.
    pub fn values(&self) -> Result<Vec<TypedValue>, ConversionError> {
        (0..self.len()).map(|column| self.value(column)).collect()
    }

    fn column(&self, column: usize) -> Result<&'a dyn Array, ConversionError> {
        let count = self.batch.num_columns();
        if column >= count {
            return Err(ConversionError::ColumnOutOfRange { column, count });
        }
        Ok(self.batch.column(column).as_ref())
    }
}

/// Pull-based cursor over the rows of one execution.
///
/// Rows are read in sequence order. The cursor pulls the next batch only
/// when the current one is used up, so memory is bounded by the execution's
/// fetch size. Errors leave earlier rows valid but stop the cursor.
pub struct RowCursor {
    execution: QueryExecution,
    current: Option<Batch>,
    /// Index of the next unread row of `current`
    position: usize,
    has_row: bool,
    row_number: u64,
    closed: bool,
}

impl RowCursor {
    pub(crate) fn new(execution: QueryExecution) -> Self {
        Self {
            execution,
            current: None,
            position: 0,
            has_row: false,
            row_number: 0,
            closed: false,
        }
    }

    /// Advance to the next row.
    ///
    /// # Returns
    ///
    /// `None` once every row was read.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the execution, `QueryError::Cancelled`
    /// after cancellation, or `QueryError::CursorClosed` after `close()`.
    pub async fn next(&mut self) -> Result<Option<Row<'_>>, HyperError> {
        if self.closed {
            return Err(QueryError::CursorClosed.into());
        }

        loop {
            if let Some(batch) = &self.current {
                if self.position < batch.num_rows() {
                    break;
                }
            }
            self.has_row = false;
            self.current = None;
            match self.execution.next_batch().await? {
                Some(batch) => {
                    self.current = Some(batch);
                    self.position = 0;
                }
                None => return Ok(None),
            }
        }

        let index = self.position;
        self.position += 1;
        self.row_number += 1;
        self.has_row = true;
        Ok(self.current.as_ref().map(|batch| Row {
            batch: &batch.data,
            index,
            row_number: self.row_number,
        }))
    }

    /// The row the cursor is positioned on.
    pub fn current(&self) -> Result<Row<'_>, HyperError> {
        if self.closed {
            return Err(QueryError::CursorClosed.into());
        }
        match (&self.current, self.has_row) {
            (Some(batch), true) => Ok(Row {
                batch: &batch.data,
                index: self.position - 1,
                row_number: self.row_number,
            }),
            _ => Err(ConversionError::NoCurrentRow.into()),
        }
    }

    /// Read a cell of the current row as the requested SQL type.
    pub fn column_value(&self, column: usize, sql_type: SqlType) -> Result<TypedValue, HyperError> {
        Ok(self.current()?.get(column, sql_type)?)
    }

    /// Read a cell of the current row in its natural SQL type.
    pub fn value(&self, column: usize) -> Result<TypedValue, HyperError> {
        Ok(self.current()?.value(column)?)
    }

    /// Result schema, once declared by the server.
    pub fn schema(&self) -> Option<SchemaRef> {
        self.execution.schema()
    }

    /// Column metadata of the result. Empty if the server never declared a
    /// schema.
    pub fn columns(&self) -> Result<Vec<ColumnMetadata>, HyperError> {
        match self.execution.schema() {
            Some(schema) => Ok(columns_from_schema(&schema)?),
            None => Ok(Vec::new()),
        }
    }

    /// Number of rows returned by `next()` so far.
    pub fn row_number(&self) -> u64 {
        self.row_number
    }

    pub fn state(&self) -> ExecutionState {
        self.execution.state()
    }

    pub fn execution(&self) -> &QueryExecution {
        &self.execution
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.execution.cancel_handle()
    }

    /// Cancel the execution. Rows already received stay readable.
    pub async fn cancel(&mut self) {
        self.execution.cancel().await;
    }

    /// Release the cursor, cancelling the execution if it is unfinished.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.execution.cancel().await;
        self.current = None;
        self.has_row = false;
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read the remaining rows into their natural values.
    ///
    /// Meant for small results; everything is held in memory.
    pub async fn collect_values(&mut self) -> Result<Vec<Vec<TypedValue>>, HyperError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row.values()?);
        }
        Ok(rows)
    }
}

impl std::fmt::Debug for RowCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor")
            .field("execution", &self.execution)
            .field("row_number", &self.row_number)
            .field("closed", &self.closed)
            .finish()
    }
}
