//! Arrow IPC decoding of result payloads.
//!
//! Schemas travel as schema-only Arrow IPC streams and rows as Arrow IPC
//! streams holding one or more record batches. A frame's batches are merged
//! so every frame maps to at most one `RecordBatch`.

use super::messages::ExecuteQueryResponse;
use super::protocol::QueryFrame;
use crate::error::TransportError;
use arrow::array::RecordBatch;
use arrow::compute::concat_batches;
use arrow::datatypes::{Schema, SchemaRef};
use arrow_ipc::reader::StreamReader;
use arrow_ipc::writer::StreamWriter;
use std::io::Cursor;

/// Decode a schema-only Arrow IPC stream.
pub fn decode_schema(bytes: &[u8]) -> Result<SchemaRef, TransportError> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| TransportError::Decode(format!("Failed to read Arrow schema: {}", e)))?;
    Ok(reader.schema())
}

/// Decode an Arrow IPC stream into a single batch.
///
/// # Returns
///
/// `None` if the stream holds a schema but no batches.
pub fn decode_batch(bytes: &[u8]) -> Result<Option<RecordBatch>, TransportError> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| TransportError::Decode(format!("Failed to create Arrow IPC reader: {}", e)))?;
    let schema = reader.schema();

    let batches = reader
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Decode(format!("Failed to read Arrow batches: {}", e)))?;

    match batches.len() {
        0 => Ok(None),
        1 => Ok(batches.into_iter().next()),
        _ => concat_batches(&schema, &batches)
            .map(Some)
            .map_err(|e| TransportError::Decode(format!("Failed to merge Arrow batches: {}", e))),
    }
}

/// Convert a wire response into a frame.
///
/// Only decoding happens here; sequencing and row-count checks belong to the
/// executor.
pub fn decode_response(response: ExecuteQueryResponse) -> Result<QueryFrame, TransportError> {
    let schema = match &response.schema {
        Some(schema) if !schema.arrow_schema.is_empty() => Some(decode_schema(&schema.arrow_schema)?),
        _ => None,
    };

    let (batch, row_count) = match &response.rows {
        Some(chunk) if !chunk.arrow_ipc.is_empty() => (decode_batch(&chunk.arrow_ipc)?, chunk.row_count),
        Some(chunk) => (None, chunk.row_count),
        None => (None, 0),
    };

    let query_id = if response.query_id.is_empty() {
        None
    } else {
        Some(response.query_id)
    };

    Ok(QueryFrame {
        sequence_number: response.sequence_number,
        query_id,
        schema,
        batch,
        row_count,
        end_of_stream: response.end_of_stream,
    })
}

/// Encode a schema as a schema-only Arrow IPC stream.
pub fn encode_schema(schema: &Schema) -> Result<Vec<u8>, TransportError> {
    let mut buffer = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buffer, schema)?;
        writer.finish()?;
    }
    Ok(buffer)
}

/// Encode a batch as an Arrow IPC stream.
pub fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>, TransportError> {
    let mut buffer = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buffer, &batch.schema())?;
        writer.write(batch)?;
        writer.finish()?;
    }
    Ok(buffer)
}
