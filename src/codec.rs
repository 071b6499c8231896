//! Schema-registry wire framing.
//!
//! Frame: magic (1 byte, 0x00) | schema id (4 bytes BE) | message-index path
//! (zigzag varints) | serialized record.
//! A payload whose first byte is not the magic byte is an unframed legacy value.

use crate::error::{Result, SchemaStreamError};
use crate::types::RecordDescriptor;
use bytes::{BufMut, BytesMut};

pub const MAGIC_BYTE: u8 = 0x00;

/// Magic byte plus schema id.
pub const FRAME_HEADER_LEN: usize = 5;

const MAX_VARINT_LEN: usize = 10;

/// Prefix `payload` with the magic byte and the big-endian schema id.
///
/// The message-index path, when used, is expected to already sit at the front
/// of `payload`.
pub fn frame_message(schema_id: u32, payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.try_reserve_exact(FRAME_HEADER_LEN + payload.len())
        .map_err(|e| SchemaStreamError::Encode(format!("frame buffer: {e}")))?;
    out.push(MAGIC_BYTE);
    out.extend_from_slice(&schema_id.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Frame a record: magic, schema id, message-index path, then the payload.
pub fn frame_record(schema_id: u32, index_path: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    body.try_reserve_exact(index_path.len() + payload.len())
        .map_err(|e| SchemaStreamError::Encode(format!("frame buffer: {e}")))?;
    body.extend_from_slice(index_path);
    body.extend_from_slice(payload);
    frame_message(schema_id, &body)
}

/// Encode the path from the file root to a message type.
///
/// The first message of a file is always written as the single byte `0`;
/// everything else is a varint count followed by one varint per index.
pub fn message_index_path(index: usize, ancestors: &[usize]) -> Vec<u8> {
    if index == 0 && ancestors.is_empty() {
        return vec![0];
    }
    let len = ancestors.len() + 1;
    let mut buf = BytesMut::with_capacity((1 + len) * MAX_VARINT_LEN);
    put_varint(&mut buf, len as i64);
    for &i in ancestors.iter().chain(std::iter::once(&index)) {
        put_varint(&mut buf, i as i64);
    }
    buf.to_vec()
}

/// Index path bytes for a record descriptor.
pub fn descriptor_index_path(descriptor: &RecordDescriptor) -> Vec<u8> {
    message_index_path(descriptor.index, &descriptor.ancestors)
}

/// Return the record payload inside `data`.
///
/// Framed data skips magic, schema id and `index_len` bytes of index path;
/// anything else is returned unchanged.
pub fn strip_framing(data: &[u8], index_len: usize) -> Result<&[u8]> {
    if data.first() != Some(&MAGIC_BYTE) {
        return Ok(data);
    }
    let skip = FRAME_HEADER_LEN + index_len;
    if data.len() < skip {
        return Err(SchemaStreamError::Decode(format!(
            "framed value is {} bytes, expected at least {}",
            data.len(),
            skip
        )));
    }
    Ok(&data[skip..])
}

/// Schema id of a framed value, `None` for unframed or truncated data.
pub fn schema_id_of(data: &[u8]) -> Option<u32> {
    if data.len() < FRAME_HEADER_LEN || data[0] != MAGIC_BYTE {
        return None;
    }
    Some(u32::from_be_bytes([data[1], data[2], data[3], data[4]]))
}

/// Signed zigzag varint, as the registry convention writes index paths.
fn put_varint(dst: &mut BytesMut, v: i64) {
    let mut z = ((v << 1) ^ (v >> 63)) as u64;
    while z >= 0x80 {
        dst.put_u8((z as u8 & 0x7f) | 0x80);
        z >>= 7;
    }
    dst.put_u8(z as u8);
}
