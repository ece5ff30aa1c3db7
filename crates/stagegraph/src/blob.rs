//! Little-endian blob writer consumed by the accelerator loader.
//!
//! Layout: [`BLOB_MAGIC`], format version, back-patched stage count, then one record per
//! serialized stage (`kind, category, #inputs, #outputs, params.., data descriptors..`).

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::model::Data;

pub const BLOB_MAGIC: [u8; 4] = *b"SGB1";
pub const BLOB_VERSION: u32 = 1;
/// Byte offset of the stage count in the header.
pub const STAGE_COUNT_OFFSET: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("data `{data}` has no resolved strides")]
    UnresolvedStrides { data: String },
    #[error("{field} value {value} does not fit in u32")]
    Overflow { field: &'static str, value: usize },
    #[error("patch at offset {offset} is outside the {len}-byte blob")]
    OutOfBounds { offset: usize, len: usize },
}

#[derive(Debug, Default)]
pub struct BlobSerializer {
    buf: BytesMut,
}

impl BlobSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer primed with the blob header; the stage count is patched by [`Self::finish`].
    pub fn with_header() -> Self {
        let mut writer = Self::new();
        writer.append_bytes(&BLOB_MAGIC);
        writer.append_u32(BLOB_VERSION);
        writer.append_u32(0);
        writer
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn append_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn append_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn append_f32(&mut self, value: f32) {
        self.buf.put_f32_le(value);
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Appends a host-sized count as `u32`.
    pub fn append_len(&mut self, field: &'static str, value: usize) -> Result<(), BlobError> {
        let value = u32::try_from(value).map_err(|_| BlobError::Overflow { field, value })?;
        self.append_u32(value);
        Ok(())
    }

    pub fn overwrite_u32_at(&mut self, offset: usize, value: u32) -> Result<(), BlobError> {
        let len = self.buf.len();
        let slot = offset
            .checked_add(4)
            .filter(|end| *end <= len)
            .map(|end| &mut self.buf[offset..end])
            .ok_or(BlobError::OutOfBounds { offset, len })?;
        slot.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Runs `write` as one record. On error everything it appended is discarded.
    pub fn record<T, E>(
        &mut self,
        write: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E> {
        let start = self.buf.len();
        let result = write(self);
        if result.is_err() {
            self.buf.truncate(start);
        }
        result
    }

    /// Data descriptor: index, dtype, order code, axis count, extents then byte strides, both
    /// innermost first.
    pub fn append_data(&mut self, data: &Data) -> Result<(), BlobError> {
        let strides = data
            .strides()
            .ok_or_else(|| BlobError::UnresolvedStrides {
                data: data.name().to_string(),
            })?;
        let order = data.order();

        self.append_len("data index", data.id().index())?;
        self.append_u32(data.desc().dtype().code());
        self.append_u32(order.code());
        self.append_len("axis count", order.num_dims())?;
        for dim in order.dims() {
            self.append_len("extent", data.desc().dim(*dim).unwrap_or(1))?;
        }
        for dim in order.dims() {
            let stride = strides.get(*dim).ok_or_else(|| BlobError::UnresolvedStrides {
                data: data.name().to_string(),
            })?;
            self.append_len("stride", stride)?;
        }
        Ok(())
    }

    /// Patches the stage count into the header and freezes the buffer.
    pub fn finish(mut self, stage_count: usize) -> Result<Bytes, BlobError> {
        let count = u32::try_from(stage_count).map_err(|_| BlobError::Overflow {
            field: "stage count",
            value: stage_count,
        })?;
        self.overwrite_u32_at(STAGE_COUNT_OFFSET, count)?;
        Ok(self.buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_count_is_patched() {
        let mut writer = BlobSerializer::with_header();
        writer.append_u32(7);
        let blob = writer.finish(3).unwrap();
        assert_eq!(&blob[..4], b"SGB1");
        assert_eq!(&blob[4..8], &BLOB_VERSION.to_le_bytes());
        assert_eq!(&blob[8..12], &3u32.to_le_bytes());
        assert_eq!(blob.len(), 16);
    }

    #[test]
    fn failed_record_leaves_no_bytes() {
        let mut writer = BlobSerializer::new();
        writer.append_u32(1);
        let result: Result<(), BlobError> = writer.record(|w| {
            w.append_u32(2);
            w.append_f32(0.5);
            w.append_len("huge", usize::MAX)
        });
        assert!(matches!(result, Err(BlobError::Overflow { field: "huge", .. })));
        assert_eq!(writer.as_bytes(), &1u32.to_le_bytes());
    }

    #[test]
    fn patch_outside_blob_is_rejected() {
        let mut writer = BlobSerializer::new();
        writer.append_i32(-1);
        assert_eq!(
            writer.overwrite_u32_at(2, 0),
            Err(BlobError::OutOfBounds { offset: 2, len: 4 })
        );
        writer.overwrite_u32_at(0, 9).unwrap();
        assert_eq!(writer.as_bytes(), &9u32.to_le_bytes());
    }
}
