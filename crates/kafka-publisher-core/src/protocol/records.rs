//! Kafka RecordBatch (magic v2) encoding and decoding.
//!
//! Produce requests and fetch responses carry records as a concatenation of
//! batches. Each batch has a fixed header followed by varint-framed records:
//!
//! ```text
//! baseOffset: i64 | batchLength: i32 | partitionLeaderEpoch: i32 | magic: i8 (2)
//! crc: u32 (CRC-32C of everything after this field) | attributes: i16
//! lastOffsetDelta: i32 | firstTimestamp: i64 | maxTimestamp: i64
//! producerId: i64 | producerEpoch: i16 | baseSequence: i32 | records: [Record]
//! ```
//!
//! Compression is not supported; a compressed batch decodes to an error.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const MAGIC: i8 = 2;

/// Bytes from `partitionLeaderEpoch` through the record count.
const BATCH_HEADER_LEN: usize = 4 + 1 + 4 + 2 + 4 + 8 + 8 + 8 + 2 + 4 + 4;

/// Offset of the CRC field from the start of the batch.
const CRC_OFFSET: usize = 8 + 4 + 4 + 1;

const COMPRESSION_MASK: i16 = 0x07;
const TIMESTAMP_LOG_APPEND: i16 = 0x08;
const CONTROL_FLAG: i16 = 0x20;

/// Errors raised while decoding record batches.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("unsupported record batch magic {0}")]
    UnsupportedMagic(i8),

    #[error("CRC mismatch in batch at offset {base_offset}: expected {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch {
        base_offset: i64,
        expected: u32,
        actual: u32,
    },

    #[error("compressed record batches are not supported (codec {0})")]
    Compressed(i16),

    #[error("malformed record batch: {0}")]
    Malformed(&'static str),
}

/// A record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Bytes>,
}

/// One record of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Absolute offset. Ignored on encode, where offsets follow slice order.
    pub offset: i64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

impl Record {
    /// A record to be produced.
    pub fn new(key: Option<Bytes>, value: impl Into<Bytes>, timestamp: i64) -> Self {
        Self {
            offset: 0,
            timestamp,
            key,
            value: Some(value.into()),
            headers: Vec::new(),
        }
    }
}

/// Encode `records` as a single uncompressed batch starting at `base_offset`.
///
/// Producers pass `0`; the broker assigns the real offsets.
#[must_use]
pub fn encode_batch(base_offset: i64, records: &[Record]) -> Bytes {
    let first_timestamp = records.first().map_or(0, |r| r.timestamp);
    let max_timestamp = records
        .iter()
        .map(|r| r.timestamp)
        .max()
        .unwrap_or(first_timestamp);

    let mut body = BytesMut::new();
    for (delta, record) in records.iter().enumerate() {
        encode_record(&mut body, record, delta as i64, first_timestamp);
    }

    let batch_length = BATCH_HEADER_LEN + body.len();
    let mut batch = BytesMut::with_capacity(8 + 4 + batch_length);
    batch.put_i64(base_offset);
    batch.put_i32(batch_length as i32);
    batch.put_i32(-1); // partition leader epoch
    batch.put_i8(MAGIC);
    batch.put_u32(0); // crc, patched below
    batch.put_i16(0); // attributes
    batch.put_i32(records.len().saturating_sub(1) as i32);
    batch.put_i64(first_timestamp);
    batch.put_i64(max_timestamp);
    batch.put_i64(-1); // producer id
    batch.put_i16(-1); // producer epoch
    batch.put_i32(-1); // base sequence
    batch.put_i32(records.len() as i32);
    batch.put_slice(&body);

    let crc = crc32c::crc32c(&batch[CRC_OFFSET + 4..]);
    batch[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());

    batch.freeze()
}

fn encode_record(buf: &mut BytesMut, record: &Record, offset_delta: i64, first_timestamp: i64) {
    let mut body = BytesMut::new();
    body.put_i8(0); // attributes
    put_varint(&mut body, record.timestamp - first_timestamp);
    put_varint(&mut body, offset_delta);
    put_nullable(&mut body, record.key.as_deref());
    put_nullable(&mut body, record.value.as_deref());
    put_varint(&mut body, record.headers.len() as i64);
    for header in &record.headers {
        put_nullable(&mut body, Some(header.key.as_bytes()));
        put_nullable(&mut body, header.value.as_deref());
    }

    put_varint(buf, body.len() as i64);
    buf.put_slice(&body);
}

fn put_nullable(buf: &mut BytesMut, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            put_varint(buf, bytes.len() as i64);
            buf.put_slice(bytes);
        }
        None => put_varint(buf, -1),
    }
}

fn put_varint(buf: &mut BytesMut, value: i64) {
    let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        let byte = (zigzag & 0x7F) as u8;
        zigzag >>= 7;
        if zigzag == 0 {
            buf.put_u8(byte);
            break;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Decode every record at or after `min_offset` from a fetch response's record set.
///
/// A truncated trailing batch, which brokers send when a batch straddles the
/// fetch size limit, ends decoding without an error. Control batches are skipped.
///
/// # Errors
///
/// Returns an error for an unknown magic byte, a CRC mismatch, a compressed
/// batch or a structurally invalid batch.
pub fn decode_batches(mut data: &[u8], min_offset: i64) -> Result<Vec<Record>, RecordError> {
    let mut records = Vec::new();

    while data.len() >= 12 {
        let base_offset = (&data[..8]).get_i64();
        let batch_length = (&data[8..12]).get_i32();
        if batch_length < 0 {
            return Err(RecordError::Malformed("negative batch length"));
        }
        let batch_length = batch_length as usize;
        if data.len() - 12 < batch_length {
            break;
        }
        if batch_length < BATCH_HEADER_LEN {
            return Err(RecordError::Malformed("batch shorter than its header"));
        }

        let mut batch = &data[12..12 + batch_length];
        data = &data[12 + batch_length..];

        let _leader_epoch = batch.get_i32();
        let magic = batch.get_i8();
        if magic != MAGIC {
            return Err(RecordError::UnsupportedMagic(magic));
        }
        let expected = batch.get_u32();
        let actual = crc32c::crc32c(batch);
        if expected != actual {
            return Err(RecordError::CrcMismatch {
                base_offset,
                expected,
                actual,
            });
        }

        let attributes = batch.get_i16();
        let _last_offset_delta = batch.get_i32();
        let first_timestamp = batch.get_i64();
        let max_timestamp = batch.get_i64();
        let _producer_id = batch.get_i64();
        let _producer_epoch = batch.get_i16();
        let _base_sequence = batch.get_i32();
        let count = batch.get_i32();

        if attributes & CONTROL_FLAG != 0 {
            continue;
        }
        let codec = attributes & COMPRESSION_MASK;
        if codec != 0 {
            return Err(RecordError::Compressed(codec));
        }
        let log_append_time = attributes & TIMESTAMP_LOG_APPEND != 0;

        for _ in 0..count.max(0) {
            let length = get_varint(&mut batch)?;
            let mut record = take(&mut batch, length)?;

            ensure(record, 1)?;
            let _attributes = record.get_i8();
            let timestamp_delta = get_varint(&mut record)?;
            let offset_delta = get_varint(&mut record)?;
            let key = get_nullable(&mut record)?;
            let value = get_nullable(&mut record)?;

            let header_count = get_varint(&mut record)?;
            let mut headers = Vec::new();
            for _ in 0..header_count.max(0) {
                let key = get_nullable(&mut record)?
                    .ok_or(RecordError::Malformed("null header key"))?;
                let value = get_nullable(&mut record)?;
                headers.push(RecordHeader {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    value,
                });
            }

            let offset = base_offset + offset_delta;
            if offset < min_offset {
                continue;
            }
            records.push(Record {
                offset,
                timestamp: if log_append_time {
                    max_timestamp
                } else {
                    first_timestamp + timestamp_delta
                },
                key,
                value,
                headers,
            });
        }
    }

    Ok(records)
}

fn ensure(buf: &[u8], len: usize) -> Result<(), RecordError> {
    if buf.len() < len {
        Err(RecordError::Malformed("record runs past the end of its batch"))
    } else {
        Ok(())
    }
}

fn take<'a>(buf: &mut &'a [u8], len: i64) -> Result<&'a [u8], RecordError> {
    let len = usize::try_from(len).map_err(|_| RecordError::Malformed("negative length"))?;
    ensure(buf, len)?;
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn get_nullable(buf: &mut &[u8]) -> Result<Option<Bytes>, RecordError> {
    let len = get_varint(buf)?;
    if len < 0 {
        return Ok(None);
    }
    Ok(Some(Bytes::copy_from_slice(take(buf, len)?)))
}

fn get_varint(buf: &mut &[u8]) -> Result<i64, RecordError> {
    let mut value: u64 = 0;
    for shift in (0..70).step_by(7) {
        ensure(buf, 1)?;
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(((value >> 1) as i64) ^ -((value & 1) as i64));
        }
    }
    Err(RecordError::Malformed("varint longer than 10 bytes"))
}
