//! WAL record encoding.
//!
//! Each record is `record_len (u16, includes itself) | tid (u64) | op (u8)`
//! followed by `key_len (u16) | key` for PUT and DELETE and
//! `value_len (u16) | value` for PUT, little-endian.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::errdata;
use crate::error::Result;

const OP_CREATE: u8 = 0;
const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_COMMIT: u8 = 3;
const OP_ROLLBACK: u8 = 4;

/// Fixed prefix: record_len + tid + op.
const RECORD_HEADER: usize = 2 + 8 + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPayload {
    Create,
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Commit,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub tid: u64,
    pub payload: RecordPayload,
}

impl Record {
    pub fn create(tid: u64) -> Self {
        Self {
            tid,
            payload: RecordPayload::Create,
        }
    }

    pub fn put(tid: u64, key: &[u8], value: &[u8]) -> Self {
        Self {
            tid,
            payload: RecordPayload::Put {
                key: key.to_vec(),
                value: value.to_vec(),
            },
        }
    }

    pub fn delete(tid: u64, key: &[u8]) -> Self {
        Self {
            tid,
            payload: RecordPayload::Delete { key: key.to_vec() },
        }
    }

    pub fn commit(tid: u64) -> Self {
        Self {
            tid,
            payload: RecordPayload::Commit,
        }
    }

    pub fn rollback(tid: u64) -> Self {
        Self {
            tid,
            payload: RecordPayload::Rollback,
        }
    }

    fn encoded_len(&self) -> usize {
        RECORD_HEADER
            + match &self.payload {
                RecordPayload::Create | RecordPayload::Commit | RecordPayload::Rollback => 0,
                RecordPayload::Delete { key } => 2 + key.len(),
                RecordPayload::Put { key, value } => 2 + key.len() + 2 + value.len(),
            }
    }

    fn op(&self) -> u8 {
        match &self.payload {
            RecordPayload::Create => OP_CREATE,
            RecordPayload::Put { .. } => OP_PUT,
            RecordPayload::Delete { .. } => OP_DELETE,
            RecordPayload::Commit => OP_COMMIT,
            RecordPayload::Rollback => OP_ROLLBACK,
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u16::<LittleEndian>(self.encoded_len() as u16).unwrap();
        buf.write_u64::<LittleEndian>(self.tid).unwrap();
        buf.write_u8(self.op()).unwrap();
        match &self.payload {
            RecordPayload::Create | RecordPayload::Commit | RecordPayload::Rollback => {}
            RecordPayload::Delete { key } => {
                buf.write_u16::<LittleEndian>(key.len() as u16).unwrap();
                buf.extend_from_slice(key);
            }
            RecordPayload::Put { key, value } => {
                buf.write_u16::<LittleEndian>(key.len() as u16).unwrap();
                buf.extend_from_slice(key);
                buf.write_u16::<LittleEndian>(value.len() as u16).unwrap();
                buf.extend_from_slice(value);
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes a whole byte stream of concatenated records. Truncation or
    /// an unknown op is corruption.
    pub fn decode_stream(bytes: &[u8]) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            if pos + RECORD_HEADER > bytes.len() {
                return Err(errdata!("truncated wal record header"));
            }
            let record_len = LittleEndian::read_u16(&bytes[pos..pos + 2]) as usize;
            if record_len < RECORD_HEADER || pos + record_len > bytes.len() {
                return Err(errdata!("wal record length {record_len} out of bounds"));
            }
            let tid = LittleEndian::read_u64(&bytes[pos + 2..pos + 10]);
            let op = bytes[pos + 10];
            let body = &bytes[pos + RECORD_HEADER..pos + record_len];
            let payload = match op {
                OP_CREATE => RecordPayload::Create,
                OP_COMMIT => RecordPayload::Commit,
                OP_ROLLBACK => RecordPayload::Rollback,
                OP_DELETE => {
                    let (key, rest) = read_chunk(body)?;
                    if !rest.is_empty() {
                        return Err(errdata!("wal delete record has trailing bytes"));
                    }
                    RecordPayload::Delete { key }
                }
                OP_PUT => {
                    let (key, rest) = read_chunk(body)?;
                    let (value, rest) = read_chunk(rest)?;
                    if !rest.is_empty() {
                        return Err(errdata!("wal put record has trailing bytes"));
                    }
                    RecordPayload::Put { key, value }
                }
                other => {
                    return Err(errdata!("unknown wal op {other}"));
                }
            };
            records.push(Record { tid, payload });
            pos += record_len;
        }
        Ok(records)
    }
}

fn read_chunk(bytes: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    if bytes.len() < 2 {
        return Err(errdata!("truncated wal record body"));
    }
    let len = LittleEndian::read_u16(&bytes[0..2]) as usize;
    if bytes.len() < 2 + len {
        return Err(errdata!("truncated wal record body"));
    }
    Ok((bytes[2..2 + len].to_vec(), &bytes[2 + len..]))
}
