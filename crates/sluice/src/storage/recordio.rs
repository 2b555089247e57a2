//! Length-prefixed record formats (`recordio:`, `recordkv:`)
//!
//! Each record is framed as a big-endian u32 length followed by the
//! payload. `recordio` stores values only and yields the shard index as
//! the key; `recordkv` stores one datum as two consecutive records, key
//! then value.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};

use super::{ByteReader, ByteWriter, RecordFormat, RecordReader, RecordWriter, ResourceSpec};
use crate::core::{Record, RecordKey, Value};
use crate::error::{Result, SluiceError};

#[derive(Debug, Clone, Copy)]
pub struct RecordIoFormat {
    with_key: bool,
}

impl RecordIoFormat {
    /// `recordio`: values only, key is the shard index.
    pub fn values_only() -> Self {
        Self { with_key: false }
    }

    /// `recordkv`: key record followed by value record.
    pub fn keyed() -> Self {
        Self { with_key: true }
    }
}

#[async_trait]
impl RecordFormat for RecordIoFormat {
    async fn open_reader(&self, rc: &ResourceSpec, shard: usize) -> Result<Box<dyn RecordReader>> {
        let raw = rc.open_raw_reader(shard).await?;
        Ok(Box::new(RecordIoReader {
            reader: BufReader::new(raw),
            with_key: self.with_key,
            shard_key: RecordKey::new(shard.to_string()),
        }))
    }

    async fn open_writer(&self, rc: &ResourceSpec, shard: usize) -> Result<Box<dyn RecordWriter>> {
        let raw = rc.open_raw_writer(shard).await?;
        Ok(Box::new(RecordIoWriter {
            writer: BufWriter::new(raw),
            with_key: self.with_key,
        }))
    }
}

struct RecordIoReader {
    reader: BufReader<ByteReader>,
    with_key: bool,
    shard_key: RecordKey,
}

impl RecordIoReader {
    /// Read one frame; `None` only at a clean end of stream.
    async fn read_frame(&mut self, at_boundary: bool) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof && at_boundary => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }
}

#[async_trait]
impl RecordReader for RecordIoReader {
    async fn next(&mut self) -> Result<Option<Record>> {
        let key = if self.with_key {
            match self.read_frame(true).await? {
                Some(bytes) => RecordKey::new(String::from_utf8(bytes).map_err(|_| {
                    SluiceError::Codec("record key is not valid utf-8".to_string())
                })?),
                None => return Ok(None),
            }
        } else {
            self.shard_key.clone()
        };
        // In a keyed stream the value frame follows its key, so EOF there
        // means a torn record and surfaces as an error.
        let value = match self.read_frame(!self.with_key).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        Ok(Some(Record {
            key,
            value: Value::Bytes(value),
            sort_order: 0,
        }))
    }
}

struct RecordIoWriter {
    writer: BufWriter<ByteWriter>,
    with_key: bool,
}

impl RecordIoWriter {
    async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.writer
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        self.writer.write_all(payload).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordWriter for RecordIoWriter {
    async fn write(&mut self, record: &Record) -> Result<()> {
        if self.with_key {
            let key = record.key.as_bytes().to_vec();
            self.write_frame(&key).await?;
        }
        self.write_frame(record.value.as_bytes()?).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}
