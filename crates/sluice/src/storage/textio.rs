//! Line-delimited text format (`textio:`)
//!
//! One record per line. Reading yields the shard index as the key and the
//! line bytes (newline stripped) as the value; writing emits the value
//! bytes followed by a newline and ignores the key.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

use super::{ByteReader, ByteWriter, RecordFormat, RecordReader, RecordWriter, ResourceSpec};
use crate::core::{Record, RecordKey, Value};
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default)]
pub struct TextFormat;

#[async_trait]
impl RecordFormat for TextFormat {
    async fn open_reader(&self, rc: &ResourceSpec, shard: usize) -> Result<Box<dyn RecordReader>> {
        let raw = rc.open_raw_reader(shard).await?;
        Ok(Box::new(TextReader {
            key: RecordKey::new(shard.to_string()),
            reader: BufReader::new(raw),
        }))
    }

    async fn open_writer(&self, rc: &ResourceSpec, shard: usize) -> Result<Box<dyn RecordWriter>> {
        let raw = rc.open_raw_writer(shard).await?;
        Ok(Box::new(TextWriter {
            writer: BufWriter::new(raw),
        }))
    }
}

struct TextReader {
    key: RecordKey,
    reader: BufReader<ByteReader>,
}

#[async_trait]
impl RecordReader for TextReader {
    async fn next(&mut self) -> Result<Option<Record>> {
        let mut line = Vec::new();
        let read = self.reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        Ok(Some(Record {
            key: self.key.clone(),
            value: Value::Bytes(line),
            sort_order: 0,
        }))
    }
}

struct TextWriter {
    writer: BufWriter<ByteWriter>,
}

#[async_trait]
impl RecordWriter for TextWriter {
    async fn write(&mut self, record: &Record) -> Result<()> {
        self.writer.write_all(record.value.as_bytes()?).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn read_all(rc: &ResourceSpec) -> Vec<Record> {
        let mut reader = rc.open_reader(0).await.unwrap();
        let mut records = Vec::new();
        while let Some(record) = reader.next().await.unwrap() {
            records.push(record);
        }
        records
    }

    #[tokio::test]
    async fn test_reads_lines_with_shard_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "alpha\nbeta\r\ngamma").unwrap();
        let rc: ResourceSpec = format!("textio:{}", file.path().display()).parse().unwrap();

        let records = read_all(&rc).await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, RecordKey::from("0"));
        assert_eq!(records[0].value, Value::Bytes(b"alpha".to_vec()));
        assert_eq!(records[1].value, Value::Bytes(b"beta".to_vec()));
        assert_eq!(records[2].value, Value::Bytes(b"gamma".to_vec()));
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let rc: ResourceSpec = format!("textio:{}", path.display()).parse().unwrap();

        let mut writer = rc.open_writer(0).await.unwrap();
        for line in ["one", "two"] {
            writer
                .write(&Record::new("ignored", line.as_bytes().to_vec()))
                .await
                .unwrap();
        }
        writer.close().await.unwrap();

        let records = read_all(&rc).await;
        let lines: Vec<_> = records
            .iter()
            .map(|r| String::from_utf8(r.value.as_bytes().unwrap().to_vec()).unwrap())
            .collect();
        assert_eq!(lines, vec!["one", "two"]);
    }
}
