//! Local filesystem media (`local`)
//!
//! The default media. Special path tokens `STDIN`, `STDOUT`, and `STDERR`
//! map to the process standard streams; each one only supports its own
//! direction.

use async_trait::async_trait;
use tokio::fs::File;

use super::{ByteReader, ByteWriter, ResourceSpec, StorageMedia};
use crate::error::{Result, StorageError};

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMedia;

#[async_trait]
impl StorageMedia for LocalMedia {
    async fn open_raw_reader(&self, rc: &ResourceSpec, shard: usize) -> Result<ByteReader> {
        match rc.path.as_str() {
            "STDIN" => return Ok(Box::new(tokio::io::stdin())),
            "STDOUT" | "STDERR" => {
                return Err(StorageError::NotSupported {
                    reason: format!("cannot read from {}", rc.path),
                }
                .into())
            }
            _ => {}
        }
        let file = File::open(rc.shard_path(shard)).await?;
        Ok(Box::new(file))
    }

    async fn open_raw_writer(&self, rc: &ResourceSpec, shard: usize) -> Result<ByteWriter> {
        match rc.path.as_str() {
            "STDOUT" => return Ok(Box::new(tokio::io::stdout())),
            "STDERR" => return Ok(Box::new(tokio::io::stderr())),
            "STDIN" => {
                return Err(StorageError::NotSupported {
                    reason: "cannot write to STDIN".to_string(),
                }
                .into())
            }
            _ => {}
        }
        let file = File::create(rc.shard_path(shard)).await?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_sharded_paths_create_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let rc: ResourceSpec = format!("recordio:{}@2", dir.path().join("part").display())
            .parse()
            .unwrap();

        for shard in 0..2 {
            let mut writer = rc.open_raw_writer(shard).await.unwrap();
            writer.write_all(&[shard as u8]).await.unwrap();
            writer.shutdown().await.unwrap();
        }

        assert!(dir.path().join("part-00000-of-00002").exists());
        assert!(dir.path().join("part-00001-of-00002").exists());

        let mut buf = Vec::new();
        let mut reader = rc.open_raw_reader(1).await.unwrap();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, vec![1u8]);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let rc: ResourceSpec = "textio:/definitely/not/here.txt".parse().unwrap();
        assert!(rc.open_raw_reader(0).await.is_err());
    }

    #[tokio::test]
    async fn test_standard_streams_are_directional() {
        use crate::error::SluiceError;

        let stdin: ResourceSpec = "textio:STDIN".parse().unwrap();
        assert!(matches!(
            stdin.open_raw_writer(0).await,
            Err(SluiceError::Storage(StorageError::NotSupported { .. }))
        ));

        for path in ["textio:STDOUT", "textio:STDERR"] {
            let rc: ResourceSpec = path.parse().unwrap();
            assert!(matches!(
                rc.open_raw_reader(0).await,
                Err(SluiceError::Storage(StorageError::NotSupported { .. }))
            ));
        }
    }
}
