//! External resource specification and storage adapter registries
//!
//! A resource is addressed by a compact path `format:[/media]path[@shards]`
//! along two orthogonal axes: *format* (how records are laid out in a byte
//! stream) and *media* (where the bytes live). Formats and media register
//! under global names; the core composes them and never looks inside.

pub mod local;
pub mod recordio;
pub mod textio;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::Record;
use crate::error::{Result, SluiceError, StorageError};

pub use local::LocalMedia;
pub use recordio::RecordIoFormat;
pub use textio::TextFormat;

const LOCAL_MEDIA: &str = "local";

/// Byte stream for a single shard of a resource.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reads one record at a time from a shard. Implementations are not
/// required to be concurrent-safe; callers stop after the first error.
#[async_trait]
pub trait RecordReader: Send {
    /// Next record, or `None` at end of stream.
    async fn next(&mut self) -> Result<Option<Record>>;
}

/// Writes records to a shard. `close` flushes and releases the sink;
/// writing after close is a contract violation.
#[async_trait]
pub trait RecordWriter: Send {
    async fn write(&mut self, record: &Record) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// How records are laid out in a byte stream. Implementations normally
/// build on the media byte streams of the spec they are given.
#[async_trait]
pub trait RecordFormat: Send + Sync {
    async fn open_reader(&self, rc: &ResourceSpec, shard: usize) -> Result<Box<dyn RecordReader>>;

    async fn open_writer(&self, rc: &ResourceSpec, shard: usize) -> Result<Box<dyn RecordWriter>>;
}

/// Where bytes live. A media may point at a local file, a remote object, or
/// something that is not persistent storage at all.
#[async_trait]
pub trait StorageMedia: Send + Sync {
    async fn open_raw_reader(&self, rc: &ResourceSpec, shard: usize) -> Result<ByteReader>;

    async fn open_raw_writer(&self, rc: &ResourceSpec, shard: usize) -> Result<ByteWriter>;
}

/// Specification of an external data source or destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub format: String,
    pub media: String,
    pub path: String,
    /// 0 means unsharded.
    pub num_shards: usize,
}

impl ResourceSpec {
    pub fn sharded(&self) -> bool {
        self.num_shards > 0
    }

    /// Number of physical shards to iterate: 1 when unsharded.
    pub fn shard_count(&self) -> usize {
        self.num_shards.max(1)
    }

    /// Per-shard path `{path}-{shard:05}-of-{total:05}`; the unsharded path
    /// is returned as is.
    pub fn shard_path(&self, shard: usize) -> String {
        if !self.sharded() {
            return self.path.clone();
        }
        format!("{}-{:05}-of-{:05}", self.path, shard, self.num_shards)
    }

    pub async fn open_reader(&self, shard: usize) -> Result<Box<dyn RecordReader>> {
        lookup_format(&self.format)?.open_reader(self, shard).await
    }

    pub async fn open_writer(&self, shard: usize) -> Result<Box<dyn RecordWriter>> {
        lookup_format(&self.format)?.open_writer(self, shard).await
    }

    pub async fn open_raw_reader(&self, shard: usize) -> Result<ByteReader> {
        lookup_media(&self.media)?.open_raw_reader(self, shard).await
    }

    pub async fn open_raw_writer(&self, shard: usize) -> Result<ByteWriter> {
        lookup_media(&self.media)?.open_raw_writer(self, shard).await
    }
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format)?;
        if self.media != LOCAL_MEDIA {
            write!(f, "/{}", self.media)?;
        }
        write!(f, "{}", self.path)?;
        if self.sharded() {
            write!(f, "@{}", self.num_shards)?;
        }
        Ok(())
    }
}

impl FromStr for ResourceSpec {
    type Err = SluiceError;

    /// Parse `format:[/media]path[@shards]`. When the path begins with `/`
    /// and its leading segment names a registered media, that media is
    /// used; otherwise the media defaults to `local`. Do not name a media
    /// after a well-known UNIX root directory.
    fn from_str(s: &str) -> Result<Self> {
        let malformed = || StorageError::MalformedPath {
            path: s.to_string(),
        };
        if s.chars().any(char::is_whitespace) {
            return Err(malformed().into());
        }
        let (format, rest) = s.split_once(':').ok_or_else(malformed)?;
        if format.is_empty() || rest.is_empty() {
            return Err(malformed().into());
        }

        let (mut path, num_shards) = match rest.rsplit_once('@') {
            Some((path, shards)) => {
                let count: usize = shards.parse().map_err(|_| malformed())?;
                (path.to_string(), count)
            }
            None => (rest.to_string(), 0),
        };
        if path.is_empty() || path.contains('@') {
            return Err(malformed().into());
        }

        let mut media = LOCAL_MEDIA.to_string();
        if let Some(stripped) = path.strip_prefix('/') {
            if let Some((head, tail)) = stripped.split_once('/') {
                if media_registered(head) {
                    media = head.to_string();
                    path = format!("/{}", tail);
                }
            }
        }

        Ok(ResourceSpec {
            format: format.to_string(),
            media,
            path,
            num_shards,
        })
    }
}

type FormatMap = RwLock<HashMap<String, Arc<dyn RecordFormat>>>;
type MediaMap = RwLock<HashMap<String, Arc<dyn StorageMedia>>>;

fn format_registry() -> &'static FormatMap {
    static FORMATS: OnceLock<FormatMap> = OnceLock::new();
    FORMATS.get_or_init(|| {
        let mut map: HashMap<String, Arc<dyn RecordFormat>> = HashMap::new();
        map.insert("textio".to_string(), Arc::new(TextFormat));
        map.insert(
            "recordio".to_string(),
            Arc::new(RecordIoFormat::values_only()),
        );
        map.insert(
            "recordkv".to_string(),
            Arc::new(RecordIoFormat::keyed()),
        );
        RwLock::new(map)
    })
}

fn media_registry() -> &'static MediaMap {
    static MEDIA: OnceLock<MediaMap> = OnceLock::new();
    MEDIA.get_or_init(|| {
        let mut map: HashMap<String, Arc<dyn StorageMedia>> = HashMap::new();
        map.insert(LOCAL_MEDIA.to_string(), Arc::new(LocalMedia));
        RwLock::new(map)
    })
}

/// Register a storage format under a global name; a setup-phase operation.
pub fn register_format(name: &str, format: Arc<dyn RecordFormat>) -> Result<()> {
    let mut formats = format_registry().write();
    if formats.contains_key(name) {
        return Err(StorageError::DuplicateName {
            name: name.to_string(),
        }
        .into());
    }
    formats.insert(name.to_string(), format);
    Ok(())
}

/// Register a storage media under a global name; a setup-phase operation.
pub fn register_media(name: &str, media: Arc<dyn StorageMedia>) -> Result<()> {
    let mut registry = media_registry().write();
    if registry.contains_key(name) {
        return Err(StorageError::DuplicateName {
            name: name.to_string(),
        }
        .into());
    }
    registry.insert(name.to_string(), media);
    Ok(())
}

fn media_registered(name: &str) -> bool {
    media_registry().read().contains_key(name)
}

fn lookup_format(name: &str) -> Result<Arc<dyn RecordFormat>> {
    format_registry()
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| {
            StorageError::UnknownFormat {
                name: name.to_string(),
            }
            .into()
        })
}

fn lookup_media(name: &str) -> Result<Arc<dyn StorageMedia>> {
    media_registry()
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| {
            StorageError::UnknownMedia {
                name: name.to_string(),
            }
            .into()
        })
}

/// Parse or panic; for statically known paths in job setup code.
pub fn must_parse(path: &str) -> ResourceSpec {
    match path.parse() {
        Ok(spec) => spec,
        Err(err) => panic!("invalid resource path '{}': {}", path, err),
    }
}
