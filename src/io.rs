//! Storage accessors
//!
//! Everything the engine stores goes through [`Accessor`]: metadata, chunk
//! files and shard files. Keys are `/`-separated paths relative to the
//! dataset root.

use crate::compression::DataEncoding;
use crate::config::AccessorOptions;
use crate::error::{PrecomputedError, Result};
use crate::layout::ChunkKeyLayout;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::fs;

/// Prefix of in-progress files; never listed and never read
pub const TEMP_FILE_PREFIX: &str = ".tmp-";

const GZIP_SUFFIX: &str = ".gz";

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// Read-only HTTP(S) server
    Http,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        let url = strip_precomputed_prefix(url);
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "http" | "https" => Ok(StorageBackend::Http),
                _ => Err(PrecomputedError::InvalidUrl(format!("Unknown scheme: {}", scheme))),
            }
        } else {
            // Assume file system if no scheme
            Ok(StorageBackend::FileSystem)
        }
    }
}

fn strip_precomputed_prefix(url: &str) -> &str {
    url.strip_prefix("precomputed://").unwrap_or(url)
}

/// Per-write options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOptions {
    /// Allow the accessor to gzip the stored file
    pub compress: bool,
    /// Replace an existing value instead of failing
    pub overwrite: bool,
}

impl WriteOptions {
    pub fn new(compress: bool, overwrite: bool) -> Self {
        Self { compress, overwrite }
    }
}

/// Key-value view of a dataset
#[async_trait]
pub trait Accessor: Send + Sync {
    /// Whole value of `key`, `NotFound` if absent
    async fn read(&self, key: &str) -> Result<Bytes>;

    /// `len` bytes of `key` starting at `offset`
    async fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Store a value; readers never observe a partially written value
    async fn write(&self, key: &str, data: &[u8], options: WriteOptions) -> Result<()>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Keys under `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<()>;

    /// Local temporary file whose content can later be published under `key`
    fn staging_file(&self, key: &str) -> Result<NamedTempFile>;

    /// Make a fully written staging file visible under `key`
    async fn publish(&self, key: &str, file: NamedTempFile, overwrite: bool) -> Result<()> {
        let data = fs::read(file.path()).await?;
        self.write(key, &data, WriteOptions::new(false, overwrite)).await
    }

    /// Get the backend type
    fn backend(&self) -> StorageBackend;

    /// How chunk keys are laid out for writing
    fn key_layout(&self) -> ChunkKeyLayout;
}

/// File system accessor
///
/// Compressed values are stored as `<key>.gz` and reads fall back to that
/// name transparently. Every write goes through a temporary file in the
/// destination directory and a rename.
pub struct FileSystemAccessor {
    base_path: PathBuf,
    options: AccessorOptions,
}

impl FileSystemAccessor {
    pub fn new(base_path: impl AsRef<Path>, options: AccessorOptions) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            options,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the full path for a key, refusing keys that escape the base
    fn full_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if key.is_empty() || escapes {
            return Err(PrecomputedError::InvalidUrl(format!(
                "key {:?} is not a relative path inside the dataset",
                key
            )));
        }
        Ok(self.base_path.join(relative))
    }

    fn gzip_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(GZIP_SUFFIX);
        PathBuf::from(name)
    }
}

fn not_found(key: &str) -> PrecomputedError {
    PrecomputedError::NotFound(format!("key {:?}", key))
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn staging_file_for(path: &Path) -> Result<NamedTempFile> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    Ok(tempfile::Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .tempfile_in(parent)?)
}

/// Rename `file` to `path`, refusing to replace an existing file unless `overwrite`
fn persist(file: NamedTempFile, path: &Path, overwrite: bool) -> Result<()> {
    let persisted = if overwrite {
        file.persist(path)
    } else {
        file.persist_noclobber(path)
    };
    match persisted {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => Err(
            PrecomputedError::AlreadyExists(format!("{} (use overwrite)", path.display())),
        ),
        Err(err) => Err(err.error.into()),
    }
}

#[async_trait]
impl Accessor for FileSystemAccessor {
    async fn read(&self, key: &str) -> Result<Bytes> {
        let path = self.full_path(key)?;
        match fs::read(&path).await {
            Ok(data) => return Ok(Bytes::from(data)),
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
            Err(_) => {}
        }
        match fs::read(Self::gzip_path(&path)).await {
            Ok(data) => Ok(Bytes::from(DataEncoding::Gzip.decode(&data)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(not_found(key)),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes> {
        let path = self.full_path(key)?;
        let range_error = |available: u64| {
            PrecomputedError::Data(format!(
                "range {}+{} of {:?} is past its end ({} bytes)",
                offset, len, key, available
            ))
        };
        if !fs::try_exists(&path).await? {
            // gzipped values cannot be seeked into
            let data = self.read(key).await?;
            let start = usize::try_from(offset).map_err(|_| range_error(data.len() as u64))?;
            let end = start
                .checked_add(len as usize)
                .filter(|&end| end <= data.len())
                .ok_or_else(|| range_error(data.len() as u64))?;
            return Ok(data.slice(start..end));
        }
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Bytes> {
            let mut file = std::fs::File::open(&path)?;
            let available = file.metadata()?.len();
            if offset.saturating_add(len) > available {
                return Err(PrecomputedError::Data(format!(
                    "range {}+{} of {:?} is past its end ({} bytes)",
                    offset, len, key, available
                )));
            }
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; len as usize];
            file.read_exact(&mut buf)?;
            Ok(Bytes::from(buf))
        })
        .await?
    }

    async fn write(&self, key: &str, data: &[u8], options: WriteOptions) -> Result<()> {
        let path = self.full_path(key)?;
        let gzip_path = Self::gzip_path(&path);
        let (target, stale, payload) = if options.compress && self.options.gzip {
            let compressed = DataEncoding::Gzip.encode(data, self.options.compression_level)?;
            (gzip_path, path, compressed)
        } else {
            (path, gzip_path, data.to_vec())
        };
        if !options.overwrite && fs::try_exists(&stale).await? {
            return Err(PrecomputedError::AlreadyExists(format!(
                "{} (use overwrite)",
                stale.display()
            )));
        }

        let destination = target.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = staging_file_for(&destination)?;
            file.write_all(&payload)?;
            file.as_file().sync_all()?;
            persist(file, &destination, options.overwrite)
        })
        .await??;
        remove_if_exists(&stale).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.full_path(key)?;
        Ok(fs::try_exists(&path).await? || fs::try_exists(Self::gzip_path(&path)).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = if prefix.is_empty() {
            self.base_path.clone()
        } else {
            self.full_path(prefix)?
        };
        let mut keys = Vec::new();
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = read_dir.next_entry().await? {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(TEMP_FILE_PREFIX) {
                    continue;
                }
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.base_path) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let key = key.strip_suffix(GZIP_SUFFIX).map(str::to_string).unwrap_or(key);
                keys.push(key);
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.full_path(key)?;
        let plain = remove_if_exists(&path).await?;
        let gzipped = remove_if_exists(&Self::gzip_path(&path)).await?;
        if plain || gzipped {
            Ok(())
        } else {
            Err(not_found(key))
        }
    }

    fn staging_file(&self, key: &str) -> Result<NamedTempFile> {
        staging_file_for(&self.full_path(key)?)
    }

    async fn publish(&self, key: &str, file: NamedTempFile, overwrite: bool) -> Result<()> {
        let path = self.full_path(key)?;
        let stale = Self::gzip_path(&path);
        if !overwrite && fs::try_exists(&stale).await? {
            return Err(PrecomputedError::AlreadyExists(format!(
                "{} (use overwrite)",
                stale.display()
            )));
        }
        tokio::task::spawn_blocking(move || -> Result<()> {
            file.as_file().sync_all()?;
            persist(file, &path, overwrite)
        })
        .await??;
        remove_if_exists(&stale).await?;
        Ok(())
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }

    fn key_layout(&self) -> ChunkKeyLayout {
        self.options.key_layout()
    }
}

/// Parse URL and create the matching accessor
///
/// `precomputed://` prefixes are accepted. HTTP URLs need the `http-client`
/// feature.
pub async fn create_accessor(url: &str, options: AccessorOptions) -> Result<Arc<dyn Accessor>> {
    let url = strip_precomputed_prefix(url);
    match StorageBackend::from_url(url)? {
        StorageBackend::FileSystem => {
            // Extract path from file:// URL or use as-is
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Arc::new(FileSystemAccessor::new(path, options)))
        }
        #[cfg(feature = "http-client")]
        StorageBackend::Http => Ok(Arc::new(crate::http::HttpAccessor::new(url, options)?)),
        #[cfg(not(feature = "http-client"))]
        StorageBackend::Http => Err(PrecomputedError::Config(format!(
            "{} needs the http-client feature",
            url
        ))),
    }
}
