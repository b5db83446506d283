//! Read-only HTTP accessor (`http-client` feature)

use crate::compression::DataEncoding;
use crate::config::AccessorOptions;
use crate::error::{PrecomputedError, Result};
use crate::io::{Accessor, StorageBackend, WriteOptions};
use crate::layout::ChunkKeyLayout;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tempfile::NamedTempFile;

/// Accessor for a dataset published on a web server
///
/// Missing keys fall back to `<key>.gz`, like on the file system. All
/// mutating operations fail with a storage error.
pub struct HttpAccessor {
    client: Client,
    base_url: String,
    options: AccessorOptions,
}

impl HttpAccessor {
    pub fn new(base_url: &str, options: AccessorOptions) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| PrecomputedError::Storage(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            options,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    /// Body of `url`, `None` on 404
    async fn get(&self, url: &str, range: Option<(u64, u64)>) -> Result<Option<Bytes>> {
        let mut request = self.client.get(url);
        if let Some((offset, len)) = range {
            if len == 0 {
                return Ok(Some(Bytes::new()));
            }
            request = request.header(RANGE, format!("bytes={}-{}", offset, offset + len - 1));
        }
        let response = request
            .send()
            .await
            .map_err(|e| PrecomputedError::Storage(format!("GET {} failed: {}", url, e)))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| PrecomputedError::Storage(format!("GET {} failed: {}", url, e)))?;
                match range {
                    // server ignored the Range header
                    Some((offset, len)) if status == StatusCode::OK => {
                        slice_range(body, offset, len, url).map(Some)
                    }
                    _ => Ok(Some(body)),
                }
            }
            status => Err(PrecomputedError::Storage(format!("GET {} returned {}", url, status))),
        }
    }

    fn read_only(&self, operation: &str) -> PrecomputedError {
        PrecomputedError::Storage(format!(
            "{} is not supported, {} is read-only",
            operation, self.base_url
        ))
    }
}

fn slice_range(body: Bytes, offset: u64, len: u64, url: &str) -> Result<Bytes> {
    let end = offset.saturating_add(len);
    if end > body.len() as u64 {
        return Err(PrecomputedError::Data(format!(
            "range {}+{} of {} is past its end ({} bytes)",
            offset,
            len,
            url,
            body.len()
        )));
    }
    Ok(body.slice(offset as usize..end as usize))
}

#[async_trait]
impl Accessor for HttpAccessor {
    async fn read(&self, key: &str) -> Result<Bytes> {
        if let Some(body) = self.get(&self.url(key), None).await? {
            return Ok(body);
        }
        match self.get(&format!("{}.gz", self.url(key)), None).await? {
            Some(body) => Ok(Bytes::from(DataEncoding::Gzip.decode(&body)?)),
            None => Err(PrecomputedError::NotFound(format!("key {:?}", key))),
        }
    }

    async fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes> {
        match self.get(&self.url(key), Some((offset, len))).await? {
            Some(body) => Ok(body),
            None => {
                let data = self.read(key).await?;
                slice_range(data, offset, len, &self.url(key))
            }
        }
    }

    async fn write(&self, _key: &str, _data: &[u8], _options: WriteOptions) -> Result<()> {
        Err(self.read_only("write"))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        for url in [self.url(key), format!("{}.gz", self.url(key))] {
            let response = self
                .client
                .head(&url)
                .send()
                .await
                .map_err(|e| PrecomputedError::Storage(format!("HEAD {} failed: {}", url, e)))?;
            if response.status().is_success() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        Err(self.read_only("list"))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(self.read_only("delete"))
    }

    fn staging_file(&self, _key: &str) -> Result<NamedTempFile> {
        Err(self.read_only("publish"))
    }

    async fn publish(&self, _key: &str, _file: NamedTempFile, _overwrite: bool) -> Result<()> {
        Err(self.read_only("publish"))
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Http
    }

    fn key_layout(&self) -> ChunkKeyLayout {
        self.options.key_layout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let io = HttpAccessor::new("https://example.org/data/", AccessorOptions::default()).unwrap();
        assert_eq!(io.url("info"), "https://example.org/data/info");
        assert_eq!(io.url("/8nm/0-64_0-64_0-64"), "https://example.org/data/8nm/0-64_0-64_0-64");
        assert_eq!(io.backend(), StorageBackend::Http);
    }

    #[tokio::test]
    async fn test_writes_are_refused() {
        let io = HttpAccessor::new("https://example.org/data", AccessorOptions::default()).unwrap();
        assert!(matches!(
            io.write("info", b"{}", WriteOptions::default()).await,
            Err(PrecomputedError::Storage(_))
        ));
        assert!(io.staging_file("0.shard").is_err());
    }

    #[test]
    fn test_slice_range() {
        let body = Bytes::from_static(b"0123456789");
        assert_eq!(&slice_range(body.clone(), 2, 3, "u").unwrap()[..], b"234");
        assert!(slice_range(body, 8, 3, "u").is_err());
    }
}
