//! Two-pass construction of the shard files of one scale level
//!
//! Pass 1 collects the encoded bytes of every chunk, keyed by chunk id.
//! Pass 2 ([`ShardAssembler::flush`]) builds each shard in a staging file and
//! publishes it under its final name only once it is complete.
//!
//! States only move forward: `Empty -> Collecting -> Sorting -> Flushed`.

use crate::compression::CompressionLevel;
use crate::error::{PrecomputedError, Result};
use crate::io::Accessor;
use crate::sharding::{encode_minishard_index, encode_shard_index, MinishardEntry, ShardingSpec};
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, info};

/// Lifecycle of a [`ShardAssembler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Empty,
    Collecting,
    Sorting,
    /// Terminal, whether or not the flush succeeded
    Flushed,
}

/// Where the payload of one chunk is kept until flush
#[derive(Debug)]
enum Payload {
    Memory(Vec<u8>),
    Spilled { offset: u64, len: u64 },
}

/// Summary of a completed flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardReport {
    pub chunks: u64,
    pub shards: u64,
    /// Bytes of all published shard files
    pub bytes: u64,
}

/// Builder of the shard files of one scale
pub struct ShardAssembler {
    accessor: Arc<dyn Accessor>,
    scale_key: String,
    spec: ShardingSpec,
    state: AssemblerState,
    chunks: BTreeMap<u64, Payload>,
    memory_budget: u64,
    memory_used: u64,
    spill: Option<Arc<Mutex<File>>>,
    spill_len: u64,
    compression_level: CompressionLevel,
    concurrency: usize,
    overwrite: bool,
}

impl ShardAssembler {
    pub fn new(accessor: Arc<dyn Accessor>, scale_key: impl Into<String>, spec: ShardingSpec) -> Self {
        Self {
            accessor,
            scale_key: scale_key.into(),
            spec,
            state: AssemblerState::Empty,
            chunks: BTreeMap::new(),
            memory_budget: u64::MAX,
            memory_used: 0,
            spill: None,
            spill_len: 0,
            compression_level: CompressionLevel::default(),
            concurrency: 1,
            overwrite: false,
        }
    }

    /// Payload bytes kept in memory before spilling to a temporary file
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_compression_level(mut self, level: CompressionLevel) -> Self {
        self.compression_level = level;
        self
    }

    /// Shards built at the same time during flush
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn spec(&self) -> &ShardingSpec {
        &self.spec
    }

    /// Number of chunks collected so far
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// True once some payloads went to the spill file
    pub fn has_spilled(&self) -> bool {
        self.spill.is_some()
    }

    /// Add the encoded bytes of one chunk; `data_encoding` is applied here
    pub fn add_chunk(&mut self, chunk_id: u64, data: &[u8]) -> Result<()> {
        match self.state {
            AssemblerState::Empty | AssemblerState::Collecting => {}
            state => {
                return Err(PrecomputedError::Assembly(format!(
                    "cannot add chunk {} to scale {} in state {:?}",
                    chunk_id, self.scale_key, state
                )))
            }
        }
        if self.chunks.contains_key(&chunk_id) {
            return Err(PrecomputedError::Assembly(format!(
                "chunk {} added twice to scale {}",
                chunk_id, self.scale_key
            )));
        }
        let payload = self.spec.data_encoding.encode(data, self.compression_level)?;
        let len = payload.len() as u64;
        let payload = if self.memory_used.saturating_add(len) <= self.memory_budget {
            self.memory_used += len;
            Payload::Memory(payload)
        } else {
            self.spill_payload(&payload)?
        };
        self.chunks.insert(chunk_id, payload);
        self.state = AssemblerState::Collecting;
        Ok(())
    }

    fn spill_payload(&mut self, payload: &[u8]) -> Result<Payload> {
        let file = match &self.spill {
            Some(file) => file.clone(),
            None => {
                debug!(scale = %self.scale_key, "shard payloads exceed the memory budget, spilling to disk");
                let file = Arc::new(Mutex::new(tempfile::tempfile()?));
                self.spill = Some(file.clone());
                file
            }
        };
        let offset = self.spill_len;
        {
            let mut file = file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(payload)?;
        }
        self.spill_len += payload.len() as u64;
        Ok(Payload::Spilled {
            offset,
            len: payload.len() as u64,
        })
    }

    /// Build and publish every non-empty shard
    ///
    /// A shard file only appears under its final key once it is complete; on
    /// error no partial shard is left behind. The assembler is `Flushed`
    /// afterwards in either case.
    pub async fn flush(&mut self) -> Result<ShardReport> {
        match self.state {
            AssemblerState::Empty | AssemblerState::Collecting => {}
            state => {
                return Err(PrecomputedError::Assembly(format!(
                    "cannot flush scale {} in state {:?}",
                    self.scale_key, state
                )))
            }
        }
        self.state = AssemblerState::Sorting;
        let result = self.build_shards().await;
        self.state = AssemblerState::Flushed;
        self.chunks.clear();
        self.spill = None;
        result
    }

    async fn build_shards(&mut self) -> Result<ShardReport> {
        // chunk ids iterate in increasing order, so every minishard list is sorted
        let mut shards: BTreeMap<u64, BTreeMap<u64, Vec<(u64, Payload)>>> = BTreeMap::new();
        let chunks = std::mem::take(&mut self.chunks);
        let num_chunks = chunks.len() as u64;
        for (chunk_id, payload) in chunks {
            let location = self.spec.locate(chunk_id);
            shards
                .entry(location.shard)
                .or_default()
                .entry(location.minishard)
                .or_default()
                .push((chunk_id, payload));
        }

        let num_shards = shards.len() as u64;
        let jobs = shards.into_iter().map(|(shard, minishards)| {
            let key = format!("{}/{}", self.scale_key, self.spec.shard_file_name(shard));
            let job = ShardJob {
                accessor: self.accessor.clone(),
                key,
                spec: self.spec.clone(),
                compression_level: self.compression_level,
                spill: self.spill.clone(),
                minishards,
            };
            let overwrite = self.overwrite;
            async move {
                let accessor = job.accessor.clone();
                let key = job.key.clone();
                let (file, size) = tokio::task::spawn_blocking(move || job.build()).await??;
                accessor.publish(&key, file, overwrite).await?;
                debug!(shard = shard, key = %key, bytes = size, "published shard");
                Ok::<_, PrecomputedError>(size)
            }
        });
        let sizes: Vec<u64> = stream::iter(jobs)
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let report = ShardReport {
            chunks: num_chunks,
            shards: num_shards,
            bytes: sizes.iter().sum(),
        };
        info!(
            scale = %self.scale_key,
            chunks = report.chunks,
            shards = report.shards,
            bytes = report.bytes,
            "flushed shards"
        );
        Ok(report)
    }
}

/// Everything needed to write one shard off the async runtime
struct ShardJob {
    accessor: Arc<dyn Accessor>,
    key: String,
    spec: ShardingSpec,
    compression_level: CompressionLevel,
    spill: Option<Arc<Mutex<File>>>,
    minishards: BTreeMap<u64, Vec<(u64, Payload)>>,
}

impl ShardJob {
    fn read_payload(&self, payload: Payload) -> Result<Vec<u8>> {
        match payload {
            Payload::Memory(data) => Ok(data),
            Payload::Spilled { offset, len } => {
                let spill = self.spill.as_ref().ok_or_else(|| {
                    PrecomputedError::Assembly("spilled chunk without a spill file".into())
                })?;
                let mut file = spill.lock();
                file.seek(SeekFrom::Start(offset))?;
                let mut data = vec![0u8; len as usize];
                file.read_exact(&mut data)?;
                Ok(data)
            }
        }
    }

    /// Write the shard into a staging file: table placeholder, data, minishard indices, table
    fn build(mut self) -> Result<(tempfile::NamedTempFile, u64)> {
        let mut staging = self.accessor.staging_file(&self.key)?;
        let table_size = self.spec.shard_index_size();
        let num_minishards = self.spec.num_minishards() as usize;
        let minishards = std::mem::take(&mut self.minishards);

        let out = staging.as_file_mut();
        out.write_all(&vec![0u8; table_size as usize])?;

        let mut position = 0u64;
        let mut indices: Vec<(u64, Vec<MinishardEntry>)> = Vec::with_capacity(minishards.len());
        for (minishard, chunks) in minishards {
            let mut entries = Vec::with_capacity(chunks.len());
            for (chunk_id, payload) in chunks {
                let data = self.read_payload(payload)?;
                out.write_all(&data)?;
                entries.push(MinishardEntry {
                    chunk_id,
                    offset: position,
                    size: data.len() as u64,
                });
                position += data.len() as u64;
            }
            indices.push((minishard, entries));
        }

        let mut ranges = vec![(position, position); num_minishards];
        for (minishard, entries) in &indices {
            let index = encode_minishard_index(entries)?;
            let index = self
                .spec
                .minishard_index_encoding
                .encode(&index, self.compression_level)?;
            out.write_all(&index)?;
            ranges[*minishard as usize] = (position, position + index.len() as u64);
            position += index.len() as u64;
        }
        // empty minishards point at the end of the file
        for range in ranges.iter_mut() {
            if range.0 == range.1 {
                *range = (position, position);
            }
        }

        out.seek(SeekFrom::Start(0))?;
        out.write_all(&encode_shard_index(&ranges))?;
        out.flush()?;
        Ok((staging, table_size + position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::DataEncoding;
    use crate::config::AccessorOptions;
    use crate::io::FileSystemAccessor;
    use crate::sharding::{decode_minishard_index, decode_shard_index_entry, ShardReader};
    use tempfile::TempDir;

    fn accessor(dir: &TempDir) -> Arc<dyn Accessor> {
        Arc::new(FileSystemAccessor::new(dir.path(), AccessorOptions::default()))
    }

    fn payload(chunk_id: u64) -> Vec<u8> {
        vec![chunk_id as u8; 3 + chunk_id as usize % 5]
    }

    /// Decoded minishard indices of a published shard
    fn read_indices(bytes: &[u8], spec: &ShardingSpec) -> Vec<Vec<MinishardEntry>> {
        let base = spec.shard_index_size();
        (0..spec.num_minishards())
            .map(|m| {
                let at = (m * 16) as usize;
                let (start, end) = decode_shard_index_entry(&bytes[at..at + 16]).unwrap();
                if start == end {
                    return Vec::new();
                }
                let raw = &bytes[(base + start) as usize..(base + end) as usize];
                decode_minishard_index(&spec.minishard_index_encoding.decode(raw).unwrap()).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_shard_layout() {
        let temp_dir = TempDir::new().unwrap();
        let io = accessor(&temp_dir);
        let spec = ShardingSpec::new(1, 2).with_minishard_index_encoding(DataEncoding::Gzip);
        let mut assembler = ShardAssembler::new(io.clone(), "8nm", spec.clone());
        assert_eq!(assembler.state(), AssemblerState::Empty);
        for chunk_id in [13u64, 2, 7, 0, 4, 9, 1] {
            assembler.add_chunk(chunk_id, &payload(chunk_id)).unwrap();
        }
        assert_eq!(assembler.state(), AssemblerState::Collecting);
        let report = assembler.flush().await.unwrap();
        assert_eq!(assembler.state(), AssemblerState::Flushed);
        assert_eq!(report.chunks, 7);
        assert_eq!(report.shards, 2);

        for shard in 0..2u64 {
            let key = format!("8nm/{}.shard", shard);
            let bytes = io.read(&key).await.unwrap();
            let indices = read_indices(&bytes, &spec);
            let entries: Vec<MinishardEntry> = indices.iter().flatten().copied().collect();
            for minishard in &indices {
                assert!(minishard.windows(2).all(|w| w[0].chunk_id < w[1].chunk_id));
            }
            // data section is exactly the concatenated payloads
            let data_len: u64 = entries.iter().map(|e| e.size).sum();
            let first_index = indices
                .iter()
                .enumerate()
                .filter(|(_, m)| !m.is_empty())
                .map(|(m, _)| decode_shard_index_entry(&bytes[m * 16..m * 16 + 16]).unwrap().0)
                .min()
                .unwrap();
            assert_eq!(data_len, first_index);
            for entry in entries {
                assert_eq!(spec.locate(entry.chunk_id).shard, shard);
                let start = (spec.shard_index_size() + entry.offset) as usize;
                assert_eq!(&bytes[start..start + entry.size as usize], &payload(entry.chunk_id)[..]);
            }
        }

        let reader = ShardReader::new(io, "8nm", spec);
        assert_eq!(reader.read_chunk(9).await.unwrap().unwrap(), payload(9));
        assert_eq!(reader.read_chunk(3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_spilled_payloads_and_gzip_data() {
        let temp_dir = TempDir::new().unwrap();
        let io = accessor(&temp_dir);
        let spec = ShardingSpec::new(0, 1).with_data_encoding(DataEncoding::Gzip);
        let mut assembler = ShardAssembler::new(io.clone(), "16nm", spec.clone())
            .with_memory_budget(40)
            .with_concurrency(4);
        for chunk_id in 0..20u64 {
            assembler.add_chunk(chunk_id, &payload(chunk_id)).unwrap();
        }
        assert!(assembler.has_spilled());
        let report = assembler.flush().await.unwrap();
        assert_eq!(report.shards, 1);

        let reader = ShardReader::new(io, "16nm", spec);
        for chunk_id in 0..20u64 {
            assert_eq!(reader.read_chunk(chunk_id).await.unwrap().unwrap(), payload(chunk_id));
        }
    }

    #[tokio::test]
    async fn test_state_machine_is_one_way() {
        let temp_dir = TempDir::new().unwrap();
        let mut assembler = ShardAssembler::new(accessor(&temp_dir), "8nm", ShardingSpec::new(0, 0));
        assembler.add_chunk(5, b"abc").unwrap();
        assert!(matches!(
            assembler.add_chunk(5, b"def"),
            Err(PrecomputedError::Assembly(_))
        ));
        assembler.flush().await.unwrap();
        assert!(matches!(
            assembler.add_chunk(6, b"ghi"),
            Err(PrecomputedError::Assembly(_))
        ));
        assert!(matches!(assembler.flush().await, Err(PrecomputedError::Assembly(_))));
    }

    #[tokio::test]
    async fn test_failed_flush_leaves_no_shard() {
        let temp_dir = TempDir::new().unwrap();
        let io = accessor(&temp_dir);
        // an existing shard that must not be replaced
        io.write("8nm/0.shard", b"previous", Default::default()).await.unwrap();

        let mut assembler = ShardAssembler::new(io.clone(), "8nm", ShardingSpec::new(1, 0));
        assembler.add_chunk(0, b"new").unwrap();
        assembler.add_chunk(1, b"new").unwrap();
        assert!(matches!(
            assembler.flush().await,
            Err(PrecomputedError::AlreadyExists(_))
        ));
        assert_eq!(assembler.state(), AssemblerState::Flushed);
        assert_eq!(&io.read("8nm/0.shard").await.unwrap()[..], b"previous");

        // no temporary file is left next to the shards
        let names: Vec<_> = std::fs::read_dir(temp_dir.path().join("8nm"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.starts_with(crate::io::TEMP_FILE_PREFIX))
            .collect();
        assert!(names.is_empty(), "{:?}", names);
    }
}
