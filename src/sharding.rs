//! Sharded container format (`neuroglancer_uint64_sharded_v1`)
//!
//! A shard file starts with a fixed table of `2^minishard_bits` pairs of
//! little-endian `u64` `[start, end)` byte ranges, one per minishard, pointing
//! at that minishard's index. Offsets in the table and in minishard indices
//! are relative to the end of the table. Chunk data follows the table,
//! grouped by minishard, and the minishard indices come last.

use crate::compression::DataEncoding;
use crate::error::{PrecomputedError, Result};
use crate::io::Accessor;
use crate::murmur::murmurhash3_x86_128_u64;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Format tag stored under `@type`
pub const SHARDED_FORMAT_TAG: &str = "neuroglancer_uint64_sharded_v1";

/// Bytes used by one minishard in the shard index table
pub const SHARD_INDEX_ENTRY_SIZE: u64 = 16;

/// Bytes used by one chunk in a decoded minishard index
pub const MINISHARD_ENTRY_SIZE: usize = 24;

fn default_format_tag() -> String {
    SHARDED_FORMAT_TAG.to_string()
}

/// Low `bits` set, saturating at 64
fn low_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Hash applied to shifted chunk ids before bucketing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ShardHash {
    #[default]
    #[serde(rename = "identity")]
    Identity,
    #[serde(rename = "murmurhash3_x86_128")]
    MurmurHash3X86_128,
}

impl ShardHash {
    pub fn apply(&self, value: u64) -> u64 {
        match self {
            ShardHash::Identity => value,
            ShardHash::MurmurHash3X86_128 => murmurhash3_x86_128_u64(value),
        }
    }
}

impl fmt::Display for ShardHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardHash::Identity => f.write_str("identity"),
            ShardHash::MurmurHash3X86_128 => f.write_str("murmurhash3_x86_128"),
        }
    }
}

/// Sharding parameters of one scale level, as stored in `info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingSpec {
    #[serde(rename = "@type", default = "default_format_tag")]
    pub format: String,
    #[serde(default)]
    pub hash: ShardHash,
    pub minishard_bits: u32,
    pub shard_bits: u32,
    #[serde(default)]
    pub preshift_bits: u32,
    #[serde(default)]
    pub minishard_index_encoding: DataEncoding,
    #[serde(default)]
    pub data_encoding: DataEncoding,
}

/// Bucket a chunk id falls in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardLocation {
    pub shard: u64,
    pub minishard: u64,
}

impl ShardingSpec {
    /// Identity hash, no preshift, raw encodings
    pub fn new(shard_bits: u32, minishard_bits: u32) -> Self {
        Self {
            format: default_format_tag(),
            hash: ShardHash::Identity,
            minishard_bits,
            shard_bits,
            preshift_bits: 0,
            minishard_index_encoding: DataEncoding::Raw,
            data_encoding: DataEncoding::Raw,
        }
    }

    pub fn with_hash(mut self, hash: ShardHash) -> Self {
        self.hash = hash;
        self
    }

    pub fn with_preshift_bits(mut self, preshift_bits: u32) -> Self {
        self.preshift_bits = preshift_bits;
        self
    }

    pub fn with_data_encoding(mut self, encoding: DataEncoding) -> Self {
        self.data_encoding = encoding;
        self
    }

    pub fn with_minishard_index_encoding(mut self, encoding: DataEncoding) -> Self {
        self.minishard_index_encoding = encoding;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.format != SHARDED_FORMAT_TAG {
            return Err(PrecomputedError::Config(format!(
                "unsupported sharding @type {:?}, expected {:?}",
                self.format, SHARDED_FORMAT_TAG
            )));
        }
        let total = self.shard_bits as u64 + self.minishard_bits as u64 + self.preshift_bits as u64;
        if total > 64 {
            return Err(PrecomputedError::Config(format!(
                "shard_bits ({}) + minishard_bits ({}) + preshift_bits ({}) = {} exceeds 64",
                self.shard_bits, self.minishard_bits, self.preshift_bits, total
            )));
        }
        Ok(())
    }

    /// Number of shard files the level may use
    pub fn num_shards(&self) -> u64 {
        low_mask(self.shard_bits).saturating_add(1)
    }

    /// Number of minishards per shard
    pub fn num_minishards(&self) -> u64 {
        low_mask(self.minishard_bits).saturating_add(1)
    }

    /// Size in bytes of the fixed table at the start of each shard file
    pub fn shard_index_size(&self) -> u64 {
        self.num_minishards().saturating_mul(SHARD_INDEX_ENTRY_SIZE)
    }

    /// Map a chunk id to its shard and minishard
    pub fn locate(&self, chunk_id: u64) -> ShardLocation {
        let shifted = chunk_id.checked_shr(self.preshift_bits).unwrap_or(0);
        let hashed = self.hash.apply(shifted);
        ShardLocation {
            minishard: hashed & low_mask(self.minishard_bits),
            shard: hashed.checked_shr(self.minishard_bits).unwrap_or(0) & low_mask(self.shard_bits),
        }
    }

    /// File name of a shard: zero-padded lowercase hex plus `.shard`
    pub fn shard_file_name(&self, shard: u64) -> String {
        let width = ((self.shard_bits + 3) / 4) as usize;
        format!("{:0width$x}.shard", shard, width = width)
    }
}

/// Compressed Morton code over a chunk grid
///
/// Each axis contributes only `ceil(log2(grid_i))` bits; bits are interleaved
/// round-robin X, Y, Z, skipping exhausted axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAddressor {
    grid_shape: [u64; 3],
    bits: [u32; 3],
}

impl ChunkAddressor {
    pub fn new(grid_shape: [u64; 3]) -> Result<Self> {
        if grid_shape.iter().any(|&g| g == 0) {
            return Err(PrecomputedError::Config(format!(
                "chunk grid {:?} has an empty axis",
                grid_shape
            )));
        }
        let bits = grid_shape.map(|g| 64 - (g - 1).leading_zeros());
        let total: u32 = bits.iter().sum();
        if total > 64 {
            return Err(PrecomputedError::Config(format!(
                "chunk grid {:?} needs {} bits of chunk id, more than 64",
                grid_shape, total
            )));
        }
        Ok(Self { grid_shape, bits })
    }

    pub fn grid_shape(&self) -> [u64; 3] {
        self.grid_shape
    }

    /// Bits allotted to each axis
    pub fn bits(&self) -> [u32; 3] {
        self.bits
    }

    /// Chunk id of a grid index
    pub fn chunk_id(&self, grid: [u64; 3]) -> Result<u64> {
        if (0..3).any(|axis| grid[axis] >= self.grid_shape[axis]) {
            return Err(PrecomputedError::OutOfBounds(format!(
                "chunk {:?} outside grid {:?}",
                grid, self.grid_shape
            )));
        }
        let max_bits = self.bits.iter().copied().max().unwrap_or(0);
        let mut code = 0u64;
        let mut j = 0;
        for i in 0..max_bits {
            for axis in 0..3 {
                if i < self.bits[axis] {
                    code |= ((grid[axis] >> i) & 1) << j;
                    j += 1;
                }
            }
        }
        Ok(code)
    }

    /// Grid index of a chunk id
    pub fn grid_index(&self, chunk_id: u64) -> Result<[u64; 3]> {
        let max_bits = self.bits.iter().copied().max().unwrap_or(0);
        let mut grid = [0u64; 3];
        let mut j = 0u32;
        for i in 0..max_bits {
            for axis in 0..3 {
                if i < self.bits[axis] {
                    grid[axis] |= ((chunk_id >> j) & 1) << i;
                    j += 1;
                }
            }
        }
        if j < 64 && chunk_id >> j != 0 {
            return Err(PrecomputedError::OutOfBounds(format!(
                "chunk id {} uses more than {} bits",
                chunk_id, j
            )));
        }
        if (0..3).any(|axis| grid[axis] >= self.grid_shape[axis]) {
            return Err(PrecomputedError::OutOfBounds(format!(
                "chunk id {} decodes to {:?}, outside grid {:?}",
                chunk_id, grid, self.grid_shape
            )));
        }
        Ok(grid)
    }
}

/// Location of one chunk's bytes in a shard's data section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MinishardEntry {
    pub chunk_id: u64,
    /// Offset relative to the start of the data section
    pub offset: u64,
    pub size: u64,
}

/// Serialize a minishard index (entries must be sorted by chunk id)
///
/// Layout: `n` chunk id deltas, `n` offset deltas (gap after the previous
/// chunk's end), `n` sizes, all little-endian `u64`.
pub fn encode_minishard_index(entries: &[MinishardEntry]) -> Result<Vec<u8>> {
    let n = entries.len();
    let mut ids = Vec::with_capacity(n);
    let mut offsets = Vec::with_capacity(n);
    let mut sizes = Vec::with_capacity(n);
    let mut prev_id = 0u64;
    let mut prev_end = 0u64;
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 && entry.chunk_id <= prev_id {
            return Err(PrecomputedError::Assembly(format!(
                "minishard entries not strictly sorted: {} after {}",
                entry.chunk_id, prev_id
            )));
        }
        if entry.offset < prev_end {
            return Err(PrecomputedError::Assembly(format!(
                "chunk {} at offset {} overlaps the previous chunk ending at {}",
                entry.chunk_id, entry.offset, prev_end
            )));
        }
        ids.push(entry.chunk_id - prev_id);
        offsets.push(entry.offset - prev_end);
        sizes.push(entry.size);
        prev_id = entry.chunk_id;
        prev_end = entry.offset + entry.size;
    }
    let mut out = Vec::with_capacity(n * MINISHARD_ENTRY_SIZE);
    for value in ids.iter().chain(&offsets).chain(&sizes) {
        out.extend_from_slice(&value.to_le_bytes());
    }
    Ok(out)
}

/// Parse a decoded minishard index back into absolute entries
pub fn decode_minishard_index(bytes: &[u8]) -> Result<Vec<MinishardEntry>> {
    if bytes.len() % MINISHARD_ENTRY_SIZE != 0 {
        return Err(PrecomputedError::Data(format!(
            "minishard index length {} is not a multiple of {}",
            bytes.len(),
            MINISHARD_ENTRY_SIZE
        )));
    }
    let n = bytes.len() / MINISHARD_ENTRY_SIZE;
    let words: Vec<u64> = bytes
        .chunks_exact(8)
        .map(|w| u64::from_le_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]]))
        .collect();
    let overflow = || PrecomputedError::Data("minishard index offsets overflow u64".into());
    let mut entries = Vec::with_capacity(n);
    let mut chunk_id = 0u64;
    let mut end = 0u64;
    for i in 0..n {
        chunk_id = chunk_id.checked_add(words[i]).ok_or_else(overflow)?;
        let offset = end.checked_add(words[n + i]).ok_or_else(overflow)?;
        let size = words[2 * n + i];
        end = offset.checked_add(size).ok_or_else(overflow)?;
        entries.push(MinishardEntry {
            chunk_id,
            offset,
            size,
        });
    }
    Ok(entries)
}

/// Serialize the fixed shard index table from per-minishard `[start, end)` ranges
pub fn encode_shard_index(ranges: &[(u64, u64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ranges.len() * SHARD_INDEX_ENTRY_SIZE as usize);
    for (start, end) in ranges {
        out.extend_from_slice(&start.to_le_bytes());
        out.extend_from_slice(&end.to_le_bytes());
    }
    out
}

/// Parse one 16-byte shard index table entry
pub fn decode_shard_index_entry(bytes: &[u8]) -> Result<(u64, u64)> {
    if bytes.len() != SHARD_INDEX_ENTRY_SIZE as usize {
        return Err(PrecomputedError::Data(format!(
            "shard index entry has {} bytes, expected {}",
            bytes.len(),
            SHARD_INDEX_ENTRY_SIZE
        )));
    }
    let mut start = [0u8; 8];
    let mut end = [0u8; 8];
    start.copy_from_slice(&bytes[..8]);
    end.copy_from_slice(&bytes[8..]);
    let (start, end) = (u64::from_le_bytes(start), u64::from_le_bytes(end));
    if end < start {
        return Err(PrecomputedError::Data(format!(
            "shard index entry has end {} before start {}",
            end, start
        )));
    }
    Ok((start, end))
}

/// Reads chunks out of published shard files
///
/// At most two index fetches per chunk: the shard index table entry, then the
/// minishard index (cached per minishard).
pub struct ShardReader {
    accessor: Arc<dyn Accessor>,
    scale_key: String,
    spec: ShardingSpec,
    minishard_cache: RwLock<HashMap<ShardLocation, Arc<Vec<MinishardEntry>>>>,
}

impl ShardReader {
    pub fn new(accessor: Arc<dyn Accessor>, scale_key: impl Into<String>, spec: ShardingSpec) -> Self {
        Self {
            accessor,
            scale_key: scale_key.into(),
            spec,
            minishard_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn spec(&self) -> &ShardingSpec {
        &self.spec
    }

    /// Storage key of a shard file
    pub fn shard_key(&self, shard: u64) -> String {
        format!("{}/{}", self.scale_key, self.spec.shard_file_name(shard))
    }

    /// Decoded minishard index, `None` when the shard or minishard is absent
    pub async fn minishard_index(
        &self,
        location: ShardLocation,
    ) -> Result<Option<Arc<Vec<MinishardEntry>>>> {
        let cached = self.minishard_cache.read().get(&location).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        let key = self.shard_key(location.shard);
        let table_entry = match self
            .accessor
            .read_range(&key, location.minishard * SHARD_INDEX_ENTRY_SIZE, SHARD_INDEX_ENTRY_SIZE)
            .await
        {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        let (start, end) = decode_shard_index_entry(&table_entry)?;
        if start == end {
            return Ok(None);
        }
        let base = self.spec.shard_index_size();
        let raw = self.accessor.read_range(&key, base + start, end - start).await?;
        let decoded = self.spec.minishard_index_encoding.decode(&raw)?;
        let entries = Arc::new(decode_minishard_index(&decoded)?);
        self.minishard_cache.write().insert(location, entries.clone());
        Ok(Some(entries))
    }

    /// Decoded bytes of one chunk, `None` if it was never written
    pub async fn read_chunk(&self, chunk_id: u64) -> Result<Option<Vec<u8>>> {
        let location = self.spec.locate(chunk_id);
        let entries = match self.minishard_index(location).await? {
            Some(entries) => entries,
            None => return Ok(None),
        };
        let entry = match entries.binary_search_by_key(&chunk_id, |e| e.chunk_id) {
            Ok(i) => entries[i],
            Err(_) => return Ok(None),
        };
        let key = self.shard_key(location.shard);
        let base = self.spec.shard_index_size();
        let raw = self
            .accessor
            .read_range(&key, base + entry.offset, entry.size)
            .await?;
        Ok(Some(self.spec.data_encoding.decode(&raw)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_compressed_morton_code() {
        let addressor = ChunkAddressor::new([100, 100, 100]).unwrap();
        assert_eq!(addressor.chunk_id([0, 0, 0]).unwrap(), 0);
        assert_eq!(addressor.chunk_id([2, 0, 0]).unwrap(), 0x8);
        assert_eq!(addressor.chunk_id([1, 1, 1]).unwrap(), 0x7);

        // Y has a single chunk, so X and Z alternate
        let flat = ChunkAddressor::new([4, 1, 4]).unwrap();
        assert_eq!(flat.bits(), [2, 0, 2]);
        assert_eq!(flat.chunk_id([1, 0, 0]).unwrap(), 0b0001);
        assert_eq!(flat.chunk_id([0, 0, 1]).unwrap(), 0b0010);
        assert_eq!(flat.chunk_id([2, 0, 0]).unwrap(), 0b0100);

        // X keeps going after the short axes are exhausted
        let long = ChunkAddressor::new([16, 2, 1]).unwrap();
        assert_eq!(long.chunk_id([0b1010, 1, 0]).unwrap(), 0b10100 | 0b10);
    }

    #[test]
    fn test_morton_is_bijective() {
        for shape in [[5, 3, 2], [1, 1, 1], [7, 1, 9], [16, 16, 4]] {
            let addressor = ChunkAddressor::new(shape).unwrap();
            let mut seen = HashSet::new();
            for z in 0..shape[2] {
                for y in 0..shape[1] {
                    for x in 0..shape[0] {
                        let id = addressor.chunk_id([x, y, z]).unwrap();
                        assert!(seen.insert(id), "collision for {:?}", [x, y, z]);
                        assert_eq!(addressor.grid_index(id).unwrap(), [x, y, z]);
                    }
                }
            }
        }
    }

    #[test]
    fn test_morton_rejects_out_of_grid() {
        let addressor = ChunkAddressor::new([3, 3, 3]).unwrap();
        assert!(addressor.chunk_id([3, 0, 0]).is_err());
        assert!(ChunkAddressor::new([0, 1, 1]).is_err());
        assert!(ChunkAddressor::new([1 << 22, 1 << 22, 1 << 22]).is_err());
    }

    #[test]
    fn test_identity_bucket_table() {
        // 4x4x1 grid: id = x0 | y0 << 1 | x1 << 2 | y1 << 3
        let addressor = ChunkAddressor::new([4, 4, 1]).unwrap();
        let spec = ShardingSpec::new(2, 1);
        let expected: [[(u64, u64); 4]; 4] = [
            // y = 0: (shard, minishard) for x = 0..4
            [(0, 0), (0, 1), (2, 0), (2, 1)],
            [(1, 0), (1, 1), (3, 0), (3, 1)],
            [(0, 0), (0, 1), (2, 0), (2, 1)],
            [(1, 0), (1, 1), (3, 0), (3, 1)],
        ];
        for y in 0..4u64 {
            for x in 0..4u64 {
                let id = addressor.chunk_id([x, y, 0]).unwrap();
                let loc = spec.locate(id);
                assert_eq!(
                    (loc.shard, loc.minishard),
                    expected[y as usize][x as usize],
                    "chunk ({}, {})",
                    x,
                    y
                );
            }
        }
    }

    #[test]
    fn test_preshift_and_hash() {
        let spec = ShardingSpec::new(1, 1).with_preshift_bits(2);
        assert_eq!(spec.locate(0b1100), ShardLocation { shard: 1, minishard: 1 });
        assert_eq!(spec.locate(0b0011), ShardLocation { shard: 0, minishard: 0 });

        let hashed = ShardingSpec::new(3, 2).with_hash(ShardHash::MurmurHash3X86_128);
        let h = murmurhash3_x86_128_u64(77);
        let loc = hashed.locate(77);
        assert_eq!(loc.minishard, h & 0b11);
        assert_eq!(loc.shard, (h >> 2) & 0b111);
    }

    #[test]
    fn test_shard_file_names() {
        assert_eq!(ShardingSpec::new(0, 3).shard_file_name(0), "0.shard");
        assert_eq!(ShardingSpec::new(4, 0).shard_file_name(10), "a.shard");
        assert_eq!(ShardingSpec::new(9, 0).shard_file_name(0x1f), "01f.shard");
    }

    #[test]
    fn test_validate_bit_budget() {
        assert!(ShardingSpec::new(30, 30).with_preshift_bits(4).validate().is_ok());
        let err = ShardingSpec::new(30, 30).with_preshift_bits(5).validate();
        assert!(matches!(err, Err(PrecomputedError::Config(_))));

        let mut spec = ShardingSpec::new(1, 1);
        spec.format = "neuroglancer_legacy".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_sharding_json() {
        let json = r#"{"@type":"neuroglancer_uint64_sharded_v1","hash":"murmurhash3_x86_128",
            "minishard_bits":6,"shard_bits":15,"preshift_bits":9,
            "minishard_index_encoding":"gzip","data_encoding":"raw"}"#;
        let spec: ShardingSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.hash, ShardHash::MurmurHash3X86_128);
        assert_eq!(spec.minishard_index_encoding, DataEncoding::Gzip);
        assert_eq!(spec.shard_index_size(), 64 * 16);
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["@type"], SHARDED_FORMAT_TAG);
    }

    #[test]
    fn test_minishard_index_layout() {
        let entries = vec![
            MinishardEntry { chunk_id: 5, offset: 0, size: 10 },
            MinishardEntry { chunk_id: 9, offset: 10, size: 4 },
            MinishardEntry { chunk_id: 12, offset: 20, size: 1 },
        ];
        let bytes = encode_minishard_index(&entries).unwrap();
        let words: Vec<u64> = bytes
            .chunks_exact(8)
            .map(|w| u64::from_le_bytes(w.try_into().unwrap()))
            .collect();
        assert_eq!(words, vec![5, 4, 3, 0, 0, 6, 10, 4, 1]);
        assert_eq!(decode_minishard_index(&bytes).unwrap(), entries);

        let unsorted = [entries[1], entries[0]];
        assert!(encode_minishard_index(&unsorted).is_err());
        assert!(decode_minishard_index(&bytes[..23]).is_err());
    }

    #[test]
    fn test_shard_index_entry() {
        let table = encode_shard_index(&[(0, 24), (24, 24)]);
        assert_eq!(table.len(), 32);
        assert_eq!(decode_shard_index_entry(&table[..16]).unwrap(), (0, 24));
        assert_eq!(decode_shard_index_entry(&table[16..]).unwrap(), (24, 24));
        let backwards = encode_shard_index(&[(8, 4)]);
        assert!(decode_shard_index_entry(&backwards).is_err());
    }
}
