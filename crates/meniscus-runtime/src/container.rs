//! Binary dataset containers for checkpoints and time series.
//!
//! A container maps stable string keys (`mesh/topology`,
//! `<subproblem>/current`, ...) to sharded numeric datasets. Writes are
//! collective: every rank contributes its local shard, the root gathers
//! and keeps the concatenation together with the per-rank shard counts,
//! and only the root touches the filesystem. Reads are independent:
//! every rank opens the file and slices out its own shard, which is
//! safe because the file is immutable once committed.
//!
//! On-disk form: bincode, zstd-compressed, behind a format version.
//! Portable and compact, not human-readable.
//!
//! The same codec carries time-series data as a stream of
//! length-prefixed *frames*, one dataset per frame, so a series file
//! can grow by append without rewriting history.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::mesh::Mesh;

/// Container format version (increment on breaking changes).
pub const CONTAINER_VERSION: u32 = 1;

/// zstd level used for every container payload.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Dataset key of the mesh connectivity.
pub const MESH_TOPOLOGY_KEY: &str = "mesh/topology";

/// Dataset key of the mesh coordinates.
pub const MESH_GEOMETRY_KEY: &str = "mesh/geometry";

/// A sharded numeric dataset.
///
/// `counts[r]` is the number of values rank `r` contributed; `values`
/// is the rank-ordered concatenation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Dataset {
    /// Floating-point data (field values, coordinates).
    Float64 {
        /// Per-rank shard lengths, in rank order.
        counts: Vec<u64>,
        /// Concatenated shards.
        values: Vec<f64>,
    },
    /// Index data (mesh connectivity).
    UInt64 {
        /// Per-rank shard lengths, in rank order.
        counts: Vec<u64>,
        /// Concatenated shards.
        values: Vec<u64>,
    },
}

impl Dataset {
    pub(crate) fn from_f64_shards(shards: Vec<Vec<f64>>) -> Self {
        let counts = shards.iter().map(|s| s.len() as u64).collect();
        let values = shards.into_iter().flatten().collect();
        Dataset::Float64 { counts, values }
    }

    pub(crate) fn from_u64_shards(shards: Vec<Vec<u64>>) -> Self {
        let counts = shards.iter().map(|s| s.len() as u64).collect();
        let values = shards.into_iter().flatten().collect();
        Dataset::UInt64 { counts, values }
    }

    /// Human-readable value kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Dataset::Float64 { .. } => "float64",
            Dataset::UInt64 { .. } => "uint64",
        }
    }

    /// Number of shards (ranks) this dataset was written by.
    pub fn shard_count(&self) -> usize {
        match self {
            Dataset::Float64 { counts, .. } | Dataset::UInt64 { counts, .. } => counts.len(),
        }
    }

    fn shard_range(counts: &[u64], rank: usize) -> std::ops::Range<usize> {
        let start: u64 = counts[..rank].iter().sum();
        let end = start + counts[rank];
        start as usize..end as usize
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ContainerFile {
    version: u32,
    datasets: IndexMap<String, Dataset>,
}

// ============================================================================
// Codec
// ============================================================================

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let serialized = bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))?;
    zstd::encode_all(&serialized[..], DEFAULT_COMPRESSION_LEVEL)
        .map_err(|e| Error::Compression(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    let serialized = zstd::decode_all(bytes).map_err(|e| Error::Decompression(e.to_string()))?;
    bincode::deserialize(&serialized).map_err(|e| Error::Deserialization(e.to_string()))
}

/// Encode one dataset as a framed payload (without the length prefix).
pub fn encode_frame(dataset: &Dataset) -> Result<Vec<u8>> {
    encode(dataset)
}

/// Decode one framed payload back into a dataset.
pub fn decode_frame(bytes: &[u8]) -> Result<Dataset> {
    decode(bytes)
}

// ============================================================================
// Collective writer
// ============================================================================

/// Accumulates gathered datasets and commits them in one file write.
///
/// Every `write_*` call is collective: all ranks must call it with the
/// same key in the same order. Only the root holds data; `close`
/// performs the single filesystem write. Callers place barriers around
/// writes according to their own protocol; the writer does not fence.
pub struct ContainerWriter<'a> {
    comm: &'a dyn Communicator,
    path: PathBuf,
    datasets: IndexMap<String, Dataset>,
}

impl<'a> ContainerWriter<'a> {
    /// Start a container destined for `path`. Nothing is written until
    /// [`ContainerWriter::close`].
    pub fn create(comm: &'a dyn Communicator, path: impl Into<PathBuf>) -> Self {
        Self {
            comm,
            path: path.into(),
            datasets: IndexMap::new(),
        }
    }

    /// Collectively write a floating-point dataset.
    pub fn write_f64(&mut self, key: impl Into<String>, local: &[f64]) {
        if let Some(shards) = self.comm.gather_f64(local) {
            self.datasets
                .insert(key.into(), Dataset::from_f64_shards(shards));
        }
    }

    /// Collectively write an index dataset.
    pub fn write_u64(&mut self, key: impl Into<String>, local: &[u64]) {
        if let Some(shards) = self.comm.gather_u64(local) {
            self.datasets
                .insert(key.into(), Dataset::from_u64_shards(shards));
        }
    }

    /// Collectively write the mesh topology and geometry datasets.
    pub fn write_mesh(&mut self, mesh: &Mesh) {
        self.write_u64(MESH_TOPOLOGY_KEY, mesh.cells());
        self.write_f64(MESH_GEOMETRY_KEY, mesh.coordinates());
    }

    /// Commit the container. Root-only filesystem work; errors
    /// propagate from the root (non-root ranks always succeed here and
    /// synchronize through the caller's barriers).
    pub fn close(self) -> Result<()> {
        if !self.comm.is_root() {
            return Ok(());
        }
        let file = ContainerFile {
            version: CONTAINER_VERSION,
            datasets: self.datasets,
        };
        let bytes = encode(&file)?;
        debug!(
            path = %self.path.display(),
            datasets = file.datasets.len(),
            bytes = bytes.len(),
            "container committed"
        );
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Read-only view of a committed container.
#[derive(Debug)]
pub struct ContainerReader {
    datasets: IndexMap<String, Dataset>,
}

impl ContainerReader {
    /// Open and fully decode a container file.
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let file: ContainerFile = decode(&bytes)?;
        if file.version != CONTAINER_VERSION {
            return Err(Error::UnsupportedContainerVersion {
                found: file.version,
                supported: CONTAINER_VERSION,
            });
        }
        Ok(Self {
            datasets: file.datasets,
        })
    }

    /// Whether a dataset key exists.
    pub fn has_dataset(&self, key: &str) -> bool {
        self.datasets.contains_key(key)
    }

    /// Raw dataset access.
    pub fn dataset(&self, key: &str) -> Option<&Dataset> {
        self.datasets.get(key)
    }

    /// This rank's shard of a floating-point dataset.
    ///
    /// `Ok(None)` when the key is absent (the caller falls back to its
    /// initial values); an error when the dataset exists but was
    /// written by a different group size or holds another value kind.
    pub fn read_f64_shard(&self, key: &str, rank: usize, size: usize) -> Result<Option<Vec<f64>>> {
        let Some(dataset) = self.datasets.get(key) else {
            return Ok(None);
        };
        match dataset {
            Dataset::Float64 { counts, values } => {
                if counts.len() != size {
                    return Err(Error::ShardCountMismatch {
                        dataset: key.to_string(),
                        written: counts.len(),
                        restoring: size,
                    });
                }
                Ok(Some(values[Dataset::shard_range(counts, rank)].to_vec()))
            }
            other => Err(Error::DatasetKindMismatch {
                dataset: key.to_string(),
                found: other.kind(),
                expected: "float64",
            }),
        }
    }

    /// This rank's shard of an index dataset.
    pub fn read_u64_shard(&self, key: &str, rank: usize, size: usize) -> Result<Option<Vec<u64>>> {
        let Some(dataset) = self.datasets.get(key) else {
            return Ok(None);
        };
        match dataset {
            Dataset::UInt64 { counts, values } => {
                if counts.len() != size {
                    return Err(Error::ShardCountMismatch {
                        dataset: key.to_string(),
                        written: counts.len(),
                        restoring: size,
                    });
                }
                Ok(Some(values[Dataset::shard_range(counts, rank)].to_vec()))
            }
            other => Err(Error::DatasetKindMismatch {
                dataset: key.to_string(),
                found: other.kind(),
                expected: "uint64",
            }),
        }
    }
}

// ============================================================================
// Frame stream
// ============================================================================

/// Append one length-prefixed frame to an open series file.
pub(crate) fn append_frame(file: &mut File, dataset: &Dataset) -> Result<()> {
    let payload = encode_frame(dataset)?;
    file.write_all(&(payload.len() as u64).to_le_bytes())?;
    file.write_all(&payload)?;
    file.flush()?;
    Ok(())
}

/// Sequential reader over a frame stream file.
pub struct FrameReader {
    reader: BufReader<File>,
}

impl FrameReader {
    /// Open a series data file for sequential frame reads.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
        })
    }

    /// Read the next frame; `Ok(None)` at a clean end of stream.
    pub fn read_frame(&mut self) -> Result<Option<Dataset>> {
        let mut len_bytes = [0u8; 8];
        match self.reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u64::from_le_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        Ok(Some(decode_frame(&payload)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{GroupComm, SoloComm};
    use tempfile::tempdir;

    #[test]
    fn test_solo_container_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fields.bin");
        let comm = SoloComm;

        let mut writer = ContainerWriter::create(&comm, &path);
        writer.write_f64("flow/current", &[1.0, 2.5, -3.0]);
        writer.write_u64(MESH_TOPOLOGY_KEY, &[0, 1, 1, 2]);
        writer.close().unwrap();

        let reader = ContainerReader::open(&path).unwrap();
        assert!(reader.has_dataset("flow/current"));
        assert_eq!(
            reader.read_f64_shard("flow/current", 0, 1).unwrap().unwrap(),
            vec![1.0, 2.5, -3.0]
        );
        assert_eq!(
            reader.read_u64_shard(MESH_TOPOLOGY_KEY, 0, 1).unwrap().unwrap(),
            vec![0, 1, 1, 2]
        );
        assert_eq!(reader.read_f64_shard("absent", 0, 1).unwrap(), None);
    }

    #[test]
    fn test_shard_count_mismatch_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fields.bin");
        let comm = SoloComm;

        let mut writer = ContainerWriter::create(&comm, &path);
        writer.write_f64("flow/current", &[1.0]);
        writer.close().unwrap();

        let reader = ContainerReader::open(&path).unwrap();
        let err = reader.read_f64_shard("flow/current", 0, 2).unwrap_err();
        assert!(matches!(err, Error::ShardCountMismatch { written: 1, restoring: 2, .. }));
    }

    #[test]
    fn test_kind_mismatch_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fields.bin");
        let comm = SoloComm;

        let mut writer = ContainerWriter::create(&comm, &path);
        writer.write_u64("cells", &[7]);
        writer.close().unwrap();

        let reader = ContainerReader::open(&path).unwrap();
        let err = reader.read_f64_shard("cells", 0, 1).unwrap_err();
        assert!(matches!(err, Error::DatasetKindMismatch { .. }));
    }

    #[test]
    fn test_group_write_keeps_rank_order_and_shards() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fields.bin");
        let comms = GroupComm::group(3);

        std::thread::scope(|scope| {
            for comm in &comms {
                let path = path.clone();
                scope.spawn(move || {
                    let shard = vec![comm.rank() as f64; 2];
                    let mut writer = ContainerWriter::create(comm, &path);
                    writer.write_f64("phase/current", &shard);
                    writer.close().unwrap();
                    comm.barrier();

                    // Every rank reads back exactly its own shard.
                    let reader = ContainerReader::open(&path).unwrap();
                    let mine = reader
                        .read_f64_shard("phase/current", comm.rank(), comm.size())
                        .unwrap()
                        .unwrap();
                    assert_eq!(mine, shard);
                });
            }
        });
    }

    #[test]
    fn test_frame_stream_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("u_from_tstep_0.bin");

        let mut file = File::create(&path).unwrap();
        let first = Dataset::Float64 {
            counts: vec![2],
            values: vec![1.0, 2.0],
        };
        let second = Dataset::UInt64 {
            counts: vec![2],
            values: vec![0, 1],
        };
        append_frame(&mut file, &first).unwrap();
        append_frame(&mut file, &second).unwrap();
        drop(file);

        let mut frames = FrameReader::open(&path).unwrap();
        assert_eq!(frames.read_frame().unwrap(), Some(first));
        assert_eq!(frames.read_frame().unwrap(), Some(second));
        assert_eq!(frames.read_frame().unwrap(), None);
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fields.bin");
        let file = ContainerFile {
            version: CONTAINER_VERSION + 1,
            datasets: IndexMap::new(),
        };
        std::fs::write(&path, encode(&file).unwrap()).unwrap();

        let err = ContainerReader::open(&path).unwrap_err();
        assert!(matches!(err, Error::UnsupportedContainerVersion { .. }));
    }
}
