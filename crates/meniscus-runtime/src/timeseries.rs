//! Append-only per-field snapshot series.
//!
//! A series is the low-frequency, inspection-oriented record of one
//! field, distinct from checkpoints: entries accumulate monotonically
//! for the life of one run directory and are never rewritten. Each
//! series owns a frame file (`<field>_from_tstep_<N>.bin`) and a
//! companion index document (`<field>_from_tstep_<N>.json`, format in
//! [`crate::index`]).
//!
//! The `_from_tstep_<N>` tag is what makes restarts safe: a resumed run
//! opens fresh series files for its own step range instead of appending
//! into (and possibly corrupting) the previous segment's files.
//!
//! Mesh topology and geometry are written once, as the first two
//! frames, when the series opens, and not re-serialized on every append.
//! Every append is flushed immediately: durability over throughput.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::comm::Communicator;
use crate::container::{append_frame, Dataset};
use crate::error::{Error, Result};
use crate::index::{write_index_document, IndexDocument, IndexEntry};
use crate::mesh::Mesh;
use crate::storage::{SolutionStorage, SubproblemLayout};

/// One open, append-only snapshot series for a single field.
///
/// All operations are collective: every rank calls [`SnapshotSeries::append`]
/// with its local shard, and only the root touches the filesystem.
pub struct SnapshotSeries {
    comm: Arc<dyn Communicator>,
    field: String,
    data_file_name: String,
    data_path: PathBuf,
    index_path: PathBuf,
    /// Root-only append handle; `None` on every other rank.
    file: Option<File>,
    /// Root-only accumulated index document.
    doc: IndexDocument,
    seq: u64,
}

impl SnapshotSeries {
    /// Open a fresh series for `field` in `dir`, tagged with the
    /// current step count, and write the mesh frames.
    pub fn open(
        comm: Arc<dyn Communicator>,
        dir: &Path,
        field: &str,
        tstep: u64,
        mesh: &Mesh,
    ) -> Result<Self> {
        let data_file_name = format!("{field}_from_tstep_{tstep}.bin");
        let data_path = dir.join(&data_file_name);
        let index_path = dir.join(format!("{field}_from_tstep_{tstep}.json"));

        let topology = comm.gather_u64(mesh.cells());
        let geometry = comm.gather_f64(mesh.coordinates());

        let doc = IndexDocument {
            field: field.to_string(),
            from_tstep: tstep,
            entries: Vec::new(),
            times: Vec::new(),
        };

        let file = if comm.is_root() {
            let mut f = File::create(&data_path)?;
            let topology = topology.expect("root receives the gather result");
            let geometry = geometry.expect("root receives the gather result");
            append_frame(&mut f, &Dataset::from_u64_shards(topology))?;
            append_frame(&mut f, &Dataset::from_f64_shards(geometry))?;
            write_index_document(&doc, &index_path)?;
            debug!(field, path = %data_path.display(), "snapshot series opened");
            Some(f)
        } else {
            None
        };

        Ok(Self {
            comm,
            field: field.to_string(),
            data_file_name,
            data_path,
            index_path,
            file,
            doc,
            seq: 0,
        })
    }

    /// Field this series records.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Path of the frame file.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Path of the companion index document.
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Collectively append one snapshot with its timestamp.
    ///
    /// The root appends a frame, flushes, and rewrites the index with
    /// the grown entry list; the first entry carries the mesh dataset
    /// addresses.
    pub fn append(&mut self, t: f64, local: &[f64]) -> Result<()> {
        let shards = self.comm.gather_f64(local);
        if let Some(shards) = shards {
            let file = self
                .file
                .as_mut()
                .expect("root holds the series file handle");
            append_frame(file, &Dataset::from_f64_shards(shards))?;

            let mut entry = IndexEntry {
                time: Some(t),
                dataset: format!("{}:/{}/{}", self.data_file_name, self.field, self.seq),
                topology: None,
                geometry: None,
            };
            if self.doc.entries.is_empty() {
                entry.topology = Some(format!("{}:/mesh/topology", self.data_file_name));
                entry.geometry = Some(format!("{}:/mesh/geometry", self.data_file_name));
            }
            self.doc.entries.push(entry);
            write_index_document(&self.doc, &self.index_path)?;
        }
        self.seq += 1;
        Ok(())
    }
}

/// Append one snapshot of every registered field.
///
/// Fields of a multi-field subproblem are extracted as component
/// blocks and tagged with their own names; a single-field subproblem
/// appends its whole buffer. Fields without an open series were not
/// registered as of interest and are skipped silently; that is not an
/// error. Collective: all ranks must call with identical layouts and
/// series maps.
pub fn save_snapshot(
    t: f64,
    state: &SolutionStorage,
    layout: &SubproblemLayout,
    series: &mut IndexMap<String, SnapshotSeries>,
) -> Result<()> {
    for (subproblem, fields) in layout.iter() {
        let Some(buffer) = state.current(subproblem) else {
            continue;
        };
        if fields.len() > 1 {
            for decl in fields {
                let Some(handle) = series.get_mut(&decl.name) else {
                    continue;
                };
                let block = layout
                    .component_slice(subproblem, &decl.name, buffer)
                    .ok_or_else(|| {
                        Error::Shape(format!(
                            "buffer of subproblem {subproblem} does not decompose into its declared fields"
                        ))
                    })?;
                handle.append(t, block)?;
            }
        } else if let Some(decl) = fields.first() {
            if let Some(handle) = series.get_mut(&decl.name) {
                handle.append(t, buffer)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SoloComm;
    use crate::container::FrameReader;
    use crate::index::parse_series_index;
    use crate::storage::FieldDecl;
    use tempfile::tempdir;

    fn solo() -> Arc<dyn Communicator> {
        Arc::new(SoloComm)
    }

    fn line_mesh(comm: &dyn Communicator) -> Mesh {
        Mesh::interval(comm, 4, 0.0, 1.0).unwrap()
    }

    #[test]
    fn test_series_appends_and_index_tracks_entries() {
        let dir = tempdir().unwrap();
        let comm = solo();
        let mesh = line_mesh(&*comm);
        let mut series = SnapshotSeries::open(Arc::clone(&comm), dir.path(), "u", 0, &mesh).unwrap();

        series.append(0.0, &[1.0; 5]).unwrap();
        series.append(0.1, &[2.0; 5]).unwrap();

        let parsed = parse_series_index(series.index_path(), true).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].0, 0.0);
        assert_eq!(parsed.entries[1].0, 0.1);
        assert!(parsed.entries[0].1.ends_with(":/u/0"));
        assert!(parsed.entries[1].1.ends_with(":/u/1"));
        assert!(parsed.topology.unwrap().ends_with(":/mesh/topology"));
        assert!(parsed.geometry.unwrap().ends_with(":/mesh/geometry"));
    }

    #[test]
    fn test_mesh_frames_written_once_then_data_frames() {
        let dir = tempdir().unwrap();
        let comm = solo();
        let mesh = line_mesh(&*comm);
        let mut series = SnapshotSeries::open(Arc::clone(&comm), dir.path(), "u", 0, &mesh).unwrap();
        series.append(0.0, &[3.0; 5]).unwrap();
        series.append(0.1, &[4.0; 5]).unwrap();

        let mut frames = FrameReader::open(series.data_path()).unwrap();
        // Frame 0: topology, frame 1: geometry, then one frame per append.
        assert!(matches!(frames.read_frame().unwrap(), Some(Dataset::UInt64 { .. })));
        assert!(matches!(frames.read_frame().unwrap(), Some(Dataset::Float64 { .. })));
        match frames.read_frame().unwrap() {
            Some(Dataset::Float64 { values, .. }) => assert_eq!(values, vec![3.0; 5]),
            other => panic!("expected data frame, got {other:?}"),
        }
        match frames.read_frame().unwrap() {
            Some(Dataset::Float64 { values, .. }) => assert_eq!(values, vec![4.0; 5]),
            other => panic!("expected data frame, got {other:?}"),
        }
        assert!(frames.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_save_snapshot_extracts_components_and_skips_unregistered() {
        let dir = tempdir().unwrap();
        let comm = solo();
        let mesh = line_mesh(&*comm);

        let mut layout = SubproblemLayout::new();
        layout.declare(
            "reaction",
            vec![FieldDecl::scalar("a"), FieldDecl::scalar("b")],
        );

        let mut state = SolutionStorage::new();
        // 5 points, fields a then b as contiguous blocks.
        state.init("reaction", vec![1.0, 1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 2.0]);

        // Only "a" is of interest; "b" has no open series.
        let mut series = IndexMap::new();
        series.insert(
            "a".to_string(),
            SnapshotSeries::open(Arc::clone(&comm), dir.path(), "a", 0, &mesh).unwrap(),
        );

        save_snapshot(0.5, &state, &layout, &mut series).unwrap();

        let mut frames = FrameReader::open(series["a"].data_path()).unwrap();
        frames.read_frame().unwrap(); // topology
        frames.read_frame().unwrap(); // geometry
        match frames.read_frame().unwrap() {
            Some(Dataset::Float64 { values, .. }) => assert_eq!(values, vec![1.0; 5]),
            other => panic!("expected a-block frame, got {other:?}"),
        }
    }

    #[test]
    fn test_single_field_subproblem_appends_whole_buffer() {
        let dir = tempdir().unwrap();
        let comm = solo();
        let mesh = line_mesh(&*comm);

        let mut layout = SubproblemLayout::new();
        layout.declare("heat", vec![FieldDecl::scalar("temperature")]);

        let mut state = SolutionStorage::new();
        state.init("heat", vec![7.0; 5]);

        let mut series = IndexMap::new();
        series.insert(
            "temperature".to_string(),
            SnapshotSeries::open(Arc::clone(&comm), dir.path(), "temperature", 0, &mesh).unwrap(),
        );

        save_snapshot(1.0, &state, &layout, &mut series).unwrap();
        let parsed = parse_series_index(series["temperature"].index_path(), false).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].0, 1.0);
    }
}
