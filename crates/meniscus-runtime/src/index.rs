//! Series index documents.
//!
//! Every time-series container is paired with a small JSON index that
//! maps timestamps to dataset addresses, so restart and post-processing
//! tooling can locate raw data without replaying the simulation. This
//! module holds the document model (shared by the writer in
//! [`crate::timeseries`]) and the standalone parser.
//!
//! # Address Form
//!
//! A dataset address is `<container-file>:<dataset-key>`. The file part
//! may be relative, in which case it resolves against the directory of
//! the index document itself, since index and container travel together.
//!
//! # Legacy Documents
//!
//! Older documents carry one document-level `times` list instead of
//! per-entry timestamps; entries pair with the list positionally. An
//! entry with neither a local time nor a same-position shared value is
//! a malformed document: the parse aborts rather than guessing a
//! pairing.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One time-grouped entry of an index document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Explicit timestamp; absent in legacy documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    /// Address of the snapshot dataset.
    pub dataset: String,
    /// Mesh connectivity address, usually only on the first entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<String>,
    /// Mesh coordinates address, usually only on the first entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<String>,
}

/// A whole series index document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Field this series belongs to.
    #[serde(default)]
    pub field: String,
    /// Step count the series started from (restart segment tag).
    #[serde(default)]
    pub from_tstep: u64,
    /// Snapshot entries in write order.
    pub entries: Vec<IndexEntry>,
    /// Legacy shared timestamp list, positionally paired with entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<f64>,
}

/// Write an index document as pretty JSON.
pub fn write_index_document(doc: &IndexDocument, path: &Path) -> Result<()> {
    let mut text =
        serde_json::to_string_pretty(doc).map_err(|e| Error::Serialization(e.to_string()))?;
    text.push('\n');
    std::fs::write(path, text)?;
    Ok(())
}

/// Result of parsing a series index.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedIndex {
    /// `(timestamp, dataset_address)` in document order.
    pub entries: Vec<(f64, String)>,
    /// Resolved mesh connectivity address, when requested and present.
    pub topology: Option<String>,
    /// Resolved mesh coordinates address, when requested and present.
    pub geometry: Option<String>,
}

/// Reconstruct the `(timestamp, dataset_address)` sequence of a series.
///
/// Entries come back exactly in document order (monotonic by
/// construction, never re-sorted). When `want_mesh_address` is set, the
/// first entries carrying topology/geometry addresses supply them;
/// requested-but-absent addresses stay `None` rather than being
/// defaulted. Relative file parts of every address resolve against the
/// index document's own directory.
pub fn parse_series_index(path: &Path, want_mesh_address: bool) -> Result<ParsedIndex> {
    let bytes = std::fs::read(path)?;
    let doc: IndexDocument = serde_json::from_slice(&bytes).map_err(|e| Error::MalformedIndex {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let mut topology_found = !want_mesh_address;
    let mut geometry_found = !want_mesh_address;
    let mut topology = None;
    let mut geometry = None;
    let mut entries = Vec::with_capacity(doc.entries.len());

    for (position, entry) in doc.entries.iter().enumerate() {
        let time = entry
            .time
            .or_else(|| doc.times.get(position).copied())
            .ok_or_else(|| Error::MalformedIndex {
                path: path.to_path_buf(),
                reason: format!(
                    "entry {position} has no timestamp and the shared time list has no value at that position"
                ),
            })?;
        if !topology_found {
            if let Some(address) = &entry.topology {
                topology = Some(resolve_address(dir, address));
                topology_found = true;
            }
        }
        if !geometry_found {
            if let Some(address) = &entry.geometry {
                geometry = Some(resolve_address(dir, address));
                geometry_found = true;
            }
        }
        entries.push((time, resolve_address(dir, &entry.dataset)));
    }

    Ok(ParsedIndex {
        entries,
        topology,
        geometry,
    })
}

/// Resolve the file part of a dataset address against `dir`.
pub fn resolve_address(dir: &Path, address: &str) -> String {
    let (file_part, key_part) = match address.split_once(':') {
        Some((file, key)) => (file, Some(key)),
        None => (address, None),
    };
    let file_path = Path::new(file_part);
    let resolved = if file_path.is_absolute() {
        file_path.to_path_buf()
    } else {
        dir.join(file_path)
    };
    match key_part {
        Some(key) => format!("{}:{}", resolved.display(), key),
        None => resolved.display().to_string(),
    }
}
