//! Runtime errors for run-directory, checkpoint and time-series handling.
//!
//! # Error Handling Policy
//!
//! Persistence errors are surfaced immediately and terminate the whole
//! rank group; there is no partial-group recovery. A collective that a
//! peer never reaches is not an error value at all: it hangs forever,
//! which operators treat as a fatal condition of the run.

use std::path::PathBuf;

use thiserror::Error;

/// Runtime result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while persisting or restoring simulation state.
#[derive(Debug, Error)]
pub enum Error {
    /// A settings file required at restart does not exist.
    ///
    /// Restarting resumes from the checkpointed configuration; without
    /// it the run cannot reconstruct its parameters and must stop.
    #[error("settings file not found: {path}")]
    MissingConfiguration {
        /// Path that was expected to hold the settings file.
        path: PathBuf,
    },

    /// An underlying filesystem operation failed.
    ///
    /// Directory creation failures during run allocation fail the whole
    /// run fast; there is no partial-tree recovery.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization to the on-disk representation failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization from the on-disk representation failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Compressing a container payload failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// Decompressing a container payload failed.
    #[error("decompression error: {0}")]
    Decompression(String),

    /// A series index document could not be interpreted.
    ///
    /// Raised when an entry carries neither its own timestamp nor a
    /// same-position entry in the document's shared time list. No
    /// pairing is guessed; the parse aborts.
    #[error("malformed series index {path}: {reason}")]
    MalformedIndex {
        /// The index document being parsed.
        path: PathBuf,
        /// What made the document uninterpretable.
        reason: String,
    },

    /// A dataset container was written by a different number of ranks.
    ///
    /// Field datasets record one shard per writing rank; restoring them
    /// requires the same group size.
    #[error("dataset {dataset} was written by {written} ranks, restoring on {restoring}")]
    ShardCountMismatch {
        /// Dataset key inside the container.
        dataset: String,
        /// Rank count recorded at write time.
        written: usize,
        /// Rank count of the restoring group.
        restoring: usize,
    },

    /// A dataset exists but holds a different value kind than requested.
    #[error("dataset {dataset} holds {found}, expected {expected}")]
    DatasetKindMismatch {
        /// Dataset key inside the container.
        dataset: String,
        /// Value kind recorded in the container.
        found: &'static str,
        /// Value kind the caller asked for.
        expected: &'static str,
    },

    /// A container file carries an unsupported format version.
    #[error("unsupported container version {found} (supported: {supported})")]
    UnsupportedContainerVersion {
        /// Version found in the file.
        found: u32,
        /// Version this build reads and writes.
        supported: u32,
    },

    /// A mesh or layout was constructed with inconsistent dimensions.
    #[error("shape error: {0}")]
    Shape(String),

    /// A parameter the time loop cannot run without is not set.
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),
}
