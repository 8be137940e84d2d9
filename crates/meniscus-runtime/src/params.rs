//! Run configuration: the ordered parameter mapping and its on-disk forms.
//!
//! Parameters travel with the run: they are dumped into the run
//! directory at allocation, rewritten into every checkpoint, and read
//! back at restart before anything else happens. The on-disk baseline
//! is structured text (keys sorted, 4-space indent) so two settings
//! files diff cleanly; the older opaque binary form survives only as a
//! legacy-compatibility mode and is sniffed by magic bytes on load.
//!
//! # Round Trip
//!
//! Both forms reproduce the in-memory mapping exactly. The only keys
//! that do not survive a checkpoint round trip unchanged are the three
//! injected ones (`num_processes`, `t_0`, `tstep`), which are
//! overwritten on every checkpoint regardless of their prior values.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Magic prefix of a legacy binary settings file.
const LEGACY_MAGIC: &[u8] = b"MNSC-SET";

/// Format version inside a legacy binary settings blob.
const LEGACY_VERSION: u32 = 1;

/// A single configuration value: scalar, string, or list.
///
/// Untagged so the text form reads naturally
/// (`{"dt": 0.01, "folder": "results"}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Floating-point scalar.
    Float(f64),
    /// String value.
    Str(String),
    /// Homogeneous or mixed list.
    List(Vec<ParamValue>),
}

impl ParamValue {
    /// The value as a float; integers coerce.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// The value as a signed integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as an unsigned integer; negative integers are `None`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ParamValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    /// The value as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<Vec<ParamValue>> for ParamValue {
    fn from(v: Vec<ParamValue>) -> Self {
        ParamValue::List(v)
    }
}

/// Ordered run configuration mapping.
///
/// Insertion order is preserved in memory; the text serialization sorts
/// keys so the on-disk form is canonical and diffable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunParameters {
    values: IndexMap<String, ParamValue>,
}

impl RunParameters {
    /// Create an empty parameter mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Set a key, overwriting any prior value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    /// Float lookup with integer coercion.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(ParamValue::as_f64)
    }

    /// Unsigned integer lookup.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(ParamValue::as_u64)
    }

    /// Boolean lookup.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(ParamValue::as_bool)
    }

    /// String lookup.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ParamValue::as_str)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    /// Overwrite the keys a checkpoint pins down.
    ///
    /// Called by the checkpoint store before the parameters file is
    /// written; any prior values under these keys are discarded.
    pub fn inject_restart_state(&mut self, num_processes: usize, t_0: f64, tstep: u64) {
        self.set("num_processes", num_processes);
        self.set("t_0", t_0);
        self.set("tstep", tstep);
    }

    /// Render the canonical text form: sorted keys, 4-space indent,
    /// trailing newline.
    pub fn to_text(&self) -> Result<String> {
        let sorted: BTreeMap<&String, &ParamValue> = self.values.iter().collect();
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        sorted
            .serialize(&mut ser)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        buf.push(b'\n');
        String::from_utf8(buf).map_err(|e| Error::Serialization(e.to_string()))
    }
}

// ============================================================================
// Legacy binary form
// ============================================================================

/// Tagged mirror of [`ParamValue`] for the legacy binary blob.
///
/// The text form needs `ParamValue` untagged, and an untagged enum
/// cannot round-trip through a non-self-describing codec, so the legacy
/// blob carries this explicit tagging instead.
#[derive(Debug, Serialize, Deserialize)]
enum LegacyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<LegacyValue>),
}

impl From<&ParamValue> for LegacyValue {
    fn from(v: &ParamValue) -> Self {
        match v {
            ParamValue::Bool(b) => LegacyValue::Bool(*b),
            ParamValue::Int(i) => LegacyValue::Int(*i),
            ParamValue::Float(f) => LegacyValue::Float(*f),
            ParamValue::Str(s) => LegacyValue::Str(s.clone()),
            ParamValue::List(items) => LegacyValue::List(items.iter().map(Into::into).collect()),
        }
    }
}

impl From<LegacyValue> for ParamValue {
    fn from(v: LegacyValue) -> Self {
        match v {
            LegacyValue::Bool(b) => ParamValue::Bool(b),
            LegacyValue::Int(i) => ParamValue::Int(i),
            LegacyValue::Float(f) => ParamValue::Float(f),
            LegacyValue::Str(s) => ParamValue::Str(s),
            LegacyValue::List(items) => ParamValue::List(items.into_iter().map(Into::into).collect()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LegacySettings {
    version: u32,
    values: IndexMap<String, LegacyValue>,
}

fn to_legacy_bytes(params: &RunParameters) -> Result<Vec<u8>> {
    let blob = LegacySettings {
        version: LEGACY_VERSION,
        values: params
            .values
            .iter()
            .map(|(k, v)| (k.clone(), LegacyValue::from(v)))
            .collect(),
    };
    let mut bytes = LEGACY_MAGIC.to_vec();
    let body = bincode::serialize(&blob).map_err(|e| Error::Serialization(e.to_string()))?;
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn from_legacy_bytes(bytes: &[u8]) -> Result<IndexMap<String, ParamValue>> {
    let body = &bytes[LEGACY_MAGIC.len()..];
    let blob: LegacySettings =
        bincode::deserialize(body).map_err(|e| Error::Deserialization(e.to_string()))?;
    if blob.version != LEGACY_VERSION {
        return Err(Error::Deserialization(format!(
            "unsupported legacy settings version {}",
            blob.version
        )));
    }
    Ok(blob
        .values
        .into_iter()
        .map(|(k, v)| (k, ParamValue::from(v)))
        .collect())
}

// ============================================================================
// File operations
// ============================================================================

/// On-disk settings representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SettingsFormat {
    /// Structured text: sorted keys, fixed 4-space indent. The baseline.
    #[default]
    Text,
    /// Opaque versioned binary blob kept for old run directories.
    LegacyBinary,
}

/// Write the parameter mapping to `path` in the baseline text form.
pub fn dump_parameters(params: &RunParameters, path: &Path) -> Result<()> {
    dump_parameters_as(params, path, SettingsFormat::Text)
}

/// Write the parameter mapping to `path` in the given form.
pub fn dump_parameters_as(
    params: &RunParameters,
    path: &Path,
    format: SettingsFormat,
) -> Result<()> {
    match format {
        SettingsFormat::Text => fs::write(path, params.to_text()?)?,
        SettingsFormat::LegacyBinary => fs::write(path, to_legacy_bytes(params)?)?,
    }
    Ok(())
}

/// Merge a settings file into `params`, file values winning.
///
/// The format is sniffed: legacy blobs carry a magic prefix, anything
/// else is parsed as text. An absent file is
/// [`Error::MissingConfiguration`]; at restart there is nothing to
/// fall back to.
pub fn load_parameters(params: &mut RunParameters, path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(Error::MissingConfiguration {
            path: path.to_path_buf(),
        });
    }
    let bytes = fs::read(path)?;
    let loaded: IndexMap<String, ParamValue> = if bytes.starts_with(LEGACY_MAGIC) {
        from_legacy_bytes(&bytes)?
    } else {
        serde_json::from_slice(&bytes).map_err(|e| Error::Deserialization(e.to_string()))?
    };
    for (key, value) in loaded {
        params.values.insert(key, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> RunParameters {
        let mut p = RunParameters::new();
        p.set("folder", "results");
        p.set("dt", 0.01);
        p.set("checkpoint_intv", 50u64);
        p.set("enable_stats", true);
        p.set(
            "probe_points",
            vec![ParamValue::from(0.25), ParamValue::from(0.75)],
        );
        p
    }

    #[test]
    fn test_text_round_trip_is_exact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parameters.dat");
        let params = sample();

        dump_parameters(&params, &path).unwrap();
        let mut restored = RunParameters::new();
        load_parameters(&mut restored, &path).unwrap();

        for (key, value) in params.iter() {
            assert_eq!(restored.get(key), Some(value), "key {key}");
        }
        assert_eq!(restored.len(), params.len());
    }

    #[test]
    fn test_text_form_is_sorted_and_indented() {
        let text = sample().to_text().unwrap();
        let dt_pos = text.find("\"dt\"").unwrap();
        let folder_pos = text.find("\"folder\"").unwrap();
        assert!(dt_pos < folder_pos, "keys must be sorted:\n{text}");
        assert!(text.contains("\n    \"dt\": 0.01"), "4-space indent:\n{text}");
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_legacy_binary_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parameters.dat");
        let params = sample();

        dump_parameters_as(&params, &path, SettingsFormat::LegacyBinary).unwrap();
        let raw = std::fs::read(&path).unwrap();
        assert!(raw.starts_with(LEGACY_MAGIC));
        assert!(
            serde_json::from_slice::<serde_json::Value>(&raw).is_err(),
            "legacy blob must not parse as text"
        );

        let mut restored = RunParameters::new();
        load_parameters(&mut restored, &path).unwrap();
        assert_eq!(restored, params);
    }

    #[test]
    fn test_missing_settings_file_is_fatal() {
        let dir = tempdir().unwrap();
        let mut params = RunParameters::new();
        let err = load_parameters(&mut params, &dir.path().join("absent.dat")).unwrap_err();
        assert!(matches!(err, Error::MissingConfiguration { .. }));
    }

    #[test]
    fn test_load_merges_file_over_memory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parameters.dat");

        let mut on_disk = RunParameters::new();
        on_disk.set("dt", 0.02);
        dump_parameters(&on_disk, &path).unwrap();

        let mut params = RunParameters::new();
        params.set("dt", 0.01);
        params.set("T", 10.0);
        load_parameters(&mut params, &path).unwrap();

        assert_eq!(params.get_f64("dt"), Some(0.02));
        assert_eq!(params.get_f64("T"), Some(10.0));
    }

    #[test]
    fn test_injection_overwrites_prior_values() {
        let mut params = sample();
        params.set("num_processes", 999u64);
        params.set("t_0", -1.0);
        params.set("tstep", 123456u64);

        params.inject_restart_state(4, 2.5, 250);

        assert_eq!(params.get_u64("num_processes"), Some(4));
        assert_eq!(params.get_f64("t_0"), Some(2.5));
        assert_eq!(params.get_u64("tstep"), Some(250));
    }

    #[test]
    fn test_integer_and_float_values_keep_their_kind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parameters.dat");
        let mut params = RunParameters::new();
        params.set("steps", 100u64);
        params.set("dt", 1.0);
        dump_parameters(&params, &path).unwrap();

        let mut restored = RunParameters::new();
        load_parameters(&mut restored, &path).unwrap();
        assert_eq!(restored.get("steps"), Some(&ParamValue::Int(100)));
        assert_eq!(restored.get("dt"), Some(&ParamValue::Float(1.0)));
    }
}
