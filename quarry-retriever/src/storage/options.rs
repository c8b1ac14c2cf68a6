//! Typed, validated per-backend options.
//!
//! Options resolve from three layers: built-in defaults, caller overrides
//! ([`BackendOptionsPatch`]), and the options recorded in an existing
//! database's metadata. Stored metadata always wins; see
//! [`factory`](super::factory).
//!
//! Every `match` on [`BackendKind`] or [`BackendOptions`] in this module is
//! written without a wildcard arm, so adding a backend does not compile until
//! defaults, merging and validation all handle it.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Physical storage engine family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sqlite,
    Postgres,
    Lancedb,
    Libsql,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Sqlite,
        BackendKind::Postgres,
        BackendKind::Lancedb,
        BackendKind::Libsql,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Postgres => "postgres",
            BackendKind::Lancedb => "lancedb",
            BackendKind::Libsql => "libsql",
        }
    }

    /// Whether the engine links native code into the host process.
    ///
    /// Postgres is reached over the network and is the one backend usable in a
    /// runtime without native extension support.
    pub fn requires_native_extensions(&self) -> bool {
        match self {
            BackendKind::Sqlite | BackendKind::Lancedb | BackendKind::Libsql => true,
            BackendKind::Postgres => false,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_choice("backend", s, &BackendKind::ALL, |k| k.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
    Dot,
}

impl DistanceMetric {
    pub const ALL: [DistanceMetric; 3] = [DistanceMetric::Cosine, DistanceMetric::L2, DistanceMetric::Dot];

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2 => "l2",
            DistanceMetric::Dot => "dot",
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_choice("distance_metric", s, &DistanceMetric::ALL, |m| m.as_str())
    }
}

/// Vector index built by the Postgres backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostgresIndexType {
    #[default]
    Hnsw,
    Ivfflat,
    None,
}

impl PostgresIndexType {
    pub const ALL: [PostgresIndexType; 3] = [
        PostgresIndexType::Hnsw,
        PostgresIndexType::Ivfflat,
        PostgresIndexType::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PostgresIndexType::Hnsw => "hnsw",
            PostgresIndexType::Ivfflat => "ivfflat",
            PostgresIndexType::None => "none",
        }
    }
}

impl FromStr for PostgresIndexType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_choice("index_type", s, &PostgresIndexType::ALL, |t| t.as_str())
    }
}

/// How libsql compresses neighbor vectors in its graph index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborCompression {
    None,
    Float32,
    Float16,
    Floatb16,
    #[default]
    Float8,
    Float1bit,
}

impl NeighborCompression {
    pub const ALL: [NeighborCompression; 6] = [
        NeighborCompression::None,
        NeighborCompression::Float32,
        NeighborCompression::Float16,
        NeighborCompression::Floatb16,
        NeighborCompression::Float8,
        NeighborCompression::Float1bit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NeighborCompression::None => "none",
            NeighborCompression::Float32 => "float32",
            NeighborCompression::Float16 => "float16",
            NeighborCompression::Floatb16 => "floatb16",
            NeighborCompression::Float8 => "float8",
            NeighborCompression::Float1bit => "float1bit",
        }
    }
}

impl FromStr for NeighborCompression {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_choice("compress_neighbors", s, &NeighborCompression::ALL, |c| c.as_str())
    }
}

fn parse_choice<T: Copy>(
    field: &str,
    value: &str,
    choices: &[T],
    name: impl Fn(&T) -> &'static str,
) -> Result<T, ConfigurationError> {
    let wanted = value.trim().to_ascii_lowercase();
    choices
        .iter()
        .find(|choice| name(choice) == wanted)
        .copied()
        .ok_or_else(|| {
            let valid: Vec<&str> = choices.iter().map(&name).collect();
            ConfigurationError::new(
                field,
                format!("unrecognized value '{value}', expected one of: {}", valid.join(", ")),
            )
        })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteOptions {
    pub distance_metric: DistanceMetric,
    pub max_neighbors: i64,
    pub ef_construction: i64,
    pub ef_search: i64,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            distance_metric: DistanceMetric::Cosine,
            max_neighbors: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresOptions {
    pub distance_metric: DistanceMetric,
    pub index_type: PostgresIndexType,
    pub hnsw_m: i64,
    pub ef_construction: i64,
    pub ivf_lists: i64,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            distance_metric: DistanceMetric::Cosine,
            index_type: PostgresIndexType::Hnsw,
            hnsw_m: 16,
            ef_construction: 64,
            ivf_lists: 100,
        }
    }
}

/// Columnar vector store tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LancedbOptions {
    pub distance_metric: DistanceMetric,
    pub num_partitions: i64,
    pub num_sub_vectors: i64,
    /// Rows required before an ANN index is built
    pub index_threshold_rows: i64,
}

impl Default for LancedbOptions {
    fn default() -> Self {
        Self {
            distance_metric: DistanceMetric::Cosine,
            num_partitions: 256,
            num_sub_vectors: 16,
            index_threshold_rows: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibsqlOptions {
    pub distance_metric: DistanceMetric,
    pub compress_neighbors: NeighborCompression,
    pub max_neighbors: i64,
}

impl Default for LibsqlOptions {
    fn default() -> Self {
        Self {
            distance_metric: DistanceMetric::Cosine,
            compress_neighbors: NeighborCompression::Float8,
            max_neighbors: 16,
        }
    }
}

/// Complete options for one backend, tagged by backend name.
///
/// Serialized as `{"backend": "sqlite", "distance_metric": "cosine", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendOptions {
    Sqlite(SqliteOptions),
    Postgres(PostgresOptions),
    Lancedb(LancedbOptions),
    Libsql(LibsqlOptions),
}

/// Options payload of one specific backend.
pub trait BackendPayload: Sized {
    const KIND: BackendKind;

    fn narrow(options: &BackendOptions) -> Option<&Self>;
}

macro_rules! backend_payload {
    ($ty:ty, $variant:ident) => {
        impl BackendPayload for $ty {
            const KIND: BackendKind = BackendKind::$variant;

            fn narrow(options: &BackendOptions) -> Option<&Self> {
                match options {
                    BackendOptions::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

backend_payload!(SqliteOptions, Sqlite);
backend_payload!(PostgresOptions, Postgres);
backend_payload!(LancedbOptions, Lancedb);
backend_payload!(LibsqlOptions, Libsql);

impl BackendOptions {
    pub fn backend(&self) -> BackendKind {
        match self {
            BackendOptions::Sqlite(_) => BackendKind::Sqlite,
            BackendOptions::Postgres(_) => BackendKind::Postgres,
            BackendOptions::Lancedb(_) => BackendKind::Lancedb,
            BackendOptions::Libsql(_) => BackendKind::Libsql,
        }
    }

    pub fn distance_metric(&self) -> DistanceMetric {
        match self {
            BackendOptions::Sqlite(o) => o.distance_metric,
            BackendOptions::Postgres(o) => o.distance_metric,
            BackendOptions::Lancedb(o) => o.distance_metric,
            BackendOptions::Libsql(o) => o.distance_metric,
        }
    }

    /// The payload narrowed to `T`, or `None` if these options belong to another backend.
    pub fn typed<T: BackendPayload>(&self) -> Option<&T> {
        T::narrow(self)
    }

    /// Parse options from JSON, rejecting unknown enum values with the field name.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| ConfigurationError::new("backend_options", e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: serde_json::Value) -> Result<Self, ConfigurationError> {
        let backend = precheck(&mut value)?;
        serde_json::from_value(value)
            .map_err(|e| ConfigurationError::new(backend.as_str(), e.to_string()))
    }
}

/// Narrow `options` to `backend`, or `None` when the discriminator differs.
pub fn typed_backend_options(options: &BackendOptions, backend: BackendKind) -> Option<&BackendOptions> {
    (options.backend() == backend).then_some(options)
}

pub fn default_backend_options(backend: BackendKind) -> BackendOptions {
    match backend {
        BackendKind::Sqlite => BackendOptions::Sqlite(SqliteOptions::default()),
        BackendKind::Postgres => BackendOptions::Postgres(PostgresOptions::default()),
        BackendKind::Lancedb => BackendOptions::Lancedb(LancedbOptions::default()),
        BackendKind::Libsql => BackendOptions::Libsql(LibsqlOptions::default()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteOptionsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_metric: Option<DistanceMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_neighbors: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ef_construction: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ef_search: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresOptionsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_metric: Option<DistanceMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_type: Option<PostgresIndexType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hnsw_m: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ef_construction: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ivf_lists: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LancedbOptionsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_metric: Option<DistanceMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_partitions: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_sub_vectors: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_threshold_rows: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibsqlOptionsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_metric: Option<DistanceMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress_neighbors: Option<NeighborCompression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_neighbors: Option<i64>,
}

/// Caller overrides: the same shapes as [`BackendOptions`] with every field optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendOptionsPatch {
    Sqlite(SqliteOptionsPatch),
    Postgres(PostgresOptionsPatch),
    Lancedb(LancedbOptionsPatch),
    Libsql(LibsqlOptionsPatch),
}

impl BackendOptionsPatch {
    /// An override that changes nothing.
    pub fn empty(backend: BackendKind) -> Self {
        match backend {
            BackendKind::Sqlite => BackendOptionsPatch::Sqlite(SqliteOptionsPatch::default()),
            BackendKind::Postgres => BackendOptionsPatch::Postgres(PostgresOptionsPatch::default()),
            BackendKind::Lancedb => BackendOptionsPatch::Lancedb(LancedbOptionsPatch::default()),
            BackendKind::Libsql => BackendOptionsPatch::Libsql(LibsqlOptionsPatch::default()),
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            BackendOptionsPatch::Sqlite(_) => BackendKind::Sqlite,
            BackendOptionsPatch::Postgres(_) => BackendKind::Postgres,
            BackendOptionsPatch::Lancedb(_) => BackendKind::Lancedb,
            BackendOptionsPatch::Libsql(_) => BackendKind::Libsql,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| ConfigurationError::new("backend_options", e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: serde_json::Value) -> Result<Self, ConfigurationError> {
        let backend = precheck(&mut value)?;
        serde_json::from_value(value)
            .map_err(|e| ConfigurationError::new(backend.as_str(), e.to_string()))
    }
}

/// Check the discriminator and every enum-valued field before serde sees them,
/// so the error names the offending field and its valid values.
///
/// Enum values are matched case-insensitively and rewritten in their canonical
/// spelling, which is the only one serde accepts.
fn precheck(value: &mut serde_json::Value) -> Result<BackendKind, ConfigurationError> {
    let object = value
        .as_object_mut()
        .ok_or_else(|| ConfigurationError::new("backend_options", "expected a JSON object"))?;
    let backend: BackendKind = object
        .get("backend")
        .and_then(|b| b.as_str())
        .ok_or_else(|| ConfigurationError::new("backend", "missing backend discriminator"))?
        .parse()?;
    object.insert("backend".into(), backend.as_str().into());

    let scoped = |e: ConfigurationError| ConfigurationError::new(format!("{backend}.{}", e.field), e.message);
    for (key, raw) in object.iter_mut() {
        let Some(text) = raw.as_str() else { continue };
        let canonical = match key.as_str() {
            "distance_metric" => text.parse::<DistanceMetric>().map_err(scoped)?.as_str(),
            "index_type" => text.parse::<PostgresIndexType>().map_err(scoped)?.as_str(),
            "compress_neighbors" => text.parse::<NeighborCompression>().map_err(scoped)?.as_str(),
            _ => continue,
        };
        *raw = canonical.into();
    }
    Ok(backend)
}

/// Defaults for `backend`, with same-backend overrides applied.
///
/// A patch for another backend is ignored entirely.
pub fn merge_backend_options(backend: BackendKind, overrides: Option<&BackendOptionsPatch>) -> BackendOptions {
    let mut options = default_backend_options(backend);
    let Some(patch) = overrides else {
        return options;
    };

    match &mut options {
        BackendOptions::Sqlite(o) => {
            if let BackendOptionsPatch::Sqlite(p) = patch {
                apply(&mut o.distance_metric, p.distance_metric);
                apply(&mut o.max_neighbors, p.max_neighbors);
                apply(&mut o.ef_construction, p.ef_construction);
                apply(&mut o.ef_search, p.ef_search);
            }
        }
        BackendOptions::Postgres(o) => {
            if let BackendOptionsPatch::Postgres(p) = patch {
                apply(&mut o.distance_metric, p.distance_metric);
                apply(&mut o.index_type, p.index_type);
                apply(&mut o.hnsw_m, p.hnsw_m);
                apply(&mut o.ef_construction, p.ef_construction);
                apply(&mut o.ivf_lists, p.ivf_lists);
            }
        }
        BackendOptions::Lancedb(o) => {
            if let BackendOptionsPatch::Lancedb(p) = patch {
                apply(&mut o.distance_metric, p.distance_metric);
                apply(&mut o.num_partitions, p.num_partitions);
                apply(&mut o.num_sub_vectors, p.num_sub_vectors);
                apply(&mut o.index_threshold_rows, p.index_threshold_rows);
            }
        }
        BackendOptions::Libsql(o) => {
            if let BackendOptionsPatch::Libsql(p) = patch {
                apply(&mut o.distance_metric, p.distance_metric);
                apply(&mut o.compress_neighbors, p.compress_neighbors);
                apply(&mut o.max_neighbors, p.max_neighbors);
            }
        }
    }
    options
}

fn apply<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

const MAX_SUB_VECTORS: i64 = 1024;

pub fn validate_backend_options(options: &BackendOptions) -> Result<(), ConfigurationError> {
    match options {
        BackendOptions::Sqlite(o) => {
            at_least_one("sqlite.max_neighbors", o.max_neighbors)?;
            at_least_one("sqlite.ef_construction", o.ef_construction)?;
            at_least_one("sqlite.ef_search", o.ef_search)?;
        }
        BackendOptions::Postgres(o) => {
            at_least_one("postgres.hnsw_m", o.hnsw_m)?;
            at_least_one("postgres.ef_construction", o.ef_construction)?;
            at_least_one("postgres.ivf_lists", o.ivf_lists)?;
        }
        BackendOptions::Lancedb(o) => {
            at_least_one("lancedb.num_partitions", o.num_partitions)?;
            at_least_one("lancedb.num_sub_vectors", o.num_sub_vectors)?;
            if o.num_sub_vectors > MAX_SUB_VECTORS {
                return Err(ConfigurationError::new(
                    "lancedb.num_sub_vectors",
                    format!("must be between 1 and {MAX_SUB_VECTORS}, got {}", o.num_sub_vectors),
                ));
            }
            if o.index_threshold_rows < 0 {
                return Err(ConfigurationError::new(
                    "lancedb.index_threshold_rows",
                    format!("must not be negative, got {}", o.index_threshold_rows),
                ));
            }
        }
        BackendOptions::Libsql(o) => {
            at_least_one("libsql.max_neighbors", o.max_neighbors)?;
        }
    }
    Ok(())
}

fn at_least_one(field: &str, value: i64) -> Result<(), ConfigurationError> {
    if value < 1 {
        return Err(ConfigurationError::new(
            field,
            format!("must be a positive integer (at least 1), got {value}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_merge_equals_defaults() {
        for backend in BackendKind::ALL {
            assert_eq!(
                merge_backend_options(backend, None),
                default_backend_options(backend)
            );
            assert_eq!(
                merge_backend_options(backend, Some(&BackendOptionsPatch::empty(backend))),
                default_backend_options(backend)
            );
            assert_eq!(default_backend_options(backend).backend(), backend);
        }
    }

    #[test]
    fn test_merge_overrides_only_given_keys() {
        let patch = BackendOptionsPatch::Sqlite(SqliteOptionsPatch {
            max_neighbors: Some(32),
            ..Default::default()
        });
        let merged = merge_backend_options(BackendKind::Sqlite, Some(&patch));
        let sqlite = merged.typed::<SqliteOptions>().unwrap();
        assert_eq!(sqlite.max_neighbors, 32);
        assert_eq!(sqlite.ef_construction, 200);
        assert_eq!(sqlite.distance_metric, DistanceMetric::Cosine);
    }

    #[test]
    fn test_cross_backend_patch_is_ignored() {
        let patch = BackendOptionsPatch::Libsql(LibsqlOptionsPatch {
            max_neighbors: Some(99),
            distance_metric: Some(DistanceMetric::L2),
            ..Default::default()
        });
        assert_eq!(
            merge_backend_options(BackendKind::Sqlite, Some(&patch)),
            default_backend_options(BackendKind::Sqlite)
        );
    }

    #[test]
    fn test_typed_narrowing() {
        let options = default_backend_options(BackendKind::Lancedb);
        assert!(options.typed::<SqliteOptions>().is_none());
        assert_eq!(
            options.typed::<LancedbOptions>(),
            Some(&LancedbOptions::default())
        );
        assert!(typed_backend_options(&options, BackendKind::Libsql).is_none());
        assert_eq!(
            typed_backend_options(&options, BackendKind::Lancedb),
            Some(&options)
        );
    }

    #[test]
    fn test_validation_rejects_non_positive_counts() {
        let mut sqlite = SqliteOptions::default();
        sqlite.max_neighbors = 0;
        let err = validate_backend_options(&BackendOptions::Sqlite(sqlite)).unwrap_err();
        assert_eq!(err.field, "sqlite.max_neighbors");

        let mut libsql = LibsqlOptions::default();
        libsql.max_neighbors = -4;
        let err = validate_backend_options(&BackendOptions::Libsql(libsql)).unwrap_err();
        assert_eq!(err.field, "libsql.max_neighbors");
        assert!(err.message.contains("-4"));

        let mut lance = LancedbOptions::default();
        lance.num_partitions = 0;
        let err = validate_backend_options(&BackendOptions::Lancedb(lance)).unwrap_err();
        assert_eq!(err.field, "lancedb.num_partitions");

        let mut lance = LancedbOptions::default();
        lance.num_sub_vectors = -1;
        let err = validate_backend_options(&BackendOptions::Lancedb(lance)).unwrap_err();
        assert_eq!(err.field, "lancedb.num_sub_vectors");

        let mut lance = LancedbOptions::default();
        lance.num_sub_vectors = 2048;
        assert!(validate_backend_options(&BackendOptions::Lancedb(lance)).is_err());
    }

    #[test]
    fn test_validation_accepts_documented_combinations() {
        for backend in BackendKind::ALL {
            validate_backend_options(&default_backend_options(backend)).unwrap();
        }
        for metric in DistanceMetric::ALL {
            for compression in NeighborCompression::ALL {
                let options = BackendOptions::Libsql(LibsqlOptions {
                    distance_metric: metric,
                    compress_neighbors: compression,
                    max_neighbors: 8,
                });
                validate_backend_options(&options).unwrap();
            }
            for index_type in PostgresIndexType::ALL {
                let options = BackendOptions::Postgres(PostgresOptions {
                    distance_metric: metric,
                    index_type,
                    ..Default::default()
                });
                validate_backend_options(&options).unwrap();
            }
        }
    }

    #[test]
    fn test_unrecognized_enum_values_are_rejected() {
        let err = BackendOptions::from_json(r#"{"backend":"sqlite","distance_metric":"manhattan"}"#)
            .unwrap_err();
        assert_eq!(err.field, "sqlite.distance_metric");
        assert!(err.message.contains("cosine, l2, dot"));

        let err = BackendOptionsPatch::from_json(r#"{"backend":"libsql","compress_neighbors":"zip"}"#)
            .unwrap_err();
        assert_eq!(err.field, "libsql.compress_neighbors");
        assert!(err.message.contains("float1bit"));

        let err = BackendOptions::from_json(r#"{"backend":"oracle"}"#).unwrap_err();
        assert_eq!(err.field, "backend");

        assert!("L2".parse::<DistanceMetric>().is_ok());
    }

    #[test]
    fn test_enum_values_accept_any_case() {
        let options = BackendOptions::from_json(r#"{"backend":"SQLite","distance_metric":"L2"}"#).unwrap();
        assert_eq!(options.backend(), BackendKind::Sqlite);
        assert_eq!(options.distance_metric(), DistanceMetric::L2);

        let patch =
            BackendOptionsPatch::from_json(r#"{"backend":"postgres","index_type":"HNSW","distance_metric":"Dot"}"#)
                .unwrap();
        let BackendOptionsPatch::Postgres(postgres) = patch else {
            panic!("expected a postgres patch, got {patch:?}");
        };
        assert_eq!(postgres.index_type, Some(PostgresIndexType::Hnsw));
        assert_eq!(postgres.distance_metric, Some(DistanceMetric::Dot));

        let err = BackendOptions::from_json(r#"{"backend":"sqlite","distance_metric":"L3"}"#).unwrap_err();
        assert_eq!(err.field, "sqlite.distance_metric");
    }

    #[test]
    fn test_json_round_trip_fills_defaults() {
        let options = BackendOptions::from_json(r#"{"backend":"libsql","max_neighbors":8}"#).unwrap();
        let libsql = options.typed::<LibsqlOptions>().unwrap();
        assert_eq!(libsql.max_neighbors, 8);
        assert_eq!(libsql.compress_neighbors, NeighborCompression::Float8);

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["backend"], "libsql");
        assert_eq!(json["compress_neighbors"], "float8");
    }
}
