//! Loading of persisted model artifacts.
//!
//! An artifact is either a raw estimator or a bundle holding an estimator and
//! the ordered feature names it was trained on. Two encodings are accepted:
//! JSON for files ending in `.json`, and a `RAIN`-prefixed bincode payload for
//! everything else.

use anyhow::Result;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::estimator::{Capabilities, Estimator, PersistedEstimator};
use crate::features::FeatureSchema;

pub const MAGIC: &[u8; 4] = b"RAIN";
pub const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = MAGIC.len() + 2;
const MAX_ARTIFACT_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("artifact not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("artifact is corrupt: {0}")]
    Corrupt(String),
    #[error("no usable estimator in artifact: {0}")]
    Unresolvable(String),
    #[error("estimator expects {expected} features but the schema has {schema}")]
    SchemaMismatch { expected: usize, schema: usize },
    #[error("failed to read artifact: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    pub model: Option<PersistedEstimator>,
    pub feature_names: Option<Vec<String>>,
}

/// On-disk shape of an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PersistedArtifact {
    Raw(PersistedEstimator),
    Bundle(ArtifactBundle),
}

impl PersistedArtifact {
    pub fn bundle(model: PersistedEstimator, feature_names: Vec<String>) -> Self {
        PersistedArtifact::Bundle(ArtifactBundle {
            model: Some(model),
            feature_names: Some(feature_names),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Json,
    Bincode,
}

impl Encoding {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Encoding::Json,
            _ => Encoding::Bincode,
        }
    }
}

/// Which resolution branch produced the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    Raw,
    BundleWithSchema,
    BundleWithoutSchema,
    /// Constructed in-process rather than read from disk.
    Injected,
}

impl fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactSource::Raw => "raw estimator, default schema",
            ArtifactSource::BundleWithSchema => "bundle with feature_names",
            ArtifactSource::BundleWithoutSchema => "bundle without feature_names, default schema",
            ArtifactSource::Injected => "injected estimator",
        };
        f.write_str(s)
    }
}

/// An estimator paired with the schema its input columns follow.
#[derive(Clone)]
pub struct LoadedModel {
    estimator: Arc<dyn Estimator>,
    feature_names: FeatureSchema,
    capabilities: Capabilities,
    source: ArtifactSource,
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("kind", &self.estimator.kind())
            .field("feature_names", &self.feature_names)
            .field("capabilities", &self.capabilities)
            .field("source", &self.source)
            .finish()
    }
}

impl LoadedModel {
    pub fn new(
        estimator: Arc<dyn Estimator>,
        feature_names: FeatureSchema,
    ) -> Result<Self, LoadError> {
        Self::resolved(estimator, feature_names, ArtifactSource::Injected)
    }

    fn resolved(
        estimator: Arc<dyn Estimator>,
        feature_names: FeatureSchema,
        source: ArtifactSource,
    ) -> Result<Self, LoadError> {
        check_schema(&feature_names)?;
        if let Some(expected) = estimator.n_features() {
            if expected != feature_names.len() {
                return Err(LoadError::SchemaMismatch {
                    expected,
                    schema: feature_names.len(),
                });
            }
        }
        let capabilities = Capabilities::of(estimator.as_ref());
        Ok(Self {
            estimator,
            feature_names,
            capabilities,
            source,
        })
    }

    pub fn estimator(&self) -> &dyn Estimator {
        self.estimator.as_ref()
    }

    pub fn feature_names(&self) -> &FeatureSchema {
        &self.feature_names
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn source(&self) -> ArtifactSource {
        self.source
    }
}

fn check_schema(schema: &FeatureSchema) -> Result<(), LoadError> {
    if schema.is_empty() {
        return Err(LoadError::Unresolvable("feature schema is empty".into()));
    }
    let mut seen = HashSet::new();
    for name in schema.iter() {
        if !seen.insert(name) {
            return Err(LoadError::Unresolvable(format!(
                "duplicate feature name '{name}'"
            )));
        }
    }
    Ok(())
}

/// Load and resolve an artifact. Emits one diagnostic naming the branch taken
/// or the reason for failure.
pub fn load(path: impl AsRef<Path>, default_schema: &FeatureSchema) -> Result<LoadedModel, LoadError> {
    let path = path.as_ref();
    let result = read_artifact(path).and_then(|artifact| resolve(artifact, default_schema));
    match &result {
        Ok(model) => log::info!(
            "Loaded {} model from '{}' ({}) with {} features",
            model.estimator().kind(),
            path.display(),
            model.source(),
            model.feature_names().len()
        ),
        Err(e @ LoadError::NotFound(_)) => log::warn!("{e}"),
        Err(e) => log::error!("Could not load model from '{}': {}", path.display(), e),
    }
    result
}

pub fn read_artifact(path: &Path) -> Result<PersistedArtifact, LoadError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(LoadError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    match Encoding::for_path(path) {
        Encoding::Json => decode_json(&bytes),
        Encoding::Bincode => decode_bincode(&bytes),
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_ARTIFACT_BYTES)
}

pub fn decode_bincode(bytes: &[u8]) -> Result<PersistedArtifact, LoadError> {
    if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(LoadError::Corrupt("missing RAIN header".into()));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(LoadError::Corrupt(format!(
            "unsupported format version {version}"
        )));
    }
    codec()
        .deserialize(&bytes[HEADER_LEN..])
        .map_err(|e| LoadError::Corrupt(e.to_string()))
}

/// Decode a JSON artifact: first as a raw estimator, then as a bundle object
/// with a `model` entry. Key order inside the document is irrelevant.
pub fn decode_json(bytes: &[u8]) -> Result<PersistedArtifact, LoadError> {
    let doc: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| LoadError::Corrupt(e.to_string()))?;

    let raw_error = match serde_json::from_value::<PersistedEstimator>(doc.clone()) {
        Ok(raw) => return Ok(PersistedArtifact::Raw(raw)),
        Err(e) => e,
    };

    let object = match doc {
        serde_json::Value::Object(object) => object,
        other => {
            return Err(LoadError::Unresolvable(format!(
                "expected an estimator or a bundle object, found {}",
                json_type(&other)
            )))
        }
    };
    let model = match object.get("model") {
        Some(model) => serde_json::from_value::<PersistedEstimator>(model.clone())
            .map_err(|e| LoadError::Unresolvable(format!("'model' is not an estimator: {e}")))?,
        None => {
            return Err(LoadError::Unresolvable(format!(
                "object has no 'model' entry and is not an estimator: {raw_error}"
            )))
        }
    };
    let feature_names = match object.get("feature_names") {
        None | Some(serde_json::Value::Null) => None,
        Some(names) => Some(
            serde_json::from_value::<Vec<String>>(names.clone()).map_err(|e| {
                LoadError::Unresolvable(format!("'feature_names' is not a list of strings: {e}"))
            })?,
        ),
    };
    Ok(PersistedArtifact::Bundle(ArtifactBundle {
        model: Some(model),
        feature_names,
    }))
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

pub fn resolve(
    artifact: PersistedArtifact,
    default_schema: &FeatureSchema,
) -> Result<LoadedModel, LoadError> {
    let (estimator, schema, source) = match artifact {
        PersistedArtifact::Raw(estimator) => {
            (estimator, default_schema.clone(), ArtifactSource::Raw)
        }
        PersistedArtifact::Bundle(ArtifactBundle {
            model: Some(estimator),
            feature_names: Some(names),
        }) => (
            estimator,
            FeatureSchema::new(names),
            ArtifactSource::BundleWithSchema,
        ),
        PersistedArtifact::Bundle(ArtifactBundle {
            model: Some(estimator),
            feature_names: None,
        }) => (
            estimator,
            default_schema.clone(),
            ArtifactSource::BundleWithoutSchema,
        ),
        PersistedArtifact::Bundle(ArtifactBundle { model: None, .. }) => {
            return Err(LoadError::Unresolvable("bundle has no 'model' entry".into()))
        }
    };
    estimator
        .validate()
        .map_err(|e| LoadError::Unresolvable(e.to_string()))?;
    LoadedModel::resolved(Arc::from(estimator.into_estimator()), schema, source)
}

pub fn save(path: impl AsRef<Path>, artifact: &PersistedArtifact) -> Result<()> {
    let path = path.as_ref();
    let data = match Encoding::for_path(path) {
        Encoding::Json => serde_json::to_vec_pretty(&artifact_json(artifact)?)?,
        Encoding::Bincode => {
            let mut data = Vec::with_capacity(HEADER_LEN);
            data.extend_from_slice(MAGIC);
            data.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
            data.extend(codec().serialize(artifact)?);
            data
        }
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)?;
    Ok(())
}

/// JSON artifacts are written untagged so they read like hand-authored files:
/// either the estimator itself or `{"model": .., "feature_names": ..}`.
fn artifact_json(artifact: &PersistedArtifact) -> serde_json::Result<serde_json::Value> {
    match artifact {
        PersistedArtifact::Raw(estimator) => serde_json::to_value(estimator),
        PersistedArtifact::Bundle(bundle) => serde_json::to_value(bundle),
    }
}

/// Summary of an artifact for operators, produced without starting the service.
#[derive(Debug, Serialize)]
pub struct Inspection {
    pub path: PathBuf,
    pub encoding: Encoding,
    pub loadable: bool,
    pub source: Option<ArtifactSource>,
    pub kind: Option<&'static str>,
    pub expected_features: Option<usize>,
    pub capabilities: Option<Capabilities>,
    pub feature_names: Option<FeatureSchema>,
    pub error: Option<String>,
}

pub fn inspect(path: impl AsRef<Path>, default_schema: &FeatureSchema) -> Inspection {
    let path = path.as_ref();
    let encoding = Encoding::for_path(path);
    match read_artifact(path).and_then(|artifact| resolve(artifact, default_schema)) {
        Ok(model) => Inspection {
            path: path.to_path_buf(),
            encoding,
            loadable: true,
            source: Some(model.source()),
            kind: Some(model.estimator().kind()),
            expected_features: model.estimator().n_features(),
            capabilities: Some(model.capabilities()),
            feature_names: Some(model.feature_names().clone()),
            error: None,
        },
        Err(e) => Inspection {
            path: path.to_path_buf(),
            encoding,
            loadable: false,
            source: None,
            kind: None,
            expected_features: None,
            capabilities: None,
            feature_names: None,
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::tests::stump_forest;
    use crate::estimator::LogisticModel;

    fn logistic(n: usize) -> PersistedEstimator {
        let mut params = vec![-1.0];
        params.extend(std::iter::repeat(0.1).take(n));
        PersistedEstimator::Logistic(LogisticModel::new(params))
    }

    #[test]
    fn bundle_schema_keeps_its_order() {
        let doc = br#"{"feature_names": ["b", "a"], "model": {"logistic": {"params": [0.0, 1.0, 2.0]}}}"#;
        let model = resolve(decode_json(doc).unwrap(), &FeatureSchema::meteorological()).unwrap();
        assert_eq!(model.feature_names().names(), ["b", "a"]);
        assert_eq!(model.source(), ArtifactSource::BundleWithSchema);
    }

    #[test]
    fn raw_estimator_gets_the_default_schema() {
        let default = FeatureSchema::daily();
        let model = resolve(PersistedArtifact::Raw(logistic(10)), &default).unwrap();
        assert_eq!(model.feature_names(), &default);
        assert_eq!(model.source(), ArtifactSource::Raw);
        assert!(model.capabilities().probabilistic);
    }

    #[test]
    fn bundle_without_names_gets_the_default_schema() {
        let doc = br#"{"model": {"logistic": {"params": [0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]}}}"#;
        let model = resolve(decode_json(doc).unwrap(), &FeatureSchema::daily()).unwrap();
        assert_eq!(model.source(), ArtifactSource::BundleWithoutSchema);
        assert_eq!(model.feature_names().len(), 10);
    }

    #[test]
    fn unknown_shapes_are_unresolvable() {
        for doc in [
            &br#"{"weights": [1.0, 2.0]}"#[..],
            &br#"{"feature_names": ["a"]}"#[..],
            &br#"[1, 2, 3]"#[..],
            &br#"{"model": "RandomForestClassifier"}"#[..],
            &br#"{"model": {"logistic": {"params": [0.0, 1.0]}}, "feature_names": [1]}"#[..],
        ] {
            let err = decode_json(doc).unwrap_err();
            assert!(matches!(err, LoadError::Unresolvable(_)), "{err}");
        }
    }

    #[test]
    fn malformed_raw_estimator_keeps_its_decode_error() {
        let err = decode_json(br#"{"logistic": {"params": "x"}}"#).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, LoadError::Unresolvable(_)));
        assert!(msg.contains("no 'model' entry"), "{msg}");
        assert!(msg.contains("invalid type"), "{msg}");
    }

    #[test]
    fn bundle_without_model_is_unresolvable() {
        let artifact = PersistedArtifact::Bundle(ArtifactBundle {
            model: None,
            feature_names: Some(vec!["a".into()]),
        });
        let err = resolve(artifact, &FeatureSchema::daily()).unwrap_err();
        assert!(matches!(err, LoadError::Unresolvable(_)));
    }

    #[test]
    fn arity_mismatch_is_detected() {
        let artifact = PersistedArtifact::bundle(logistic(3), vec!["a".into(), "b".into()]);
        let err = resolve(artifact, &FeatureSchema::daily()).unwrap_err();
        assert!(matches!(
            err,
            LoadError::SchemaMismatch {
                expected: 3,
                schema: 2
            }
        ));
    }

    #[test]
    fn duplicate_feature_names_are_rejected() {
        let artifact = PersistedArtifact::bundle(logistic(2), vec!["a".into(), "a".into()]);
        assert!(resolve(artifact, &FeatureSchema::daily()).is_err());
    }

    #[test]
    fn corrupt_bytes_are_reported() {
        assert!(matches!(decode_bincode(b"nope"), Err(LoadError::Corrupt(_))));
        assert!(matches!(
            decode_bincode(b"RAIN\x02\x00rest"),
            Err(LoadError::Corrupt(_))
        ));
        assert!(matches!(
            decode_bincode(b"RAIN\x01\x00\xff\xff\xff"),
            Err(LoadError::Corrupt(_))
        ));
        assert!(matches!(decode_json(b"{not json"), Err(LoadError::Corrupt(_))));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = load("/nonexistent/model.bin", &FeatureSchema::daily()).unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[test]
    fn bincode_and_json_files_load_the_same_model() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = PersistedArtifact::bundle(
            PersistedEstimator::Forest(stump_forest()),
            vec!["humidity".into(), "cloud_cover".into()],
        );
        for name in ["model.bin", "model.json"] {
            let path = dir.path().join(name);
            save(&path, &artifact).unwrap();
            assert_eq!(read_artifact(&path).unwrap(), artifact);
            let model = load(&path, &FeatureSchema::meteorological()).unwrap();
            assert_eq!(model.estimator().kind(), "forest");
            assert!(model.capabilities().explainable);
        }
    }

    #[test]
    fn inspection_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        fs::write(&path, br#"{"weights": []}"#).unwrap();
        let report = inspect(&path, &FeatureSchema::daily());
        assert!(!report.loadable);
        assert!(report.error.unwrap().contains("no 'model' entry"));
    }
}
