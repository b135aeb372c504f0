use indexmap::IndexMap;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::artifact::{self, ArtifactSource, LoadError, LoadedModel};
use crate::config::AppConfig;
use crate::estimator::{is_distribution, Capabilities, EstimatorError};
use crate::features::{DefaultSchema, FeatureSchema, FeatureValues};

pub const DEMO_WARNING: &str = "Using demo mode - actual model not available";

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("Missing feature: {0}")]
    MissingFeature(String),
    #[error("Feature '{name}' is not a finite number: '{value}'")]
    NonNumericFeature { name: String, value: String },
    #[error("Estimator invocation failed: {0}")]
    EstimatorInvocation(#[source] EstimatorError),
}

impl PredictionError {
    /// Whether the caller sent bad input, as opposed to the estimator failing.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, PredictionError::EstimatorInvocation(_))
    }
}

impl From<EstimatorError> for PredictionError {
    fn from(e: EstimatorError) -> Self {
        PredictionError::EstimatorInvocation(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RainLabel {
    NoRain,
    Rain,
}

impl RainLabel {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(RainLabel::NoRain),
            1 => Some(RainLabel::Rain),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            RainLabel::NoRain => 0,
            RainLabel::Rain => 1,
        }
    }

    pub fn headline(self) -> &'static str {
        match self {
            RainLabel::NoRain => "No Rainfall Expected",
            RainLabel::Rain => "Rainfall Expected",
        }
    }

    pub fn css_class(self) -> &'static str {
        match self {
            RainLabel::NoRain => "no-rain",
            RainLabel::Rain => "rain-expected",
        }
    }
}

impl fmt::Display for RainLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RainLabel::NoRain => "No Rain",
            RainLabel::Rain => "Rain",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub label: RainLabel,
    /// `[P(no-rain), P(rain)]`
    pub probability: Option<[f64; 2]>,
    /// Percent.
    pub confidence: Option<f64>,
    pub feature_importance: Option<IndexMap<String, f64>>,
    pub demo_mode: bool,
    pub warning: Option<String>,
}

impl PredictionResult {
    pub fn rain_chance(&self) -> Option<f64> {
        self.probability.map(|p| p[1])
    }
}

/// Feature names the demo heuristic reads its three inputs from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoInputs {
    pub humidity: String,
    pub cloud_cover: String,
    /// The daily schema has no precipitation column.
    pub precipitation_3hr: Option<String>,
}

impl DemoInputs {
    pub fn for_schema(schema: DefaultSchema) -> Self {
        match schema {
            DefaultSchema::Meteorological => Self {
                humidity: "humidity".into(),
                cloud_cover: "cloud_cover".into(),
                precipitation_3hr: Some("precipitation_3hr".into()),
            },
            DefaultSchema::Daily => Self {
                humidity: "humidity".into(),
                cloud_cover: "cloud".into(),
                precipitation_3hr: None,
            },
        }
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        [Some(&self.humidity), Some(&self.cloud_cover), self.precipitation_3hr.as_ref()]
            .into_iter()
            .flatten()
            .map(String::as_str)
    }
}

impl Default for DemoInputs {
    fn default() -> Self {
        Self::for_schema(DefaultSchema::Meteorological)
    }
}

/// Rule used when no trained estimator is available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoHeuristic {
    pub humidity_weight: f64,
    pub cloud_cover_weight: f64,
    pub precipitation_weight: f64,
    pub threshold: f64,
    pub confidence_cap: f64,
    /// Unset means the names of the configured default schema.
    pub inputs: Option<DemoInputs>,
}

impl Default for DemoHeuristic {
    fn default() -> Self {
        Self {
            humidity_weight: 0.3,
            cloud_cover_weight: 0.3,
            precipitation_weight: 2.0,
            threshold: 60.0,
            confidence_cap: 95.0,
            inputs: None,
        }
    }
}

impl DemoHeuristic {
    /// Fills in the input names of `schema` unless they were set explicitly.
    pub fn resolved_for(mut self, schema: DefaultSchema) -> Self {
        self.inputs.get_or_insert_with(|| DemoInputs::for_schema(schema));
        self
    }

    pub fn inputs(&self) -> Cow<'_, DemoInputs> {
        match &self.inputs {
            Some(inputs) => Cow::Borrowed(inputs),
            None => Cow::Owned(DemoInputs::default()),
        }
    }

    /// Inputs the heuristic reads that `schema` does not declare.
    pub fn missing_inputs(&self, schema: &FeatureSchema) -> Vec<String> {
        let inputs = self.inputs();
        let mut missing: Vec<String> = inputs
            .names()
            .filter(|name| !schema.iter().any(|n| n == *name))
            .map(str::to_string)
            .collect();
        if inputs.precipitation_3hr.is_none() {
            missing.push("precipitation_3hr (unset)".into());
        }
        missing
    }

    pub fn score(&self, humidity: f64, cloud_cover: f64, precipitation_3hr: f64) -> f64 {
        self.humidity_weight * humidity
            + self.cloud_cover_weight * cloud_cover
            + self.precipitation_weight * precipitation_3hr
    }

    /// Absent inputs count as 0.0; present but unparsable ones are rejected.
    pub fn predict(&self, features: &FeatureValues) -> Result<PredictionResult, PredictionError> {
        let inputs = self.inputs();
        let humidity = features.value(&inputs.humidity)?.unwrap_or(0.0);
        let cloud_cover = features.value(&inputs.cloud_cover)?.unwrap_or(0.0);
        let precipitation_3hr = match &inputs.precipitation_3hr {
            Some(name) => features.value(name)?.unwrap_or(0.0),
            None => 0.0,
        };

        let score = self.score(humidity, cloud_cover, precipitation_3hr);
        let label = if score > self.threshold {
            RainLabel::Rain
        } else {
            RainLabel::NoRain
        };
        Ok(PredictionResult {
            label,
            probability: None,
            confidence: Some(score.min(self.confidence_cap)),
            feature_importance: None,
            demo_mode: true,
            warning: Some(DEMO_WARNING.to_string()),
        })
    }
}

/// Outcome of loading the model at startup.
#[derive(Debug, Clone)]
pub enum ModelState {
    Ready(LoadedModel),
    Unavailable { reason: String },
}

impl ModelState {
    pub fn load(path: impl AsRef<Path>, default_schema: &FeatureSchema) -> Self {
        Self::from_result(artifact::load(path, default_schema))
    }

    pub fn from_result(result: Result<LoadedModel, LoadError>) -> Self {
        match result {
            Ok(model) => ModelState::Ready(model),
            Err(e) => {
                log::warn!("Model not available, predictions will run in demo mode");
                ModelState::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_loaded: bool,
    pub model_ready: bool,
    pub model_type: Option<&'static str>,
    pub source: Option<ArtifactSource>,
    pub expected_features: usize,
    pub feature_names: Vec<String>,
    pub feature_count: usize,
    pub capabilities: Capabilities,
    pub unavailable_reason: Option<String>,
}

/// Serves predictions from a model loaded once at startup. Immutable after
/// construction, so it can be shared across requests behind an `Arc`.
#[derive(Debug, Clone)]
pub struct PredictionService {
    state: ModelState,
    default_schema: FeatureSchema,
    demo: DemoHeuristic,
}

impl PredictionService {
    pub fn new(state: ModelState, default_schema: FeatureSchema, demo: DemoHeuristic) -> Self {
        if matches!(state, ModelState::Unavailable { .. }) {
            let missing = demo.missing_inputs(&default_schema);
            if !missing.is_empty() {
                log::warn!(
                    "Demo heuristic inputs not in the feature schema, they will read as 0.0: {}",
                    missing.join(", ")
                );
            }
        }
        Self {
            state,
            default_schema,
            demo,
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        let default_schema = cfg.default_feature_schema();
        let state = ModelState::load(&cfg.model_path, &default_schema);
        let demo = cfg.demo.clone().resolved_for(cfg.default_schema);
        Self::new(state, default_schema, demo)
    }

    pub fn with_model(model: LoadedModel) -> Self {
        Self::new(
            ModelState::Ready(model),
            FeatureSchema::meteorological(),
            DemoHeuristic::default(),
        )
    }

    pub fn demo_only(default_schema: FeatureSchema) -> Self {
        Self::new(
            ModelState::Unavailable {
                reason: "no model configured".into(),
            },
            default_schema,
            DemoHeuristic::default(),
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ModelState::Ready(_))
    }

    /// The schema requests are expected to cover.
    pub fn schema(&self) -> &FeatureSchema {
        match &self.state {
            ModelState::Ready(model) => model.feature_names(),
            ModelState::Unavailable { .. } => &self.default_schema,
        }
    }

    pub fn predict(&self, features: &FeatureValues) -> Result<PredictionResult, PredictionError> {
        match &self.state {
            ModelState::Ready(model) => predict_with_model(model, features),
            ModelState::Unavailable { .. } => self.demo.predict(features),
        }
    }

    /// `predict` with request-boundary logging.
    pub fn predict_and_log(
        &self,
        features: &FeatureValues,
    ) -> Result<PredictionResult, PredictionError> {
        let result = self.predict(features);
        match &result {
            Ok(r) if r.demo_mode => log::warn!(
                "{}: {} (confidence {:?})",
                DEMO_WARNING,
                r.label,
                r.confidence
            ),
            Ok(r) => log::info!("Prediction: {} (confidence {:?})", r.label, r.confidence),
            Err(e) if e.is_client_error() => {
                log::warn!("Rejected prediction request: {}; features: {:?}", e, features)
            }
            Err(e) => log::error!("Prediction failed: {}; features: {:?}", e, features),
        }
        result
    }

    pub fn model_info(&self) -> ModelInfo {
        let schema = self.schema();
        match &self.state {
            ModelState::Ready(model) => ModelInfo {
                model_loaded: true,
                model_ready: true,
                model_type: Some(model.estimator().kind()),
                source: Some(model.source()),
                expected_features: model.estimator().n_features().unwrap_or(schema.len()),
                feature_names: schema.names().to_vec(),
                feature_count: schema.len(),
                capabilities: model.capabilities(),
                unavailable_reason: None,
            },
            ModelState::Unavailable { reason } => ModelInfo {
                model_loaded: false,
                model_ready: false,
                model_type: None,
                source: None,
                expected_features: schema.len(),
                feature_names: schema.names().to_vec(),
                feature_count: schema.len(),
                capabilities: Capabilities::default(),
                unavailable_reason: Some(reason.clone()),
            },
        }
    }
}

/// Single-row input matrix in schema order. Fails on the first schema entry
/// that is missing or not numeric.
pub fn feature_matrix(
    schema: &FeatureSchema,
    features: &FeatureValues,
) -> Result<Array2<f64>, PredictionError> {
    let mut row = Vec::with_capacity(schema.len());
    for name in schema.iter() {
        match features.value(name)? {
            Some(v) => row.push(v),
            None => return Err(PredictionError::MissingFeature(name.to_string())),
        }
    }
    Ok(Array1::from(row).insert_axis(Axis(0)))
}

fn predict_with_model(
    model: &LoadedModel,
    features: &FeatureValues,
) -> Result<PredictionResult, PredictionError> {
    let x = feature_matrix(model.feature_names(), features)?;
    let estimator = model.estimator();
    let capabilities = model.capabilities();

    let labels = estimator.predict(x.view())?;
    let code = match labels.as_slice() {
        Some([code]) => *code,
        _ => {
            return Err(EstimatorError::InvalidOutput(format!(
                "expected a single label, got {}",
                labels.len()
            ))
            .into())
        }
    };
    let label = RainLabel::from_code(code).ok_or_else(|| {
        EstimatorError::InvalidOutput(format!("label {code} is not a binary outcome"))
    })?;

    let probability = match estimator.as_probabilistic() {
        Some(p) if capabilities.probabilistic => {
            Some(two_class_probability(&p.predict_proba(x.view())?)?)
        }
        _ => None,
    };
    let confidence = probability.map(|p| 100.0 * p[usize::from(label.code())]);

    let feature_importance = match estimator.as_explainable() {
        Some(e) if capabilities.explainable => {
            let importances = e.feature_importances();
            if importances.len() == model.feature_names().len() {
                Some(
                    model
                        .feature_names()
                        .iter()
                        .map(str::to_string)
                        .zip(importances.iter().copied())
                        .collect(),
                )
            } else {
                log::warn!(
                    "Ignoring {} feature importances for {} features",
                    importances.len(),
                    model.feature_names().len()
                );
                None
            }
        }
        _ => None,
    };

    Ok(PredictionResult {
        label,
        probability,
        confidence,
        feature_importance,
        demo_mode: false,
        warning: None,
    })
}

fn two_class_probability(proba: &Array2<f64>) -> Result<[f64; 2], EstimatorError> {
    if proba.nrows() != 1 || proba.ncols() != 2 {
        return Err(EstimatorError::InvalidOutput(format!(
            "expected a 1x2 probability matrix, got {}x{}",
            proba.nrows(),
            proba.ncols()
        )));
    }
    let p = [proba[[0, 0]], proba[[0, 1]]];
    if !is_distribution(&p) {
        return Err(EstimatorError::InvalidOutput(format!(
            "probabilities {p:?} do not form a distribution"
        )));
    }
    Ok(p)
}
