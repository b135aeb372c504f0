use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Allowed distance from 1.0 for the sum of a class distribution.
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

/// Two finite class probabilities in [0, 1] that sum to one.
pub fn is_distribution(p: &[f64]) -> bool {
    p.len() == 2
        && p.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v))
        && (p[0] + p[1] - 1.0).abs() <= PROBABILITY_TOLERANCE
}

#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("expected {expected} feature columns, got {got}")]
    ShapeMismatch { expected: usize, got: usize },
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("invalid estimator output: {0}")]
    InvalidOutput(String),
}

/// A trained binary classifier. Labels are 0 (no rain) and 1 (rain).
pub trait Estimator: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Number of feature columns the estimator was trained on, when known.
    fn n_features(&self) -> Option<usize>;

    /// One label per row of `x`.
    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<i64>, EstimatorError>;

    fn as_probabilistic(&self) -> Option<&dyn ProbabilisticEstimator> {
        None
    }

    fn as_explainable(&self) -> Option<&dyn ExplainableEstimator> {
        None
    }
}

pub trait ProbabilisticEstimator {
    /// Rows x classes, columns ordered {no-rain, rain}.
    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, EstimatorError>;
}

pub trait ExplainableEstimator {
    /// Importances aligned to the training feature order.
    fn feature_importances(&self) -> &[f64];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub probabilistic: bool,
    pub explainable: bool,
}

impl Capabilities {
    pub fn of(estimator: &dyn Estimator) -> Self {
        Self {
            probabilistic: estimator.as_probabilistic().is_some(),
            explainable: estimator.as_explainable().is_some(),
        }
    }
}

/// Closed set of estimators that can be persisted in an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedEstimator {
    Logistic(LogisticModel),
    Forest(ForestModel),
}

impl PersistedEstimator {
    pub fn validate(&self) -> Result<(), EstimatorError> {
        match self {
            PersistedEstimator::Logistic(m) => m.validate(),
            PersistedEstimator::Forest(m) => m.validate(),
        }
    }

    pub fn into_estimator(self) -> Box<dyn Estimator> {
        match self {
            PersistedEstimator::Logistic(m) => Box::new(m),
            PersistedEstimator::Forest(m) => Box::new(m),
        }
    }
}

fn check_columns(x: &ArrayView2<f64>, expected: usize) -> Result<(), EstimatorError> {
    if x.ncols() != expected {
        return Err(EstimatorError::ShapeMismatch {
            expected,
            got: x.ncols(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    /// `[bias, w1, .., wn]`
    pub params: Vec<f64>,
}

impl LogisticModel {
    pub fn new(params: Vec<f64>) -> Self {
        Self { params }
    }

    fn validate(&self) -> Result<(), EstimatorError> {
        if self.params.len() < 2 {
            return Err(EstimatorError::InvalidModel(
                "logistic model needs a bias and at least one weight".into(),
            ));
        }
        if self.params.iter().any(|p| !p.is_finite()) {
            return Err(EstimatorError::InvalidModel(
                "logistic parameters must be finite".into(),
            ));
        }
        Ok(())
    }

    fn rain_probability(&self, row: ArrayView1<f64>) -> f64 {
        let (bias, weights) = match self.params.split_first() {
            Some(split) => split,
            None => return 0.5,
        };
        let z: f64 = *bias + weights.iter().zip(row.iter()).map(|(w, x)| w * x).sum::<f64>();
        1.0 / (1.0 + (-z).exp())
    }
}

impl Estimator for LogisticModel {
    fn kind(&self) -> &'static str {
        "logistic"
    }

    fn n_features(&self) -> Option<usize> {
        Some(self.params.len().saturating_sub(1))
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<i64>, EstimatorError> {
        check_columns(&x, self.params.len().saturating_sub(1))?;
        Ok(x.rows()
            .into_iter()
            .map(|row| i64::from(self.rain_probability(row) >= 0.5))
            .collect())
    }

    fn as_probabilistic(&self) -> Option<&dyn ProbabilisticEstimator> {
        Some(self)
    }
}

impl ProbabilisticEstimator for LogisticModel {
    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, EstimatorError> {
        check_columns(&x, self.params.len().saturating_sub(1))?;
        let mut out = Array2::zeros((x.nrows(), 2));
        for (i, row) in x.rows().into_iter().enumerate() {
            let p = self.rain_probability(row);
            out[[i, 0]] = 1.0 - p;
            out[[i, 1]] = p;
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeNode {
    /// Go left if `x[feature] < threshold`.
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    /// Class distribution `[p(no-rain), p(rain)]`.
    Leaf { distribution: Vec<f64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    /// Node 0 is the root.
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    fn validate(&self, n_features: usize) -> Result<(), EstimatorError> {
        if self.nodes.is_empty() {
            return Err(EstimatorError::InvalidModel("tree has no nodes".into()));
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if *feature >= n_features {
                        return Err(EstimatorError::InvalidModel(format!(
                            "node {idx} splits on feature {feature}, model has {n_features}"
                        )));
                    }
                    if !threshold.is_finite() {
                        return Err(EstimatorError::InvalidModel(format!(
                            "node {idx} has a non-finite threshold"
                        )));
                    }
                    // children must point forward, which also rules out cycles
                    for child in [left, right] {
                        if *child <= idx || *child >= self.nodes.len() {
                            return Err(EstimatorError::InvalidModel(format!(
                                "node {idx} has invalid child {child}"
                            )));
                        }
                    }
                }
                TreeNode::Leaf { distribution } => {
                    if !is_distribution(distribution) {
                        return Err(EstimatorError::InvalidModel(format!(
                            "leaf {idx} holds {distribution:?}, not a two-class distribution"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn leaf(&self, row: ArrayView1<f64>) -> Result<&[f64], EstimatorError> {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(TreeNode::Leaf { distribution }) => return Ok(distribution.as_slice()),
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let value = row.get(*feature).copied().ok_or_else(|| {
                        EstimatorError::InvalidModel(format!("feature {feature} out of range"))
                    })?;
                    idx = if value < *threshold { *left } else { *right };
                }
                None => {
                    return Err(EstimatorError::InvalidModel(format!(
                        "dangling node reference {idx}"
                    )))
                }
            }
        }
    }
}

/// Averaging ensemble of decision trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestModel {
    pub n_features: usize,
    pub trees: Vec<DecisionTree>,
    pub feature_importances: Option<Vec<f64>>,
}

impl ForestModel {
    fn validate(&self) -> Result<(), EstimatorError> {
        if self.n_features == 0 {
            return Err(EstimatorError::InvalidModel("forest has zero features".into()));
        }
        if self.trees.is_empty() {
            return Err(EstimatorError::InvalidModel("forest has no trees".into()));
        }
        for tree in &self.trees {
            tree.validate(self.n_features)?;
        }
        if let Some(importances) = &self.feature_importances {
            if importances.len() != self.n_features {
                return Err(EstimatorError::InvalidModel(format!(
                    "{} importances for {} features",
                    importances.len(),
                    self.n_features
                )));
            }
        }
        Ok(())
    }

    fn row_proba(&self, row: ArrayView1<f64>) -> Result<[f64; 2], EstimatorError> {
        let mut acc = [0.0, 0.0];
        for tree in &self.trees {
            let dist = tree.leaf(row)?;
            acc[0] += dist[0];
            acc[1] += dist[1];
        }
        let n = self.trees.len() as f64;
        Ok([acc[0] / n, acc[1] / n])
    }
}

impl Estimator for ForestModel {
    fn kind(&self) -> &'static str {
        "forest"
    }

    fn n_features(&self) -> Option<usize> {
        Some(self.n_features)
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<i64>, EstimatorError> {
        check_columns(&x, self.n_features)?;
        x.rows()
            .into_iter()
            .map(|row| -> Result<i64, EstimatorError> {
                let [p0, p1] = self.row_proba(row)?;
                Ok(i64::from(p1 > p0))
            })
            .collect()
    }

    fn as_probabilistic(&self) -> Option<&dyn ProbabilisticEstimator> {
        Some(self)
    }

    fn as_explainable(&self) -> Option<&dyn ExplainableEstimator> {
        self.feature_importances
            .as_ref()
            .map(|_| self as &dyn ExplainableEstimator)
    }
}

impl ProbabilisticEstimator for ForestModel {
    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, EstimatorError> {
        check_columns(&x, self.n_features)?;
        let mut out = Array2::zeros((x.nrows(), 2));
        for (i, row) in x.rows().into_iter().enumerate() {
            let [p0, p1] = self.row_proba(row)?;
            out[[i, 0]] = p0;
            out[[i, 1]] = p1;
        }
        Ok(out)
    }
}

impl ExplainableEstimator for ForestModel {
    fn feature_importances(&self) -> &[f64] {
        self.feature_importances.as_deref().unwrap_or(&[])
    }
}
