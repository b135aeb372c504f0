//! Rain / no-rain predictions from a pre-trained classifier.
//!
//! - `artifact`: loads a persisted estimator, raw or bundled with its schema
//! - `service`: validates and orders feature values, runs inference, falls
//!   back to a demo heuristic when no model is available
//! - `http`: JSON API and form endpoint over the service

pub mod artifact;
pub mod config;
pub mod estimator;
pub mod features;
pub mod http;
pub mod service;

pub use artifact::{LoadError, LoadedModel};
pub use features::{FeatureSchema, FeatureValues};
pub use service::{PredictionError, PredictionResult, PredictionService};
