//! HTTP surface over the prediction service.
//!
//! - `GET  /health`
//! - `GET  /features`, `GET /features/metadata`
//! - `GET  /model_info`
//! - `POST /api/predict` (JSON object of feature name to value)
//! - `POST /predict` (form-encoded fields)

use anyhow::{anyhow, Result};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::config::AppConfig;
use crate::features::{describe_schema, FeatureMeta, FeatureValues};
use crate::service::{PredictionError, PredictionResult, PredictionService, RainLabel};

pub type SharedService = Arc<PredictionService>;

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ApiPredictResponse {
    pub prediction: u8,
    pub label: RainLabel,
    pub probability: Option<[f64; 2]>,
    pub rain_chance: Option<f64>,
    pub confidence: Option<f64>,
    pub feature_importance: Option<IndexMap<String, f64>>,
    pub demo_mode: bool,
    pub warning: Option<String>,
    pub status: &'static str,
}

impl From<PredictionResult> for ApiPredictResponse {
    fn from(result: PredictionResult) -> Self {
        Self {
            prediction: result.label.code(),
            label: result.label,
            rain_chance: result.rain_chance(),
            probability: result.probability,
            confidence: result.confidence,
            feature_importance: result.feature_importance,
            demo_mode: result.demo_mode,
            warning: result.warning,
            status: "success",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FormPredictResponse {
    pub prediction: &'static str,
    pub result_class: &'static str,
    pub confidence: Option<f64>,
    pub features: IndexMap<String, f64>,
    pub feature_count: usize,
    pub demo_mode: bool,
    pub warning: Option<String>,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct FeaturesResponse {
    pub features: Vec<String>,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct MetadataResponse {
    pub features: Vec<FeatureMeta>,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub status: &'static str,
}

#[derive(Debug)]
struct Unauthorized;

impl warp::reject::Reject for Unauthorized {}

// =============================================================================
// Routes
// =============================================================================

pub fn routes(
    service: SharedService,
    cfg: &AppConfig,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let limit = cfg.max_body_bytes;

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_service(service.clone()))
        .map(handle_health);

    let features = warp::path("features")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_service(service.clone()))
        .map(handle_features);

    let metadata = warp::path("features")
        .and(warp::path("metadata"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_service(service.clone()))
        .map(handle_metadata);

    let model_info = warp::path("model_info")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_service(service.clone()))
        .map(|service: SharedService| warp::reply::json(&service.model_info()));

    let api_predict = warp::path("api")
        .and(warp::path("predict"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_api_key(cfg.api_key.clone()))
        .and(warp::body::content_length_limit(limit))
        .and(warp::body::json())
        .and(with_service(service.clone()))
        .and_then(handle_api_predict);

    let form_predict = warp::path("predict")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_api_key(cfg.api_key.clone()))
        .and(warp::body::content_length_limit(limit))
        .and(warp::body::form())
        .and(with_service(service))
        .and_then(handle_form_predict);

    health
        .or(features)
        .or(metadata)
        .or(model_info)
        .or(api_predict)
        .or(form_predict)
        .recover(handle_rejection)
        .with(warp::log("rainfall::http"))
}

/// Bind `cfg.bind` and serve until the returned future is dropped.
pub async fn serve(cfg: &AppConfig, service: SharedService) -> Result<()> {
    let addr: SocketAddr = cfg
        .bind
        .parse()
        .map_err(|e| anyhow!("invalid bind address '{}': {}", cfg.bind, e))?;
    let (bound, server) = warp::serve(routes(service, cfg)).try_bind_ephemeral(addr)?;
    log::info!("Serving rainfall predictions on http://{}", bound);
    server.await;
    Ok(())
}

// =============================================================================
// Filters
// =============================================================================

fn with_service(
    service: SharedService,
) -> impl Filter<Extract = (SharedService,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

/// Passes when no key is configured or the `x-api-key` header matches.
fn with_api_key(expected: Option<String>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("x-api-key")
        .and_then(move |provided: Option<String>| {
            let expected = expected.clone();
            async move {
                match (expected, provided) {
                    (None, _) => Ok(()),
                    (Some(expected), Some(provided))
                        if constant_time_compare(&expected, &provided) =>
                    {
                        Ok(())
                    }
                    _ => Err(warp::reject::custom(Unauthorized)),
                }
            }
        })
        .untuple_one()
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

// =============================================================================
// Handlers
// =============================================================================

fn handle_health(service: SharedService) -> impl Reply {
    warp::reply::json(&serde_json::json!({
        "status": "ok",
        "model_ready": service.is_ready(),
    }))
}

fn handle_features(service: SharedService) -> impl Reply {
    warp::reply::json(&FeaturesResponse {
        features: service.schema().names().to_vec(),
        status: "success",
    })
}

fn handle_metadata(service: SharedService) -> impl Reply {
    warp::reply::json(&MetadataResponse {
        features: describe_schema(service.schema()),
        status: "success",
    })
}

async fn handle_api_predict(
    body: serde_json::Value,
    service: SharedService,
) -> Result<warp::reply::Response, Infallible> {
    let object = match body.as_object() {
        Some(object) if !object.is_empty() => object,
        _ => {
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                "No data provided".to_string(),
            ))
        }
    };
    let features = FeatureValues::from_json(object);
    match service.predict_and_log(&features) {
        Ok(result) => Ok(warp::reply::with_status(
            warp::reply::json(&ApiPredictResponse::from(result)),
            StatusCode::OK,
        )
        .into_response()),
        Err(e) => Ok(prediction_error_response(&e)),
    }
}

async fn handle_form_predict(
    fields: HashMap<String, String>,
    service: SharedService,
) -> Result<warp::reply::Response, Infallible> {
    let features = FeatureValues::from_form(fields);
    match service.predict_and_log(&features) {
        Ok(result) => {
            let submitted: IndexMap<String, f64> = features
                .numeric_subset(service.schema().iter())
                .into_iter()
                .collect();
            let resp = FormPredictResponse {
                prediction: result.label.headline(),
                result_class: result.label.css_class(),
                confidence: result.confidence.map(|c| (c * 100.0).round() / 100.0),
                feature_count: submitted.len(),
                features: submitted,
                demo_mode: result.demo_mode,
                warning: result.warning,
                status: "success",
            };
            Ok(warp::reply::with_status(warp::reply::json(&resp), StatusCode::OK).into_response())
        }
        Err(e) => Ok(prediction_error_response(&e)),
    }
}

fn prediction_error_response(e: &PredictionError) -> warp::reply::Response {
    let status = if e.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    error_response(status, e.to_string())
}

fn error_response(status: StatusCode, error: String) -> warp::reply::Response {
    let body = ApiError {
        error,
        status: "error",
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

async fn handle_rejection(err: Rejection) -> Result<warp::reply::Response, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Page not found".to_string())
    } else if err.find::<Unauthorized>().is_some() {
        (StatusCode::UNAUTHORIZED, "Please login first".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid request body: {e}"))
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large".to_string())
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (
            StatusCode::LENGTH_REQUIRED,
            "Content-Length header required".to_string(),
        )
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Unsupported content type".to_string(),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        log::error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    };
    Ok(error_response(status, message))
}
