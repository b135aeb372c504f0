use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::service::PredictionError;

/// Ordered feature names. Position `i` is column `i` of the estimator input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSchema(Vec<String>);

impl FeatureSchema {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    /// 12-entry set served by the web form.
    pub fn meteorological() -> Self {
        Self::new([
            "temperature",
            "humidity",
            "wind_speed",
            "pressure",
            "cloud_cover",
            "precipitation",
            "visibility",
            "dew_point",
            "wind_direction",
            "solar_radiation",
            "uv_index",
            "precipitation_3hr",
        ])
    }

    /// 10-entry set of the daily observation dataset. `temparature` is spelled
    /// the way the dataset column is.
    pub fn daily() -> Self {
        Self::new([
            "pressure",
            "maxtemp",
            "temparature",
            "mintemp",
            "dewpoint",
            "humidity",
            "cloud",
            "sunshine",
            "winddirection",
            "windspeed",
        ])
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Schema used when an artifact does not carry `feature_names`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultSchema {
    #[default]
    Meteorological,
    Daily,
}

impl DefaultSchema {
    pub fn schema(self) -> FeatureSchema {
        match self {
            DefaultSchema::Meteorological => FeatureSchema::meteorological(),
            DefaultSchema::Daily => FeatureSchema::daily(),
        }
    }
}

/// A raw, not yet coerced, input value.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureInput {
    Number(f64),
    Text(String),
    /// Booleans, nulls, arrays and objects from a JSON body.
    Other(String),
}

/// Per-request mapping of feature name to untrusted input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureValues {
    values: HashMap<String, FeatureInput>,
}

impl FeatureValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(object: &serde_json::Map<String, serde_json::Value>) -> Self {
        let values = object
            .iter()
            .map(|(name, value)| {
                let input = match value {
                    serde_json::Value::Number(n) => match n.as_f64() {
                        Some(f) => FeatureInput::Number(f),
                        None => FeatureInput::Other(n.to_string()),
                    },
                    serde_json::Value::String(s) => FeatureInput::Text(s.clone()),
                    other => FeatureInput::Other(other.to_string()),
                };
                (name.clone(), input)
            })
            .collect();
        Self { values }
    }

    pub fn from_form(fields: HashMap<String, String>) -> Self {
        let values = fields
            .into_iter()
            .map(|(name, value)| (name, FeatureInput::Text(value)))
            .collect();
        Self { values }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), FeatureInput::Number(value));
    }

    pub fn insert_text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), FeatureInput::Text(value.into()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// `Ok(None)` when absent, an error when present but not a finite number.
    pub fn value(&self, name: &str) -> Result<Option<f64>, PredictionError> {
        let parsed = match self.values.get(name) {
            None => return Ok(None),
            Some(FeatureInput::Number(v)) => Some(*v),
            Some(FeatureInput::Text(s)) => s.trim().parse::<f64>().ok(),
            Some(FeatureInput::Other(_)) => None,
        };
        match parsed {
            Some(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(PredictionError::NonNumericFeature {
                name: name.to_string(),
                value: self.raw(name),
            }),
        }
    }

    fn raw(&self, name: &str) -> String {
        match self.values.get(name) {
            Some(FeatureInput::Number(v)) => v.to_string(),
            Some(FeatureInput::Text(s)) | Some(FeatureInput::Other(s)) => s.clone(),
            None => String::new(),
        }
    }

    /// Values for the given names that parse; used for logging and echoing input back.
    pub fn numeric_subset<'a>(&self, names: impl Iterator<Item = &'a str>) -> Vec<(String, f64)> {
        names
            .filter_map(|name| match self.value(name) {
                Ok(Some(v)) => Some((name.to_string(), v)),
                _ => None,
            })
            .collect()
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for FeatureValues {
    fn from_iter<T: IntoIterator<Item = (S, f64)>>(iter: T) -> Self {
        let mut values = FeatureValues::new();
        for (name, value) in iter {
            values.insert(name, value);
        }
        values
    }
}

/// Presentation metadata. Not used to validate inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureMeta {
    pub name: String,
    pub icon: &'static str,
    pub unit: &'static str,
    pub description: &'static str,
    pub default_value: f64,
    pub typical_range: Option<(f64, f64)>,
}

struct MetaEntry {
    name: &'static str,
    icon: &'static str,
    unit: &'static str,
    description: &'static str,
    default_value: f64,
    typical_range: Option<(f64, f64)>,
}

const fn entry(
    name: &'static str,
    icon: &'static str,
    unit: &'static str,
    description: &'static str,
    default_value: f64,
    typical_range: Option<(f64, f64)>,
) -> MetaEntry {
    MetaEntry {
        name,
        icon,
        unit,
        description,
        default_value,
        typical_range,
    }
}

const METADATA: &[MetaEntry] = &[
    entry("temperature", "thermometer-half", "°C", "Air temperature in Celsius", 25.0, Some((-10.0, 35.0))),
    entry("humidity", "tint", "%", "Relative humidity percentage", 65.0, Some((0.0, 100.0))),
    entry("wind_speed", "wind", "km/h", "Wind speed in kilometers per hour", 12.0, Some((0.0, 100.0))),
    entry("pressure", "tachometer-alt", "hPa", "Atmospheric pressure in hectopascals", 1013.0, Some((980.0, 1040.0))),
    entry("cloud_cover", "cloud", "%", "Percentage of sky covered by clouds", 45.0, Some((0.0, 100.0))),
    entry("precipitation", "cloud-rain", "mm", "Current precipitation in millimeters", 0.0, None),
    entry("visibility", "eye", "km", "Visibility distance in kilometers", 10.0, None),
    entry("dew_point", "snowflake", "°C", "Dew point temperature in Celsius", 18.0, Some((-10.0, 30.0))),
    entry("wind_direction", "compass", "degrees", "Wind direction in degrees (0-360)", 180.0, Some((0.0, 360.0))),
    entry("solar_radiation", "sun", "W/m²", "Solar radiation intensity in watts per square meter", 500.0, None),
    entry("uv_index", "sun", "index", "Ultraviolet radiation index", 5.0, None),
    entry("precipitation_3hr", "cloud-showers-heavy", "mm", "Precipitation in last 3 hours in millimeters", 0.0, None),
    entry("maxtemp", "thermometer-full", "°C", "Maximum daily temperature in Celsius", 30.0, Some((0.0, 40.0))),
    entry("temparature", "thermometer-half", "°C", "Mean daily temperature in Celsius", 25.0, Some((-10.0, 35.0))),
    entry("mintemp", "thermometer-empty", "°C", "Minimum daily temperature in Celsius", 20.0, Some((-10.0, 30.0))),
    entry("dewpoint", "snowflake", "°C", "Dew point temperature in Celsius", 18.0, Some((-10.0, 30.0))),
    entry("cloud", "cloud", "%", "Percentage of sky covered by clouds", 45.0, Some((0.0, 100.0))),
    entry("sunshine", "sun", "hours", "Hours of sunshine", 6.0, Some((0.0, 12.0))),
    entry("winddirection", "compass", "degrees", "Wind direction in degrees (0-360)", 180.0, Some((0.0, 360.0))),
    entry("windspeed", "wind", "km/h", "Wind speed in kilometers per hour", 12.0, Some((0.0, 100.0))),
];

pub fn describe(name: &str) -> FeatureMeta {
    match METADATA.iter().find(|m| m.name == name) {
        Some(m) => FeatureMeta {
            name: name.to_string(),
            icon: m.icon,
            unit: m.unit,
            description: m.description,
            default_value: m.default_value,
            typical_range: m.typical_range,
        },
        None => FeatureMeta {
            name: name.to_string(),
            icon: "chart-line",
            unit: "units",
            description: "Weather parameter",
            default_value: 0.0,
            typical_range: None,
        },
    }
}

pub fn describe_schema(schema: &FeatureSchema) -> Vec<FeatureMeta> {
    schema.iter().map(describe).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_schemas_have_expected_sizes() {
        assert_eq!(DefaultSchema::Meteorological.schema().len(), 12);
        assert_eq!(DefaultSchema::Daily.schema().len(), 10);
        assert_eq!(
            FeatureSchema::meteorological().names()[11],
            "precipitation_3hr"
        );
    }

    #[test]
    fn json_values_coerce_numbers_and_numeric_strings() {
        let body = json!({"humidity": 65, "cloud_cover": " 45.5 ", "note": "hello"});
        let values = FeatureValues::from_json(body.as_object().unwrap());
        assert_eq!(values.value("humidity").unwrap(), Some(65.0));
        assert_eq!(values.value("cloud_cover").unwrap(), Some(45.5));
        assert_eq!(values.value("pressure").unwrap(), None);
        assert!(matches!(
            values.value("note"),
            Err(PredictionError::NonNumericFeature { .. })
        ));
    }

    #[test]
    fn non_finite_and_non_scalar_inputs_are_rejected() {
        let body = json!({"a": "NaN", "b": "inf", "c": true, "d": null, "e": [1.0]});
        let values = FeatureValues::from_json(body.as_object().unwrap());
        for name in ["a", "b", "c", "d", "e"] {
            assert!(values.value(name).is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn form_values_are_parsed_lazily() {
        let mut fields = HashMap::new();
        fields.insert("humidity".to_string(), "90".to_string());
        fields.insert("csrf".to_string(), "abc".to_string());
        let values = FeatureValues::from_form(fields);
        assert_eq!(values.value("humidity").unwrap(), Some(90.0));
        assert!(values.contains("csrf"));
    }

    #[test]
    fn metadata_falls_back_for_unknown_names() {
        let meta = describe("humidity");
        assert_eq!(meta.unit, "%");
        assert_eq!(meta.typical_range, Some((0.0, 100.0)));
        let unknown = describe("soil_moisture");
        assert_eq!(unknown.icon, "chart-line");
        assert_eq!(unknown.description, "Weather parameter");
    }

    #[test]
    fn every_default_feature_has_metadata() {
        let known: Vec<&str> = METADATA.iter().map(|m| m.name).collect();
        for name in FeatureSchema::meteorological()
            .iter()
            .chain(FeatureSchema::daily().iter())
        {
            assert!(known.contains(&name), "{name} has no metadata");
        }
    }
}
