use std::collections::HashMap;

use serde::Serialize;

pub mod influx;
pub mod json;

/// Field value for metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    UnsignedInteger(u64),
    Float(f64),
    Boolean(bool),
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::UnsignedInteger(value)
    }
}

impl From<usize> for FieldValue {
    fn from(value: usize) -> Self {
        FieldValue::UnsignedInteger(value as u64)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::UnsignedInteger(u64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

/// One measurement ready for encoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurement {
    pub name: &'static str,
    pub tags: HashMap<String, String>,
    pub fields: HashMap<String, FieldValue>,
}

impl Measurement {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// Trait for encoding metrics in different formats
pub trait MetricsEncoder: Send + Sync {
    /// Encode metrics with measurement name, tags, fields, and timestamp
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &HashMap<String, String>,
        fields: &HashMap<String, FieldValue>,
        timestamp: i64,
    ) -> String;

    fn encode_measurement(&self, measurement: &Measurement, timestamp: i64) -> String {
        self.encode_metrics(
            measurement.name,
            &measurement.tags,
            &measurement.fields,
            timestamp,
        )
    }
}

/// Concrete encoder without dynamic dispatch
pub enum Encoder {
    Json(json::JsonEncoder),
    Influx(influx::InfluxEncoder),
}

impl MetricsEncoder for Encoder {
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &HashMap<String, String>,
        fields: &HashMap<String, FieldValue>,
        timestamp: i64,
    ) -> String {
        match self {
            Encoder::Json(inner) => inner.encode_metrics(measurement, tags, fields, timestamp),
            Encoder::Influx(inner) => inner.encode_metrics(measurement, tags, fields, timestamp),
        }
    }
}

/// Factory function to create encoders based on format string (static dispatch)
pub fn create_encoder(format: &str) -> Encoder {
    match format.to_lowercase().as_str() {
        "json" => Encoder::Json(json::JsonEncoder),
        _ => Encoder::Influx(influx::InfluxEncoder),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn field_value_conversions() {
        assert_eq!(FieldValue::from("x"), FieldValue::String("x".to_string()));
        assert_eq!(FieldValue::from(3usize), FieldValue::UnsignedInteger(3));
        assert_eq!(FieldValue::from(7u32), FieldValue::UnsignedInteger(7));
        assert_eq!(FieldValue::from(-2i64), FieldValue::Integer(-2));
        assert_eq!(FieldValue::from(true), FieldValue::Boolean(true));
    }

    #[test]
    fn measurement_builder_collects_tags_and_fields() {
        let m = Measurement::new("governor_queue")
            .tag("priority", "high")
            .field("depth", 4usize);
        assert_eq!(m.tags.get("priority").map(String::as_str), Some("high"));
        assert_eq!(m.fields.get("depth"), Some(&FieldValue::UnsignedInteger(4)));
    }

    #[test]
    fn factory_selects_format() {
        assert!(matches!(create_encoder("JSON"), Encoder::Json(_)));
        assert!(matches!(create_encoder("influx"), Encoder::Influx(_)));
        assert!(matches!(create_encoder("other"), Encoder::Influx(_)));
    }
}
