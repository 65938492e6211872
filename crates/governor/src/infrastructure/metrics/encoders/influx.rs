use std::collections::HashMap;

use influxdb_line_protocol::LineProtocolBuilder;

use super::FieldValue;
use super::MetricsEncoder;
use crate::infrastructure::metrics::BytesWrapper;

/// InfluxDB line protocol encoder
pub struct InfluxEncoder;

impl MetricsEncoder for InfluxEncoder {
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &HashMap<String, String>,
        fields: &HashMap<String, FieldValue>,
        timestamp: i64,
    ) -> String {
        let mut builder = LineProtocolBuilder::new().measurement(measurement);

        let mut tag_entries: Vec<_> = tags.iter().collect();
        tag_entries.sort_by_key(|(k, _)| *k);
        for (key, value) in tag_entries {
            builder = builder.tag(key, value);
        }

        // the first field moves the builder into its AfterField state
        let mut field_entries: Vec<_> = fields.iter().collect();
        field_entries.sort_by_key(|(k, _)| *k);

        let Some((first_key, first_value)) = field_entries.first() else {
            let lp_built = builder
                .field("_empty", true)
                .timestamp(timestamp)
                .close_line()
                .build();
            return BytesWrapper::from(lp_built).to_string();
        };

        let mut after_first_field = match first_value {
            FieldValue::String(s) => builder.field(first_key, s.as_str()),
            FieldValue::Integer(i) => builder.field(first_key, *i),
            FieldValue::UnsignedInteger(u) => builder.field(first_key, *u),
            FieldValue::Float(f) => builder.field(first_key, *f),
            FieldValue::Boolean(b) => builder.field(first_key, *b),
        };
        for (key, value) in field_entries.iter().skip(1) {
            after_first_field = match value {
                FieldValue::String(s) => after_first_field.field(key, s.as_str()),
                FieldValue::Integer(i) => after_first_field.field(key, *i),
                FieldValue::UnsignedInteger(u) => after_first_field.field(key, *u),
                FieldValue::Float(f) => after_first_field.field(key, *f),
                FieldValue::Boolean(b) => after_first_field.field(key, *b),
            };
        }

        let lp_built = after_first_field.timestamp(timestamp).close_line().build();
        BytesWrapper::from(lp_built).to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn encodes_queue_measurement() {
        let mut tags = HashMap::new();
        tags.insert("priority".to_string(), "critical".to_string());
        let mut fields = HashMap::new();
        fields.insert("depth".to_string(), 12u64.into());
        fields.insert("occupancy".to_string(), 0.25.into());

        let line = InfluxEncoder.encode_metrics("governor_queue", &tags, &fields, 1_700_000_000_000);

        assert!(line.starts_with("governor_queue,priority=critical "));
        assert!(line.contains("depth=12u"));
        assert!(line.contains("occupancy=0.25"));
        assert!(line.trim_end().ends_with("1700000000000"));
    }

    #[test]
    fn fields_are_sorted() {
        let mut fields = HashMap::new();
        fields.insert("zeta".to_string(), 1i64.into());
        fields.insert("alpha".to_string(), true.into());
        fields.insert("mid".to_string(), "open".into());

        let line = InfluxEncoder.encode_metrics("governor_breaker", &HashMap::new(), &fields, 1);

        assert!(line.starts_with("governor_breaker alpha=true,mid=\"open\",zeta=1i 1"));
    }

    #[test]
    fn empty_fields_emit_marker() {
        let line = InfluxEncoder.encode_metrics("governor_cache", &HashMap::new(), &HashMap::new(), 5);
        assert!(line.contains("_empty=true"));
    }
}
