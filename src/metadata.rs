//! Tabular metadata and filter-expression compilation.
//!
//! The publisher owns an authoritative [`DataSet`] describing the signals it
//! can serve. Subscribe commands carry a filter expression that is compiled
//! against this metadata into an ordered set of signal IDs; the compiled set
//! seeds the subscription's signal-index cache.
//!
//! The full filter-expression engine is an external collaborator consumed
//! through the [`FilterCompiler`] trait. [`DataSetFilterCompiler`] is the
//! built-in implementation: it understands single-condition
//! `FILTER <table> WHERE <column>='<value>'` expressions and plain
//! semicolon-separated lists of signal IDs, measurement keys, or point tags.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PublisherError, Result};
use crate::signal;

/// One measurement row of the metadata set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub signal_id: Uuid,
    pub id: u32,
    pub source: String,
    pub point_tag: String,
    pub signal_reference: String,
    pub signal_type: String,
    pub device: String,
    pub description: String,
    pub enabled: bool,
}

impl MeasurementRecord {
    /// `source:id` measurement key text.
    pub fn measurement_key(&self) -> String {
        format!("{}:{}", self.source, self.id)
    }

    /// Engineering units derived from the signal type.
    pub fn engineering_units(&self) -> &'static str {
        signal::engineering_units(&self.signal_type)
    }
}

/// One device row of the metadata set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub unique_id: Uuid,
    pub acronym: String,
    pub name: String,
    pub protocol_name: String,
    pub enabled: bool,
}

impl DeviceRecord {
    /// Measurement- versus frame-oriented protocol classification.
    pub fn protocol_type(&self) -> &'static str {
        signal::protocol_type(&self.protocol_name)
    }
}

/// The metadata tables served to subscribers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSet {
    pub version: u32,
    pub devices: Vec<DeviceRecord>,
    pub measurements: Vec<MeasurementRecord>,
}

impl DataSet {
    pub fn measurement_by_signal_id(&self, signal_id: &Uuid) -> Option<&MeasurementRecord> {
        self.measurements
            .iter()
            .find(|record| record.signal_id == *signal_id)
    }

    /// Serializes the tables for a metadata-refresh response.
    pub fn serialize_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| PublisherError::Configuration(format!("metadata serialization: {e}")))
    }
}

/// Compiles a subscriber filter expression to an ordered signal-ID set.
pub trait FilterCompiler: Send + Sync {
    fn compile(&self, expression: &str) -> Result<Vec<Uuid>>;
}

/// Metadata-backed compiler for the supported expression subset.
pub struct DataSetFilterCompiler {
    dataset: Arc<DataSet>,
}

impl DataSetFilterCompiler {
    pub fn new(dataset: Arc<DataSet>) -> Self {
        Self { dataset }
    }

    fn compile_where_clause(&self, column: &str, value: &str) -> Result<Vec<Uuid>> {
        let matches = |record: &MeasurementRecord| -> bool {
            let field = if column.eq_ignore_ascii_case("SignalType") {
                &record.signal_type
            } else if column.eq_ignore_ascii_case("Source") {
                &record.source
            } else if column.eq_ignore_ascii_case("Device") {
                &record.device
            } else if column.eq_ignore_ascii_case("PointTag") {
                &record.point_tag
            } else if column.eq_ignore_ascii_case("SignalReference") {
                &record.signal_reference
            } else {
                return false;
            };
            field.eq_ignore_ascii_case(value)
        };

        let known_column = ["SignalType", "Source", "Device", "PointTag", "SignalReference"]
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(column));

        if !known_column {
            return Err(PublisherError::Configuration(format!(
                "unknown filter column \"{column}\""
            )));
        }

        Ok(self
            .dataset
            .measurements
            .iter()
            .filter(|record| record.enabled && matches(record))
            .map(|record| record.signal_id)
            .collect())
    }

    fn resolve_term(&self, term: &str) -> Result<Uuid> {
        let trimmed = term.trim().trim_matches(|c| c == '{' || c == '}');

        if let Ok(signal_id) = Uuid::parse_str(trimmed) {
            return Ok(signal_id);
        }

        if trimmed.contains(':') {
            let key = signal::MeasurementKey::parse(trimmed);
            if let Some(record) = self.dataset.measurements.iter().find(|record| {
                record.id == key.id && record.source.eq_ignore_ascii_case(&key.source)
            }) {
                return Ok(record.signal_id);
            }
        }

        if let Some(record) = self
            .dataset
            .measurements
            .iter()
            .find(|record| record.point_tag.eq_ignore_ascii_case(trimmed))
        {
            return Ok(record.signal_id);
        }

        Err(PublisherError::Configuration(format!(
            "unresolvable filter term \"{trimmed}\""
        )))
    }
}

impl FilterCompiler for DataSetFilterCompiler {
    fn compile(&self, expression: &str) -> Result<Vec<Uuid>> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Ok(Vec::new());
        }

        // ASCII-only uppercasing keeps byte offsets aligned with the input.
        let upper = expression.to_ascii_uppercase();
        if upper.starts_with("FILTER ") {
            // FILTER <table> WHERE <column>='<value>'
            let where_position = upper.find(" WHERE ").ok_or_else(|| {
                PublisherError::Configuration("filter expression missing WHERE clause".to_string())
            })?;
            let clause = expression[where_position + 7..].trim();
            let (column, value) = clause.split_once('=').ok_or_else(|| {
                PublisherError::Configuration("filter clause missing '='".to_string())
            })?;
            let value = value.trim().trim_matches('\'');
            self.compile_where_clause(column.trim(), value)
        } else {
            expression
                .split(';')
                .map(str::trim)
                .filter(|term| !term.is_empty())
                .map(|term| self.resolve_term(term))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dataset() -> Arc<DataSet> {
        let mut measurements = Vec::new();
        for (index, (tag, signal_type)) in [
            ("SHELBY-FQ", "FREQ"),
            ("SHELBY-PA1", "VPHA"),
            ("CORDOVA-FQ", "FREQ"),
            ("CORDOVA-PM1", "VPHM"),
            ("RADIUS-FQ", "FREQ"),
        ]
        .iter()
        .enumerate()
        {
            measurements.push(MeasurementRecord {
                signal_id: Uuid::new_v4(),
                id: index as u32 + 1,
                source: "PPA".to_string(),
                point_tag: tag.to_string(),
                signal_reference: tag.to_string(),
                signal_type: signal_type.to_string(),
                device: tag.split('-').next().unwrap_or_default().to_string(),
                description: String::new(),
                enabled: true,
            });
        }

        Arc::new(DataSet {
            version: 1,
            devices: vec![DeviceRecord {
                unique_id: Uuid::new_v4(),
                acronym: "SHELBY".to_string(),
                name: "Shelby substation".to_string(),
                protocol_name: "Gateway Transport".to_string(),
                enabled: true,
            }],
            measurements,
        })
    }

    #[test]
    fn test_filter_by_signal_type() {
        let dataset = sample_dataset();
        let compiler = DataSetFilterCompiler::new(dataset.clone());

        let signal_ids = compiler
            .compile("FILTER ActiveMeasurements WHERE SignalType='FREQ'")
            .expect("compile");
        assert_eq!(signal_ids.len(), 3);

        // Compilation order follows metadata order.
        let expected: Vec<Uuid> = dataset
            .measurements
            .iter()
            .filter(|record| record.signal_type == "FREQ")
            .map(|record| record.signal_id)
            .collect();
        assert_eq!(signal_ids, expected);
    }

    #[test]
    fn test_filter_unknown_column_fails() {
        let compiler = DataSetFilterCompiler::new(sample_dataset());
        assert!(compiler
            .compile("FILTER ActiveMeasurements WHERE Voltage='11'")
            .is_err());
    }

    #[test]
    fn test_direct_signal_id_list() {
        let dataset = sample_dataset();
        let compiler = DataSetFilterCompiler::new(dataset.clone());

        let first = dataset.measurements[0].signal_id;
        let third = dataset.measurements[2].signal_id;
        let expression = format!("{first};{third}");

        assert_eq!(compiler.compile(&expression).expect("compile"), vec![first, third]);
    }

    #[test]
    fn test_measurement_key_and_tag_list() {
        let dataset = sample_dataset();
        let compiler = DataSetFilterCompiler::new(dataset.clone());

        let signal_ids = compiler.compile("PPA:2; CORDOVA-PM1").expect("compile");
        assert_eq!(
            signal_ids,
            vec![
                dataset.measurements[1].signal_id,
                dataset.measurements[3].signal_id
            ]
        );
    }

    #[test]
    fn test_unresolvable_term_fails() {
        let compiler = DataSetFilterCompiler::new(sample_dataset());
        assert!(compiler.compile("NO-SUCH-TAG").is_err());
    }

    #[test]
    fn test_disabled_rows_excluded() {
        let mut dataset = (*sample_dataset()).clone();
        for record in &mut dataset.measurements {
            if record.signal_type == "FREQ" {
                record.enabled = false;
            }
        }
        let compiler = DataSetFilterCompiler::new(Arc::new(dataset));
        let signal_ids = compiler
            .compile("FILTER ActiveMeasurements WHERE SignalType='FREQ'")
            .expect("compile");
        assert!(signal_ids.is_empty());
    }

    #[test]
    fn test_dataset_json_roundtrip() {
        let dataset = sample_dataset();
        let serialized = dataset.serialize_json().expect("serialize");
        let parsed: DataSet = serde_json::from_slice(&serialized).expect("deserialize");
        assert_eq!(parsed.version, dataset.version);
        assert_eq!(parsed.measurements.len(), dataset.measurements.len());
        assert_eq!(parsed.devices[0].protocol_type(), "Measurement");
    }
}
