use crate::error::IngestError;
use crate::model::Measurement;
use std::collections::HashMap;

/// Unit attached to a measure definition, e.g. `{ "Degree", "°", "number" }`.
#[derive(Clone, Debug)]
pub struct MeasureUnit {
    pub name: String,
    pub sign: String,
    pub value_type: String,
}

/// A measure type known to the device manager, with the value keys a
/// measurement of this type is expected to carry.
#[derive(Clone, Debug)]
pub struct MeasureDefinition {
    pub unit: Option<MeasureUnit>,
    pub value_keys: Vec<String>,
}

/// Registry of measure types. Ingestion rejects measurements whose type is
/// not registered, before anything is persisted.
#[derive(Clone, Debug, Default)]
pub struct MeasureRegistry {
    definitions: HashMap<String, MeasureDefinition>,
}

impl MeasureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in measure types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "temperature",
            MeasureDefinition {
                unit: Some(MeasureUnit {
                    name: "Degree".to_string(),
                    sign: "°".to_string(),
                    value_type: "number".to_string(),
                }),
                value_keys: vec!["temperature".to_string()],
            },
        );
        registry.register(
            "humidity",
            MeasureDefinition {
                unit: Some(MeasureUnit {
                    name: "Percentage".to_string(),
                    sign: "%".to_string(),
                    value_type: "number".to_string(),
                }),
                value_keys: vec!["humidity".to_string()],
            },
        );
        registry.register(
            "battery",
            MeasureDefinition {
                unit: Some(MeasureUnit {
                    name: "Volt".to_string(),
                    sign: "V".to_string(),
                    value_type: "number".to_string(),
                }),
                value_keys: vec!["battery".to_string()],
            },
        );
        registry.register(
            "position",
            MeasureDefinition {
                unit: None,
                value_keys: vec!["position".to_string(), "accuracy".to_string()],
            },
        );
        registry.register(
            "movement",
            MeasureDefinition {
                unit: None,
                value_keys: vec!["movement".to_string()],
            },
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, definition: MeasureDefinition) {
        self.definitions.insert(name.into(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&MeasureDefinition> {
        self.definitions.get(name)
    }

    /// Validate a decoded measurement against the registry.
    pub fn validate(&self, measurement: &Measurement) -> Result<(), IngestError> {
        if measurement.measure_name.trim().is_empty() {
            return Err(IngestError::validation("missing \"measureName\""));
        }
        if measurement.measure_type.trim().is_empty() {
            return Err(IngestError::validation("missing \"type\""));
        }
        if measurement.values.is_empty() {
            return Err(IngestError::validation(format!(
                "missing \"values\" for measure \"{}\"",
                measurement.measure_name
            )));
        }
        if self.get(&measurement.measure_type).is_none() {
            return Err(IngestError::validation(format!(
                "unknown measure type \"{}\"",
                measurement.measure_type
            )));
        }
        Ok(())
    }
}
