//! Model registry built once at startup and passed by reference to the forecaster.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::config::ModelEntry;
use crate::error::Result;
use crate::model::{ModelAdapter, ModelArtifact};

#[derive(Clone, Debug, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelAdapter>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every configured model. A missing artifact file leaves the key registered but
    /// not loaded; an unreadable or inconsistent one is an error.
    pub fn from_entries(entries: &[ModelEntry]) -> Result<Self> {
        let mut registry = Self::new();
        for entry in entries {
            let projector = entry.family.projector();
            if !entry.path.exists() {
                warn!(
                    operation = "startup",
                    model = %entry.key,
                    path = %entry.path.display(),
                    "Model artifact not found, model will report as not loaded"
                );
                registry.insert(ModelAdapter::detached(&entry.key, projector));
                continue;
            }

            let artifact = ModelArtifact::load(&entry.path)?;
            if artifact.family != entry.family {
                warn!(
                    operation = "startup",
                    model = %entry.key,
                    configured = %entry.family,
                    artifact = %artifact.family,
                    "Artifact family differs from configuration, using the configured projector"
                );
            }
            info!(
                operation = "startup",
                model = %entry.key,
                family = %entry.family,
                version = %artifact.version,
                features = artifact.feature_names.len(),
                "Loaded model"
            );
            registry.insert(ModelAdapter::new(&entry.key, projector, artifact)?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, adapter: ModelAdapter) {
        self.models.insert(adapter.key().to_string(), adapter);
    }

    /// Loaded model for `key`; `None` when unknown or never trained.
    pub fn get_model(&self, key: &str) -> Option<&ModelAdapter> {
        self.models.get(key).filter(|adapter| adapter.is_loaded())
    }

    pub fn is_loaded(&self, key: &str) -> bool {
        self.get_model(key).is_some()
    }

    pub fn any_loaded(&self) -> bool {
        self.models.values().any(ModelAdapter::is_loaded)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Estimator;
    use crate::projector::ModelFamily;

    fn artifact() -> ModelArtifact {
        ModelArtifact {
            version: "20240101_000000".into(),
            family: ModelFamily::Balanced,
            feature_names: vec!["lag_1".into()],
            scaler: None,
            estimator: Estimator::Linear {
                intercept: 0.0,
                coefficients: vec![1.0],
            },
            metrics: BTreeMap::new(),
        }
    }

    #[test]
    fn missing_artifact_registers_detached_model() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("balanced.json");
        artifact().save(&present).unwrap();

        let entries = vec![
            ModelEntry {
                key: "balanced".into(),
                path: present,
                family: ModelFamily::Balanced,
            },
            ModelEntry {
                key: "prototype".into(),
                path: dir.path().join("missing.json"),
                family: ModelFamily::Prototype,
            },
        ];
        let registry = ModelRegistry::from_entries(&entries).unwrap();

        assert!(registry.is_loaded("balanced"));
        assert!(!registry.is_loaded("prototype"));
        assert!(registry.get_model("prototype").is_none());
        assert!(registry.get_model("unknown").is_none());
        assert!(registry.any_loaded());
        assert_eq!(
            registry.keys().collect::<Vec<_>>(),
            vec!["balanced", "prototype"]
        );
    }

    #[test]
    fn corrupt_artifact_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("balanced.json");
        std::fs::write(&path, "{not json").unwrap();
        let entries = vec![ModelEntry {
            key: "balanced".into(),
            path,
            family: ModelFamily::Balanced,
        }];
        assert!(ModelRegistry::from_entries(&entries).is_err());
    }
}
