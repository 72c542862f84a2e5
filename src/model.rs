//! Model artifacts (estimator + optional scaler) and the adapter that runs inference on them.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::features::FeatureVector;
use crate::projector::{FeatureProjector, ModelFamily};

const fn default_true() -> bool {
    true
}

/// Per-column standardisation `(x - mean) / scale`, fit once at training time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    /// Population mean/std per column; zero spread maps to a unit scale.
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let width = rows.first().map_or(0, Vec::len);
        let n = rows.len().max(1) as f64;
        let mut mean = vec![0.0; width];
        for row in rows {
            for (acc, value) in mean.iter_mut().zip(row) {
                *acc += value / n;
            }
        }
        let mut scale = vec![0.0; width];
        for row in rows {
            for ((acc, value), mu) in scale.iter_mut().zip(row).zip(&mean) {
                let diff = value - mu;
                *acc += diff * diff / n;
            }
        }
        for value in &mut scale {
            *value = value.sqrt();
            if !value.is_finite() || *value <= f64::EPSILON {
                *value = 1.0;
            }
        }
        Self { mean, scale }
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, row: &[f64]) -> Result<Vec<f64>> {
        if row.len() != self.width() || self.scale.len() != self.width() {
            return Err(ForecastError::ScalerMismatch {
                expected: self.width(),
                actual: row.len(),
            });
        }
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(value, (mean, scale))| {
                let scale = if *scale == 0.0 { 1.0 } else { *scale };
                (value - mean) / scale
            })
            .collect())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        #[serde(default = "default_true")]
        default_left: bool,
    },
    Leaf {
        value: f64,
    },
}

/// Regression tree stored as a flat node list; node 0 is the root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    fn evaluate(&self, row: &[f64]) -> Result<f64> {
        let mut idx = 0;
        // A well-formed tree reaches a leaf in fewer hops than it has nodes.
        for _ in 0..=self.nodes.len() {
            match self.nodes.get(idx) {
                Some(TreeNode::Leaf { value }) => return Ok(*value),
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    default_left,
                }) => {
                    let value = row.get(*feature).copied().ok_or(
                        ForecastError::FeatureWidthMismatch {
                            expected: feature + 1,
                            actual: row.len(),
                        },
                    )?;
                    let go_left = if value.is_nan() {
                        *default_left
                    } else {
                        value <= *threshold
                    };
                    idx = if go_left { *left } else { *right };
                }
                None => {
                    return Err(ForecastError::Artifact(format!(
                        "tree node {idx} out of range"
                    )));
                }
            }
        }
        Err(ForecastError::Artifact("tree does not terminate".into()))
    }

    fn max_feature(&self) -> Option<usize> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                TreeNode::Split { feature, .. } => Some(*feature),
                TreeNode::Leaf { .. } => None,
            })
            .max()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Estimator {
    Linear {
        intercept: f64,
        coefficients: Vec<f64>,
    },
    TreeEnsemble {
        base_score: f64,
        trees: Vec<Tree>,
    },
}

impl Estimator {
    pub fn check_width(&self, width: usize) -> Result<()> {
        match self {
            Self::Linear { coefficients, .. } if coefficients.len() != width => {
                Err(ForecastError::FeatureWidthMismatch {
                    expected: coefficients.len(),
                    actual: width,
                })
            }
            Self::TreeEnsemble { trees, .. } => {
                match trees.iter().filter_map(Tree::max_feature).max() {
                    Some(max) if max >= width => Err(ForecastError::FeatureWidthMismatch {
                        expected: max + 1,
                        actual: width,
                    }),
                    _ => Ok(()),
                }
            }
            Self::Linear { .. } => Ok(()),
        }
    }

    pub fn evaluate(&self, row: &[f64]) -> Result<f64> {
        match self {
            Self::Linear {
                intercept,
                coefficients,
            } => {
                self.check_width(row.len())?;
                Ok(coefficients
                    .iter()
                    .zip(row)
                    .fold(*intercept, |acc, (w, x)| w.mul_add(*x, acc)))
            }
            Self::TreeEnsemble { base_score, trees } => trees
                .iter()
                .try_fold(*base_score, |acc, tree| Ok(acc + tree.evaluate(row)?)),
        }
    }
}

/// Serialised model: what the registry loads and the trainer writes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: String,
    #[serde(default)]
    pub family: ModelFamily,
    pub feature_names: Vec<String>,
    #[serde(default)]
    pub scaler: Option<StandardScaler>,
    pub estimator: Estimator,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl ModelArtifact {
    /// Checks that scaler and estimator agree with the declared feature width.
    pub fn validate(&self) -> Result<()> {
        let width = self.feature_names.len();
        if let Some(scaler) = &self.scaler
            && (scaler.width() != width || scaler.scale.len() != width)
        {
            return Err(ForecastError::ScalerMismatch {
                expected: scaler.width(),
                actual: width,
            });
        }
        self.estimator.check_width(width)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| {
            ForecastError::Artifact(format!("Failed to open {}: {err}", path.display()))
        })?;
        let artifact: Self = serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            ForecastError::Artifact(format!("Failed to parse {}: {err}", path.display()))
        })?;
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}

/// Uniform `predict` over any loaded artifact. Immutable once built; share through `Arc`.
#[derive(Clone, Debug)]
pub struct ModelAdapter {
    key: String,
    projector: Arc<dyn FeatureProjector>,
    artifact: Option<Arc<ModelArtifact>>,
}

impl ModelAdapter {
    /// Adapter without an artifact; every prediction fails with `ModelNotLoaded`.
    pub fn detached(key: impl Into<String>, projector: Arc<dyn FeatureProjector>) -> Self {
        Self {
            key: key.into(),
            projector,
            artifact: None,
        }
    }

    pub fn new(
        key: impl Into<String>,
        projector: Arc<dyn FeatureProjector>,
        artifact: ModelArtifact,
    ) -> Result<Self> {
        artifact.validate()?;
        Ok(Self {
            key: key.into(),
            projector,
            artifact: Some(Arc::new(artifact)),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn family(&self) -> ModelFamily {
        self.projector.family()
    }

    pub const fn is_loaded(&self) -> bool {
        self.artifact.is_some()
    }

    pub fn artifact(&self) -> Option<&ModelArtifact> {
        self.artifact.as_deref()
    }

    fn loaded(&self) -> Result<&ModelArtifact> {
        self.artifact
            .as_deref()
            .ok_or_else(|| ForecastError::ModelNotLoaded {
                model_key: self.key.clone(),
            })
    }

    /// Feature order the artifact was trained with.
    pub fn feature_order(&self) -> Result<&[String]> {
        Ok(&self.loaded()?.feature_names)
    }

    /// Project, scale and evaluate. Pure read of immutable state.
    pub fn predict(&self, vector: &FeatureVector, feature_order: &[String]) -> Result<f64> {
        let artifact = self.loaded()?;
        let row = self.projector.project(vector, feature_order)?;
        let row = match &artifact.scaler {
            Some(scaler) => scaler.transform(&row)?,
            None => row,
        };
        artifact.estimator.evaluate(&row)
    }

    /// [`Self::predict`] in the artifact's own feature order.
    pub fn predict_vector(&self, vector: &FeatureVector) -> Result<f64> {
        self.predict(vector, self.feature_order()?)
    }
}
