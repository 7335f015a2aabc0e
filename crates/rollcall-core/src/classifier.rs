//! k-nearest-neighbor classifier store.
//!
//! A brute-force k-NN over L2-normalized embeddings with cosine distance,
//! plus a label encoder mapping student labels to dense class ids. The pair
//! is persisted as two JSON files in one directory and reloaded read-only by
//! the recognition engine.

use crate::types::{cosine_distance, Embedding};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the fitted neighbor model inside the classifier directory.
pub const MODEL_FILE: &str = "knn_model.json";
/// File name of the label encoder inside the classifier directory.
pub const ENCODER_FILE: &str = "label_encoder.json";
/// Neighbor count used when retraining.
pub const DEFAULT_K: usize = 3;

const METRIC_COSINE: &str = "cosine";

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier store not found in {0}; enroll at least one student and retrain")]
    StoreMissing(PathBuf),
    #[error("no embeddings to train on")]
    EmptyTrainingSet,
    #[error("k must be at least 1")]
    InvalidK,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("corrupt classifier store: {0}")]
    Corrupt(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sorted set of class labels; a label's id is its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    pub fn fit<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut classes: Vec<String> = labels.into_iter().map(Into::into).collect();
        classes.sort();
        classes.dedup();
        Self { classes }
    }

    pub fn transform(&self, label: &str) -> Option<usize> {
        self.classes
            .binary_search_by(|c| c.as_str().cmp(label))
            .ok()
    }

    pub fn inverse_transform(&self, id: usize) -> Option<&str> {
        self.classes.get(id).map(String::as_str)
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// One neighbor returned by [`KnnClassifier::kneighbors`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Index of the training sample.
    pub index: usize,
    pub distance: f32,
    pub class_id: usize,
}

/// Brute-force k-NN with cosine distance and uniform vote weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnnClassifier {
    k: usize,
    metric: String,
    n_classes: usize,
    vectors: Vec<Vec<f32>>,
    class_ids: Vec<usize>,
}

impl KnnClassifier {
    /// Fit over `(vector, class id)` pairs. Vectors are stored as given;
    /// callers normalize them first.
    pub fn fit(
        k: usize,
        samples: Vec<(Vec<f32>, usize)>,
        n_classes: usize,
    ) -> Result<Self, ClassifierError> {
        if k == 0 {
            return Err(ClassifierError::InvalidK);
        }
        let dim = match samples.first() {
            Some((v, _)) => v.len(),
            None => return Err(ClassifierError::EmptyTrainingSet),
        };

        let mut vectors = Vec::with_capacity(samples.len());
        let mut class_ids = Vec::with_capacity(samples.len());
        for (vector, class_id) in samples {
            if vector.len() != dim {
                return Err(ClassifierError::DimensionMismatch {
                    expected: dim,
                    actual: vector.len(),
                });
            }
            if class_id >= n_classes {
                return Err(ClassifierError::Corrupt(format!(
                    "class id {class_id} out of range for {n_classes} classes"
                )));
            }
            vectors.push(vector);
            class_ids.push(class_id);
        }

        Ok(Self {
            k,
            metric: METRIC_COSINE.to_string(),
            n_classes,
            vectors,
            class_ids,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn n_samples(&self) -> usize {
        self.vectors.len()
    }

    pub fn dim(&self) -> usize {
        self.vectors.first().map_or(0, Vec::len)
    }

    /// The `n` closest training samples, nearest first. Ties keep training order.
    pub fn kneighbors(&self, query: &[f32], n: usize) -> Vec<Neighbor> {
        let mut all: Vec<Neighbor> = self
            .vectors
            .iter()
            .zip(self.class_ids.iter())
            .enumerate()
            .map(|(index, (v, &class_id))| Neighbor {
                index,
                distance: cosine_distance(query, v),
                class_id,
            })
            .collect();

        all.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.index.cmp(&b.index))
        });
        all.truncate(n);
        all
    }

    /// Class probabilities: the fraction of the `k` nearest neighbors voting for each class.
    ///
    /// With fewer than `k` training samples, all samples vote.
    pub fn predict_proba(&self, query: &[f32]) -> Vec<f32> {
        let neighbors = self.kneighbors(query, self.k);
        let mut votes = vec![0usize; self.n_classes];
        for n in &neighbors {
            votes[n.class_id] += 1;
        }
        let total = neighbors.len();
        votes
            .into_iter()
            .map(|v| if total > 0 { v as f32 / total as f32 } else { 0.0 })
            .collect()
    }

    fn validate(&self) -> Result<(), ClassifierError> {
        if self.metric != METRIC_COSINE {
            return Err(ClassifierError::Corrupt(format!(
                "unsupported metric {:?}",
                self.metric
            )));
        }
        if self.k == 0 {
            return Err(ClassifierError::InvalidK);
        }
        if self.vectors.is_empty() || self.vectors.len() != self.class_ids.len() {
            return Err(ClassifierError::Corrupt(
                "sample and label counts disagree".into(),
            ));
        }
        let dim = self.dim();
        if let Some(v) = self.vectors.iter().find(|v| v.len() != dim) {
            return Err(ClassifierError::DimensionMismatch {
                expected: dim,
                actual: v.len(),
            });
        }
        if self.class_ids.iter().any(|&c| c >= self.n_classes) {
            return Err(ClassifierError::Corrupt("class id out of range".into()));
        }
        Ok(())
    }
}

/// Outcome of classifying one embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Label of the most probable class (raw, normalized form).
    pub label: String,
    /// Cosine distance to the single nearest training sample.
    pub distance: f32,
    /// Probability of the predicted class in [0, 1].
    pub confidence: f32,
}

/// A fitted classifier together with its label encoder.
#[derive(Debug, Clone)]
pub struct ClassifierStore {
    model: KnnClassifier,
    encoder: LabelEncoder,
}

impl ClassifierStore {
    /// Train from `(embedding, label)` pairs. Embeddings are L2-normalized here.
    pub fn train(samples: Vec<(Embedding, String)>, k: usize) -> Result<Self, ClassifierError> {
        if samples.is_empty() {
            return Err(ClassifierError::EmptyTrainingSet);
        }

        let encoder = LabelEncoder::fit(samples.iter().map(|(_, label)| label.clone()));
        let mut encoded = Vec::with_capacity(samples.len());
        for (embedding, label) in samples {
            let class_id = encoder
                .transform(&label)
                .ok_or_else(|| ClassifierError::Corrupt(format!("label {label:?} not encoded")))?;
            encoded.push((embedding.normalized().values, class_id));
        }

        let model = KnnClassifier::fit(k, encoded, encoder.len())?;
        tracing::info!(
            samples = model.n_samples(),
            classes = encoder.len(),
            k,
            "k-NN classifier trained"
        );
        Ok(Self { model, encoder })
    }

    pub fn model(&self) -> &KnnClassifier {
        &self.model
    }

    pub fn encoder(&self) -> &LabelEncoder {
        &self.encoder
    }

    /// Classify an already-normalized embedding.
    ///
    /// Returns `None` only when the query's dimension does not match the model.
    pub fn predict(&self, query: &Embedding) -> Option<Prediction> {
        if query.values.len() != self.model.dim() {
            tracing::warn!(
                expected = self.model.dim(),
                actual = query.values.len(),
                "embedding dimension does not match classifier"
            );
            return None;
        }

        let nearest = self.model.kneighbors(&query.values, 1);
        let distance = nearest.first()?.distance;

        let probs = self.model.predict_proba(&query.values);
        // First maximum wins, so ties go to the lowest class id.
        let (best_id, confidence) = probs
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (id, p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((id, p)),
            })?;

        let label = self.encoder.inverse_transform(best_id)?.to_string();
        Some(Prediction {
            label,
            distance,
            confidence,
        })
    }

    /// Whether both artifact files exist in `dir`.
    pub fn exists(dir: &Path) -> bool {
        dir.join(MODEL_FILE).is_file() && dir.join(ENCODER_FILE).is_file()
    }

    /// Persist model and encoder into `dir`, replacing any previous artifact.
    pub fn save(&self, dir: &Path) -> Result<(), ClassifierError> {
        fs::create_dir_all(dir)?;
        write_atomic(&dir.join(MODEL_FILE), &serde_json::to_vec(&self.model)?)?;
        write_atomic(&dir.join(ENCODER_FILE), &serde_json::to_vec(&self.encoder)?)?;
        tracing::info!(dir = %dir.display(), "classifier store saved");
        Ok(())
    }

    /// Load a previously saved store from `dir`.
    pub fn load(dir: &Path) -> Result<Self, ClassifierError> {
        if !Self::exists(dir) {
            return Err(ClassifierError::StoreMissing(dir.to_path_buf()));
        }

        let model: KnnClassifier = serde_json::from_slice(&fs::read(dir.join(MODEL_FILE))?)?;
        let encoder: LabelEncoder = serde_json::from_slice(&fs::read(dir.join(ENCODER_FILE))?)?;
        model.validate()?;
        if model.n_classes != encoder.len() {
            return Err(ClassifierError::Corrupt(format!(
                "model has {} classes, encoder has {}",
                model.n_classes,
                encoder.len()
            )));
        }

        tracing::info!(
            dir = %dir.display(),
            samples = model.n_samples(),
            classes = encoder.len(),
            "classifier store loaded"
        );
        Ok(Self { model, encoder })
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), ClassifierError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(values: &[f32], label: &str) -> (Embedding, String) {
        (Embedding::new(values.to_vec()), label.to_string())
    }

    fn two_students() -> ClassifierStore {
        ClassifierStore::train(
            vec![
                sample(&[1.0, 0.0, 0.0], "bob"),
                sample(&[0.9, 0.1, 0.0], "bob"),
                sample(&[0.95, 0.05, 0.0], "bob"),
                sample(&[0.0, 1.0, 0.0], "alice"),
                sample(&[0.1, 0.9, 0.0], "alice"),
                sample(&[0.0, 0.95, 0.05], "alice"),
            ],
            DEFAULT_K,
        )
        .unwrap()
    }

    #[test]
    fn test_label_encoder_sorted_ids() {
        let enc = LabelEncoder::fit(["carol", "alice", "bob", "alice"]);
        assert_eq!(enc.classes(), &["alice", "bob", "carol"]);
        assert_eq!(enc.transform("bob"), Some(1));
        assert_eq!(enc.inverse_transform(2), Some("carol"));
        assert_eq!(enc.transform("dave"), None);
    }

    #[test]
    fn test_kneighbors_nearest_first() {
        let model = KnnClassifier::fit(
            3,
            vec![(vec![0.0, 1.0], 0), (vec![1.0, 0.0], 1), (vec![0.7, 0.7], 0)],
            2,
        )
        .unwrap();
        let n = model.kneighbors(&[1.0, 0.0], 2);
        assert_eq!(n.len(), 2);
        assert_eq!(n[0].index, 1);
        assert!(n[0].distance.abs() < 1e-6);
        assert_eq!(n[1].index, 2);
    }

    #[test]
    fn test_predict_proba_uniform_votes() {
        let model = KnnClassifier::fit(
            3,
            vec![
                (vec![1.0, 0.0], 0),
                (vec![0.99, 0.01], 0),
                (vec![0.9, 0.1], 1),
                (vec![0.0, 1.0], 1),
            ],
            2,
        )
        .unwrap();
        let p = model.predict_proba(&[1.0, 0.0]);
        assert!((p[0] - 2.0 / 3.0).abs() < 1e-6);
        assert!((p[1] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_fit_rejects_mixed_dimensions() {
        let err = KnnClassifier::fit(3, vec![(vec![1.0, 0.0], 0), (vec![1.0], 0)], 1).unwrap_err();
        assert!(matches!(err, ClassifierError::DimensionMismatch { expected: 2, actual: 1 }));
    }

    #[test]
    fn test_train_empty_is_error() {
        let err = ClassifierStore::train(Vec::new(), DEFAULT_K).unwrap_err();
        assert!(matches!(err, ClassifierError::EmptyTrainingSet));
    }

    #[test]
    fn test_predict_confident_match() {
        let store = two_students();
        let query = Embedding::new(vec![1.0, 0.02, 0.0]).normalized();
        let p = store.predict(&query).unwrap();
        assert_eq!(p.label, "bob");
        assert!((p.confidence - 1.0).abs() < 1e-6);
        assert!(p.distance < 0.01);
    }

    #[test]
    fn test_predict_tie_prefers_lowest_class_id() {
        // k=2 with one neighbor per class → 0.5/0.5, "alice" (id 0) wins.
        let store = ClassifierStore::train(
            vec![sample(&[1.0, 0.0], "bob"), sample(&[0.0, 1.0], "alice")],
            2,
        )
        .unwrap();
        let p = store.predict(&Embedding::new(vec![1.0, 0.0])).unwrap();
        assert_eq!(p.label, "alice");
        assert!((p.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_predict_dimension_mismatch_is_none() {
        let store = two_students();
        assert!(store.predict(&Embedding::new(vec![1.0, 0.0])).is_none());
    }

    #[test]
    fn test_save_load_roundtrip_predicts_the_same() {
        let dir = tempfile::tempdir().unwrap();
        let store = two_students();
        store.save(dir.path()).unwrap();
        assert!(ClassifierStore::exists(dir.path()));

        let loaded = ClassifierStore::load(dir.path()).unwrap();
        assert_eq!(loaded.encoder(), store.encoder());
        let query = Embedding::new(vec![0.05, 1.0, 0.0]).normalized();
        assert_eq!(loaded.predict(&query), store.predict(&query));
    }

    #[test]
    fn test_load_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClassifierStore::load(dir.path()).unwrap_err();
        assert!(matches!(err, ClassifierError::StoreMissing(_)));
    }

    #[test]
    fn test_load_rejects_inconsistent_encoder() {
        let dir = tempfile::tempdir().unwrap();
        two_students().save(dir.path()).unwrap();
        fs::write(
            dir.path().join(ENCODER_FILE),
            serde_json::to_vec(&LabelEncoder::fit(["only"])).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            ClassifierStore::load(dir.path()),
            Err(ClassifierError::Corrupt(_))
        ));
    }
}
