//! Enrollment pipeline and classifier retraining.
//!
//! Each enrollment image becomes one JSON embedding artifact plus one
//! `face_embeddings` row. Retraining always rebuilds the classifier store from
//! the full record set; it never updates it incrementally.

use crate::db::{Store, StoreError};
use crate::models::Student;
use rollcall_core::classifier::{ClassifierError, ClassifierStore};
use rollcall_core::names;
use rollcall_core::{Embedding, EmbeddingExtractor, FaceLocator};
use rollcall_hw::source::list_images;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// An enrollment image that produced no embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrollReport {
    pub student_id: i64,
    /// Artifact file names written, in order.
    pub saved: Vec<String>,
    pub skipped: Vec<SkippedImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainReport {
    pub samples: usize,
    /// Labels present in the new classifier, sorted.
    pub labels: Vec<String>,
    pub skipped_artifacts: usize,
    pub classifier_dir: PathBuf,
}

/// Writes embedding artifacts for a student's images.
pub struct Enroller<'a, L, E> {
    store: &'a Store,
    locator: &'a mut L,
    extractor: &'a mut E,
    embedding_dir: &'a Path,
}

impl<'a, L: FaceLocator, E: EmbeddingExtractor> Enroller<'a, L, E> {
    pub fn new(
        store: &'a Store,
        locator: &'a mut L,
        extractor: &'a mut E,
        embedding_dir: &'a Path,
    ) -> Self {
        Self {
            store,
            locator,
            extractor,
            embedding_dir,
        }
    }

    /// Embed each image (in path order) and record the artifacts.
    ///
    /// Undecodable images and images without a face are skipped and
    /// reported; they never abort the batch.
    pub fn enroll_images(
        &mut self,
        student: &Student,
        images: &[PathBuf],
    ) -> Result<EnrollReport, EnrollError> {
        std::fs::create_dir_all(self.embedding_dir)?;
        let label = names::label_for(&student.full_name);
        let mut seq = next_sequence(&self.store.embedding_records_for(student.id)?);

        let mut images = images.to_vec();
        images.sort();

        let mut report = EnrollReport {
            student_id: student.id,
            ..Default::default()
        };
        for path in images {
            let embedding = match self.embed_image(&path) {
                Ok(embedding) => embedding,
                Err(reason) => {
                    tracing::warn!(path = %path.display(), %reason, "skipping enrollment image");
                    report.skipped.push(SkippedImage { path, reason });
                    continue;
                }
            };

            let (file_name, artifact) = loop {
                let file_name = format!("{label}_{seq}.json");
                let artifact = self.embedding_dir.join(&file_name);
                seq += 1;
                if !artifact.exists() {
                    break (file_name, artifact);
                }
            };
            write_embedding(&artifact, &embedding)?;
            self.store
                .add_embedding_record(student.id, &file_name, &artifact)?;
            tracing::debug!(student = %student.full_name, file = %file_name, "embedding saved");
            report.saved.push(file_name);
        }

        tracing::info!(
            student = %student.full_name,
            saved = report.saved.len(),
            skipped = report.skipped.len(),
            "enrollment finished"
        );
        Ok(report)
    }

    /// Enroll every `.jpg`/`.jpeg`/`.png` in the student's image folder.
    pub fn enroll_folder(&mut self, student: &Student) -> Result<EnrollReport, EnrollError> {
        let images = if student.image_folder.is_dir() {
            list_images(&student.image_folder)?
        } else {
            tracing::warn!(folder = %student.image_folder.display(), "image folder missing");
            Vec::new()
        };
        self.enroll_images(student, &images)
    }

    /// Replace the student's embeddings with a fresh pass over their folder.
    pub fn reenroll(&mut self, student: &Student) -> Result<EnrollReport, EnrollError> {
        let removed = self.store.clear_embeddings(student.id)?;
        tracing::info!(student = %student.full_name, removed, "cleared embeddings for re-enrollment");
        self.enroll_folder(student)
    }

    fn embed_image(&mut self, path: &Path) -> Result<Embedding, String> {
        let frame = image::open(path)
            .map_err(|e| format!("unreadable image: {e}"))?
            .to_rgb8();
        let face = self
            .locator
            .locate(&frame)
            .map_err(|e| format!("face location failed: {e}"))?
            .ok_or_else(|| "no face detected".to_string())?;
        self.extractor
            .embed(&face.crop)
            .map_err(|e| format!("embedding failed: {e}"))
    }
}

/// Sequence number after the highest `<label>_<n>.json` already recorded.
fn next_sequence(records: &[crate::models::EmbeddingRecord]) -> u32 {
    records
        .iter()
        .filter_map(|r| {
            let stem = r.file_name.strip_suffix(".json")?;
            let (_, n) = stem.rsplit_once('_')?;
            n.parse::<u32>().ok()
        })
        .max()
        .map_or(1, |n| n + 1)
}

pub fn write_embedding(path: &Path, embedding: &Embedding) -> Result<(), EnrollError> {
    std::fs::write(path, serde_json::to_vec(embedding)?)?;
    Ok(())
}

pub fn read_embedding(path: &Path) -> Result<Embedding, EnrollError> {
    Ok(serde_json::from_slice(&std::fs::read(path)?)?)
}

/// Rebuild the classifier store from every embedding record.
///
/// Labels come from each student's current name. Unreadable artifacts are
/// skipped; students left with no embeddings drop out of the classifier.
pub fn retrain(store: &Store, classifier_dir: &Path, k: usize) -> Result<TrainReport, EnrollError> {
    let mut samples = Vec::new();
    let mut skipped = 0;
    for labeled in store.labeled_embedding_records()? {
        let path = &labeled.record.embedding_path;
        match read_embedding(path) {
            Ok(embedding) => samples.push((embedding, names::label_for(&labeled.full_name))),
            Err(e) => {
                skipped += 1;
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable embedding");
            }
        }
    }

    let labels: BTreeSet<String> = samples.iter().map(|(_, l)| l.clone()).collect();
    let count = samples.len();
    let classifier = ClassifierStore::train(samples, k)?;
    classifier.save(classifier_dir)?;

    tracing::info!(samples = count, students = labels.len(), skipped, "classifier retrained");
    Ok(TrainReport {
        samples: count,
        labels: labels.into_iter().collect(),
        skipped_artifacts: skipped,
        classifier_dir: classifier_dir.to_path_buf(),
    })
}
