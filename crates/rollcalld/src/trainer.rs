use rollcall_core::onnx::{OnnxEmbedder, OnnxFaceLocator};
use rollcall_core::{Config, EmbeddingExtractor, FaceError, FaceLocator};
use rollcall_store::enrollment::{retrain, EnrollError, EnrollReport, Enroller, TrainReport};
use rollcall_store::{Store, StoreError};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum TrainerError {
    #[error("enrollment: {0}")]
    Enroll(#[from] EnrollError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("model: {0}")]
    Face(#[from] FaceError),
    #[error("failed to spawn trainer thread: {0}")]
    Spawn(std::io::Error),
    #[error("trainer thread exited")]
    ChannelClosed,
}

/// Result of an enroll request: the fresh embeddings and the retrain that
/// followed them.
#[derive(Debug, Serialize)]
pub struct EnrollAndTrain {
    pub enrollment: EnrollReport,
    pub training: TrainReport,
}

/// Messages sent from D-Bus handlers to the trainer thread.
enum TrainerRequest {
    Enroll {
        student_id: i64,
        reply: oneshot::Sender<Result<EnrollAndTrain, TrainerError>>,
    },
    Retrain {
        reply: oneshot::Sender<Result<TrainReport, TrainerError>>,
    },
}

/// Clone-safe handle to the trainer thread.
#[derive(Clone)]
pub struct TrainerHandle {
    tx: mpsc::Sender<TrainerRequest>,
}

impl TrainerHandle {
    /// Re-embed the student's image folder, then rebuild the classifier.
    pub async fn enroll(&self, student_id: i64) -> Result<EnrollAndTrain, TrainerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(TrainerRequest::Enroll {
                student_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TrainerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| TrainerError::ChannelClosed)?
    }

    /// Rebuild the classifier from every stored embedding.
    pub async fn retrain(&self) -> Result<TrainReport, TrainerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(TrainerRequest::Retrain { reply: reply_tx })
            .await
            .map_err(|_| TrainerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| TrainerError::ChannelClosed)?
    }
}

/// Where the trainer reads and writes.
pub struct TrainerPaths {
    pub embedding_dir: PathBuf,
    pub classifier_dir: PathBuf,
    pub knn_k: usize,
}

impl TrainerPaths {
    pub fn from_config(config: &Config) -> Self {
        Self {
            embedding_dir: config.embedding_dir(),
            classifier_dir: config.classifier_dir(),
            knn_k: config.knn_k,
        }
    }
}

/// Open the database and load both models, then start the trainer thread.
/// Fails fast if any of them is unavailable.
pub fn spawn_trainer(config: &Config) -> Result<TrainerHandle, TrainerError> {
    let store = Store::open(config.db_path())?;
    let locator = OnnxFaceLocator::load(&config.detector_model_path(), config.detection_threshold)?;
    tracing::info!(path = %config.detector_model_path().display(), "face locator loaded");
    let extractor = OnnxEmbedder::load(&config.embedder_model_path())?;
    tracing::info!(path = %config.embedder_model_path().display(), "embedding extractor loaded");

    spawn_with(store, locator, extractor, TrainerPaths::from_config(config))
}

/// Run the request loop over the given store and models.
pub fn spawn_with<L, E>(
    store: Store,
    mut locator: L,
    mut extractor: E,
    paths: TrainerPaths,
) -> Result<TrainerHandle, TrainerError>
where
    L: FaceLocator + Send + 'static,
    E: EmbeddingExtractor + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<TrainerRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-trainer".into())
        .spawn(move || {
            tracing::info!("trainer thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    TrainerRequest::Enroll { student_id, reply } => {
                        let result =
                            run_enroll(&store, &mut locator, &mut extractor, &paths, student_id);
                        if let Err(e) = &result {
                            tracing::warn!(student_id, error = %e, "enroll request failed");
                        }
                        let _ = reply.send(result);
                    }
                    TrainerRequest::Retrain { reply } => {
                        let result = retrain(&store, &paths.classifier_dir, paths.knn_k)
                            .map_err(TrainerError::from);
                        if let Err(e) = &result {
                            tracing::warn!(error = %e, "retrain request failed");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("trainer thread exiting");
        })
        .map_err(TrainerError::Spawn)?;

    Ok(TrainerHandle { tx })
}

fn run_enroll<L: FaceLocator, E: EmbeddingExtractor>(
    store: &Store,
    locator: &mut L,
    extractor: &mut E,
    paths: &TrainerPaths,
    student_id: i64,
) -> Result<EnrollAndTrain, TrainerError> {
    let student = store.get_student(student_id)?;
    let enrollment =
        Enroller::new(store, locator, extractor, &paths.embedding_dir).reenroll(&student)?;
    let training = retrain(store, &paths.classifier_dir, paths.knn_k)?;
    Ok(EnrollAndTrain {
        enrollment,
        training,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rollcall_core::classifier::{ClassifierError, ClassifierStore};
    use rollcall_core::{BoundingBox, Embedding, FaceRegion};
    use rollcall_store::NewStudent;

    struct WholeFrameLocator;

    impl FaceLocator for WholeFrameLocator {
        fn locate(&mut self, frame: &RgbImage) -> Result<Option<FaceRegion>, FaceError> {
            Ok(Some(FaceRegion {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: frame.width() as f32,
                    height: frame.height() as f32,
                    confidence: 0.9,
                },
                crop: frame.clone(),
            }))
        }
    }

    struct PixelExtractor;

    impl EmbeddingExtractor for PixelExtractor {
        fn embed(&mut self, face: &RgbImage) -> Result<Embedding, FaceError> {
            let [r, g, b] = face.get_pixel(0, 0).0;
            Ok(Embedding::new(vec![r as f32, g as f32, b as f32]))
        }
    }

    fn setup(dir: &std::path::Path) -> (TrainerHandle, i64) {
        let folder = dir.join("images").join("Divy Tank");
        std::fs::create_dir_all(&folder).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([200, 20, 20]))
            .save(folder.join("a.png"))
            .unwrap();

        let db = dir.join("attendance.db");
        let store = Store::open(&db).unwrap();
        let student = store
            .add_student(&NewStudent {
                full_name: "Divy Tank".into(),
                roll_no: "1".into(),
                mobile: None,
                email: None,
                image_folder: folder,
            })
            .unwrap();

        let paths = TrainerPaths {
            embedding_dir: dir.join("embeddings"),
            classifier_dir: dir.join("classifier"),
            knn_k: 3,
        };
        let handle = spawn_with(store, WholeFrameLocator, PixelExtractor, paths).unwrap();
        (handle, student.id)
    }

    #[tokio::test]
    async fn test_retrain_with_no_embeddings_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _) = setup(dir.path());
        let err = handle.retrain().await.unwrap_err();
        assert!(matches!(
            err,
            TrainerError::Enroll(EnrollError::Classifier(ClassifierError::EmptyTrainingSet))
        ));
    }

    #[tokio::test]
    async fn test_enroll_then_retrain() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, id) = setup(dir.path());

        let outcome = handle.enroll(id).await.unwrap();
        assert_eq!(outcome.enrollment.saved, ["divy_tank_1.json"]);
        assert_eq!(outcome.training.labels, ["divy_tank"]);
        assert!(ClassifierStore::exists(&dir.path().join("classifier")));

        // Enrolling again replaces rather than duplicates.
        let again = handle.enroll(id).await.unwrap();
        assert_eq!(again.training.samples, 1);

        let report = handle.clone().retrain().await.unwrap();
        assert_eq!(report.samples, 1);
    }

    #[tokio::test]
    async fn test_enroll_unknown_student() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _) = setup(dir.path());
        let err = handle.enroll(999).await.unwrap_err();
        assert!(matches!(
            err,
            TrainerError::Store(StoreError::StudentNotFound(999))
        ));
    }
}
