//! rollcall-core: Face recognition engine for classroom attendance.
//!
//! Holds the embedding type, the k-NN classifier store trained over enrolled
//! students, and the per-frame recognition engine. Face detection and
//! embedding extraction run through ONNX Runtime behind small traits so the
//! decision logic can be driven by any locator/extractor pair.

pub mod classifier;
pub mod config;
pub mod names;
pub mod onnx;
pub mod recognizer;
pub mod types;

pub use classifier::{ClassifierError, ClassifierStore, KnnClassifier, LabelEncoder};
pub use config::Config;
pub use recognizer::{
    AnnotatedFrame, DecisionGate, EmbeddingExtractor, FaceLocator, FrameOutcome,
    RecognitionEngine,
};
pub use types::{BoundingBox, Embedding, FaceError, FaceRegion};
