//! Per-frame recognition: locate → embed → normalize → k-NN → gate → annotate.

use crate::classifier::{ClassifierStore, Prediction};
use crate::config::Config;
use crate::names;
use crate::types::{BoundingBox, Embedding, FaceError, FaceRegion};
use ab_glyph::FontRef;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

const ACCEPT_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const REJECT_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BANNER_HEIGHT: u32 = 24;
const TEXT_SCALE: f32 = 16.0;
const TEXT_MARGIN: i32 = 4;

static CAPTION_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

/// Finds the face to recognize in a raw frame.
pub trait FaceLocator {
    /// The single highest-scoring face, or `None` when the frame has no face.
    fn locate(&mut self, frame: &RgbImage) -> Result<Option<FaceRegion>, FaceError>;
}

/// Maps a cropped face to an embedding vector.
pub trait EmbeddingExtractor {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, FaceError>;
}

/// Distance/confidence gate deciding whether a prediction is trusted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionGate {
    /// Reject when the nearest-neighbor distance is above this.
    pub distance_threshold: f32,
    /// Reject when the class probability is below this.
    pub confidence_threshold: f32,
}

impl Default for DecisionGate {
    fn default() -> Self {
        Self {
            distance_threshold: 0.30,
            confidence_threshold: 1.00,
        }
    }
}

impl DecisionGate {
    pub fn from_config(config: &Config) -> Self {
        Self {
            distance_threshold: config.distance_threshold,
            confidence_threshold: config.confidence_threshold,
        }
    }

    /// NaN on either input is rejected.
    pub fn accepts(&self, distance: f32, confidence: f32) -> bool {
        distance <= self.distance_threshold && confidence >= self.confidence_threshold
    }

    pub fn decide(&self, prediction: Prediction) -> FrameOutcome {
        let Prediction {
            label,
            distance,
            confidence,
        } = prediction;
        if self.accepts(distance, confidence) {
            FrameOutcome::Recognized {
                label,
                distance,
                confidence,
            }
        } else {
            FrameOutcome::Unknown {
                predicted: Some(label),
                distance,
                confidence,
            }
        }
    }
}

/// What the engine concluded about one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    NoFace,
    /// A face was located but no embedding could be taken from it.
    FaceUnreadable,
    Unknown {
        /// Label the classifier leaned toward, if it produced one.
        predicted: Option<String>,
        distance: f32,
        confidence: f32,
    },
    Recognized {
        /// Raw classifier label (normalized student name).
        label: String,
        distance: f32,
        confidence: f32,
    },
}

impl FrameOutcome {
    /// Overlay text, e.g. `"Divy Tank (d=0.12, c=1.00)"` or `"UNKNOWN (d=0.41, c=0.67)"`.
    pub fn caption(&self) -> String {
        match self {
            FrameOutcome::NoFace => "No face detected".to_string(),
            FrameOutcome::FaceUnreadable => "Face unreadable".to_string(),
            FrameOutcome::Unknown {
                distance,
                confidence,
                ..
            } => format!("UNKNOWN (d={distance:.2}, c={confidence:.2})"),
            FrameOutcome::Recognized {
                label,
                distance,
                confidence,
            } => format!(
                "{} (d={distance:.2}, c={confidence:.2})",
                names::display_name(label)
            ),
        }
    }

    pub fn recognized_label(&self) -> Option<&str> {
        match self {
            FrameOutcome::Recognized { label, .. } => Some(label),
            _ => None,
        }
    }
}

/// A frame with the decision drawn on it.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub image: RgbImage,
    pub face: Option<BoundingBox>,
    pub outcome: FrameOutcome,
}

impl AnnotatedFrame {
    fn new(mut image: RgbImage, face: Option<BoundingBox>, outcome: FrameOutcome) -> Self {
        let color = if outcome.recognized_label().is_some() {
            ACCEPT_COLOR
        } else {
            REJECT_COLOR
        };
        draw_overlay(&mut image, face.as_ref(), color, &outcome.caption());
        Self {
            image,
            face,
            outcome,
        }
    }

    pub fn caption(&self) -> String {
        self.outcome.caption()
    }
}

/// Banner with the caption across the top, plus the face box.
fn draw_overlay(
    image: &mut RgbImage,
    face: Option<&BoundingBox>,
    color: Rgb<u8>,
    caption: &str,
) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    draw_filled_rect_mut(
        image,
        Rect::at(0, 0).of_size(width, BANNER_HEIGHT.min(height)),
        color,
    );

    match FontRef::try_from_slice(CAPTION_FONT) {
        Ok(font) => draw_text_mut(
            image,
            TEXT_COLOR,
            TEXT_MARGIN,
            TEXT_MARGIN,
            TEXT_SCALE,
            &font,
            caption,
        ),
        Err(e) => tracing::warn!(error = %e, "caption font unusable; drawing banner only"),
    }

    if let Some(bbox) = face {
        let w = bbox.width.round() as u32;
        let h = bbox.height.round() as u32;
        if w > 0 && h > 0 {
            draw_hollow_rect_mut(
                image,
                Rect::at(bbox.x.round() as i32, bbox.y.round() as i32).of_size(w, h),
                color,
            );
        }
    }
}

/// Recognition engine over a loaded classifier store.
pub struct RecognitionEngine<L, E> {
    locator: L,
    extractor: E,
    classifier: ClassifierStore,
    gate: DecisionGate,
}

impl<L: FaceLocator, E: EmbeddingExtractor> RecognitionEngine<L, E> {
    pub fn new(locator: L, extractor: E, classifier: ClassifierStore, gate: DecisionGate) -> Self {
        Self {
            locator,
            extractor,
            classifier,
            gate,
        }
    }

    pub fn gate(&self) -> DecisionGate {
        self.gate
    }

    /// Normalize, query the classifier and apply the gate.
    pub fn classify(&self, embedding: &Embedding) -> FrameOutcome {
        let normalized = embedding.normalized();
        match self.classifier.predict(&normalized) {
            Some(prediction) => self.gate.decide(prediction),
            None => FrameOutcome::Unknown {
                predicted: None,
                distance: f32::NAN,
                confidence: 0.0,
            },
        }
    }

    /// Run one frame through the pipeline.
    ///
    /// Returns the annotated frame and, when the gate accepts, the raw
    /// classifier label. Locator and extractor failures skip the frame.
    pub fn recognize(&mut self, frame: RgbImage) -> (AnnotatedFrame, Option<String>) {
        let region = match self.locator.locate(&frame) {
            Ok(region) => region,
            Err(e) => {
                tracing::warn!(error = %e, "face location failed; skipping frame");
                None
            }
        };

        let Some(region) = region else {
            return (AnnotatedFrame::new(frame, None, FrameOutcome::NoFace), None);
        };

        let embedding = match self.extractor.embed(&region.crop) {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!(error = %e, "embedding extraction failed; skipping frame");
                let outcome = FrameOutcome::FaceUnreadable;
                return (AnnotatedFrame::new(frame, Some(region.bbox), outcome), None);
            }
        };

        let outcome = self.classify(&embedding);
        tracing::debug!(caption = %outcome.caption(), "frame classified");

        let name = outcome.recognized_label().map(str::to_string);
        (AnnotatedFrame::new(frame, Some(region.bbox), outcome), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::DEFAULT_K;

    struct FixedLocator(Option<FaceRegion>);

    impl FaceLocator for FixedLocator {
        fn locate(&mut self, _frame: &RgbImage) -> Result<Option<FaceRegion>, FaceError> {
            Ok(self.0.clone())
        }
    }

    struct FailingLocator;

    impl FaceLocator for FailingLocator {
        fn locate(&mut self, _frame: &RgbImage) -> Result<Option<FaceRegion>, FaceError> {
            Err(FaceError::InferenceFailed("boom".into()))
        }
    }

    struct FailingExtractor;

    impl EmbeddingExtractor for FailingExtractor {
        fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, FaceError> {
            Err(FaceError::InferenceFailed("bad crop".into()))
        }
    }

    struct FixedExtractor(Vec<f32>);

    impl EmbeddingExtractor for FixedExtractor {
        fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, FaceError> {
            Ok(Embedding::new(self.0.clone()))
        }
    }

    fn face() -> FaceRegion {
        FaceRegion {
            bbox: BoundingBox {
                x: 10.0,
                y: 30.0,
                width: 20.0,
                height: 20.0,
                confidence: 0.99,
            },
            crop: RgbImage::new(4, 4),
        }
    }

    fn classifier() -> ClassifierStore {
        ClassifierStore::train(
            vec![
                (Embedding::new(vec![1.0, 0.0, 0.0]), "divy_tank".into()),
                (Embedding::new(vec![0.98, 0.02, 0.0]), "divy_tank".into()),
                (Embedding::new(vec![0.97, 0.0, 0.03]), "divy_tank".into()),
                (Embedding::new(vec![0.0, 1.0, 0.0]), "asha_rao".into()),
                (Embedding::new(vec![0.0, 0.98, 0.02]), "asha_rao".into()),
                (Embedding::new(vec![0.02, 0.97, 0.0]), "asha_rao".into()),
            ],
            DEFAULT_K,
        )
        .unwrap()
    }

    fn prediction(distance: f32, confidence: f32) -> Prediction {
        Prediction {
            label: "divy_tank".into(),
            distance,
            confidence,
        }
    }

    #[test]
    fn test_gate_rejects_distance_above_threshold() {
        let outcome = DecisionGate::default().decide(prediction(0.31, 1.00));
        assert!(matches!(outcome, FrameOutcome::Unknown { .. }));
        assert!(outcome.recognized_label().is_none());
    }

    #[test]
    fn test_gate_accepts_close_confident_match() {
        let outcome = DecisionGate::default().decide(prediction(0.10, 1.00));
        assert_eq!(outcome.recognized_label(), Some("divy_tank"));
    }

    #[test]
    fn test_gate_rejects_low_confidence() {
        let outcome = DecisionGate::default().decide(prediction(0.05, 0.67));
        assert!(outcome.recognized_label().is_none());
    }

    #[test]
    fn test_gate_boundary_is_inclusive() {
        let gate = DecisionGate {
            distance_threshold: 0.30,
            confidence_threshold: 0.5,
        };
        assert!(gate.accepts(0.30, 0.5));
        assert!(!gate.accepts(f32::NAN, 1.0));
        assert!(!gate.accepts(0.1, f32::NAN));
    }

    #[test]
    fn test_captions() {
        assert_eq!(FrameOutcome::NoFace.caption(), "No face detected");
        assert_eq!(
            DecisionGate::default().decide(prediction(0.1, 1.0)).caption(),
            "Divy Tank (d=0.10, c=1.00)"
        );
        assert_eq!(
            DecisionGate::default().decide(prediction(0.31, 1.0)).caption(),
            "UNKNOWN (d=0.31, c=1.00)"
        );
    }

    #[test]
    fn test_recognize_no_face() {
        let mut engine = RecognitionEngine::new(
            FixedLocator(None),
            FixedExtractor(vec![1.0, 0.0, 0.0]),
            classifier(),
            DecisionGate::default(),
        );
        let (annotated, name) = engine.recognize(RgbImage::new(64, 48));
        assert!(name.is_none());
        assert_eq!(annotated.outcome, FrameOutcome::NoFace);
        assert_eq!(annotated.caption(), "No face detected");
        assert_eq!(*annotated.image.get_pixel(0, 0), REJECT_COLOR);
    }

    #[test]
    fn test_recognize_locator_error_skips_frame() {
        let mut engine = RecognitionEngine::new(
            FailingLocator,
            FixedExtractor(vec![1.0, 0.0, 0.0]),
            classifier(),
            DecisionGate::default(),
        );
        let (annotated, name) = engine.recognize(RgbImage::new(16, 16));
        assert!(name.is_none());
        assert_eq!(annotated.outcome, FrameOutcome::NoFace);
    }

    #[test]
    fn test_recognize_extractor_error_keeps_face_box() {
        let mut engine = RecognitionEngine::new(
            FixedLocator(Some(face())),
            FailingExtractor,
            classifier(),
            DecisionGate::default(),
        );
        let (annotated, name) = engine.recognize(RgbImage::new(64, 64));
        assert!(name.is_none());
        assert_eq!(annotated.outcome, FrameOutcome::FaceUnreadable);
        assert_eq!(annotated.caption(), "Face unreadable");
        assert_eq!(annotated.face.map(|b| b.x), Some(10.0));
        assert_eq!(*annotated.image.get_pixel(10, 30), REJECT_COLOR);
    }

    fn unknown(distance: f32, confidence: f32) -> FrameOutcome {
        FrameOutcome::Unknown {
            predicted: Some("divy_tank".into()),
            distance,
            confidence,
        }
    }

    #[test]
    fn test_caption_is_drawn_into_banner() {
        let annotated = AnnotatedFrame::new(RgbImage::new(240, 60), None, unknown(0.31, 1.0));
        let text_pixels = (0..240)
            .flat_map(|x| (0..BANNER_HEIGHT).map(move |y| (x, y)))
            .filter(|&(x, y)| *annotated.image.get_pixel(x, y) != REJECT_COLOR)
            .count();
        assert!(text_pixels > 0);
        // Below the banner the frame is untouched.
        assert_eq!(*annotated.image.get_pixel(120, 50), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_different_scores_render_differently() {
        let frame = RgbImage::new(240, 60);
        let near = AnnotatedFrame::new(frame.clone(), None, unknown(0.31, 1.0));
        let far = AnnotatedFrame::new(frame.clone(), None, unknown(0.95, 0.33));
        let no_face = AnnotatedFrame::new(frame, None, FrameOutcome::NoFace);
        assert_ne!(near.image, far.image);
        assert_ne!(near.image, no_face.image);
    }

    #[test]
    fn test_recognize_returns_raw_label() {
        // Unnormalized on purpose: the engine normalizes before querying.
        let mut engine = RecognitionEngine::new(
            FixedLocator(Some(face())),
            FixedExtractor(vec![5.0, 0.05, 0.0]),
            classifier(),
            DecisionGate::default(),
        );
        let (annotated, name) = engine.recognize(RgbImage::new(64, 64));
        assert_eq!(name.as_deref(), Some("divy_tank"));
        assert!(annotated.caption().starts_with("Divy Tank (d=0.00"));
        assert_eq!(*annotated.image.get_pixel(0, 0), ACCEPT_COLOR);
        // Face box outline drawn at the box's top-left corner.
        assert_eq!(*annotated.image.get_pixel(10, 30), ACCEPT_COLOR);
    }

    #[test]
    fn test_recognize_stranger_is_unknown() {
        let mut engine = RecognitionEngine::new(
            FixedLocator(Some(face())),
            FixedExtractor(vec![0.0, 0.0, 1.0]),
            classifier(),
            DecisionGate::default(),
        );
        let (annotated, name) = engine.recognize(RgbImage::new(64, 64));
        assert!(name.is_none());
        assert!(annotated.caption().starts_with("UNKNOWN"));
    }

    #[test]
    fn test_classify_dimension_mismatch_is_unknown() {
        let engine = RecognitionEngine::new(
            FixedLocator(None),
            FixedExtractor(vec![]),
            classifier(),
            DecisionGate::default(),
        );
        let outcome = engine.classify(&Embedding::new(vec![1.0, 0.0]));
        assert!(matches!(outcome, FrameOutcome::Unknown { predicted: None, .. }));
    }
}
