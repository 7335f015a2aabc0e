//! ONNX Runtime backends for face location and embedding extraction.
//!
//! The locator runs an UltraFace-style detector (RFB-320: one score tensor
//! and one box tensor with normalized corners, already decoded against its
//! priors). The extractor runs a FaceNet (InceptionResnetV1, VGGFace2) model
//! exported to ONNX, producing a 512-dimensional embedding.

use crate::recognizer::{EmbeddingExtractor, FaceLocator};
use crate::types::{BoundingBox, Embedding, FaceError, FaceRegion};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

// --- Detector constants ---
const DETECTOR_INPUT_WIDTH: u32 = 320;
const DETECTOR_INPUT_HEIGHT: u32 = 240;
const DETECTOR_MEAN: f32 = 127.0;
const DETECTOR_STD: f32 = 128.0;
/// Extra context around the detected box, as a fraction of its size per side.
const CROP_MARGIN: f32 = 0.1;

// --- Embedder constants ---
const FACENET_INPUT_SIZE: u32 = 160;
const FACENET_MEAN: f32 = 127.5;
const FACENET_STD: f32 = 128.0;
const FACENET_EMBEDDING_DIM: usize = 512;
const FACENET_MODEL_VERSION: &str = "facenet_vggface2";

fn load_session(model_path: &Path) -> Result<Session, FaceError> {
    if !model_path.exists() {
        return Err(FaceError::ModelNotFound(model_path.display().to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = %model_path.display(),
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );
    Ok(session)
}

/// Convert an RGB image into a normalized NCHW tensor of the given size.
fn to_nchw(image: &RgbImage, width: u32, height: u32, mean: f32, std: f32) -> Array4<f32> {
    let resized;
    let src = if image.dimensions() == (width, height) {
        image
    } else {
        resized = imageops::resize(image, width, height, FilterType::Triangle);
        &resized
    };

    let (w, h) = (width as usize, height as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in src.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - mean) / std;
        }
    }
    tensor
}

/// UltraFace detector returning the single best face per frame.
pub struct OnnxFaceLocator {
    session: Session,
    score_threshold: f32,
}

impl OnnxFaceLocator {
    pub fn load(model_path: &Path, score_threshold: f32) -> Result<Self, FaceError> {
        Ok(Self {
            session: load_session(model_path)?,
            score_threshold,
        })
    }
}

impl FaceLocator for OnnxFaceLocator {
    fn locate(&mut self, frame: &RgbImage) -> Result<Option<FaceRegion>, FaceError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Ok(None);
        }

        let input = to_nchw(
            frame,
            DETECTOR_INPUT_WIDTH,
            DETECTOR_INPUT_HEIGHT,
            DETECTOR_MEAN,
            DETECTOR_STD,
        );
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| FaceError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| FaceError::InferenceFailed(format!("boxes: {e}")))?;

        let best = best_detection(scores, boxes, self.score_threshold, width, height);
        Ok(best.and_then(|bbox| crop_face(frame, &bbox)))
    }
}

/// Pick the highest-scoring detection above `threshold`, mapped to frame pixels.
///
/// `scores` is `[N, 2]` (background, face); `boxes` is `[N, 4]` with
/// normalized `(x1, y1, x2, y2)` corners.
fn best_detection(
    scores: &[f32],
    boxes: &[f32],
    threshold: f32,
    frame_width: u32,
    frame_height: u32,
) -> Option<BoundingBox> {
    let count = (scores.len() / 2).min(boxes.len() / 4);
    let (fw, fh) = (frame_width as f32, frame_height as f32);

    (0..count)
        .map(|i| (i, scores[i * 2 + 1]))
        .filter(|&(_, score)| score > threshold)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .and_then(|(i, score)| {
            let x1 = (boxes[i * 4] * fw).clamp(0.0, fw);
            let y1 = (boxes[i * 4 + 1] * fh).clamp(0.0, fh);
            let x2 = (boxes[i * 4 + 2] * fw).clamp(0.0, fw);
            let y2 = (boxes[i * 4 + 3] * fh).clamp(0.0, fh);
            (x2 > x1 && y2 > y1).then(|| BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
}

/// The box grown by `CROP_MARGIN` on each side, clipped to the frame, as
/// `(x, y, width, height)` in whole pixels.
fn crop_rect(
    frame_width: u32,
    frame_height: u32,
    bbox: &BoundingBox,
) -> Option<(u32, u32, u32, u32)> {
    let (fw, fh) = (frame_width as f32, frame_height as f32);
    let dx = bbox.width * CROP_MARGIN;
    let dy = bbox.height * CROP_MARGIN;
    let x1 = (bbox.x - dx).floor().clamp(0.0, fw);
    let y1 = (bbox.y - dy).floor().clamp(0.0, fh);
    let x2 = (bbox.x + bbox.width + dx).ceil().clamp(0.0, fw);
    let y2 = (bbox.y + bbox.height + dy).ceil().clamp(0.0, fh);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
}

/// Crop the box plus margin out of the frame and resize it for the embedder.
/// The region keeps the detector's box.
fn crop_face(frame: &RgbImage, bbox: &BoundingBox) -> Option<FaceRegion> {
    let (x, y, w, h) = crop_rect(frame.width(), frame.height(), bbox)?;
    let crop = imageops::crop_imm(frame, x, y, w, h).to_image();
    let crop = imageops::resize(&crop, FACENET_INPUT_SIZE, FACENET_INPUT_SIZE, FilterType::Triangle);
    Some(FaceRegion { bbox: *bbox, crop })
}

/// FaceNet embedding extractor.
pub struct OnnxEmbedder {
    session: Session,
}

impl OnnxEmbedder {
    pub fn load(model_path: &Path) -> Result<Self, FaceError> {
        Ok(Self {
            session: load_session(model_path)?,
        })
    }
}

impl EmbeddingExtractor for OnnxEmbedder {
    /// Returns the raw (unnormalized) embedding; consumers normalize.
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, FaceError> {
        let input = to_nchw(
            face,
            FACENET_INPUT_SIZE,
            FACENET_INPUT_SIZE,
            FACENET_MEAN,
            FACENET_STD,
        );
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| FaceError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != FACENET_EMBEDDING_DIM {
            return Err(FaceError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: raw.to_vec(),
            model_version: Some(FACENET_MODEL_VERSION.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_to_nchw_shape_and_normalization() {
        let image = RgbImage::from_pixel(8, 8, Rgb([255, 127, 0]));
        let t = to_nchw(&image, 8, 8, DETECTOR_MEAN, DETECTOR_STD);
        assert_eq!(t.shape(), &[1, 3, 8, 8]);
        assert!((t[[0, 0, 3, 3]] - 1.0).abs() < 1e-6);
        assert!(t[[0, 1, 3, 3]].abs() < 1e-6);
        assert!((t[[0, 2, 3, 3]] + 127.0 / 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_to_nchw_resizes() {
        let image = RgbImage::from_pixel(40, 30, Rgb([128, 128, 128]));
        let t = to_nchw(&image, 160, 160, FACENET_MEAN, FACENET_STD);
        assert_eq!(t.shape(), &[1, 3, 160, 160]);
    }

    #[test]
    fn test_best_detection_picks_highest_score() {
        let scores = [0.9, 0.1, 0.2, 0.8, 0.05, 0.95];
        let boxes = [
            0.0, 0.0, 0.1, 0.1, //
            0.1, 0.1, 0.5, 0.5, //
            0.5, 0.5, 0.75, 1.0,
        ];
        let b = best_detection(&scores, &boxes, 0.7, 200, 100).unwrap();
        assert!((b.confidence - 0.95).abs() < 1e-6);
        assert!((b.x - 100.0).abs() < 1e-4);
        assert!((b.y - 50.0).abs() < 1e-4);
        assert!((b.width - 50.0).abs() < 1e-4);
        assert!((b.height - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_best_detection_below_threshold() {
        let scores = [0.9, 0.1, 0.4, 0.6];
        let boxes = [0.0, 0.0, 0.5, 0.5, 0.2, 0.2, 0.4, 0.4];
        assert!(best_detection(&scores, &boxes, 0.7, 100, 100).is_none());
    }

    #[test]
    fn test_best_detection_degenerate_box() {
        let scores = [0.0, 0.99];
        let boxes = [0.5, 0.5, 0.5, 0.9];
        assert!(best_detection(&scores, &boxes, 0.7, 100, 100).is_none());
    }

    fn bbox(x: f32, y: f32, width: f32, height: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width,
            height,
            confidence: 0.9,
        }
    }

    #[test]
    fn test_crop_rect_adds_margin() {
        // 10% of a 50x40 box: 5px horizontally, 4px vertically.
        assert_eq!(
            crop_rect(200, 100, &bbox(20.0, 30.0, 50.0, 40.0)),
            Some((15, 26, 60, 48))
        );
    }

    #[test]
    fn test_crop_rect_clips_margin_at_frame_edges() {
        assert_eq!(
            crop_rect(100, 80, &bbox(0.0, 0.0, 40.0, 40.0)),
            Some((0, 0, 44, 44))
        );
        assert_eq!(
            crop_rect(100, 80, &bbox(90.0, 70.0, 30.0, 30.0)),
            Some((87, 67, 13, 13))
        );
        assert_eq!(crop_rect(100, 80, &bbox(120.0, 0.0, 10.0, 10.0)), None);
    }

    #[test]
    fn test_crop_face_keeps_detector_box() {
        let frame = RgbImage::new(200, 100);
        let b = bbox(20.0, 30.0, 50.0, 40.0);
        let region = crop_face(&frame, &b).unwrap();
        assert_eq!(region.bbox, b);
    }

    #[test]
    fn test_crop_face_resizes_to_embedder_input() {
        let frame = RgbImage::new(100, 80);
        let bbox = BoundingBox {
            x: 90.0,
            y: 70.0,
            width: 30.0,
            height: 30.0,
            confidence: 0.9,
        };
        let region = crop_face(&frame, &bbox).unwrap();
        assert_eq!(region.crop.dimensions(), (FACENET_INPUT_SIZE, FACENET_INPUT_SIZE));
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxEmbedder::load(Path::new("/nonexistent/facenet.onnx")).err().unwrap();
        assert!(matches!(err, FaceError::ModelNotFound(_)));
    }
}
