use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Runtime configuration shared by the daemon and the CLI.
///
/// Resolution order: compiled defaults, then the TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for the database, images, embeddings and classifier artifacts.
    pub data_dir: PathBuf,
    /// SQLite database path (default: `<data_dir>/attendance.db`).
    pub db_path: Option<PathBuf>,
    /// Directory containing the ONNX model files (default: `<data_dir>/models`).
    pub model_dir: Option<PathBuf>,
    /// Face detector model file name inside `model_dir`.
    pub detector_model: String,
    /// Embedding model file name inside `model_dir`.
    pub embedder_model: String,
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Minimum detector score for a face to be located.
    pub detection_threshold: f32,
    /// Nearest-neighbor cosine distance above which a face is unknown.
    pub distance_threshold: f32,
    /// Classifier probability below which a face is unknown.
    pub confidence_threshold: f32,
    /// Neighbor count for retraining.
    pub knn_k: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_path: None,
            model_dir: None,
            detector_model: "version-RFB-320.onnx".to_string(),
            embedder_model: "facenet_vggface2.onnx".to_string(),
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            detection_threshold: 0.7,
            distance_threshold: 0.30,
            confidence_threshold: 1.00,
            knn_k: crate::classifier::DEFAULT_K,
        }
    }
}

impl Config {
    /// Load configuration from the config file (if any) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_file_path() {
            Some(path) if path.is_file() => Self::load_from_path(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file. Missing keys take defaults.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("ROLLCALL_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_DB_PATH") {
            self.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("ROLLCALL_MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        parse_into(&var, "ROLLCALL_DETECTION_THRESHOLD", &mut self.detection_threshold);
        parse_into(&var, "ROLLCALL_DISTANCE_THRESHOLD", &mut self.distance_threshold);
        parse_into(&var, "ROLLCALL_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        parse_into(&var, "ROLLCALL_KNN_K", &mut self.knn_k);
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.distance_threshold) {
            return Err(ConfigError::Validation(
                "distance threshold must be between 0.0 and 2.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Validation(
                "confidence threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.detection_threshold) {
            return Err(ConfigError::Validation(
                "detection threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.knn_k == 0 {
            return Err(ConfigError::Validation("knn_k must be at least 1".to_string()));
        }
        if self.camera_width == 0 || self.camera_height == 0 {
            return Err(ConfigError::Validation(
                "camera dimensions must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("attendance.db"))
    }

    /// Per-student enrollment image folders live under here.
    pub fn image_dir(&self) -> PathBuf {
        self.data_dir.join("student_images")
    }

    /// One artifact per enrollment image.
    pub fn embedding_dir(&self) -> PathBuf {
        self.data_dir.join("embeddings")
    }

    /// Holds `knn_model.json` and `label_encoder.json`.
    pub fn classifier_dir(&self) -> PathBuf {
        self.data_dir.join("classifier")
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir().join(&self.detector_model)
    }

    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir().join(&self.embedder_model)
    }
}

fn parse_into<F, T>(var: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment value"),
        }
    }
}

fn config_file_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("ROLLCALL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let config_home = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
    Some(config_home.join("rollcall").join("rollcall.toml"))
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"));
            home.join(".local/share")
        })
        .join("rollcall")
}
