//! Camera streaming session.
//!
//! A session owns the capture thread and the cancellation token that stops
//! it. The loop checks the token once per frame, so a stop takes effect after
//! at most one in-flight frame.

use chrono::{Local, NaiveDateTime};
use rollcall_core::classifier::{ClassifierError, ClassifierStore};
use rollcall_core::onnx::{OnnxEmbedder, OnnxFaceLocator};
use rollcall_core::{Config, DecisionGate, EmbeddingExtractor, FaceError, FaceLocator, RecognitionEngine};
use rollcall_hw::{CameraError, CameraSource, FrameSource};
use rollcall_store::{MarkOutcome, Store, StoreError};
use serde::Serialize;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("model: {0}")]
    Face(#[from] FaceError),
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(std::io::Error),
}

/// Why a capture loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum StreamExit {
    Cancelled,
    SourceEnded,
    SourceFailed(String),
}

/// Progress published by the capture loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamSnapshot {
    pub session_id: String,
    pub started_at: Option<NaiveDateTime>,
    pub running: bool,
    pub frames_processed: u64,
    pub faces_seen: u64,
    pub marks_written: u64,
    pub last_caption: Option<String>,
    pub exit: Option<StreamExit>,
}

/// Pull frames until cancelled or the source stops, marking recognized
/// students present. When the clock crosses midnight the new day is
/// initialized before its first mark.
pub fn run_capture_loop<S, L, E, N>(
    source: &mut S,
    engine: &mut RecognitionEngine<L, E>,
    store: &Store,
    token: &CancellationToken,
    progress: &watch::Sender<StreamSnapshot>,
    now: N,
) -> StreamExit
where
    S: FrameSource,
    L: FaceLocator,
    E: EmbeddingExtractor,
    N: Fn() -> NaiveDateTime,
{
    let mut day = now().date();
    loop {
        if token.is_cancelled() {
            return StreamExit::Cancelled;
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return StreamExit::SourceEnded,
            Err(e) => {
                tracing::error!(error = %e, "frame source failed; ending stream");
                return StreamExit::SourceFailed(e.to_string());
            }
        };

        let at = now();
        if at.date() != day {
            day = at.date();
            match store.initialize_day(day, at) {
                Ok(created) => tracing::info!(%day, created, "new day initialized"),
                Err(e) => tracing::warn!(%day, error = %e, "failed to initialize new day"),
            }
        }

        let (annotated, name) = engine.recognize(frame);
        let mut marked = false;
        if let Some(name) = name {
            match store.mark_present(&name, at) {
                Ok(MarkOutcome::UnknownStudent) => {}
                Ok(_) => marked = true,
                Err(e) => tracing::warn!(student = %name, error = %e, "failed to mark attendance"),
            }
        }

        let caption = annotated.caption();
        progress.send_modify(|s| {
            s.frames_processed += 1;
            if annotated.face.is_some() {
                s.faces_seen += 1;
            }
            if marked {
                s.marks_written += 1;
            }
            s.last_caption = Some(caption);
        });
    }
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// A running (or finished) capture session.
pub struct StreamSession {
    id: Uuid,
    token: CancellationToken,
    thread: Option<JoinHandle<StreamExit>>,
    progress: watch::Receiver<StreamSnapshot>,
}

impl StreamSession {
    /// Open the ledger, the classifier store, both models and the camera,
    /// then start capturing. Any missing resource fails the start.
    pub fn start(config: &Config) -> Result<Self, StreamError> {
        let store = Store::open(config.db_path())?;
        let classifier = ClassifierStore::load(&config.classifier_dir())?;
        let locator =
            OnnxFaceLocator::load(&config.detector_model_path(), config.detection_threshold)?;
        let extractor = OnnxEmbedder::load(&config.embedder_model_path())?;
        let source = CameraSource::open(
            &config.camera_device,
            config.camera_width,
            config.camera_height,
        )?;

        let engine =
            RecognitionEngine::new(locator, extractor, classifier, DecisionGate::from_config(config));
        Self::spawn(source, engine, store, local_now)
    }

    /// Initialize today's ledger and run the capture loop on its own thread.
    pub fn spawn<S, L, E, N>(
        mut source: S,
        mut engine: RecognitionEngine<L, E>,
        store: Store,
        now: N,
    ) -> Result<Self, StreamError>
    where
        S: FrameSource + Send + 'static,
        L: FaceLocator + Send + 'static,
        E: EmbeddingExtractor + Send + 'static,
        N: Fn() -> NaiveDateTime + Send + 'static,
    {
        let started_at = now();
        store.initialize_day(started_at.date(), started_at)?;

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let (tx, rx) = watch::channel(StreamSnapshot {
            session_id: id.to_string(),
            started_at: Some(started_at),
            running: true,
            ..Default::default()
        });

        let loop_token = token.clone();
        let thread = std::thread::Builder::new()
            .name("rollcall-stream".into())
            .spawn(move || {
                tracing::info!(session = %id, "capture loop started");
                let exit = run_capture_loop(&mut source, &mut engine, &store, &loop_token, &tx, now);
                tracing::info!(session = %id, ?exit, "capture loop ended");
                tx.send_modify(|s| {
                    s.running = false;
                    s.exit = Some(exit.clone());
                });
                exit
            })
            .map_err(StreamError::Spawn)?;

        Ok(Self {
            id,
            token,
            thread: Some(thread),
            progress: rx,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        self.progress.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel and wait for the loop to finish its current frame.
    pub fn stop(mut self) -> StreamExit {
        self.token.cancel();
        self.join()
    }

    fn join(&mut self) -> StreamExit {
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(exit)) => exit,
            Some(Err(_)) => StreamExit::SourceFailed("capture thread panicked".into()),
            None => self
                .progress
                .borrow()
                .exit
                .clone()
                .unwrap_or(StreamExit::Cancelled),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
