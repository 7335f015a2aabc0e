use crate::stream::StreamSession;
use crate::trainer::TrainerHandle;
use chrono::Local;
use rollcall_core::classifier::ClassifierStore;
use rollcall_core::Config;
use rollcall_store::{Store, StoreError};
use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    config: Arc<Config>,
    trainer: TrainerHandle,
    stream: Arc<Mutex<Option<StreamSession>>>,
}

impl AttendanceService {
    pub fn new(config: Arc<Config>, trainer: TrainerHandle) -> Self {
        Self {
            config,
            trainer,
            stream: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared slot holding the current session, for shutdown.
    pub fn stream_slot(&self) -> Arc<Mutex<Option<StreamSession>>> {
        self.stream.clone()
    }

    /// Run a ledger query on the blocking pool against a fresh connection.
    async fn with_store<T, F>(&self, f: F) -> fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.config.db_path();
        tokio::task::spawn_blocking(move || Store::open(db_path).and_then(|store| f(&store)))
            .await
            .map_err(|e| fdo::Error::Failed(format!("store task failed: {e}")))?
            .map_err(failed)
    }
}

fn failed(e: impl std::fmt::Display) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

fn to_json(value: &impl serde::Serialize) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Start the camera stream. Returns the session id.
    async fn start_stream(&self) -> fdo::Result<String> {
        let mut slot = self.stream.lock().await;
        if slot.as_ref().is_some_and(StreamSession::is_running) {
            return Err(fdo::Error::Failed("stream already running".into()));
        }

        let config = self.config.clone();
        let session = tokio::task::spawn_blocking(move || StreamSession::start(&config))
            .await
            .map_err(failed)?
            .map_err(|e| {
                tracing::warn!(error = %e, "stream start failed");
                failed(e)
            })?;

        let id = session.id().to_string();
        tracing::info!(session = %id, "stream started");
        *slot = Some(session);
        Ok(id)
    }

    /// Stop the camera stream. Returns false when no stream was running.
    async fn stop_stream(&self) -> fdo::Result<bool> {
        let Some(session) = self.stream.lock().await.take() else {
            return Ok(false);
        };
        let was_running = session.is_running();
        let exit = tokio::task::spawn_blocking(move || session.stop())
            .await
            .map_err(failed)?;
        tracing::info!(?exit, "stream stopped");
        Ok(was_running)
    }

    /// Daemon status as JSON.
    async fn status(&self) -> fdo::Result<String> {
        let stream = self
            .stream
            .lock()
            .await
            .as_ref()
            .map(StreamSession::snapshot);
        let today = Local::now().date_naive();
        let (day_initialized, present_today) = self
            .with_store(move |store| {
                Ok((store.is_day_initialized(today)?, store.present_count(today)?))
            })
            .await?;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "date": today,
            "stream": stream,
            "day_initialized": day_initialized,
            "present_today": present_today,
            "classifier_ready": ClassifierStore::exists(&self.config.classifier_dir()),
        })
        .to_string())
    }

    /// Create today's Absent rows. Returns how many were created.
    async fn initialize_day(&self) -> fdo::Result<u32> {
        let now = Local::now().naive_local();
        let created = self
            .with_store(move |store| store.initialize_day(now.date(), now))
            .await?;
        Ok(created as u32)
    }

    /// Number of students marked Present today.
    async fn present_count(&self) -> fdo::Result<u32> {
        let today = Local::now().date_naive();
        self.with_store(move |store| store.present_count(today)).await
    }

    /// Re-embed a student's images and retrain. Returns the JSON report.
    async fn enroll(&self, student_id: i64) -> fdo::Result<String> {
        tracing::info!(student_id, "enroll requested");
        let outcome = self.trainer.enroll(student_id).await.map_err(failed)?;
        to_json(&outcome)
    }

    /// Rebuild the classifier from all embeddings. Returns the JSON report.
    async fn retrain(&self) -> fdo::Result<String> {
        tracing::info!("retrain requested");
        let report = self.trainer.retrain().await.map_err(failed)?;
        to_json(&report)
    }
}
