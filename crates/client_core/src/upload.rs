//! Batch file uploads. Each file becomes a task that renders its own preview,
//! transfers on its own and ends up uploaded or failed without waiting on or
//! affecting its siblings.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures::stream;
use reqwest::{
    multipart::{Form, Part},
    Body, Client,
};
use shared::{
    domain::{TaskId, TaskIdGenerator},
    protocol::TransferFields,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::UploadError,
    preview::{render_preview, Preview, PreviewOptions},
    transport::resolve_url,
};

const EVENT_CAPACITY: usize = 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Called with `(bytes_sent, bytes_total)` while a file is being transferred.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;
/// Called once for every task that finishes uploading.
pub type CompletionFn = Arc<dyn Fn(TaskId) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSource {
    pub name: String,
    pub mime_type: Option<String>,
    pub bytes: Bytes,
}

impl FileSource {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// The whole file inlined as a `data:` URI.
    pub fn data_uri(&self) -> String {
        let mime_type = self
            .mime_type
            .as_deref()
            .unwrap_or("application/octet-stream");
        format!("data:{mime_type};base64,{}", STANDARD.encode(&self.bytes))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreviewState {
    Pending,
    Ready(Preview),
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Idle,
    Transferring,
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadTask {
    pub id: TaskId,
    pub file: FileSource,
    pub fields: TransferFields,
    pub preview: PreviewState,
    /// Percentage in `0..=100`.
    pub progress: u8,
    pub phase: TaskPhase,
}

impl UploadTask {
    fn new(id: TaskId, file: FileSource) -> Self {
        Self {
            id,
            file,
            fields: TransferFields::default(),
            preview: PreviewState::Pending,
            progress: 0,
            phase: TaskPhase::Idle,
        }
    }

    pub fn uploaded(&self) -> bool {
        self.phase == TaskPhase::Uploaded
    }

    pub fn failed(&self) -> bool {
        self.phase == TaskPhase::Failed
    }

    pub fn is_terminal(&self) -> bool {
        self.uploaded() || self.failed()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    TaskAdded(UploadTask),
    TaskUpdated(UploadTask),
    TaskRemoved(TaskId),
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub uri: String,
    pub task_id: TaskId,
    pub file: FileSource,
    pub fields: TransferFields,
}

#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn transfer(&self, request: TransferRequest, progress: ProgressFn)
        -> Result<(), UploadError>;
}

/// Streams the file as a multipart `file` part next to the `title` and
/// `description` fields.
pub struct MultipartUploadTransport {
    http: Client,
    base_url: Url,
    chunk_size: usize,
}

impl MultipartUploadTransport {
    pub fn new(http: Client, base_url: Url) -> Self {
        Self::with_chunk_size(http, base_url, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(http: Client, base_url: Url, chunk_size: usize) -> Self {
        Self {
            http,
            base_url,
            chunk_size: chunk_size.max(1),
        }
    }
}

fn chunks(bytes: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    (0..bytes.len())
        .step_by(chunk_size)
        .map(|start| bytes.slice(start..(start + chunk_size).min(bytes.len())))
        .collect()
}

#[async_trait]
impl UploadTransport for MultipartUploadTransport {
    async fn transfer(
        &self,
        request: TransferRequest,
        progress: ProgressFn,
    ) -> Result<(), UploadError> {
        let url = resolve_url(&self.base_url, &request.uri)
            .map_err(|err| UploadError::Transport(err.to_string()))?;
        let total = request.file.bytes.len() as u64;

        let mut sent = 0u64;
        let body = stream::iter(chunks(&request.file.bytes, self.chunk_size).into_iter().map(
            move |chunk| {
                sent += chunk.len() as u64;
                progress(sent, total);
                Ok::<_, std::io::Error>(chunk)
            },
        ));

        let mut part = Part::stream_with_length(Body::wrap_stream(body), total)
            .file_name(request.file.name.clone());
        if let Some(mime_type) = &request.file.mime_type {
            part = part
                .mime_str(mime_type)
                .map_err(|_| UploadError::InvalidMime(mime_type.clone()))?;
        }
        let form = Form::new()
            .text("title", request.fields.title)
            .text("description", request.fields.description)
            .part("file", part);

        let response = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| UploadError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(UploadError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct CoordinatorState {
    ids: TaskIdGenerator,
    tasks: BTreeMap<TaskId, UploadTask>,
}

pub struct UploadCoordinator {
    upload_uri: String,
    transport: Arc<dyn UploadTransport>,
    preview_options: PreviewOptions,
    on_upload: Option<CompletionFn>,
    inner: Mutex<CoordinatorState>,
    events: broadcast::Sender<UploadEvent>,
}

impl UploadCoordinator {
    pub fn new(upload_uri: impl Into<String>, transport: Arc<dyn UploadTransport>) -> Arc<Self> {
        Self::new_with_options(upload_uri, transport, PreviewOptions::default(), None)
    }

    pub fn new_with_options(
        upload_uri: impl Into<String>,
        transport: Arc<dyn UploadTransport>,
        preview_options: PreviewOptions,
        on_upload: Option<CompletionFn>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            upload_uri: upload_uri.into(),
            transport,
            preview_options,
            on_upload,
            inner: Mutex::new(CoordinatorState::default()),
            events,
        })
    }

    pub fn upload_uri(&self) -> &str {
        &self.upload_uri
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.events.send(event);
    }

    /// Creates one idle task per file and starts rendering their previews in
    /// the background. Returns the new ids in file order.
    pub async fn add_files(self: &Arc<Self>, files: Vec<FileSource>) -> Vec<TaskId> {
        let mut added = Vec::with_capacity(files.len());
        {
            let mut guard = self.inner.lock().await;
            for file in files {
                let id = guard.ids.next_id();
                let task = UploadTask::new(id, file);
                info!(task = %id, name = %task.file.name, "upload: task added");
                added.push((id, task.file.bytes.clone()));
                guard.tasks.insert(id, task.clone());
                self.emit(UploadEvent::TaskAdded(task));
            }
        }

        added
            .into_iter()
            .map(|(id, bytes)| {
                self.spawn_preview(id, bytes);
                id
            })
            .collect()
    }

    fn spawn_preview(self: &Arc<Self>, id: TaskId, bytes: Bytes) {
        let coordinator = Arc::clone(self);
        let options = self.preview_options;
        tokio::spawn(async move {
            let rendered =
                tokio::task::spawn_blocking(move || render_preview(&bytes, options)).await;
            let state = match rendered {
                Ok(Ok(preview)) => PreviewState::Ready(preview),
                Ok(Err(err)) => PreviewState::Unavailable(err.to_string()),
                Err(err) => PreviewState::Unavailable(format!("preview worker failed: {err}")),
            };
            coordinator.apply_preview(id, state).await;
        });
    }

    async fn apply_preview(&self, id: TaskId, state: PreviewState) {
        let mut guard = self.inner.lock().await;
        let Some(task) = guard.tasks.get_mut(&id) else {
            debug!(task = %id, "upload: preview finished for removed task");
            return;
        };
        task.preview = state;
        self.emit(UploadEvent::TaskUpdated(task.clone()));
    }

    /// Forgets the task. Work already running for it keeps running, but its
    /// results are dropped.
    pub async fn remove_task(&self, id: TaskId) -> bool {
        let removed = self.inner.lock().await.tasks.remove(&id).is_some();
        if removed {
            info!(task = %id, "upload: task removed");
            self.emit(UploadEvent::TaskRemoved(id));
        }
        removed
    }

    pub async fn has_pending_tasks(&self) -> bool {
        !self.inner.lock().await.tasks.is_empty()
    }

    pub async fn set_metadata(&self, id: TaskId, fields: TransferFields) -> bool {
        let mut guard = self.inner.lock().await;
        let Some(task) = guard.tasks.get_mut(&id) else {
            return false;
        };
        task.fields = fields;
        self.emit(UploadEvent::TaskUpdated(task.clone()));
        true
    }

    pub async fn task(&self, id: TaskId) -> Option<UploadTask> {
        self.inner.lock().await.tasks.get(&id).cloned()
    }

    /// Every live task, in creation order.
    pub async fn tasks(&self) -> Vec<UploadTask> {
        self.inner.lock().await.tasks.values().cloned().collect()
    }

    /// Starts a transfer for every task that is not already transferring.
    /// Finished tasks, uploaded or failed, start over from zero.
    pub async fn submit(self: &Arc<Self>) -> Vec<TaskId> {
        let mut requests = Vec::new();
        {
            let mut guard = self.inner.lock().await;
            for task in guard.tasks.values_mut() {
                if task.phase == TaskPhase::Transferring {
                    continue;
                }
                task.progress = 0;
                task.phase = TaskPhase::Transferring;
                self.emit(UploadEvent::TaskUpdated(task.clone()));
                requests.push(TransferRequest {
                    uri: self.upload_uri.clone(),
                    task_id: task.id,
                    file: task.file.clone(),
                    fields: task.fields.clone(),
                });
            }
        }

        info!(count = requests.len(), uri = %self.upload_uri, "upload: submitting");
        requests
            .into_iter()
            .map(|request| {
                let id = request.task_id;
                self.spawn_transfer(request);
                id
            })
            .collect()
    }

    fn spawn_transfer(self: &Arc<Self>, request: TransferRequest) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let id = request.task_id;
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let progress: ProgressFn = Arc::new(move |loaded, total| {
                let _ = progress_tx.send((loaded, total));
            });

            let transfer = coordinator.transport.transfer(request, progress);
            tokio::pin!(transfer);
            let outcome = loop {
                tokio::select! {
                    Some((loaded, total)) = progress_rx.recv() => {
                        coordinator.on_progress(id, loaded, total).await;
                    }
                    outcome = &mut transfer => break outcome,
                }
            };
            while let Ok((loaded, total)) = progress_rx.try_recv() {
                coordinator.on_progress(id, loaded, total).await;
            }

            match outcome {
                Ok(()) => coordinator.on_done(id).await,
                Err(err) => {
                    warn!(task = %id, error = %err, "upload: transfer failed");
                    coordinator.on_failed(id).await;
                }
            }
        });
    }

    pub async fn on_progress(&self, id: TaskId, loaded: u64, total: u64) {
        let mut guard = self.inner.lock().await;
        let Some(task) = guard.tasks.get_mut(&id) else {
            return;
        };
        if task.phase != TaskPhase::Transferring {
            return;
        }
        task.progress = progress_percent(loaded, total);
        self.emit(UploadEvent::TaskUpdated(task.clone()));
    }

    /// Marks a transferring task uploaded and runs the completion callback.
    pub async fn on_done(&self, id: TaskId) {
        if !self.finish(id, TaskPhase::Uploaded).await {
            return;
        }
        if let Some(on_upload) = &self.on_upload {
            on_upload(id);
        }
    }

    pub async fn on_failed(&self, id: TaskId) {
        self.finish(id, TaskPhase::Failed).await;
    }

    async fn finish(&self, id: TaskId, phase: TaskPhase) -> bool {
        let mut guard = self.inner.lock().await;
        let Some(task) = guard.tasks.get_mut(&id) else {
            debug!(task = %id, ?phase, "upload: transfer finished for removed task");
            return false;
        };
        if task.phase != TaskPhase::Transferring {
            return false;
        }
        task.phase = phase;
        info!(task = %id, ?phase, "upload: transfer finished");
        self.emit(UploadEvent::TaskUpdated(task.clone()));
        true
    }
}

fn progress_percent(loaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = (loaded as f64 * 100.0 / total as f64).round();
    percent.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
