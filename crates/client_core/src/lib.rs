use std::sync::Arc;

use shared::domain::TaskId;
use tracing::info;

pub mod auth_gate;
pub mod bus;
pub mod error;
pub mod preview;
pub mod transport;
pub mod upload;

pub use auth_gate::{AuthGate, AuthOutcome, Endpoints};
pub use bus::{AuthSignalBus, BusEvent, PendingRequest};
pub use error::{GateError, PreviewError, UploadError};
pub use preview::{render_preview, Preview, PreviewOptions};
pub use transport::{GateResponse, HttpTransport, RequestDescriptor, ReqwestTransport};
pub use upload::{
    CompletionFn, FileSource, MultipartUploadTransport, PreviewState, TaskPhase, UploadCoordinator,
    UploadEvent, UploadTask, UploadTransport,
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub endpoints: Endpoints,
    pub preview: PreviewOptions,
    pub upload_chunk_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            preview: PreviewOptions::default(),
            upload_chunk_size: upload::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// The auth gate and the upload transport wired to one HTTP client, so uploads
/// ride on the session the gate logged into.
pub struct ClientCore {
    gate: Arc<AuthGate>,
    uploads: Arc<MultipartUploadTransport>,
    preview: PreviewOptions,
}

impl ClientCore {
    pub fn connect(server_url: &str, options: ClientOptions) -> Result<Self, GateError> {
        let http = transport::build_http_client()?;
        let transport = ReqwestTransport::new(http.clone(), server_url)?;
        let uploads = MultipartUploadTransport::with_chunk_size(
            http,
            transport.base_url().clone(),
            options.upload_chunk_size,
        );
        let gate = AuthGate::with_endpoints(
            Arc::new(transport),
            Arc::new(AuthSignalBus::new()),
            options.endpoints,
        );

        Ok(Self {
            gate,
            uploads: Arc::new(uploads),
            preview: options.preview,
        })
    }

    pub fn gate(&self) -> &Arc<AuthGate> {
        &self.gate
    }

    pub fn bus(&self) -> &Arc<AuthSignalBus> {
        self.gate.bus()
    }

    pub fn upload_coordinator(
        &self,
        upload_uri: impl Into<String>,
        on_upload: Option<CompletionFn>,
    ) -> Arc<UploadCoordinator> {
        UploadCoordinator::new_with_options(
            upload_uri,
            self.uploads.clone(),
            self.preview,
            on_upload,
        )
    }

    /// Hands an uploaded image to the crop editor by publishing
    /// `ThumbnailEditReady` for a `width` x `height` thumbnail. Returns false
    /// when the task is unknown or has not finished uploading.
    pub async fn edit_thumbnail(
        &self,
        coordinator: &UploadCoordinator,
        id: TaskId,
        width: u32,
        height: u32,
    ) -> bool {
        let Some(task) = coordinator.task(id).await else {
            return false;
        };
        if !task.uploaded() {
            return false;
        }
        info!(task = %id, width, height, "upload: thumbnail ready for editing");
        self.bus().publish(BusEvent::ThumbnailEditReady {
            image: task.file.data_uri(),
            width,
            height,
        });
        true
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
