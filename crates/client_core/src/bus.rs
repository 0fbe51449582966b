//! Process-wide authentication signals and the queue of parked requests.

use shared::protocol::SessionPayload;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::debug;

use crate::{
    error::GateError,
    transport::{GateResponse, RequestDescriptor},
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    AuthenticationRequired,
    AuthenticationSuccessful(SessionPayload),
    AuthenticationFailure,
    /// An image is ready to be cropped into a `width` x `height` thumbnail.
    /// Published by `ClientCore::edit_thumbnail` once a file has uploaded.
    ThumbnailEditReady {
        image: String,
        width: u32,
        height: u32,
    },
}

impl BusEvent {
    /// Ratio the crop selection has to keep for a `ThumbnailEditReady` event.
    pub fn aspect_ratio(&self) -> Option<f64> {
        match self {
            Self::ThumbnailEditReady { width, height, .. } if *height > 0 => {
                Some(f64::from(*width) / f64::from(*height))
            }
            _ => None,
        }
    }
}

pub type ReplayOutcome = Result<GateResponse, GateError>;

/// A request that came back 401 and is waiting for the next successful
/// authentication. The original caller holds the other end of `responder`.
#[derive(Debug)]
pub struct PendingRequest {
    pub descriptor: RequestDescriptor,
    responder: oneshot::Sender<ReplayOutcome>,
}

impl PendingRequest {
    pub fn new(descriptor: RequestDescriptor) -> (Self, oneshot::Receiver<ReplayOutcome>) {
        let (responder, rx) = oneshot::channel();
        (
            Self {
                descriptor,
                responder,
            },
            rx,
        )
    }

    /// Resolves the caller's result slot. Consumes the request, so it cannot be
    /// resolved twice.
    pub fn resolve(self, outcome: ReplayOutcome) {
        if self.responder.send(outcome).is_err() {
            debug!(path = %self.descriptor.path, "auth: caller went away before replay completed");
        }
    }
}

pub struct AuthSignalBus {
    events: broadcast::Sender<BusEvent>,
    pending: Mutex<Vec<PendingRequest>>,
}

impl Default for AuthSignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthSignalBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Broadcasts to current subscribers. Having none is not an error.
    ///
    /// Publishing `AuthenticationSuccessful` here only notifies; replaying the
    /// parked requests is the gate's job (`AuthGate::authentication_successful`).
    pub fn publish(&self, event: BusEvent) {
        let _ = self.events.send(event);
    }

    pub async fn park(&self, request: PendingRequest) -> usize {
        let mut pending = self.pending.lock().await;
        pending.push(request);
        pending.len()
    }

    /// Takes every parked request in parking order and leaves the queue empty,
    /// in one step under the lock.
    pub async fn take_pending(&self) -> Vec<PendingRequest> {
        std::mem::take(&mut *self.pending.lock().await)
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}
