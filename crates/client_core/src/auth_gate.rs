//! 401 interception: park requests that need a session, replay them once one
//! exists.

use std::{sync::Arc, task::Poll};

use futures::{stream::FuturesUnordered, StreamExt};
use reqwest::StatusCode;
use shared::protocol::{LoginForm, SessionPayload};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    bus::{AuthSignalBus, BusEvent, PendingRequest},
    error::GateError,
    transport::{GateResponse, HttpTransport, RequestDescriptor},
};

pub const LOGIN_PATH: &str = "/api/1.0/login/";
pub const LOGOUT_PATH: &str = "/api/1.0/logout/";
pub const SESSION_PATH: &str = "/api/1.0/tenant/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub login: String,
    pub logout: String,
    pub session: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: LOGIN_PATH.into(),
            logout: LOGOUT_PATH.into(),
            session: SESSION_PATH.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    Authenticated(SessionPayload),
    Rejected { status: u16 },
}

pub struct AuthGate {
    transport: Arc<dyn HttpTransport>,
    bus: Arc<AuthSignalBus>,
    endpoints: Endpoints,
}

impl AuthGate {
    pub fn new(transport: Arc<dyn HttpTransport>, bus: Arc<AuthSignalBus>) -> Arc<Self> {
        Self::with_endpoints(transport, bus, Endpoints::default())
    }

    pub fn with_endpoints(
        transport: Arc<dyn HttpTransport>,
        bus: Arc<AuthSignalBus>,
        endpoints: Endpoints,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            bus,
            endpoints,
        })
    }

    pub fn bus(&self) -> &Arc<AuthSignalBus> {
        &self.bus
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn is_login(&self, request: &RequestDescriptor) -> bool {
        request.path == self.endpoints.login
            || Url::parse(&request.path).is_ok_and(|url| url.path() == self.endpoints.login)
    }

    /// Sends `request` through the gate.
    ///
    /// A 401 from anything but the login endpoint does not fail: the request is
    /// parked and this future resolves with the outcome of its replay after the
    /// next successful authentication. Every other non-success status comes
    /// back as [`GateError::Status`].
    pub async fn send(&self, request: RequestDescriptor) -> Result<GateResponse, GateError> {
        let response = self.transport.execute(&request).await?;
        if response.status == StatusCode::UNAUTHORIZED && !self.is_login(&request) {
            return self.park(request).await;
        }
        into_result(response)
    }

    pub async fn get(&self, path: &str) -> Result<GateResponse, GateError> {
        self.send(RequestDescriptor::get(path)).await
    }

    pub async fn post_form<K, V>(&self, path: &str, pairs: Vec<(K, V)>) -> Result<GateResponse, GateError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.send(RequestDescriptor::post(path).with_form(pairs))
            .await
    }

    async fn park(&self, request: RequestDescriptor) -> Result<GateResponse, GateError> {
        let path = request.path.clone();
        let (pending, outcome) = PendingRequest::new(request);
        let queued = self.bus.park(pending).await;
        info!(path = %path, queued, "auth: parked request until authentication succeeds");
        self.bus.publish(BusEvent::AuthenticationRequired);

        outcome.await.map_err(|_| GateError::Abandoned)?
    }

    /// Replays every request parked so far, then announces the session to
    /// subscribers.
    ///
    /// The queue is swapped out before anything goes out; anything parked
    /// meanwhile waits for the next call. Every replay is issued in parking
    /// order before the announcement, but none waits on another: a replay that
    /// never answers only keeps its own caller waiting. A replay is sent
    /// straight to the transport and its outcome, 401 included, is final.
    pub async fn authentication_successful(&self, payload: SessionPayload) {
        let parked = self.bus.take_pending().await;
        if !parked.is_empty() {
            info!(count = parked.len(), "auth: replaying parked requests");
            let mut replays = parked
                .into_iter()
                .map(|request| replay(Arc::clone(&self.transport), request))
                .collect::<FuturesUnordered<_>>();

            // One pass polls every replay once, in the order they were parked.
            while let Poll::Ready(Some(())) = futures::poll!(replays.next()) {}
            if !replays.is_empty() {
                debug!(in_flight = replays.len(), "auth: replays continue in the background");
                tokio::spawn(async move { while replays.next().await.is_some() {} });
            }
        }

        self.bus
            .publish(BusEvent::AuthenticationSuccessful(payload));
    }

    /// Posts credentials to the login endpoint. Exactly 200 is followed by a
    /// session fetch that bypasses parking; a session then counts as
    /// [`AuthOutcome::Authenticated`]. Anything else broadcasts
    /// `AuthenticationFailure`.
    pub async fn authentication_request(
        &self,
        username: &str,
        password: &str,
        remember: bool,
    ) -> Result<AuthOutcome, GateError> {
        let form = LoginForm::new(username, password, remember);
        let request = RequestDescriptor::post(self.endpoints.login.clone()).with_form(form.pairs());

        match self.log_in(request).await {
            Ok(payload) => {
                info!(username, "auth: credentials accepted");
                self.authentication_successful(payload.clone()).await;
                Ok(AuthOutcome::Authenticated(payload))
            }
            Err(GateError::Status { status, .. }) => {
                warn!(username, status, "auth: credentials rejected");
                self.bus.publish(BusEvent::AuthenticationFailure);
                Ok(AuthOutcome::Rejected { status })
            }
            Err(err) => {
                warn!(username, error = %err, "auth: login request failed");
                self.bus.publish(BusEvent::AuthenticationFailure);
                Err(err)
            }
        }
    }

    async fn log_in(&self, request: RequestDescriptor) -> Result<SessionPayload, GateError> {
        let response = self.send(request).await?;
        if response.status != StatusCode::OK {
            return Err(GateError::Status {
                status: response.status.as_u16(),
                body: response.text(),
            });
        }
        // A 401 here means the login did not stick; parking it would wait on itself.
        let session = RequestDescriptor::get(self.endpoints.session.clone());
        self.transport
            .execute(&session)
            .await
            .and_then(into_result)?
            .json_or_null()
    }

    /// Logs out, then asks the server about the session in the background and
    /// tells subscribers authentication is required again.
    pub async fn forget_authentication_request(self: &Arc<Self>) -> Result<(), GateError> {
        let request = RequestDescriptor::post(self.endpoints.logout.clone())
            .with_form(std::iter::empty::<(&str, &str)>());
        self.send(request).await?;
        info!("auth: session forgotten");

        let gate = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = gate.ping().await {
                debug!(error = %err, "auth: post-logout ping failed");
            }
        });

        self.bus.publish(BusEvent::AuthenticationRequired);
        Ok(())
    }

    /// Fetches the current session through the gate, so a 401 parks it until
    /// the next login. On success the parked requests are replayed and
    /// `AuthenticationSuccessful` carries the payload.
    pub async fn ping(&self) -> Result<SessionPayload, GateError> {
        let response = self
            .send(RequestDescriptor::get(self.endpoints.session.clone()))
            .await?;
        let payload = response.json_or_null()?;
        self.authentication_successful(payload.clone()).await;
        Ok(payload)
    }
}

async fn replay(transport: Arc<dyn HttpTransport>, request: PendingRequest) {
    let outcome = transport
        .execute(&request.descriptor)
        .await
        .and_then(into_result);
    if let Err(err) = &outcome {
        warn!(path = %request.descriptor.path, error = %err, "auth: replay failed");
    }
    request.resolve(outcome);
}

fn into_result(response: GateResponse) -> Result<GateResponse, GateError> {
    if response.is_success() {
        return Ok(response);
    }
    Err(GateError::Status {
        status: response.status.as_u16(),
        body: response.text(),
    })
}

#[cfg(test)]
#[path = "tests/auth_gate_tests.rs"]
mod tests;
