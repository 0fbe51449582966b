//! Raw HTTP plumbing underneath the auth gate.
//!
//! Requests are described by value so that a parked request can be reissued
//! verbatim, and responses are buffered so they can be handed to whichever
//! caller ends up waiting for them.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Client, Method, StatusCode,
};
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::GateError;

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";

#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Either a path relative to the transport's base url or an absolute url.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Url-encodes `pairs` as the body and sets the form content type. An empty
    /// iterator yields an empty body, which is what the logout call sends.
    pub fn with_form<I, K, V>(self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        self.with_header(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE))
            .with_body(body)
    }
}

#[derive(Debug, Clone)]
pub struct GateResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GateResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, GateError> {
        serde_json::from_slice(&self.body).map_err(|err| GateError::Decode(err.to_string()))
    }

    /// Like [`GateResponse::json`], but an empty body decodes to `null`.
    pub fn json_or_null(&self) -> Result<serde_json::Value, GateError> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Null);
        }
        self.json()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends the request and buffers whatever comes back, whatever the status.
    /// Only a missing response is an error here.
    async fn execute(&self, request: &RequestDescriptor) -> Result<GateResponse, GateError>;
}

pub struct ReqwestTransport {
    http: Client,
    base_url: Url,
}

impl ReqwestTransport {
    pub fn new(http: Client, base_url: &str) -> Result<Self, GateError> {
        let base_url =
            Url::parse(base_url).map_err(|err| GateError::InvalidUrl(format!("{base_url}: {err}")))?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &RequestDescriptor) -> Result<GateResponse, GateError> {
        let url = resolve_url(&self.base_url, &request.path)?;
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| GateError::Transport(err.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| GateError::Transport(err.to_string()))?;

        Ok(GateResponse {
            status,
            headers,
            body,
        })
    }
}

/// Resolves `path` against `base` unless it is already an absolute url.
pub fn resolve_url(base: &Url, path: &str) -> Result<Url, GateError> {
    match Url::parse(path) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => base
            .join(path)
            .map_err(|err| GateError::InvalidUrl(format!("{path}: {err}"))),
        Err(err) => Err(GateError::InvalidUrl(format!("{path}: {err}"))),
    }
}

/// Builds the HTTP client shared by the gate and the upload transport. The
/// cookie store is what carries the session from login to later calls.
pub fn build_http_client() -> Result<Client, GateError> {
    Client::builder()
        .cookie_store(true)
        .build()
        .map_err(|err| GateError::Transport(err.to_string()))
}
