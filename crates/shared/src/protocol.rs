use serde::{Deserialize, Serialize};

/// Form body posted to the login endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
    pub remember: bool,
}

impl LoginForm {
    pub fn new(username: impl Into<String>, password: impl Into<String>, remember: bool) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            remember,
        }
    }

    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("username", self.username.clone()),
            ("password", self.password.clone()),
            ("remember", self.remember.to_string()),
        ]
    }
}

/// Per-file fields sent alongside the file part of an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFields {
    pub title: String,
    pub description: String,
}

/// Whatever the session endpoint returns for the current tenant. The client
/// core never inspects it; it is handed to subscribers as-is.
pub type SessionPayload = serde_json::Value;
