use std::{collections::HashMap, fs, path::Path};

use anyhow::Context;
use client_core::{ClientOptions, Endpoints, PreviewOptions};
use tracing_subscriber::EnvFilter;

pub const SETTINGS_FILE: &str = "uploader.toml";
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub login_path: String,
    pub logout_path: String,
    pub session_path: String,
    pub upload_uri: String,
    pub preview_max_width: u32,
    pub preview_max_height: u32,
    pub upload_chunk_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let endpoints = Endpoints::default();
        let preview = PreviewOptions::default();
        let client = ClientOptions::default();
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            login_path: endpoints.login,
            logout_path: endpoints.logout,
            session_path: endpoints.session,
            upload_uri: "/api/1.0/images/".into(),
            preview_max_width: preview.max_width,
            preview_max_height: preview.max_height,
            upload_chunk_size: client.upload_chunk_size,
        }
    }
}

impl Settings {
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            endpoints: Endpoints {
                login: self.login_path.clone(),
                logout: self.logout_path.clone(),
                session: self.session_path.clone(),
            },
            preview: PreviewOptions {
                max_width: self.preview_max_width,
                max_height: self.preview_max_height,
            },
            upload_chunk_size: self.upload_chunk_size,
        }
    }
}

/// Defaults, then `uploader.toml` in the working directory, then environment.
pub fn load_settings() -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let path = Path::new(SETTINGS_FILE);
    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
        apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid settings file '{}'", path.display()))?;
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

/// `RUST_LOG` directives when they parse, `info` otherwise.
pub fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg = toml::from_str::<HashMap<String, String>>(raw)?;
    apply_values(settings, |key| file_cfg.get(key).cloned());
    Ok(())
}

fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("UPLOADER_SERVER_URL") {
        settings.server_url = v;
    }
    apply_values(settings, |key| lookup(&format!("APP__{}", key.to_ascii_uppercase())));
}

fn apply_values(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("login_path") {
        settings.login_path = v;
    }
    if let Some(v) = lookup("logout_path") {
        settings.logout_path = v;
    }
    if let Some(v) = lookup("session_path") {
        settings.session_path = v;
    }
    if let Some(v) = lookup("upload_uri") {
        settings.upload_uri = v;
    }
    if let Some(parsed) = lookup("preview_max_width").and_then(|v| v.parse().ok()) {
        settings.preview_max_width = parsed;
    }
    if let Some(parsed) = lookup("preview_max_height").and_then(|v| v.parse().ok()) {
        settings.preview_max_height = parsed;
    }
    if let Some(parsed) = lookup("upload_chunk_size").and_then(|v| v.parse().ok()) {
        settings.upload_chunk_size = parsed;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
