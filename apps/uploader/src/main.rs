use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{
    AuthOutcome, BusEvent, ClientCore, FileSource, TaskPhase, UploadEvent, UploadTask,
};
use shared::{domain::TaskId, protocol::TransferFields};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};

mod config;

use config::{load_settings, log_filter};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    remember: bool,
    /// Endpoint the files are posted to; defaults to the configured one.
    #[arg(long)]
    upload_uri: Option<String>,
    #[arg(long, default_value = "")]
    title: String,
    #[arg(long, default_value = "")]
    description: String,
    files: Vec<PathBuf>,
}

fn spawn_bus_logger(mut events: broadcast::Receiver<BusEvent>) {
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BusEvent::AuthenticationRequired => warn!("session: authentication required"),
                BusEvent::AuthenticationSuccessful(payload) => {
                    info!(%payload, "session: authenticated")
                }
                BusEvent::AuthenticationFailure => warn!("session: authentication failed"),
                BusEvent::ThumbnailEditReady { image, .. } => {
                    info!(image = %image, "session: thumbnail ready for editing")
                }
            }
        }
    });
}

async fn read_files(paths: &[PathBuf]) -> Result<Vec<FileSource>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mut file = FileSource::new(name, bytes);
        if let Some(mime) = mime_guess::from_path(path).first() {
            file = file.with_mime_type(mime.essence_str());
        }
        files.push(file);
    }
    Ok(files)
}

fn describe(task: &UploadTask) -> &'static str {
    match task.phase {
        TaskPhase::Idle => "idle",
        TaskPhase::Transferring => "transferring",
        TaskPhase::Uploaded => "uploaded",
        TaskPhase::Failed => "failed",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings()?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(upload_uri) = args.upload_uri {
        settings.upload_uri = upload_uri;
    }

    let core = ClientCore::connect(&settings.server_url, settings.client_options())
        .with_context(|| format!("failed to set up client for {}", settings.server_url))?;
    spawn_bus_logger(core.bus().subscribe());

    match core
        .gate()
        .authentication_request(&args.username, &args.password, args.remember)
        .await?
    {
        AuthOutcome::Authenticated(payload) => println!("Logged in, tenant: {payload}"),
        AuthOutcome::Rejected { status } => bail!("login rejected with status {status}"),
    }

    if args.files.is_empty() {
        return Ok(());
    }

    let files = read_files(&args.files).await?;
    let coordinator = core.upload_coordinator(
        settings.upload_uri.clone(),
        Some(Arc::new(|id: TaskId| info!(task = %id, "upload: completed"))),
    );
    let ids = coordinator.add_files(files).await;
    for id in &ids {
        coordinator
            .set_metadata(
                *id,
                TransferFields {
                    title: args.title.clone(),
                    description: args.description.clone(),
                },
            )
            .await;
    }

    let mut updates = BroadcastStream::new(coordinator.subscribe());
    coordinator.submit().await;

    while let Some(update) = updates.next().await {
        match update {
            Ok(UploadEvent::TaskUpdated(task)) if task.phase == TaskPhase::Transferring => {
                println!("{} {:>3}%", task.file.name, task.progress);
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "upload: missed progress updates"),
        }
        if coordinator.tasks().await.iter().all(UploadTask::is_terminal) {
            break;
        }
    }

    let tasks = coordinator.tasks().await;
    for task in &tasks {
        println!("{}: {}", task.file.name, describe(task));
    }
    let failed = tasks.iter().filter(|task| task.failed()).count();
    if failed > 0 {
        bail!("{failed} of {} uploads failed", tasks.len());
    }
    Ok(())
}
