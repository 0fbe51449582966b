use super::*;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{Multipart, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use shared::protocol::TransferFields;
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Debug, Clone, Deserialize)]
struct LoginBody {
    username: String,
    password: String,
    remember: String,
}

#[derive(Debug, Clone, Default)]
struct ReceivedUpload {
    title: String,
    description: String,
    filename: String,
    size: usize,
}

#[derive(Clone, Default)]
struct ShopState {
    logins: Arc<Mutex<Vec<LoginBody>>>,
    login_content_types: Arc<Mutex<Vec<String>>>,
    uploads: Arc<Mutex<Vec<ReceivedUpload>>>,
}

fn has_session(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.split(';').any(|cookie| cookie.trim() == "session=ok"))
}

async fn handle_login(
    State(state): State<ShopState>,
    headers: HeaderMap,
    Form(body): Form<LoginBody>,
) -> Response {
    if let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        state
            .login_content_types
            .lock()
            .await
            .push(content_type.to_string());
    }
    let accepted = body.password == "s3cret";
    state.logins.lock().await.push(body);
    if accepted {
        (StatusCode::OK, [(header::SET_COOKIE, "session=ok; Path=/")]).into_response()
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

async fn handle_logout() -> Response {
    (
        StatusCode::OK,
        [(header::SET_COOKIE, "session=; Path=/; Max-Age=0")],
    )
        .into_response()
}

async fn handle_tenant(headers: HeaderMap) -> Response {
    if !has_session(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({ "slug": "shop", "name": "Demo shop" })).into_response()
}

async fn handle_products(headers: HeaderMap) -> Response {
    if !has_session(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!([{ "slug": "teapot" }])).into_response()
}

async fn handle_upload(
    State(state): State<ShopState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> StatusCode {
    if !has_session(&headers) {
        return StatusCode::UNAUTHORIZED;
    }

    let mut received = ReceivedUpload::default();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "title" => received.title = field.text().await.unwrap_or_default(),
            "description" => received.description = field.text().await.unwrap_or_default(),
            "file" => {
                received.filename = field.file_name().unwrap_or_default().to_string();
                received.size = field.bytes().await.map(|bytes| bytes.len()).unwrap_or_default();
            }
            _ => {}
        }
    }

    let rejected = received.filename == "reject.png";
    state.uploads.lock().await.push(received);
    if rejected {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::CREATED
    }
}

async fn spawn_shop_server() -> Result<(String, ShopState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ShopState::default();
    let app = Router::new()
        .route(auth_gate::LOGIN_PATH, post(handle_login))
        .route(auth_gate::LOGOUT_PATH, post(handle_logout))
        .route(auth_gate::SESSION_PATH, get(handle_tenant))
        .route("/api/1.0/product/", get(handle_products))
        .route("/api/1.0/images/", post(handle_upload))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

async fn wait_for_pending(bus: &AuthSignalBus, expected: usize) {
    for _ in 0..1000 {
        if bus.pending_len().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pending queue never reached {expected}");
}

async fn wait_for_terminal(coordinator: &UploadCoordinator) -> Vec<UploadTask> {
    for _ in 0..1000 {
        let tasks = coordinator.tasks().await;
        if tasks.iter().all(UploadTask::is_terminal) {
            return tasks;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("uploads never finished");
}

fn png(name: &str) -> FileSource {
    FileSource::new(name, crate::preview::sample_png(64, 48)).with_mime_type("image/png")
}

#[tokio::test]
async fn request_parked_before_login_completes_after_it() {
    let (server_url, state) = spawn_shop_server().await.expect("spawn server");
    let core = ClientCore::connect(&server_url, ClientOptions::default()).expect("client");
    let mut events = core.bus().subscribe();

    let gate = Arc::clone(core.gate());
    let products = tokio::spawn(async move { gate.get("/api/1.0/product/").await });
    wait_for_pending(core.bus(), 1).await;
    assert_eq!(
        events.recv().await.expect("event"),
        BusEvent::AuthenticationRequired
    );

    let outcome = core
        .gate()
        .authentication_request("alice", "s3cret", true)
        .await
        .expect("login");
    assert_eq!(
        outcome,
        AuthOutcome::Authenticated(json!({ "slug": "shop", "name": "Demo shop" }))
    );

    let response = products.await.expect("join").expect("replayed");
    assert_eq!(
        response.json::<serde_json::Value>().expect("json"),
        json!([{ "slug": "teapot" }])
    );
    assert_eq!(core.bus().pending_len().await, 0);

    let logins = state.logins.lock().await;
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].username, "alice");
    assert_eq!(logins[0].remember, "true");
    assert_eq!(
        state.login_content_types.lock().await.as_slice(),
        [transport::FORM_CONTENT_TYPE]
    );
}

#[tokio::test]
async fn wrong_password_is_reported_not_parked() {
    let (server_url, _state) = spawn_shop_server().await.expect("spawn server");
    let core = ClientCore::connect(&server_url, ClientOptions::default()).expect("client");
    let mut events = core.bus().subscribe();

    let outcome = core
        .gate()
        .authentication_request("alice", "guess", false)
        .await
        .expect("login");

    assert_eq!(outcome, AuthOutcome::Rejected { status: 401 });
    assert_eq!(core.bus().pending_len().await, 0);
    assert_eq!(
        events.recv().await.expect("event"),
        BusEvent::AuthenticationFailure
    );
}

#[tokio::test]
async fn uploads_ride_on_the_logged_in_session() {
    let (server_url, state) = spawn_shop_server().await.expect("spawn server");
    let options = ClientOptions {
        upload_chunk_size: 256,
        ..ClientOptions::default()
    };
    let core = ClientCore::connect(&server_url, options).expect("client");
    core.gate()
        .authentication_request("alice", "s3cret", false)
        .await
        .expect("login");

    let coordinator = core.upload_coordinator("/api/1.0/images/", None);
    let ids = coordinator
        .add_files(vec![png("front.png"), png("reject.png")])
        .await;
    coordinator
        .set_metadata(
            ids[0],
            TransferFields {
                title: "Front".into(),
                description: "Box front".into(),
            },
        )
        .await;
    coordinator.submit().await;

    let tasks = wait_for_terminal(&coordinator).await;
    assert!(tasks[0].uploaded());
    assert_eq!(tasks[0].progress, 100);
    assert!(tasks[1].failed());

    let uploads = state.uploads.lock().await;
    let front = uploads
        .iter()
        .find(|upload| upload.filename == "front.png")
        .expect("front uploaded");
    assert_eq!(front.title, "Front");
    assert_eq!(front.description, "Box front");
    assert_eq!(front.size, tasks[0].file.bytes.len());
}

#[tokio::test]
async fn uploaded_image_is_handed_to_the_thumbnail_editor() {
    let (server_url, _state) = spawn_shop_server().await.expect("spawn server");
    let core = ClientCore::connect(&server_url, ClientOptions::default()).expect("client");
    core.gate()
        .authentication_request("alice", "s3cret", false)
        .await
        .expect("login");

    let coordinator = core.upload_coordinator("/api/1.0/images/", None);
    let ids = coordinator.add_files(vec![png("cover.png")]).await;
    assert!(!core.edit_thumbnail(&coordinator, ids[0], 300, 200).await);

    coordinator.submit().await;
    wait_for_terminal(&coordinator).await;
    let mut events = core.bus().subscribe();

    assert!(core.edit_thumbnail(&coordinator, ids[0], 300, 200).await);
    assert!(!core.edit_thumbnail(&coordinator, TaskId(99), 300, 200).await);

    let event = events.recv().await.expect("event");
    assert_eq!(event.aspect_ratio(), Some(1.5));
    match event {
        BusEvent::ThumbnailEditReady { image, width, height } => {
            assert!(image.starts_with("data:image/png;base64,iVBOR"));
            assert_eq!((width, height), (300, 200));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn uploads_without_a_session_fail_instead_of_parking() {
    let (server_url, _state) = spawn_shop_server().await.expect("spawn server");
    let core = ClientCore::connect(&server_url, ClientOptions::default()).expect("client");

    let coordinator = core.upload_coordinator("/api/1.0/images/", None);
    coordinator.add_files(vec![png("anonymous.png")]).await;
    coordinator.submit().await;

    let tasks = wait_for_terminal(&coordinator).await;
    assert!(tasks[0].failed());
    assert_eq!(core.bus().pending_len().await, 0);
}

#[tokio::test]
async fn logout_sends_subscribers_back_to_login() {
    let (server_url, _state) = spawn_shop_server().await.expect("spawn server");
    let core = ClientCore::connect(&server_url, ClientOptions::default()).expect("client");
    core.gate()
        .authentication_request("alice", "s3cret", false)
        .await
        .expect("login");
    let mut events = core.bus().subscribe();

    core.gate()
        .forget_authentication_request()
        .await
        .expect("logout");

    assert_eq!(
        events.recv().await.expect("event"),
        BusEvent::AuthenticationRequired
    );
    // The session check after logout is refused and parked.
    wait_for_pending(core.bus(), 1).await;
}
