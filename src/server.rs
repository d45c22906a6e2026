//! HTTP surface (§6): axum router wiring vault, storage, upload, and
//! delivery onto routes. Grounded on the teacher's `AppState` +
//! `security_headers` middleware shape, generalized from a single
//! ephemeral drop to a full filesystem surface.

use crate::collaborators::{AiFeeder, AuthContext, HoneyfileGuard, NoHoneyfiles, NoopFeeder};
use crate::config::EceConfig;
use crate::container;
use crate::crypto::{self, BufferPools, SALT_SIZE};
use crate::delivery::{self, DeliveryOutcome};
use crate::error::EceError;
use crate::policy::{self, ContentMode, EncryptionOverride};
use crate::storage::Storage;
use crate::upload::UploadCoordinator;
use crate::vault::Vault;
use axum::{
    body::Bytes,
    extract::{Multipart, Path as AxPath, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub struct AppState {
    pub vault: Arc<Vault>,
    pub storage: Arc<Storage>,
    pub uploads: Arc<UploadCoordinator>,
    pub pools: BufferPools,
    pub config: EceConfig,
    pub honeyfiles: Arc<dyn HoneyfileGuard>,
    pub ai_feeder: Arc<dyn AiFeeder>,
}

impl AppState {
    pub fn new(config: EceConfig) -> Self {
        Self {
            vault: Arc::new(Vault::new(config.vault_dir.clone())),
            storage: Arc::new(Storage::new(config.base_dir.clone(), config.trash_subdir.clone())),
            uploads: Arc::new(UploadCoordinator::new(config.base_dir.join(&config.uploads_subdir))),
            pools: BufferPools::new(),
            config,
            honeyfiles: Arc::new(NoHoneyfiles),
            ai_feeder: Arc::new(NoopFeeder),
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    state.uploads.spawn_reaper();

    Router::new()
        .route("/api/vault/status", get(vault_status))
        .route("/api/vault/setup", post(vault_setup))
        .route("/api/vault/unlock", post(vault_unlock))
        .route("/api/vault/lock", post(vault_lock))
        .route("/api/vault/panic", post(vault_panic))
        .route("/api/uploads/init", post(init_upload))
        .route("/api/uploads/{id}/chunk", put(upload_chunk))
        .route("/api/uploads/{id}/finalize", post(finalize_upload))
        .route("/api/uploads/{id}", delete(abort_upload))
        .route("/api/storage/list", get(list_storage))
        .route("/api/storage/mkdir", post(mkdir))
        .route("/api/storage/move", post(move_entry))
        .route("/api/storage/upload", post(direct_upload))
        .route("/api/storage/download/{*path}", get(download))
        .route("/api/storage/entry/{*path}", delete(soft_delete))
        .route("/api/storage/trash", get(list_trash))
        .route("/api/storage/trash/restore", post(restore_trash))
        .route("/api/storage/trash/{*id}", delete(delete_trash))
        .layer(middleware::from_fn(security_headers))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn security_headers(request: axum::extract::Request, next: middleware::Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "Permissions-Policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );
    headers.insert("Cache-Control", HeaderValue::from_static("no-store, no-cache, must-revalidate"));
    response
}

// ─── Vault ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PasswordBody {
    password: String,
}

async fn vault_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.vault.status().await)
}

async fn vault_setup(State(state): State<Arc<AppState>>, Json(body): Json<PasswordBody>) -> Response {
    match state.vault.setup(&body.password).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn vault_unlock(State(state): State<Arc<AppState>>, Json(body): Json<PasswordBody>) -> Response {
    match state.vault.unlock(&body.password).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn vault_lock(State(state): State<Arc<AppState>>) -> Response {
    match state.vault.lock().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn vault_panic(State(state): State<Arc<AppState>>) -> Response {
    match state.vault.panic().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

// ─── Chunked uploads ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct InitUploadBody {
    filename: String,
    expected_size: u64,
    dest_relative: String,
}

async fn init_upload(State(state): State<Arc<AppState>>, Json(body): Json<InitUploadBody>) -> Response {
    let content_len_ok = body.expected_size <= state.config.upload_cap_bytes;
    if !content_len_ok {
        return EceError::BadRequest("expected_size exceeds upload cap".to_string()).into_response();
    }
    match state.uploads.init_upload(body.filename, body.expected_size, body.dest_relative).await {
        Ok(id) => Json(serde_json::json!({ "upload_id": id })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn upload_chunk(State(state): State<Arc<AppState>>, AxPath(id): AxPath<Uuid>, body: Bytes) -> Response {
    match state.uploads.upload_chunk(id, &body).await {
        Ok(received) => Json(serde_json::json!({ "received": received })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn finalize_upload(State(state): State<Arc<AppState>>, AxPath(id): AxPath<Uuid>) -> Response {
    match state.uploads.finalize_upload(id, &state.storage, state.config.reject_on_size_mismatch).await {
        Ok(dest) => {
            let ai_feeder = state.ai_feeder.clone();
            let dest_for_notify = dest.clone();
            tokio::spawn(async move {
                ai_feeder.notify_upload(&dest_for_notify, 0).await;
            });
            Json(serde_json::json!({ "path": dest })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn abort_upload(State(state): State<Arc<AppState>>, AxPath(id): AxPath<Uuid>) -> Response {
    match state.uploads.abort_upload(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

// ─── Storage CRUD ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: String,
}

async fn list_storage(State(state): State<Arc<AppState>>, Query(q): Query<PathQuery>) -> Response {
    match state.storage.list(&q.path).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct MkdirBody {
    path: String,
}

async fn mkdir(State(state): State<Arc<AppState>>, Json(body): Json<MkdirBody>) -> Response {
    match state.storage.mkdir(&body.path).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct MoveBody {
    from: String,
    to: String,
}

async fn move_entry(State(state): State<Arc<AppState>>, Json(body): Json<MoveBody>) -> Response {
    match state.storage.mv(&body.from, &body.to).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Non-chunked multipart upload for files under the server's cap: reads
/// the `file` field plus the `path` destination and optional
/// `encryption_override` fields, runs `policy::validate_upload`, then
/// dispatches on `policy::determine_mode` — encrypting server-side under
/// the vault's DEK for `USER` mode (§4.7) rather than writing cleartext.
async fn direct_upload(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let mut dest_path: Option<String> = None;
    let mut encryption_override = EncryptionOverride::Auto;
    let mut file_bytes: Option<Bytes> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return EceError::BadRequest(e.to_string()).into_response(),
        };

        match field.name().unwrap_or("") {
            "path" => match field.text().await {
                Ok(text) => dest_path = Some(text),
                Err(e) => return EceError::BadRequest(e.to_string()).into_response(),
            },
            "encryption_override" => match field.text().await {
                Ok(text) => {
                    encryption_override = match text.to_lowercase().as_str() {
                        "force_user" => EncryptionOverride::ForceUser,
                        "force_none" => EncryptionOverride::ForceNone,
                        _ => EncryptionOverride::Auto,
                    };
                }
                Err(e) => return EceError::BadRequest(e.to_string()).into_response(),
            },
            "file" => match field.bytes().await {
                Ok(data) => file_bytes = Some(data),
                Err(e) => return EceError::BadRequest(e.to_string()).into_response(),
            },
            _ => {
                let _ = field.bytes().await;
            }
        }
    }

    let Some(data) = file_bytes else {
        return EceError::BadRequest("missing file field".to_string()).into_response();
    };
    let Some(dest_path) = dest_path else {
        return EceError::BadRequest("missing path field".to_string()).into_response();
    };

    if let Err(rejection) = policy::validate_upload(
        &dest_path,
        data.len() as u64,
        state.config.upload_cap_bytes,
        &data[..data.len().min(512)],
    ) {
        return EceError::BadRequest(format!("{:?}", rejection)).into_response();
    }

    let mode = policy::determine_mode(&dest_path, data.len() as u64, encryption_override);

    match mode {
        ContentMode::User => {
            let key = match state.vault.current_dek().await {
                Some(key) => key,
                None => return EceError::VaultLocked.into_response(),
            };
            let stored_path = if dest_path.ends_with(".enc") { dest_path } else { format!("{}.enc", dest_path) };
            let salt = crypto::random_bytes::<SALT_SIZE>();
            let mut sealed = Vec::new();
            let mut reader = std::io::Cursor::new(data.to_vec());
            if let Err(e) = container::encrypt_stream_with_key(&key, salt, &mut reader, &mut sealed, &state.pools).await {
                return e.into_response();
            }
            match state.storage.write_file(&stored_path, std::io::Cursor::new(sealed)).await {
                Ok(written) => {
                    Json(serde_json::json!({ "path": stored_path, "size_bytes": written, "mode": "user" })).into_response()
                }
                Err(e) => e.into_response(),
            }
        }
        ContentMode::None => match state.storage.write_file(&dest_path, std::io::Cursor::new(data.to_vec())).await {
            Ok(written) => Json(serde_json::json!({ "path": dest_path, "size_bytes": written, "mode": "none" })).into_response(),
            Err(e) => e.into_response(),
        },
        ContentMode::System => EceError::NotImplemented("system-managed encryption mode".to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    mode: Option<String>,
}

async fn download(
    State(state): State<Arc<AppState>>,
    AxPath(path): AxPath<String>,
    Query(q): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Response {
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let password = headers.get("X-Decrypt-Password").and_then(|v| v.to_str().ok());
    let auth = AuthContext::anonymous();

    let outcome = delivery::get_stream(
        &state.storage,
        &path,
        range,
        password,
        q.mode.as_deref(),
        &state.vault,
        state.honeyfiles.as_ref(),
        &auth,
        &state.pools,
        state.config.offload_enabled,
        &state.config.offload_prefix,
    )
    .await;

    match outcome {
        Ok(DeliveryOutcome::Offload { internal_path, content_type }) => {
            let mut response = StatusCode::OK.into_response();
            let headers = response.headers_mut();
            if let Ok(value) = content_type.parse() {
                headers.insert(header::CONTENT_TYPE, value);
            }
            if let Ok(value) = HeaderValue::from_str(&internal_path) {
                headers.insert("X-Accel-Redirect", value);
            }
            response
        }
        Ok(DeliveryOutcome::Inline(content)) => {
            let status = StatusCode::from_u16(content.status).unwrap_or(StatusCode::OK);
            let mut response = (status, content.body).into_response();
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, content.content_type.parse().unwrap());
            headers.insert(header::CONTENT_LENGTH, content.content_length.into());
            if content.accept_ranges {
                headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            }
            if let Some(range) = content.content_range {
                headers.insert(header::CONTENT_RANGE, range.parse().unwrap());
            }
            response
        }
        Err(e) => e.into_response(),
    }
}

async fn soft_delete(State(state): State<Arc<AppState>>, AxPath(path): AxPath<String>) -> Response {
    match state.storage.delete(&path).await {
        Ok(id) => Json(serde_json::json!({ "trash_id": id })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_trash(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.list_trash().await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct TrashIdBody {
    id: String,
}

async fn restore_trash(State(state): State<Arc<AppState>>, Json(body): Json<TrashIdBody>) -> Response {
    match state.storage.restore_from_trash(&body.id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_trash(State(state): State<Arc<AppState>>, AxPath(id): AxPath<String>) -> Response {
    match state.storage.delete_from_trash(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}
