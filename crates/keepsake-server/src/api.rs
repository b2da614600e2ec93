use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use keepsake_shared::constants::{
    FEATURED_LIKES_THRESHOLD, FEATURED_LIMIT, IV_SIZE, SALT_SIZE, TAG_SIZE, WALL_PAGE_LIMIT,
};
use keepsake_shared::entitlement::EntitlementToken;
use keepsake_shared::{crypto, wall};
use keepsake_shared::{
    AccessPolicy, BlobHandle, Capsule, CapsuleId, FileId, GeoFence, KeyMaterial, LockReason,
    NewCapsule, ReaderContext, UserId,
};
use keepsake_store::{
    Database, OwnerStats, ProfileUpdate, StoreCounts, StoredFile, UserProfile, WallListing,
    WallSort,
};

use crate::auth::{verify_admin_token, AuthUser};
use crate::blob_store::BlobStore;
use crate::capsules::{CapsuleService, OpenOutcome, OpenedCapsule, RevealedFile, SweepReport};
use crate::config::ServerConfig;
use crate::entitlement::EntitlementVerifier;
use crate::error::ServerError;

const AUTHOR_FALLBACK: &str = "Anonymous";

#[derive(Clone)]
pub struct AppState {
    pub capsules: CapsuleService,
    pub blob_store: Arc<BlobStore>,
    pub entitlements: Arc<EntitlementVerifier>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, db: Database, blob_store: BlobStore) -> Self {
        let blob_store = Arc::new(blob_store);
        Self {
            capsules: CapsuleService::new(Arc::new(Mutex::new(db)), blob_store.clone()),
            blob_store,
            entitlements: Arc::new(EntitlementVerifier::new(config.payment_server_pubkey)),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Database) -> Result<T, ServerError> + Send + 'static,
        T: Send + 'static,
    {
        self.capsules.with_db(f).await
    }
}

/// Largest blob the store accepts for a given plaintext ceiling: hex
/// doubles the sealed payload.
pub fn max_blob_size(max_upload_size: usize) -> usize {
    2 * (max_upload_size + SALT_SIZE + IV_SIZE + TAG_SIZE)
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    // Multipart framing needs a little room above the file itself.
    let body_limit = state.config.max_upload_size + 64 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/users/sync", post(sync_user))
        .route("/users/me", get(current_user))
        .route("/entitlement/verify", post(entitlement_verify))
        .route("/capsules", post(create_capsule).get(list_capsules))
        .route("/capsules/stats", get(capsule_stats))
        .route("/capsules/:id", get(view_capsule))
        .route("/capsules/:id/open", post(open_capsule))
        .route("/capsules/:id/files", get(capsule_files))
        .route("/files/upload", post(upload_file))
        .route("/files/:id", get(get_file).patch(attach_file))
        .route("/blobs/:handle", get(download_blob))
        .route("/wall", get(list_wall))
        .route("/wall/featured", get(featured_wall))
        .route("/wall/:capsule_id", get(wall_entry))
        .route("/wall/:capsule_id/like", post(like_wall_entry))
        .route("/admin/status", get(admin_status))
        .route("/admin/sweep", post(admin_sweep))
        .route("/admin/grant-entitlement", post(admin_grant_entitlement))
        .route("/admin/revoke-entitlement", post(admin_revoke_entitlement))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request / response bodies ───

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct SyncUserResponse {
    exists: bool,
    user: UserProfile,
}

#[derive(Serialize)]
struct EntitlementVerifyResponse {
    valid: bool,
}

#[derive(Deserialize)]
struct CreateCapsuleRequest {
    title: String,
    content: Option<String>,
    file_id: Option<FileId>,
    unlock_date: DateTime<Utc>,
    location: Option<GeoFence>,
    #[serde(default)]
    is_one_time_access: bool,
    max_access: Option<u32>,
    #[serde(default)]
    is_public: bool,
}

impl CreateCapsuleRequest {
    fn into_new_capsule(self) -> NewCapsule {
        NewCapsule {
            title: self.title,
            content: self.content,
            file_id: self.file_id,
            unlock_date: self.unlock_date,
            location: self.location,
            policy: AccessPolicy {
                is_one_time_access: self.is_one_time_access,
                max_access: self.max_access,
            },
            is_public: self.is_public,
        }
    }
}

/// Owner's view of a capsule: no content, no key material.
#[derive(Serialize)]
struct CapsuleSummary {
    id: CapsuleId,
    title: String,
    unlock_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<GeoFence>,
    is_one_time_access: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_access: Option<u32>,
    is_public: bool,
    is_unlocked: bool,
    is_accessed: bool,
    is_exhausted: bool,
    access_count: u32,
    unlocked_at: Option<DateTime<Utc>>,
    last_accessed_at: Option<DateTime<Utc>>,
    has_file: bool,
    created_at: DateTime<Utc>,
}

impl From<&Capsule> for CapsuleSummary {
    fn from(c: &Capsule) -> Self {
        Self {
            id: c.id,
            title: c.title.clone(),
            unlock_date: c.unlock_date,
            location: c.location.clone(),
            is_one_time_access: c.policy.is_one_time_access,
            max_access: c.policy.max_access,
            is_public: c.is_public,
            is_unlocked: c.state.is_unlocked,
            is_accessed: c.state.is_accessed,
            is_exhausted: c.is_exhausted(),
            access_count: c.state.access_count,
            unlocked_at: c.state.unlocked_at,
            last_accessed_at: c.state.last_accessed_at,
            has_file: c.file_id.is_some(),
            created_at: c.created_at,
        }
    }
}

#[derive(Deserialize)]
struct ReaderQuery {
    lat: Option<f64>,
    lon: Option<f64>,
}

#[derive(Default, Deserialize)]
struct OpenRequest {
    lat: Option<f64>,
    lon: Option<f64>,
}

#[derive(Serialize)]
struct LockedResponse {
    locked: bool,
    capsule_id: CapsuleId,
    reason: &'static str,
    reason_code: LockReason,
}

impl LockedResponse {
    fn new(capsule_id: CapsuleId, reason: LockReason) -> Self {
        Self {
            locked: true,
            capsule_id,
            reason: reason.message(),
            reason_code: reason,
        }
    }
}

#[derive(Serialize)]
struct VerdictResponse {
    locked: bool,
    capsule_id: CapsuleId,
    title: String,
    unlock_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason_code: Option<LockReason>,
}

#[derive(Serialize)]
struct OpenedFile {
    id: FileId,
    file_name: String,
    mime_type: String,
    file_size: u64,
    data_base64: String,
}

impl From<RevealedFile> for OpenedFile {
    fn from(revealed: RevealedFile) -> Self {
        let RevealedFile { file, plaintext } = revealed;
        Self {
            id: file.id,
            file_name: file.file_name,
            mime_type: file.mime_type,
            file_size: file.file_size,
            data_base64: base64::engine::general_purpose::STANDARD.encode(plaintext),
        }
    }
}

#[derive(Serialize)]
struct OpenedResponse {
    locked: bool,
    capsule_id: CapsuleId,
    title: String,
    content: Option<String>,
    access_count: u32,
    unlocked_at: Option<DateTime<Utc>>,
    file: Option<OpenedFile>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OpenResponse {
    Locked(LockedResponse),
    Opened(OpenedResponse),
}

/// File metadata as clients see it: never the key material.
#[derive(Serialize)]
struct FileResponse {
    id: FileId,
    file_name: String,
    mime_type: String,
    file_size: u64,
    capsule_id: Option<CapsuleId>,
    url: String,
    created_at: DateTime<Utc>,
}

impl FileResponse {
    fn new(file: &StoredFile, blobs: &BlobStore) -> Self {
        Self {
            id: file.id,
            file_name: file.file_name.clone(),
            mime_type: file.mime_type.clone(),
            file_size: file.file_size,
            capsule_id: file.capsule_id,
            url: blobs.url_for(&file.storage_handle),
            created_at: file.created_at,
        }
    }
}

#[derive(Deserialize)]
struct AttachFileRequest {
    capsule_id: CapsuleId,
}

#[derive(Deserialize)]
struct WallQuery {
    #[serde(default)]
    sort: WallSort,
    search: Option<String>,
    category: Option<String>,
}

#[derive(Serialize)]
struct WallItem {
    id: uuid::Uuid,
    capsule_id: CapsuleId,
    title: String,
    content: String,
    excerpt: String,
    category: &'static str,
    tags: Vec<String>,
    likes: i64,
    featured: bool,
    views: u32,
    author: String,
    unlocked_at: DateTime<Utc>,
}

impl From<WallListing> for WallItem {
    fn from(listing: WallListing) -> Self {
        let WallListing {
            entry,
            title,
            author_name,
            access_count,
        } = listing;
        Self {
            id: entry.id,
            capsule_id: entry.capsule_id,
            category: wall::determine_category(&entry.content, &title),
            tags: wall::extract_tags(&entry.content, &title),
            excerpt: wall::excerpt(&entry.content),
            featured: entry.likes > FEATURED_LIKES_THRESHOLD,
            likes: entry.likes,
            views: access_count,
            author: author_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| AUTHOR_FALLBACK.to_string()),
            unlocked_at: entry.unlocked_at,
            content: entry.content,
            title,
        }
    }
}

#[derive(Serialize)]
struct LikeResponse {
    likes: i64,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    version: &'static str,
    uptime_secs: u64,
    entitlement_required: bool,
    free_tier_capsule_limit: u32,
    sweep_interval_secs: u64,
    entitled_users: usize,
    counts: StoreCounts,
}

#[derive(Deserialize)]
struct AdminEntitlementRequest {
    user_id: UserId,
}

// ─── Health ───

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ─── Users & entitlement ───

async fn sync_user(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(profile): Json<ProfileUpdate>,
) -> Result<Json<SyncUserResponse>, ServerError> {
    let (exists, user) = state
        .with_db(move |db| {
            let exists = db.sync_user(&user, &profile, Utc::now())?;
            Ok((exists, db.get_user(&user)?))
        })
        .await?;
    Ok(Json(SyncUserResponse { exists, user }))
}

async fn current_user(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<UserProfile>, ServerError> {
    let profile = state.with_db(move |db| Ok(db.get_user(&user)?)).await?;
    Ok(Json(profile))
}

async fn entitlement_verify(
    State(state): State<AppState>,
    Json(token): Json<EntitlementToken>,
) -> Json<EntitlementVerifyResponse> {
    if !state.config.entitlement_required {
        return Json(EntitlementVerifyResponse { valid: true });
    }
    let valid = state.entitlements.verify(&token).await;
    Json(EntitlementVerifyResponse { valid })
}

// ─── Capsules ───

async fn create_capsule(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateCapsuleRequest>,
) -> Result<(StatusCode, Json<CapsuleSummary>), ServerError> {
    if state.config.entitlement_required && !state.entitlements.is_entitled(&user).await {
        let owner = user.clone();
        let owned = state
            .with_db(move |db| Ok(db.count_capsules_for_owner(&owner)?))
            .await?;
        if owned >= u64::from(state.config.free_tier_capsule_limit) {
            return Err(ServerError::Forbidden("free tier limit reached".into()));
        }
    }

    let key = match req.file_id {
        Some(file_id) => {
            let owner = user.clone();
            state
                .with_db(move |db| {
                    let file = db.get_file(file_id)?;
                    if file.uploaded_by != owner {
                        return Err(ServerError::NotFound(format!("File {file_id}")));
                    }
                    Ok(file.encryption_key)
                })
                .await?
        }
        None => KeyMaterial::new(state.config.master_key.clone()),
    };

    let capsule = state
        .capsules
        .create(user, req.into_new_capsule(), key, Utc::now())
        .await?;

    Ok((StatusCode::CREATED, Json(CapsuleSummary::from(&capsule))))
}

async fn list_capsules(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<CapsuleSummary>>, ServerError> {
    let capsules = state
        .with_db(move |db| Ok(db.list_capsules_for_owner(&user)?))
        .await?;
    Ok(Json(capsules.iter().map(CapsuleSummary::from).collect()))
}

async fn capsule_stats(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<OwnerStats>, ServerError> {
    let stats = state.with_db(move |db| Ok(db.owner_stats(&user)?)).await?;
    Ok(Json(stats))
}

async fn view_capsule(
    State(state): State<AppState>,
    Path(id): Path<CapsuleId>,
    Query(query): Query<ReaderQuery>,
) -> Result<Json<VerdictResponse>, ServerError> {
    let reader = ReaderContext::from_parts(Utc::now(), query.lat, query.lon);
    let (capsule, verdict) = state.capsules.evaluate(id, &reader).await?;

    let reason = verdict.reason();
    Ok(Json(VerdictResponse {
        locked: !verdict.is_unlocked(),
        capsule_id: capsule.id,
        title: capsule.title,
        unlock_date: capsule.unlock_date,
        reason: reason.map(|r| r.message()),
        reason_code: reason,
    }))
}

async fn open_capsule(
    State(state): State<AppState>,
    AuthUser(_user): AuthUser,
    Path(id): Path<CapsuleId>,
    body: Option<Json<OpenRequest>>,
) -> Result<Json<OpenResponse>, ServerError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let reader = ReaderContext::from_parts(Utc::now(), req.lat, req.lon);

    let OpenedCapsule { capsule, file } =
        match state.capsules.evaluate_and_open(id, &reader).await? {
            OpenOutcome::Locked(reason) => {
                return Ok(Json(OpenResponse::Locked(LockedResponse::new(id, reason))));
            }
            OpenOutcome::Opened(opened) => opened,
        };

    Ok(Json(OpenResponse::Opened(OpenedResponse {
        locked: false,
        capsule_id: capsule.id,
        title: capsule.title,
        content: capsule.content,
        access_count: capsule.state.access_count,
        unlocked_at: capsule.state.unlocked_at,
        file: file.map(OpenedFile::from),
    })))
}

async fn capsule_files(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<CapsuleId>,
) -> Result<Json<Vec<FileResponse>>, ServerError> {
    let files = state
        .with_db(move |db| {
            let capsule = db.get_capsule(id)?;
            if capsule.owner_id != user {
                return Err(ServerError::NotFound(format!("Capsule {id}")));
            }
            Ok(db.list_files_for_capsule(id)?)
        })
        .await?;
    Ok(Json(
        files
            .iter()
            .map(|f| FileResponse::new(f, &state.blob_store))
            .collect(),
    ))
}

// ─── Files & blobs ───

async fn upload_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<FileResponse>), ServerError> {
    let mut upload: Option<(String, String, Vec<u8>)> = None;
    let mut capsule_id: Option<CapsuleId> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;
                upload = Some((file_name, mime_type, data.to_vec()));
            }
            "capsule_id" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;
                let id = uuid::Uuid::parse_str(text.trim())
                    .map_err(|_| ServerError::BadRequest("Invalid capsule_id".into()))?;
                capsule_id = Some(CapsuleId(id));
            }
            _ => {}
        }
    }

    let Some((file_name, mime_type, data)) = upload else {
        return Err(ServerError::BadRequest(
            "Missing 'file' field in multipart form".to_string(),
        ));
    };
    if data.is_empty() {
        return Err(ServerError::BadRequest("Empty file".into()));
    }
    if data.len() > state.config.max_upload_size {
        return Err(ServerError::PayloadTooLarge {
            size: data.len(),
            max: state.config.max_upload_size,
        });
    }

    let size = data.len();
    let master_key = state.config.master_key.clone();
    let sealed = tokio::task::spawn_blocking(move || crypto::encrypt(&data, &master_key)).await??;

    let handle: BlobHandle = state
        .blob_store
        .put_encrypted_bytes(sealed.blob.as_bytes())
        .await?;

    let file = StoredFile {
        id: FileId::new(),
        storage_handle: handle.clone(),
        file_name,
        mime_type,
        file_size: size as u64,
        encryption_key: sealed.key_material,
        uploaded_by: user,
        capsule_id,
        created_at: Utc::now(),
    };

    // Metadata only after the blob is durable; undo the blob if it fails.
    let record = file.clone();
    let inserted = state
        .with_db(move |db| Ok(db.insert_file(&record)?))
        .await;
    if let Err(e) = inserted {
        if let Err(cleanup) = state.blob_store.delete(&handle).await {
            warn!(handle = %handle, error = %cleanup, "Failed to remove orphaned blob");
        }
        return Err(e);
    }

    info!(file = %file.id, size, "File uploaded");
    Ok((
        StatusCode::CREATED,
        Json(FileResponse::new(&file, &state.blob_store)),
    ))
}

async fn get_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<FileId>,
) -> Result<Json<FileResponse>, ServerError> {
    let file = state.with_db(move |db| Ok(db.get_file(id)?)).await?;
    if file.uploaded_by != user {
        return Err(ServerError::NotFound(format!("File {id}")));
    }
    Ok(Json(FileResponse::new(&file, &state.blob_store)))
}

async fn attach_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<FileId>,
    Json(req): Json<AttachFileRequest>,
) -> Result<Json<FileResponse>, ServerError> {
    let capsule_id = req.capsule_id;
    let file = state
        .with_db(move |db| {
            db.attach_file(id, capsule_id, &user)?;
            Ok(db.get_file(id)?)
        })
        .await?;
    info!(file = %id, capsule = %req.capsule_id, "File attached");
    Ok(Json(FileResponse::new(&file, &state.blob_store)))
}

async fn download_blob(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let data = state.blob_store.get(&BlobHandle(handle)).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data))
}

// ─── Public wall ───

async fn list_wall(
    State(state): State<AppState>,
    Query(query): Query<WallQuery>,
) -> Result<Json<Vec<WallItem>>, ServerError> {
    let sort = query.sort;
    let search = query.search.clone();
    let listings = state
        .with_db(move |db| Ok(db.list_wall(sort, search.as_deref(), WALL_PAGE_LIMIT)?))
        .await?;

    let items = listings
        .into_iter()
        .map(WallItem::from)
        .filter(|item| wall::matches_category(query.category.as_deref(), item.category))
        .collect();
    Ok(Json(items))
}

async fn featured_wall(State(state): State<AppState>) -> Result<Json<Vec<WallItem>>, ServerError> {
    let listings = state
        .with_db(|db| Ok(db.featured_wall(FEATURED_LIKES_THRESHOLD, FEATURED_LIMIT)?))
        .await?;
    Ok(Json(listings.into_iter().map(WallItem::from).collect()))
}

async fn wall_entry(
    State(state): State<AppState>,
    Path(capsule_id): Path<CapsuleId>,
) -> Result<Json<WallItem>, ServerError> {
    let now = Utc::now();
    let listing = state
        .with_db(move |db| Ok(db.get_wall_listing(capsule_id, now)?))
        .await?;
    Ok(Json(WallItem::from(listing)))
}

async fn like_wall_entry(
    State(state): State<AppState>,
    AuthUser(_user): AuthUser,
    Path(capsule_id): Path<CapsuleId>,
) -> Result<Json<LikeResponse>, ServerError> {
    let likes = state
        .with_db(move |db| Ok(db.like_wall_entry(capsule_id)?))
        .await?;
    Ok(Json(LikeResponse { likes }))
}

// ─── Admin ───

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let counts = state.with_db(|db| Ok(db.store_counts()?)).await?;
    Ok(Json(AdminStatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        entitlement_required: state.config.entitlement_required,
        free_tier_capsule_limit: state.config.free_tier_capsule_limit,
        sweep_interval_secs: state.config.sweep_interval_secs,
        entitled_users: state.entitlements.cached_count().await,
        counts,
    }))
}

async fn admin_sweep(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<SweepReport>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(state.capsules.run_unlock_sweep(Utc::now()).await?))
}

async fn admin_grant_entitlement(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AdminEntitlementRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    state.entitlements.admin_grant(&req.user_id).await;

    info!(user = %req.user_id, "Admin granted entitlement");
    Ok(Json(serde_json::json!({ "granted": true })))
}

async fn admin_revoke_entitlement(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AdminEntitlementRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let revoked = state.entitlements.admin_revoke(&req.user_id).await;

    info!(user = %req.user_id, revoked, "Admin revoked entitlement");
    Ok(Json(serde_json::json!({ "revoked": revoked })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::auth::USER_ID_HEADER;

    const ADMIN_TOKEN: &str = "test-admin-token";

    async fn test_app(configure: impl FnOnce(&mut ServerConfig)) -> (Router, AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = ServerConfig {
            database_path: dir.path().join("keepsake.db"),
            blob_storage_path: dir.path().join("blobs"),
            master_key: "test-master-key".into(),
            admin_token: Some(ADMIN_TOKEN.into()),
            ..ServerConfig::default()
        };
        configure(&mut config);

        let db = Database::open_at(&config.database_path).unwrap();
        let blobs = BlobStore::new(
            config.blob_storage_path.clone(),
            max_blob_size(config.max_upload_size),
            config.public_base_url.clone(),
        )
        .await
        .unwrap();

        let state = AppState::new(config, db, blobs);
        (build_router(state.clone()), state, dir)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            req = req.header(USER_ID_HEADER, user);
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => req.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn create(app: &Router, user: &str, body: Value) -> Value {
        let (status, value) = send(app, "POST", "/capsules", Some(user), Some(body)).await;
        assert_eq!(status, StatusCode::CREATED, "{value}");
        value
    }

    fn past() -> String {
        (Utc::now() - Duration::days(1)).to_rfc3339()
    }

    fn future() -> String {
        (Utc::now() + Duration::days(1)).to_rfc3339()
    }

    async fn upload(app: &Router, user: &str, bytes: &[u8]) -> (StatusCode, Value) {
        let boundary = "keepsake-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"note.txt\"\r\nContent-Type: text/plain\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let req = Request::builder()
            .method("POST")
            .uri("/files/upload")
            .header(USER_ID_HEADER, user)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();

        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _state, _dir) = test_app(|_| {}).await;
        let (status, body) = send(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_create_requires_identity_and_valid_input() {
        let (app, _state, _dir) = test_app(|_| {}).await;
        let body = json!({ "title": "x", "unlock_date": future() });

        let (status, _) = send(&app, "POST", "/capsules", None, Some(body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let bad = json!({
            "title": "x",
            "unlock_date": future(),
            "location": { "latitude": 91.0, "longitude": 0.0, "radius_meters": 10.0 }
        });
        let (status, _) = send(&app, "POST", "/capsules", Some("alice"), Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_time_locked_capsule() {
        let (app, _state, _dir) = test_app(|_| {}).await;
        let created = create(
            &app,
            "alice",
            json!({ "title": "Later", "content": "secret", "unlock_date": future() }),
        )
        .await;
        assert!(created.get("content").is_none());
        assert!(created.get("encryption_key").is_none());
        let id = created["id"].as_str().unwrap();

        let (status, verdict) = send(&app, "GET", &format!("/capsules/{id}"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(verdict["locked"], true);
        assert_eq!(verdict["reason"], "Unlock date not reached yet");

        let (_, opened) = send(
            &app,
            "POST",
            &format!("/capsules/{id}/open"),
            Some("bob"),
            Some(json!({})),
        )
        .await;
        assert_eq!(opened["locked"], true);
        assert!(opened.get("content").is_none());
    }

    #[tokio::test]
    async fn test_geofenced_one_time_capsule() {
        let (app, _state, _dir) = test_app(|_| {}).await;
        let created = create(
            &app,
            "alice",
            json!({
                "title": "Meet me here",
                "content": "you made it",
                "unlock_date": past(),
                "is_one_time_access": true,
                "location": { "latitude": 40.0, "longitude": -74.0, "radius_meters": 100.0 }
            }),
        )
        .await;
        let id = created["id"].as_str().unwrap();

        let (_, verdict) = send(&app, "GET", &format!("/capsules/{id}"), None, None).await;
        assert_eq!(verdict["reason"], "Location required but not provided");

        let (_, verdict) = send(
            &app,
            "GET",
            &format!("/capsules/{id}?lat=41.0&lon=-74.0"),
            None,
            None,
        )
        .await;
        assert_eq!(verdict["reason"], "Location not within allowed radius");

        let here = json!({ "lat": 40.0, "lon": -74.0 });
        let (status, opened) = send(
            &app,
            "POST",
            &format!("/capsules/{id}/open"),
            Some("bob"),
            Some(here.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(opened["locked"], false);
        assert_eq!(opened["content"], "you made it");
        assert_eq!(opened["access_count"], 1);

        let (_, again) = send(
            &app,
            "POST",
            &format!("/capsules/{id}/open"),
            Some("bob"),
            Some(here),
        )
        .await;
        assert_eq!(again["locked"], true);
        assert_eq!(again["reason"], "Already accessed (one-time only)");
    }

    #[tokio::test]
    async fn test_free_tier_limit() {
        let (app, state, _dir) = test_app(|_| {}).await;
        let body = json!({ "title": "t", "unlock_date": future() });

        create(&app, "alice", body.clone()).await;
        create(&app, "alice", body.clone()).await;
        let (status, err) = send(&app, "POST", "/capsules", Some("alice"), Some(body.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(err["error"].as_str().unwrap().contains("free tier limit reached"));

        state.entitlements.admin_grant(&UserId::new("alice")).await;
        create(&app, "alice", body).await;
    }

    #[tokio::test]
    async fn test_free_tier_disabled() {
        let (app, _state, _dir) = test_app(|c| c.entitlement_required = false).await;
        let body = json!({ "title": "t", "unlock_date": future() });
        for _ in 0..4 {
            create(&app, "alice", body.clone()).await;
        }
        let (_, listed) = send(&app, "GET", "/capsules", Some("alice"), None).await;
        assert_eq!(listed.as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let (app, state, _dir) = test_app(|_| {}).await;

        let (status, file) = upload(&app, "alice", b"hello capsule").await;
        assert_eq!(status, StatusCode::CREATED, "{file}");
        assert!(file.get("encryption_key").is_none());
        let file_id = file["id"].as_str().unwrap();

        // The stored blob is ciphertext, not the upload.
        let handle = file["url"].as_str().unwrap().rsplit('/').next().unwrap();
        let raw = state
            .blob_store
            .get(&BlobHandle(handle.to_string()))
            .await
            .unwrap();
        assert!(!raw.windows(13).any(|w| w == b"hello capsule"));

        let created = create(
            &app,
            "alice",
            json!({ "title": "With file", "unlock_date": past(), "file_id": file_id }),
        )
        .await;
        assert_eq!(created["has_file"], true);
        let id = created["id"].as_str().unwrap();

        let (_, files) = send(&app, "GET", &format!("/capsules/{id}/files"), Some("alice"), None).await;
        assert_eq!(files.as_array().unwrap().len(), 1);
        let (status, _) = send(&app, "GET", &format!("/capsules/{id}/files"), Some("bob"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, opened) = send(
            &app,
            "POST",
            &format!("/capsules/{id}/open"),
            Some("alice"),
            Some(json!({})),
        )
        .await;
        assert_eq!(opened["locked"], false);
        let data = base64::engine::general_purpose::STANDARD
            .decode(opened["file"]["data_base64"].as_str().unwrap())
            .unwrap();
        assert_eq!(data, b"hello capsule");
        assert_eq!(opened["file"]["file_name"], "note.txt");
    }

    /// Upload a file as alice and seal it into a one-time capsule that is
    /// already due.
    async fn one_time_capsule_with_file(app: &Router) -> (String, BlobHandle) {
        let (status, file) = upload(app, "alice", b"hello capsule").await;
        assert_eq!(status, StatusCode::CREATED, "{file}");
        let handle = file["url"].as_str().unwrap().rsplit('/').next().unwrap();

        let created = create(
            app,
            "alice",
            json!({
                "title": "Once only",
                "unlock_date": past(),
                "is_one_time_access": true,
                "file_id": file["id"]
            }),
        )
        .await;
        (
            created["id"].as_str().unwrap().to_string(),
            BlobHandle(handle.to_string()),
        )
    }

    async fn access_count(app: &Router, id: &str) -> Value {
        let (_, listed) = send(app, "GET", "/capsules", Some("alice"), None).await;
        listed
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["id"] == id)
            .unwrap()["access_count"]
            .clone()
    }

    #[tokio::test]
    async fn test_open_requires_identity() {
        let (app, _state, _dir) = test_app(|_| {}).await;
        let created = create(
            &app,
            "alice",
            json!({
                "title": "Once",
                "content": "hi",
                "unlock_date": past(),
                "is_one_time_access": true
            }),
        )
        .await;
        let id = created["id"].as_str().unwrap();
        let uri = format!("/capsules/{id}/open");

        let (status, body) = send(&app, "POST", &uri, None, Some(json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.get("content").is_none());
        assert_eq!(access_count(&app, id).await, 0);

        let (status, opened) = send(&app, "POST", &uri, Some("bob"), Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(opened["content"], "hi");
        assert_eq!(access_count(&app, id).await, 1);

        let (_, listed) = send(&app, "GET", "/capsules", Some("alice"), None).await;
        assert_eq!(listed[0]["is_exhausted"], true);
    }

    #[tokio::test]
    async fn test_open_with_missing_blob_keeps_capsule_sealed() {
        let (app, state, _dir) = test_app(|_| {}).await;
        let (id, handle) = one_time_capsule_with_file(&app).await;
        state.blob_store.delete(&handle).await.unwrap();

        let uri = format!("/capsules/{id}/open");
        let (status, body) = send(&app, "POST", &uri, Some("bob"), Some(json!({}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.to_string().contains(&handle.0));
        assert_eq!(access_count(&app, &id).await, 0);

        let (_, verdict) = send(&app, "GET", &format!("/capsules/{id}"), None, None).await;
        assert_eq!(verdict["locked"], false);
    }

    #[tokio::test]
    async fn test_open_with_tampered_blob_is_refused() {
        let (app, _state, dir) = test_app(|_| {}).await;
        let (id, handle) = one_time_capsule_with_file(&app).await;

        // Flip one hex digit inside the ciphertext, past salt and IV.
        let path = dir.path().join("blobs").join(&handle.0);
        let mut blob = std::fs::read(&path).unwrap();
        let at = 2 * (32 + 12) + 2;
        blob[at] = if blob[at] == b'0' { b'1' } else { b'0' };
        std::fs::write(&path, blob).unwrap();

        let uri = format!("/capsules/{id}/open");
        let (status, body) = send(&app, "POST", &uri, Some("bob"), Some(json!({}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "error": "Internal server error" }));
        assert_eq!(access_count(&app, &id).await, 0);

        // The single allowed open was not spent.
        let (_, verdict) = send(&app, "GET", &format!("/capsules/{id}"), None, None).await;
        assert_eq!(verdict["locked"], false);
    }

    #[tokio::test]
    async fn test_upload_limits_and_attach() {
        let (app, _state, _dir) = test_app(|c| c.max_upload_size = 16).await;

        let (status, _) = upload(&app, "alice", &[7u8; 17]).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        let (status, file) = upload(&app, "alice", b"small").await;
        assert_eq!(status, StatusCode::CREATED);
        let file_id = file["id"].as_str().unwrap();

        let capsule = create(&app, "alice", json!({ "title": "t", "unlock_date": future() })).await;
        let capsule_id = capsule["id"].as_str().unwrap();

        let (status, _) = send(
            &app,
            "PATCH",
            &format!("/files/{file_id}"),
            Some("bob"),
            Some(json!({ "capsule_id": capsule_id })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, attached) = send(
            &app,
            "PATCH",
            &format!("/files/{file_id}"),
            Some("alice"),
            Some(json!({ "capsule_id": capsule_id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(attached["capsule_id"], capsule_id);

        let (status, _) = send(&app, "GET", &format!("/files/{file_id}"), Some("bob"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_public_wall_flow() {
        let (app, _state, _dir) = test_app(|_| {}).await;
        let (status, _) = send(
            &app,
            "POST",
            "/users/sync",
            Some("alice"),
            Some(json!({ "display_name": "Alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let created = create(
            &app,
            "alice",
            json!({
                "title": "Our wedding",
                "content": "love and family forever",
                "unlock_date": past(),
                "is_public": true
            }),
        )
        .await;
        let id = created["id"].as_str().unwrap();

        let (status, _) = send(&app, "GET", &format!("/wall/{id}"), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Viewing an unlocked public capsule publishes it, once.
        for _ in 0..3 {
            send(&app, "GET", &format!("/capsules/{id}"), None, None).await;
        }

        let (_, wall) = send(&app, "GET", "/wall", None, None).await;
        let items = wall.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["category"], "Love & Relationships");
        assert_eq!(items[0]["author"], "Alice");
        assert_eq!(items[0]["featured"], false);
        assert_eq!(items[0]["tags"], json!(["love", "family", "wedding"]));

        let (_, filtered) = send(&app, "GET", "/wall?category=Historical", None, None).await;
        assert!(filtered.as_array().unwrap().is_empty());
        let (_, all) = send(&app, "GET", "/wall?category=All%20Categories&sort=popular", None, None).await;
        assert_eq!(all.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, "POST", &format!("/wall/{id}/like"), None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (_, liked) = send(&app, "POST", &format!("/wall/{id}/like"), Some("bob"), None).await;
        assert_eq!(liked["likes"], 1);

        let (status, entry) = send(&app, "GET", &format!("/wall/{id}"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entry["views"], 0);
        let (_, stats) = send(&app, "GET", "/capsules/stats", Some("alice"), None).await;
        assert_eq!(stats["total_views"], 0);
        assert_eq!(stats["total_likes"], 1);

        let (_, featured) = send(&app, "GET", "/wall/featured", None, None).await;
        assert!(featured.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_endpoints() {
        let (app, _state, _dir) = test_app(|_| {}).await;
        create(
            &app,
            "alice",
            json!({ "title": "due", "unlock_date": past(), "is_public": true }),
        )
        .await;

        let (status, _) = send(&app, "POST", "/admin/sweep", None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let admin = |method: &str, uri: &str| {
            Request::builder()
                .method(method)
                .uri(uri)
                .header("authorization", format!("Bearer {ADMIN_TOKEN}"))
                .header("content-type", "application/json")
        };

        let response = app
            .clone()
            .oneshot(admin("POST", "/admin/sweep").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let report: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(report, json!({ "unlocked": 1, "published": 1 }));

        let response = app
            .clone()
            .oneshot(admin("GET", "/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let status: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status["counts"]["capsules"], 1);
        assert_eq!(status["counts"]["wall_entries"], 1);

        let response = app
            .clone()
            .oneshot(
                admin("POST", "/admin/grant-entitlement")
                    .body(Body::from(json!({ "user_id": "alice" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_disabled_without_token() {
        let (app, _state, _dir) = test_app(|c| c.admin_token = None).await;
        let req = Request::builder()
            .method("GET")
            .uri("/admin/status")
            .header("authorization", "Bearer anything")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_entitlement_verify_endpoint() {
        use ed25519_dalek::SigningKey;
        use keepsake_shared::entitlement::create_entitlement_token;
        use rand::rngs::OsRng;

        let gateway = SigningKey::generate(&mut OsRng);
        let pubkey = gateway.verifying_key().to_bytes();
        let (app, _state, _dir) = test_app(|c| c.payment_server_pubkey = pubkey).await;

        let token = create_entitlement_token(
            &UserId::new("alice"),
            Utc::now() + Duration::days(30),
            &gateway,
        );
        let (_, verified) = send(
            &app,
            "POST",
            "/entitlement/verify",
            None,
            Some(serde_json::to_value(&token).unwrap()),
        )
        .await;
        assert_eq!(verified["valid"], true);

        let body = json!({ "title": "t", "unlock_date": future() });
        for _ in 0..3 {
            create(&app, "alice", body.clone()).await;
        }
    }

    #[tokio::test]
    async fn test_users_me() {
        let (app, _state, _dir) = test_app(|_| {}).await;
        let (status, _) = send(&app, "GET", "/users/me", Some("carol"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, synced) = send(
            &app,
            "POST",
            "/users/sync",
            Some("carol"),
            Some(json!({ "email": "carol@example.com" })),
        )
        .await;
        assert_eq!(synced["exists"], false);

        let (status, me) = send(&app, "GET", "/users/me", Some("carol"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["email"], "carol@example.com");
    }
}
