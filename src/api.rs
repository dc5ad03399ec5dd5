//! HTTP JSON API served by the `backend` binary.
//!
//! Catalog and storage calls block, so every handler hops onto the blocking
//! pool via `spawn_blocking`. Errors always leave as
//! `{"error": <code>, "message": <text>}`; upstream failures are logged here
//! and reported to the client with a generic message.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use log::{error, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::task;

use crate::{
    admin::{self, AdminError},
    catalog::{Catalog, Drama, Episode, EpisodeInsert, NewDrama, NewEpisode},
    config::SyncConfig,
    session::{self, SessionResolver, SessionUser},
    storage::ObjectStorage,
    sync::{SyncError, SyncReport, Synchronizer},
};

#[derive(Clone)]
pub struct AppState {
    catalog: Arc<Catalog>,
    sessions: Arc<dyn SessionResolver>,
    storage: Arc<dyn ObjectStorage>,
    sync: Arc<SyncConfig>,
    cache: Arc<ApiCache>,
}

impl AppState {
    pub fn new(
        catalog: Catalog,
        sessions: Arc<dyn SessionResolver>,
        storage: Arc<dyn ObjectStorage>,
        sync: SyncConfig,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            catalog: Arc::new(catalog),
            sessions,
            storage,
            sync: Arc::new(sync),
            cache: Arc::new(ApiCache::new(cache_ttl)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/admin/check-admin",
            get(check_admin).post(request_admin),
        )
        .route("/api/admin/sync-firebase", post(sync_firebase))
        .route("/api/dramas", get(list_dramas).post(create_drama))
        .route("/api/episodes", get(list_episodes).post(create_episode))
        .route("/api/episodes/{id}", get(get_episode))
        .route("/api/public/episodes", get(list_public_episodes))
        .route("/api/favorites", get(list_favorites))
        .route("/api/favorites/toggle", post(toggle_favorite))
        .method_not_allowed_fallback(method_not_allowed)
        .fallback(unknown_route)
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Please log in to access this feature",
        )
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    /// Logs the real cause; the client only sees a generic message.
    fn upstream(action: &str, err: impl std::fmt::Display) -> Self {
        error!("{action} failed: {err:#}");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("Failed while {action}"),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.code,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<AdminError> for ApiError {
    fn from(err: AdminError) -> Self {
        match err {
            AdminError::NotAuthenticated => Self::unauthorized(),
            AdminError::CreatedNotAdmin => Self::forbidden(
                "Your account has been created, but admin access is required for this page",
            ),
            AdminError::NotAdmin => Self::forbidden("Admin privileges required"),
            AdminError::AdminsExist => Self::forbidden(
                "Admin users already exist; an existing admin must grant access",
            ),
            AdminError::Store(err) => Self::upstream("checking admin status", err),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Runs blocking work off the async runtime.
async fn join<F, T>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::upstream("running blocking task", err))
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("Invalid JSON body: {err}")))
}

/// The session behind the request, if any.
pub struct MaybeCaller(pub Option<SessionUser>);

/// A request that must carry a valid session; rejects with 401 otherwise.
pub struct Caller(pub SessionUser);

impl FromRequestParts<AppState> for MaybeCaller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(token) = session::access_token(&parts.headers) else {
            return Ok(Self(None));
        };
        let sessions = state.sessions.clone();
        let user = join(move || sessions.resolve(&token))
            .await?
            .map_err(|err| ApiError::upstream("resolving session", err))?;
        Ok(Self(user))
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let MaybeCaller(user) = MaybeCaller::from_request_parts(parts, state).await?;
        user.map(Self).ok_or_else(ApiError::unauthorized)
    }
}

struct SlotState<T> {
    generation: u64,
    cached: Option<(Instant, T)>,
}

/// One cached list. Clearing bumps the generation so a fetch that started
/// before the clear cannot store its now-stale result.
struct CacheSlot<T> {
    state: RwLock<SlotState<T>>,
}

impl<T: Clone> CacheSlot<T> {
    fn new() -> Self {
        Self {
            state: RwLock::new(SlotState {
                generation: 0,
                cached: None,
            }),
        }
    }

    /// Fresh value, or the generation to hand back to `store`.
    fn lookup(&self, ttl: Duration) -> Result<T, u64> {
        let state = self.state.read();
        match &state.cached {
            Some((stored_at, value)) if stored_at.elapsed() < ttl => Ok(value.clone()),
            _ => Err(state.generation),
        }
    }

    fn store(&self, generation: u64, ttl: Duration, value: T) {
        if ttl.is_zero() {
            return;
        }
        let mut state = self.state.write();
        if state.generation == generation {
            state.cached = Some((Instant::now(), value));
        }
    }

    fn clear(&self) {
        let mut state = self.state.write();
        state.generation += 1;
        state.cached = None;
    }
}

pub struct ApiCache {
    ttl: Duration,
    dramas: CacheSlot<Vec<Drama>>,
    episodes: CacheSlot<Vec<Episode>>,
}

impl ApiCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            dramas: CacheSlot::new(),
            episodes: CacheSlot::new(),
        }
    }
}

impl AppState {
    async fn get_dramas(&self) -> ApiResult<Vec<Drama>> {
        let generation = match self.cache.dramas.lookup(self.cache.ttl) {
            Ok(cached) => return Ok(cached),
            Err(generation) => generation,
        };
        let catalog = self.catalog.clone();
        let dramas = join(move || catalog.list_dramas())
            .await?
            .map_err(|err| ApiError::upstream("listing dramas", err))?;
        self.cache
            .dramas
            .store(generation, self.cache.ttl, dramas.clone());
        Ok(dramas)
    }

    async fn get_episodes(&self) -> ApiResult<Vec<Episode>> {
        let generation = match self.cache.episodes.lookup(self.cache.ttl) {
            Ok(cached) => return Ok(cached),
            Err(generation) => generation,
        };
        let catalog = self.catalog.clone();
        let episodes = join(move || catalog.list_episodes())
            .await?
            .map_err(|err| ApiError::upstream("listing episodes", err))?;
        self.cache
            .episodes
            .store(generation, self.cache.ttl, episodes.clone());
        Ok(episodes)
    }
}

async fn method_not_allowed() -> ApiError {
    ApiError::new(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        "Method not allowed",
    )
}

async fn unknown_route() -> ApiError {
    ApiError::not_found("No such endpoint")
}

async fn health() -> &'static str {
    "ok"
}

async fn check_admin(
    State(state): State<AppState>,
    MaybeCaller(caller): MaybeCaller,
) -> ApiResult<Json<Value>> {
    let catalog = state.catalog.clone();
    let user = join(move || admin::check_admin(&catalog, caller.as_ref())).await??;
    info!("admin check passed for {}", user.id);
    Ok(Json(json!({ "isAdmin": true })))
}

async fn request_admin(
    State(state): State<AppState>,
    MaybeCaller(caller): MaybeCaller,
) -> ApiResult<Json<Value>> {
    let catalog = state.catalog.clone();
    let user = join(move || admin::request_admin(&catalog, caller.as_ref())).await??;
    Ok(Json(json!({
        "success": true,
        "message": "Admin privileges granted successfully",
        "isAdmin": user.is_admin,
    })))
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    success: bool,
    message: String,
    results: SyncReport,
}

async fn sync_firebase(
    State(state): State<AppState>,
    MaybeCaller(caller): MaybeCaller,
) -> ApiResult<Json<SyncResponse>> {
    let catalog = state.catalog.clone();
    let admin = join(move || admin::check_admin(&catalog, caller.as_ref())).await??;
    info!("storage sync requested by {}", admin.id);

    let (catalog, storage, sync) = (
        state.catalog.clone(),
        state.storage.clone(),
        state.sync.clone(),
    );
    let report = join(move || Synchronizer::new(&catalog, storage.as_ref(), &sync).run())
        .await?
        .map_err(|err| match err {
            SyncError::NoDrama | SyncError::UnknownDefaultDrama(_) => {
                ApiError::bad_request(err.to_string())
            }
            SyncError::Other(err) => ApiError::upstream("syncing object storage", err),
        })?;

    if !report.added.is_empty() {
        state.cache.episodes.clear();
    }

    Ok(Json(SyncResponse {
        success: true,
        message: report.summary(),
        results: report,
    }))
}

async fn list_dramas(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> ApiResult<Json<Vec<Drama>>> {
    let dramas = state.get_dramas().await?;
    info!("listed {} dramas for {}", dramas.len(), caller.id);
    Ok(Json(dramas))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CreateDramaRequest {
    title: Option<String>,
    description: Option<String>,
    image_url: Option<String>,
}

async fn create_drama(
    State(state): State<AppState>,
    Caller(caller): Caller,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Drama>)> {
    let request: CreateDramaRequest = parse_body(&body)?;
    let title = non_blank(request.title).ok_or_else(|| ApiError::bad_request("Title is required"))?;
    let new_drama = NewDrama {
        title,
        description: request.description.unwrap_or_default(),
        image_url: request.image_url.unwrap_or_default(),
    };

    let catalog = state.catalog.clone();
    let drama = join(move || catalog.create_drama(&new_drama))
        .await?
        .map_err(|err| ApiError::upstream("creating drama", err))?;
    state.cache.dramas.clear();

    info!("{} created drama {}", caller.id, drama.id);
    Ok((StatusCode::CREATED, Json(drama)))
}

async fn list_episodes(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> ApiResult<Json<Vec<Episode>>> {
    let episodes = state.get_episodes().await?;
    info!("listed {} episodes for {}", episodes.len(), caller.id);
    Ok(Json(episodes))
}

async fn list_public_episodes(State(state): State<AppState>) -> ApiResult<Json<Vec<Episode>>> {
    Ok(Json(state.get_episodes().await?))
}

async fn get_episode(
    State(state): State<AppState>,
    Caller(_caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Episode>> {
    let catalog = state.catalog.clone();
    let episode = join(move || catalog.get_episode(&id))
        .await?
        .map_err(|err| ApiError::upstream("fetching episode", err))?
        .ok_or_else(|| ApiError::not_found("Episode not found"))?;
    Ok(Json(episode))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CreateEpisodeRequest {
    title: Option<String>,
    description: Option<String>,
    video_url: Option<String>,
    thumbnail_url: Option<String>,
    duration: Option<Value>,
    is_premium: Option<bool>,
    drama_id: Option<String>,
}

async fn create_episode(
    State(state): State<AppState>,
    Caller(caller): Caller,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Episode>)> {
    let request: CreateEpisodeRequest = parse_body(&body)?;

    let mut missing = Vec::new();
    let mut required = |value: Option<String>, field: &'static str| {
        non_blank(value).unwrap_or_else(|| {
            missing.push(field);
            String::new()
        })
    };
    let title = required(request.title, "title");
    let video_url = required(request.video_url, "videoUrl");
    let thumbnail_url = required(request.thumbnail_url, "thumbnailUrl");
    let drama_id = required(request.drama_id, "dramaId");
    if !missing.is_empty() {
        return Err(ApiError::bad_request(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )));
    }

    let new_episode = NewEpisode {
        title,
        description: request.description.unwrap_or_default(),
        video_url,
        thumbnail_url,
        duration: parse_duration(request.duration.as_ref())?,
        is_premium: request.is_premium.unwrap_or(false),
        drama_id,
    };

    let catalog = state.catalog.clone();
    let outcome = join(move || catalog.create_episode(&new_episode))
        .await?
        .map_err(|err| ApiError::upstream("creating episode", err))?;

    match outcome {
        EpisodeInsert::Created(episode) => {
            state.cache.episodes.clear();
            info!("{} created episode {}", caller.id, episode.id);
            Ok((StatusCode::CREATED, Json(episode)))
        }
        EpisodeInsert::UnknownDrama => Err(ApiError::not_found("Drama not found")),
        EpisodeInsert::DuplicateVideoUrl => Err(ApiError::conflict(
            "An episode with this videoUrl already exists",
        )),
    }
}

async fn list_favorites(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> ApiResult<Json<Vec<Episode>>> {
    let catalog = state.catalog.clone();
    let user_id = caller.id.clone();
    let favorites = join(move || catalog.list_favorites(&user_id))
        .await?
        .map_err(|err| ApiError::upstream("listing favorites", err))?;
    info!("found {} favorites for {}", favorites.len(), caller.id);
    Ok(Json(favorites))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ToggleFavoriteRequest {
    episode_id: Option<String>,
}

async fn toggle_favorite(
    State(state): State<AppState>,
    Caller(caller): Caller,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let request: ToggleFavoriteRequest = parse_body(&body)?;
    let episode_id =
        non_blank(request.episode_id).ok_or_else(|| ApiError::bad_request("Missing episodeId"))?;

    let catalog = state.catalog.clone();
    let (user_id, email) = (caller.id.clone(), caller.email_or_empty().to_string());
    let toggled_id = episode_id.clone();
    let is_favorite = join(move || catalog.toggle_favorite(&user_id, &email, &toggled_id))
        .await?
        .map_err(|err| ApiError::upstream("toggling favorite", err))?
        .ok_or_else(|| ApiError::not_found("Episode not found"))?;

    info!(
        "{} {} episode {episode_id}",
        caller.id,
        if is_favorite { "favorited" } else { "unfavorited" }
    );
    let message = if is_favorite {
        "Added to favorites"
    } else {
        "Removed from favorites"
    };
    Ok(Json(json!({ "message": message, "isFavorite": is_favorite })))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Accepts `90`, `90.5` or `"90"`; absent means 0.
fn parse_duration(value: Option<&Value>) -> ApiResult<i64> {
    let invalid = || ApiError::bad_request("duration must be a non-negative number of seconds");
    let seconds = match value {
        None | Some(Value::Null) => return Ok(0),
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))
            .ok_or_else(invalid)?,
        Some(Value::String(text)) if text.trim().is_empty() => return Ok(0),
        Some(Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|float| float.is_finite())
            .map(|float| float as i64)
            .ok_or_else(invalid)?,
        Some(_) => return Err(invalid()),
    };
    if seconds < 0 {
        return Err(invalid());
    }
    Ok(seconds)
}
