// tests/support/mod.rs
//! In-process stand-in for the display API, bound to 127.0.0.1:0.
#![allow(dead_code)]

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use futures_util::Stream;
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};
use signage_runtime::api::HEADER_API_KEY;
use signage_runtime::types::*;
use signage_runtime::verify;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

pub const PAIRING_CODE: &str = "424242";
pub const DEVICE_ID: &str = "dev-1";
pub const DEVICE_API_KEY: &str = "static-key";

#[derive(Clone, Debug)]
pub enum StreamCmd {
    Notify,
    CloseAll,
}

pub struct StubDisplay {
    pub display_id: String,
    pub key_id: String,
    pub public_key_pem: String,
}

struct StubSession {
    nonce: String,
    expires_at: DateTime<Utc>,
    used: bool,
}

struct StubChallenge {
    slug: String,
    key_id: String,
    expires_at: DateTime<Utc>,
}

pub struct StubState {
    pub pairing_codes: HashSet<String>,
    pub session_ttl: Duration,
    pub challenge_ttl: Duration,
    pub displays: HashMap<String, StubDisplay>,
    pub manifest: Value,
    pub manifest_fetches: u64,
    pub heartbeats: u64,
    pub stream_connects: u64,
    pub fail_heartbeats: bool,
    pub authenticated: HashSet<String>,
    sessions: HashMap<String, StubSession>,
    challenges: HashMap<String, StubChallenge>,
    stream_tokens: HashSet<String>,
}

type Shared = Arc<StubShared>;

pub struct StubShared {
    pub state: Mutex<StubState>,
    pub events: broadcast::Sender<StreamCmd>,
}

pub struct StubServer {
    pub addr: SocketAddr,
    pub shared: Shared,
    handle: tokio::task::JoinHandle<()>,
}

impl StubServer {
    pub async fn start() -> Self {
        Self::serve(TcpListener::bind("127.0.0.1:0").await.expect("bind")).await
    }

    /// Binds a specific address, e.g. one a client was already pointed at.
    pub async fn start_at(addr: SocketAddr) -> Self {
        Self::serve(TcpListener::bind(addr).await.expect("bind")).await
    }

    async fn serve(listener: TcpListener) -> Self {
        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(StubShared {
            state: Mutex::new(StubState {
                pairing_codes: HashSet::from([PAIRING_CODE.to_string()]),
                session_ttl: Duration::minutes(10),
                challenge_ttl: Duration::minutes(2),
                displays: HashMap::new(),
                manifest: manifest_json("v1", &[("a", 1, 5.0), ("b", 2, 5.0)]),
                manifest_fetches: 0,
                heartbeats: 0,
                stream_connects: 0,
                fail_heartbeats: false,
                authenticated: HashSet::new(),
                sessions: HashMap::new(),
                challenges: HashMap::new(),
                stream_tokens: HashSet::new(),
            }),
            events,
        });

        let app = Router::new()
            .route("/display-runtime/registration-sessions", post(create_session))
            .route("/display-runtime/registrations", post(register))
            .route("/display-runtime/auth/challenges", post(challenge))
            .route("/display-runtime/auth/challenges/:token/verify", post(verify_challenge))
            .route("/display-runtime/:slug/manifest", get(signed_manifest))
            .route("/display-runtime/:slug/stream", get(signed_stream))
            .route("/display-runtime/:slug/heartbeat", post(heartbeat))
            .route("/devices/:id/manifest", get(device_manifest))
            .route("/devices/:id/stream-token", get(device_stream_token))
            .route("/devices/:id/stream", get(device_stream))
            .with_state(shared.clone())
            .layer(TraceLayer::new_for_http());

        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("stub server");
        });
        Self { addr, shared, handle }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut StubState) -> R) -> R {
        let mut state = self.shared.state.lock().expect("stub state");
        f(&mut state)
    }

    pub fn set_manifest(&self, manifest: Value) {
        self.with_state(|s| s.manifest = manifest);
    }

    pub fn notify(&self) {
        let _ = self.shared.events.send(StreamCmd::Notify);
    }

    pub fn close_streams(&self) {
        let _ = self.shared.events.send(StreamCmd::CloseAll);
    }

    /// Inserts a display directly, as if it had registered earlier.
    pub fn seed_display(&self, slug: &str, key_id: &str, public_key_pem: &str) {
        self.with_state(|s| {
            s.displays.insert(
                slug.to_string(),
                StubDisplay {
                    display_id: format!("display-{slug}"),
                    key_id: key_id.to_string(),
                    public_key_pem: public_key_pem.to_string(),
                },
            )
        });
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn manifest_json(version: &str, items: &[(&str, i64, f64)]) -> Value {
    json!({
        "playlistId": "playlist-1",
        "playlistVersion": version,
        "generatedAt": Utc::now().to_rfc3339(),
        "runtimeSettings": { "scrollPxPerSecond": 24 },
        "items": items.iter().map(|(id, seq, duration)| json!({
            "id": id,
            "sequence": seq,
            "duration": duration,
            "content": {
                "id": format!("content-{id}"),
                "type": "IMAGE",
                "checksum": null,
                "downloadUrl": format!("https://cdn.example/{id}.png"),
                "mimeType": "image/png",
                "width": 1920,
                "height": 1080,
                "duration": null
            }
        })).collect::<Vec<_>>()
    })
}

// ---------- HANDLERS ---------- //

type ApiResult<T> = Result<T, (StatusCode, Json<Value>)>;

fn api_err(status: StatusCode, code: &str, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({ "error": { "code": code, "message": message.into() } })),
    )
}

fn gen_nonce() -> String {
    let mut b = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut b);
    URL_SAFE_NO_PAD.encode(b)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionBody {
    registration_code: String,
}

async fn create_session(
    State(shared): State<Shared>,
    Json(body): Json<SessionBody>,
) -> ApiResult<Json<Value>> {
    let mut s = shared.state.lock().expect("stub state");
    if !s.pairing_codes.remove(&body.registration_code) {
        return Err(api_err(
            StatusCode::NOT_FOUND,
            "REGISTRATION_CODE_INVALID",
            "Pairing code is invalid or expired",
        ));
    }
    let id = uuid::Uuid::new_v4().to_string();
    let nonce = gen_nonce();
    let expires_at = Utc::now() + s.session_ttl;
    s.sessions.insert(
        id.clone(),
        StubSession {
            nonce: nonce.clone(),
            expires_at,
            used: false,
        },
    );
    Ok(Json(json!({
        "registrationSessionId": id,
        "expiresAt": expires_at.to_rfc3339(),
        "challengeNonce": nonce,
        "constraints": { "maxWidth": 7680, "maxHeight": 7680 }
    })))
}

async fn register(
    State(shared): State<Shared>,
    Json(req): Json<RegisterReq>,
) -> ApiResult<Json<Value>> {
    let mut s = shared.state.lock().expect("stub state");
    let Some(session) = s.sessions.get(&req.registration_session_id) else {
        return Err(api_err(StatusCode::BAD_REQUEST, "SESSION_INVALID", "invalid/expired session"));
    };
    if session.used || session.expires_at < Utc::now() {
        return Err(api_err(StatusCode::BAD_REQUEST, "SESSION_EXPIRED", "expired session"));
    }
    verify::verify_registration_signature(&req, &session.nonce)
        .map_err(|_| api_err(StatusCode::UNAUTHORIZED, "SIGNATURE_INVALID", "bad signature"))?;

    if let Some(existing) = s.displays.get(&req.display_slug) {
        if existing.public_key_pem.trim() != req.public_key.trim() {
            return Err(api_err(
                StatusCode::CONFLICT,
                "SLUG_TAKEN",
                "display slug already registered with another key",
            ));
        }
    }

    if let Some(session) = s.sessions.get_mut(&req.registration_session_id) {
        session.used = true;
    }
    let display_id = format!("display-{}", uuid::Uuid::new_v4());
    let key_id = format!("key-{}", uuid::Uuid::new_v4());
    s.displays.insert(
        req.display_slug.clone(),
        StubDisplay {
            display_id: display_id.clone(),
            key_id: key_id.clone(),
            public_key_pem: req.public_key.clone(),
        },
    );
    Ok(Json(json!({
        "displayId": display_id,
        "displaySlug": req.display_slug,
        "state": "ACTIVE",
        "keyId": key_id
    })))
}

async fn challenge(
    State(shared): State<Shared>,
    Json(req): Json<ChallengeReq>,
) -> ApiResult<Json<Value>> {
    let mut s = shared.state.lock().expect("stub state");
    match s.displays.get(&req.display_slug) {
        Some(d) if d.key_id == req.key_id => {}
        _ => return Err(api_err(StatusCode::NOT_FOUND, "DISPLAY_UNKNOWN", "unknown display or key")),
    }
    let token = gen_nonce();
    let expires_at = Utc::now() + s.challenge_ttl;
    s.challenges.insert(
        token.clone(),
        StubChallenge {
            slug: req.display_slug,
            key_id: req.key_id,
            expires_at,
        },
    );
    Ok(Json(json!({ "challengeToken": token, "expiresAt": expires_at.to_rfc3339() })))
}

async fn verify_challenge(
    State(shared): State<Shared>,
    Path(token): Path<String>,
    Json(req): Json<VerifyChallengeReq>,
) -> ApiResult<Json<Value>> {
    let mut s = shared.state.lock().expect("stub state");
    let Some(ch) = s.challenges.remove(&token) else {
        return Err(api_err(StatusCode::UNAUTHORIZED, "CHALLENGE_INVALID", "unknown challenge"));
    };
    if ch.expires_at <= Utc::now() {
        return Err(api_err(StatusCode::UNAUTHORIZED, "CHALLENGE_EXPIRED", "challenge expired"));
    }
    if ch.slug != req.display_slug || ch.key_id != req.key_id {
        return Err(api_err(StatusCode::UNAUTHORIZED, "CHALLENGE_INVALID", "challenge mismatch"));
    }
    let pem = s
        .displays
        .get(&req.display_slug)
        .map(|d| d.public_key_pem.clone())
        .ok_or_else(|| api_err(StatusCode::NOT_FOUND, "DISPLAY_UNKNOWN", "unknown display"))?;
    verify::verify_challenge_signature(&pem, &token, &req.display_slug, &req.key_id, &req.signature)
        .map_err(|_| api_err(StatusCode::UNAUTHORIZED, "SIGNATURE_INVALID", "bad signature"))?;
    s.authenticated.insert(req.display_slug);
    Ok(Json(json!({ "ok": true })))
}

fn check_signed(
    shared: &Shared,
    slug: &str,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: Option<&Value>,
) -> ApiResult<()> {
    let s = shared.state.lock().expect("stub state");
    let display = s
        .displays
        .get(slug)
        .ok_or_else(|| api_err(StatusCode::NOT_FOUND, "DISPLAY_UNKNOWN", "unknown display"))?;
    let claims = verify::verify_signed_request(
        &display.public_key_pem,
        method,
        path,
        headers,
        body,
        Utc::now(),
        Duration::seconds(60),
    )
    .map_err(|e| api_err(StatusCode::UNAUTHORIZED, "SIGNATURE_INVALID", e.to_string()))?;
    if claims.display_slug != slug || claims.key_id != display.key_id {
        return Err(api_err(StatusCode::UNAUTHORIZED, "SIGNATURE_INVALID", "identity mismatch"));
    }
    Ok(())
}

async fn signed_manifest(
    State(shared): State<Shared>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let path = format!("/display-runtime/{slug}/manifest");
    check_signed(&shared, &slug, "GET", &path, &headers, None)?;
    let mut s = shared.state.lock().expect("stub state");
    s.manifest_fetches += 1;
    Ok(Json(s.manifest.clone()))
}

async fn heartbeat(
    State(shared): State<Shared>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let path = format!("/display-runtime/{slug}/heartbeat");
    check_signed(&shared, &slug, "POST", &path, &headers, Some(&body))?;
    let mut s = shared.state.lock().expect("stub state");
    s.heartbeats += 1;
    if s.fail_heartbeats {
        return Err(api_err(StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", "heartbeat store down"));
    }
    Ok(Json(json!({ "ok": true })))
}

fn event_stream(shared: &Shared) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = shared.events.subscribe();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(StreamCmd::Notify) => {
                    let event = Event::default().event("manifest.updated").data("{}");
                    return Some((Ok(event), rx));
                }
                Ok(StreamCmd::CloseAll) | Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn signed_stream(
    State(shared): State<Shared>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let path = format!("/display-runtime/{slug}/stream");
    check_signed(&shared, &slug, "GET", &path, &headers, None)?;
    shared.state.lock().expect("stub state").stream_connects += 1;
    Ok(event_stream(&shared))
}

fn check_api_key(id: &str, headers: &HeaderMap) -> ApiResult<()> {
    let key = headers.get(HEADER_API_KEY).and_then(|v| v.to_str().ok());
    if id != DEVICE_ID || key != Some(DEVICE_API_KEY) {
        return Err(api_err(StatusCode::UNAUTHORIZED, "API_KEY_INVALID", "invalid api key"));
    }
    Ok(())
}

async fn device_manifest(
    State(shared): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    check_api_key(&id, &headers)?;
    let mut s = shared.state.lock().expect("stub state");
    s.manifest_fetches += 1;
    Ok(Json(s.manifest.clone()))
}

async fn device_stream_token(
    State(shared): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    check_api_key(&id, &headers)?;
    let token = gen_nonce();
    shared
        .state
        .lock()
        .expect("stub state")
        .stream_tokens
        .insert(token.clone());
    Ok(Json(json!({ "token": token, "expiresAt": (Utc::now() + Duration::minutes(1)).to_rfc3339() })))
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

async fn device_stream(
    State(shared): State<Shared>,
    Path(_id): Path<String>,
    Query(q): Query<TokenQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    {
        let mut s = shared.state.lock().expect("stub state");
        if !s.stream_tokens.remove(&q.token) {
            return Err(api_err(StatusCode::UNAUTHORIZED, "STREAM_TOKEN_INVALID", "bad stream token"));
        }
        s.stream_connects += 1;
    }
    Ok(event_stream(&shared))
}
