use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};
use switchboard_config::{validate_runtime_support, Config, Secrets};
use switchboard_contracts::{
    AutomationToggle, ErrorResponse, EventType, InboundEvent, Outcome, WebhookAck, WebhookPayload,
    API_VERSION,
};
use switchboard_kernel::{stable_event_id, verify_signature, SignatureError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

mod audit;
mod delivery;
mod responder;
mod router;
mod store;

pub use audit::{verify_audit_chain, AuditRecord};
pub use delivery::{
    build_gateway, deliver_with_retry, DeliveryError, DeliveryGateway, DeliveryReceipt,
    DeliveryReport, ProviderGateway, RetryPolicy,
};
pub use responder::{
    build_responder, AgentHttpResponder, OpenAiResponder, Responder, ResponderError,
    ResponderRequest,
};
pub use router::WebhookRouter;
pub use store::StoreError;

/// External systems the router talks to. Production builds them from config
/// and environment; tests inject stubs.
pub struct Collaborators {
    pub responder: Arc<dyn Responder>,
    pub gateway: Arc<dyn DeliveryGateway>,
    pub webhook_secret: SecretString,
}

impl Collaborators {
    pub fn from_config(cfg: &Config, secrets: Secrets) -> Result<Self, String> {
        Ok(Self {
            responder: build_responder(&cfg.responder, secrets.responder_api_key)?,
            gateway: build_gateway(
                &cfg.delivery,
                secrets.delivery_account_id,
                secrets.delivery_auth_token,
            )?,
            webhook_secret: secrets.webhook_secret,
        })
    }
}

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;
    let sweep_every = Duration::from_millis(cfg.sessions.sweep_interval_ms);

    let secrets = Secrets::from_env(&cfg).map_err(|e| e.to_string())?;
    let collaborators = Collaborators::from_config(&cfg, secrets)?;
    let state = AppState::new(cfg, collaborators).await?;
    let sweeper = spawn_session_sweeper(Arc::clone(&state.router), sweep_every);
    let pending = state.pending.clone();
    let app = routes(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(event_name = "server.listening", %addr, "switchboard listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"));
    sweeper.abort();
    drain_pending(&pending).await;
    served
}

/// Waits for deferred webhook pipelines; the provider already got its 202
/// and will not redeliver.
async fn drain_pending(pending: &TaskTracker) {
    pending.close();
    if !pending.is_empty() {
        info!(
            event_name = "server.draining",
            in_flight = pending.len(),
            "waiting for deferred webhooks"
        );
    }
    pending.wait().await;
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let secrets = Secrets::from_env(&cfg).map_err(|e| e.to_string())?;
    let collaborators = Collaborators::from_config(&cfg, secrets)?;
    build_app_with(cfg, collaborators).await
}

pub async fn build_app_with(cfg: Config, collaborators: Collaborators) -> Result<Router, String> {
    Ok(routes(AppState::new(cfg, collaborators).await?))
}

fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/readyz", get(readyz))
        .route("/v1/conversations/{id}", get(conversation))
        .route("/v1/conversations/{id}/automation", put(automation))
        .route("/v1/webhooks/conversations", post(conversations_webhook))
        .route("/v1/webhooks/message-added", post(message_added_webhook))
        .route("/v1/webhooks/participant-added", post(participant_added_webhook))
        .route(
            "/v1/webhooks/participant-removed",
            post(participant_removed_webhook),
        )
        .route(
            "/v1/webhooks/conversation-state-updated",
            post(state_updated_webhook),
        )
        .with_state(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckMode {
    Inline,
    Deferred,
}

#[derive(Clone)]
struct AppState {
    router: Arc<WebhookRouter>,
    webhook_secret: SecretString,
    signature_header: String,
    ack_mode: AckMode,
    pending: TaskTracker,
}

impl AppState {
    async fn new(cfg: Config, collaborators: Collaborators) -> Result<Self, String> {
        validate_runtime_support(&cfg).map_err(|e| e.to_string())?;
        let router =
            WebhookRouter::new(&cfg, collaborators.responder, collaborators.gateway).await?;
        Ok(Self {
            router: Arc::new(router),
            webhook_secret: collaborators.webhook_secret,
            signature_header: cfg.webhook.signature_header.to_ascii_lowercase(),
            ack_mode: if cfg.server.ack_mode == "inline" {
                AckMode::Inline
            } else {
                AckMode::Deferred
            },
            pending: TaskTracker::new(),
        })
    }
}

fn spawn_session_sweeper(router: Arc<WebhookRouter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match router.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!(
                    event_name = "session.swept",
                    purged, "expired sessions purged"
                ),
                Err(e) => warn!(
                    event_name = "session.sweep_failed",
                    error = %e,
                    "session sweep failed"
                ),
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(event_name = "server.signal_failed", error = %e, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
    info!(event_name = "server.shutdown", "shutting down");
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ready",
        "version": API_VERSION,
        "store": state.router.store_kind().await,
        "responder": state.router.responder_kind(),
    }))
}

async fn conversation(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.router.snapshot(&id).await {
        Ok(Some(snapshot)) => (StatusCode::OK, Json(snapshot)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                format!("no active session for conversation {id}"),
            )),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(toggle): Json<AutomationToggle>,
) -> Response {
    match state.router.set_automation(&id, toggle.enabled).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: StoreError) -> Response {
    error!(event_name = "operator.store_failed", error = %e, "session store failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("internal_error", "session store unavailable")),
    )
        .into_response()
}

async fn conversations_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    accept_webhook(state, headers, body, None).await
}

async fn message_added_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    accept_webhook(state, headers, body, Some(EventType::MessageAdded)).await
}

async fn participant_added_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    accept_webhook(state, headers, body, Some(EventType::ParticipantAdded)).await
}

async fn participant_removed_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    accept_webhook(state, headers, body, Some(EventType::ParticipantRemoved)).await
}

async fn state_updated_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    accept_webhook(state, headers, body, Some(EventType::StateUpdated)).await
}

async fn accept_webhook(
    state: AppState,
    headers: HeaderMap,
    body: Bytes,
    default_type: Option<EventType>,
) -> Response {
    let provided = headers
        .get(state.signature_header.as_str())
        .and_then(|v| v.to_str().ok());
    if let Err(e) = verify_signature(
        state.webhook_secret.expose_secret().as_bytes(),
        &body,
        provided,
    ) {
        warn!(
            event_name = "webhook.rejected",
            reason_code = signature_reason(&e),
            "webhook signature check failed"
        );
        state
            .router
            .record_rejection("unknown", signature_reason(&e))
            .await;
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("authentication_error", e.to_string())),
        )
            .into_response();
    }

    let event = match parse_event(&headers, &body, default_type) {
        Ok(event) => event,
        Err(message) => {
            warn!(
                event_name = "webhook.invalid_payload",
                error = %message,
                "webhook payload rejected"
            );
            return (
                StatusCode::OK,
                Json(WebhookAck::failed("validation_error", message)),
            )
                .into_response();
        }
    };
    debug!(
        event_name = "webhook.received",
        conversation_id = %event.conversation_id,
        event_id = %event.event_id,
        event_type = event.event_type.as_str(),
        "webhook accepted"
    );

    match state.ack_mode {
        AckMode::Inline => (StatusCode::OK, Json(state.router.handle(event).await)).into_response(),
        AckMode::Deferred => {
            let router = Arc::clone(&state.router);
            state.pending.spawn(async move {
                router.handle(event).await;
            });
            (
                StatusCode::ACCEPTED,
                Json(WebhookAck::outcome(Outcome::Accepted, "event accepted")),
            )
                .into_response()
        }
    }
}

fn signature_reason(e: &SignatureError) -> &'static str {
    match e {
        SignatureError::Missing => "signature_missing",
        SignatureError::Malformed => "signature_malformed",
        SignatureError::Mismatch => "signature_mismatch",
        SignatureError::EmptySecret => "signature_unconfigured",
    }
}

/// Decodes a form- or JSON-encoded provider payload into an event.
fn parse_event(
    headers: &HeaderMap,
    body: &[u8],
    default_type: Option<EventType>,
) -> Result<InboundEvent, String> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().starts_with("application/json"))
        .unwrap_or(false);

    let payload: WebhookPayload = if is_json {
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON payload: {e}"))?
    } else {
        let fields: Map<String, Value> = url::form_urlencoded::parse(body)
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect();
        serde_json::from_value(Value::Object(fields))
            .map_err(|e| format!("invalid form payload: {e}"))?
    };

    let fallback_id = stable_event_id(payload.conversation_id.as_deref().unwrap_or(""), body);
    payload.into_event(default_type, fallback_id, Utc::now().to_rfc3339())
}
