use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use secrecy::SecretString;
use serde_json::{json, Value};
use switchboard_config::{
    Audit, Config, Delivery, Fallback, Logging, Responder as ResponderConfig, Server, Sessions,
    Store, Webhook,
};
use switchboard_contracts::AgentReply;
use switchboard_kernel::sign_body;
use switchboard_server::{
    build_app_with, verify_audit_chain, Collaborators, DeliveryError, DeliveryGateway,
    DeliveryReceipt, Responder, ResponderError, ResponderRequest,
};
use tower::util::ServiceExt;

const SECRET: &str = "whsec_test_secret";
const SIGNATURE_HEADER: &str = "x-switchboard-signature";

static UNIQUE: AtomicUsize = AtomicUsize::new(0);

fn temp_path(name: &str, ext: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    let n = UNIQUE.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir()
        .join(format!("switchboard-{name}-{nanos}-{n}.{ext}"))
        .to_string_lossy()
        .to_string()
}

fn test_config() -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
            ack_mode: "inline".to_string(),
        },
        webhook: Webhook {
            secret_env: "SWITCHBOARD_WEBHOOK_SECRET".to_string(),
            signature_header: "X-Switchboard-Signature".to_string(),
        },
        store: Store {
            kind: "memory".to_string(),
            sqlite_path: None,
        },
        sessions: Sessions {
            max_history: 20,
            timeout_ms: 1_800_000,
            max_processed_ids: 256,
            sweep_interval_ms: 60_000,
            human_agent_prefix: "human_agent_".to_string(),
        },
        responder: ResponderConfig {
            kind: "agent_http".to_string(),
            endpoint: Some("http://127.0.0.1:9/agent".to_string()),
            model: None,
            api_key_env: None,
            timeout_ms: 2_000,
            max_tokens: 1000,
            temperature: 0.7,
            instructions: String::new(),
        },
        delivery: Delivery {
            base_url: "http://127.0.0.1:9".to_string(),
            service_id: "IS123".to_string(),
            account_id_env: "SWITCHBOARD_ACCOUNT_ID".to_string(),
            auth_token_env: "SWITCHBOARD_AUTH_TOKEN".to_string(),
            author: "assistant".to_string(),
            timeout_ms: 1_000,
            retry_max_attempts: 3,
            retry_backoff_ms: 1,
            typing_indicator: true,
        },
        fallback: Fallback {
            rate_limited: "We're getting a lot of messages right now. Please try again shortly."
                .to_string(),
            unavailable: "Our assistant is unavailable right now. A team member will follow up."
                .to_string(),
            token_limit_exceeded: "That conversation got too long for me. Could you summarize?"
                .to_string(),
            unknown: "Something went wrong on our side. Please try again.".to_string(),
        },
        logging: Logging::default(),
        audit: Audit {
            jsonl_path: temp_path("audit", "jsonl"),
            immutable_mirror_path: None,
        },
    }
}

struct StubResponder {
    delay: Duration,
    failure: Option<ResponderError>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<ResponderRequest>>,
}

impl StubResponder {
    fn replying() -> Self {
        Self {
            delay: Duration::ZERO,
            failure: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::replying()
        }
    }

    fn failing(err: ResponderError) -> Self {
        Self {
            failure: Some(err),
            ..Self::replying()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Responder for StubResponder {
    fn kind(&self) -> &'static str {
        "stub"
    }

    async fn respond(&self, request: ResponderRequest) -> Result<AgentReply, ResponderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let message = request.message.clone();
        self.requests.lock().unwrap().push(request);
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(AgentReply {
                text: format!("reply to: {message}"),
                tool_invocations: Vec::new(),
                error: None,
            }),
        }
    }
}

#[derive(Default)]
struct StubGateway {
    failures_remaining: AtomicUsize,
    attempts: AtomicUsize,
    sent: Mutex<Vec<(String, String, String)>>,
    typing: Mutex<Vec<(String, String, bool)>>,
}

impl StubGateway {
    fn failing_first(n: usize) -> Self {
        Self {
            failures_remaining: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }

    fn typing(&self) -> Vec<(String, String, bool)> {
        self.typing.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryGateway for StubGateway {
    async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        author: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DeliveryError::Status(503));
        }
        self.sent.lock().unwrap().push((
            conversation_id.to_string(),
            text.to_string(),
            author.to_string(),
        ));
        Ok(DeliveryReceipt {
            message_id: Some(format!("IM-out-{attempt}")),
        })
    }

    async fn set_typing(
        &self,
        conversation_id: &str,
        participant_id: &str,
        typing: bool,
    ) -> Result<(), DeliveryError> {
        self.typing.lock().unwrap().push((
            conversation_id.to_string(),
            participant_id.to_string(),
            typing,
        ));
        Ok(())
    }
}

struct Harness {
    app: Router,
    responder: Arc<StubResponder>,
    gateway: Arc<StubGateway>,
    audit_path: String,
}

async fn harness_with(cfg: Config, responder: StubResponder, gateway: StubGateway) -> Harness {
    let responder = Arc::new(responder);
    let gateway = Arc::new(gateway);
    let audit_path = cfg.audit.jsonl_path.clone();
    let app = build_app_with(
        cfg,
        Collaborators {
            responder: responder.clone(),
            gateway: gateway.clone(),
            webhook_secret: SecretString::from(SECRET),
        },
    )
    .await
    .unwrap();
    Harness {
        app,
        responder,
        gateway,
        audit_path,
    }
}

async fn harness() -> Harness {
    harness_with(test_config(), StubResponder::replying(), StubGateway::default()).await
}

fn form(fields: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields)
        .finish()
}

fn message(conversation: &str, message_id: &str, author: &str, body: &str) -> String {
    form(&[
        ("EventType", "onMessageAdd"),
        ("AccountSid", "AC123"),
        ("ConversationSid", conversation),
        ("MessageSid", message_id),
        ("ParticipantSid", "MB1"),
        ("Author", author),
        ("Body", body),
    ])
}

async fn read_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn post_signed(app: &Router, uri: &str, content_type: &str, body: String) -> (StatusCode, Value) {
    let signature = sign_body(SECRET.as_bytes(), body.as_bytes()).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", content_type)
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(body))
        .unwrap();
    read_json(app.clone().oneshot(request).await.unwrap()).await
}

async fn post_webhook(app: &Router, body: String) -> (StatusCode, Value) {
    post_signed(
        app,
        "/v1/webhooks/conversations",
        "application/x-www-form-urlencoded",
        body,
    )
    .await
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    read_json(app.clone().oneshot(request).await.unwrap()).await
}

async fn put_automation(app: &Router, conversation: &str, enabled: bool) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("PUT")
        .uri(format!("/v1/conversations/{conversation}/automation"))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "enabled": enabled }).to_string()))
        .unwrap();
    read_json(app.clone().oneshot(request).await.unwrap()).await
}

#[tokio::test]
async fn healthz_ok() {
    let h = harness().await;
    let response = h
        .app
        .oneshot(
            Request::builder()
                .uri("/v1/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn readyz_reports_store_and_responder() {
    let h = harness().await;
    let (status, body) = get_json(&h.app, "/v1/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], "memory");
    assert_eq!(body["responder"], "stub");
}

#[tokio::test]
async fn unsigned_or_forged_webhooks_are_rejected_without_session() {
    let h = harness().await;
    let body = message("CH1", "IM1", "customer_1", "check order 12345");

    let unsigned = Request::builder()
        .method("POST")
        .uri("/v1/webhooks/conversations")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, payload) = read_json(h.app.clone().oneshot(unsigned).await.unwrap()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(payload["error"]["code"], "authentication_error");

    let forged_signature = sign_body(b"some-other-secret", body.as_bytes()).unwrap();
    let forged = Request::builder()
        .method("POST")
        .uri("/v1/webhooks/conversations")
        .header("content-type", "application/x-www-form-urlencoded")
        .header(SIGNATURE_HEADER, forged_signature)
        .body(Body::from(body))
        .unwrap();
    let (status, _) = read_json(h.app.clone().oneshot(forged).await.unwrap()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = get_json(&h.app, "/v1/conversations/CH1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(h.responder.calls(), 0);
    assert!(h.gateway.sent().is_empty());

    let audit = std::fs::read_to_string(&h.audit_path).unwrap();
    assert!(audit.contains("signature_missing"));
    assert!(audit.contains("signature_mismatch"));
}

#[tokio::test]
async fn single_customer_message_gets_one_reply() {
    let h = harness().await;
    let (status, ack) =
        post_webhook(&h.app, message("CH1", "IM1", "customer_1", "check order 12345")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["success"], true);
    assert_eq!(ack["outcome"], "replied");
    assert_eq!(ack["agent_responded"], true);
    assert_eq!(ack["delivered"], true);

    assert_eq!(h.responder.calls(), 1);
    assert_eq!(
        h.gateway.sent(),
        vec![(
            "CH1".to_string(),
            "reply to: check order 12345".to_string(),
            "assistant".to_string()
        )]
    );

    let (status, snapshot) = get_json(&h.app, "/v1/conversations/CH1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["history_len"], 2);
    assert_eq!(snapshot["state"], "eligible");
    assert_eq!(snapshot["participant_count"], 1);
    assert_eq!(snapshot["history"][0]["role"], "customer");
    assert_eq!(snapshot["history"][1]["role"], "assistant");
}

#[tokio::test]
async fn history_is_sent_to_the_responder() {
    let h = harness().await;
    post_webhook(&h.app, message("CH1", "IM1", "customer_1", "check order 12345")).await;
    post_webhook(&h.app, message("CH1", "IM2", "customer_1", "and the other one?")).await;

    let requests = h.responder.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].history.is_empty());
    assert_eq!(requests[1].history.len(), 2);
    assert_eq!(requests[1].history[0].text, "check order 12345");
    assert_eq!(requests[1].message, "and the other one?");
}

#[tokio::test]
async fn second_participant_stops_automation() {
    let h = harness().await;
    post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;

    let (_, ack) = post_webhook(
        &h.app,
        form(&[
            ("EventType", "onParticipantAdded"),
            ("ConversationSid", "CH1"),
            ("ParticipantSid", "MB2"),
            ("Identity", "support_rep"),
        ]),
    )
    .await;
    assert_eq!(ack["outcome"], "recorded");

    let (_, ack) = post_webhook(&h.app, message("CH1", "IM2", "customer_1", "anyone there?")).await;
    assert_eq!(ack["outcome"], "skipped");
    assert_eq!(ack["reason_code"], "multiple_participants");
    assert_eq!(ack["agent_responded"], false);
    assert_eq!(h.responder.calls(), 1);

    let (_, snapshot) = get_json(&h.app, "/v1/conversations/CH1").await;
    assert_eq!(snapshot["state"], "ineligible");
    assert_eq!(snapshot["eligible"], false);
}

#[tokio::test]
async fn removing_the_extra_participant_does_not_restore_automation() {
    let h = harness().await;
    post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    for event_type in ["onParticipantAdded", "onParticipantRemoved"] {
        let (_, ack) = post_webhook(
            &h.app,
            form(&[
                ("EventType", event_type),
                ("ConversationSid", "CH1"),
                ("ParticipantSid", "MB2"),
                ("Identity", "support_rep"),
                ("WebhookSid", "WH1"),
            ]),
        )
        .await;
        assert_eq!(ack["outcome"], "recorded");
    }

    let (_, ack) = post_webhook(&h.app, message("CH1", "IM2", "customer_1", "hello?")).await;
    assert_eq!(ack["outcome"], "skipped");
    assert_eq!(ack["reason_code"], "automation_disabled");
    assert_eq!(h.responder.calls(), 1);
}

#[tokio::test]
async fn participant_events_sharing_a_webhook_sid_are_all_applied() {
    let h = harness().await;
    post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;

    let mut outcomes = Vec::new();
    for (participant, identity) in [("MB1", "customer_1"), ("MB2", "support_rep")] {
        let (_, ack) = post_webhook(
            &h.app,
            form(&[
                ("EventType", "onParticipantAdded"),
                ("ConversationSid", "CH1"),
                ("ParticipantSid", participant),
                ("Identity", identity),
                ("WebhookSid", "WH1"),
            ]),
        )
        .await;
        outcomes.push(ack["outcome"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(outcomes, vec!["recorded", "recorded"]);

    let (_, ack) = post_webhook(&h.app, message("CH1", "IM2", "customer_1", "anyone?")).await;
    assert_eq!(ack["outcome"], "skipped");
    assert_eq!(ack["reason_code"], "multiple_participants");
    assert_eq!(h.responder.calls(), 1);

    let (_, snapshot) = get_json(&h.app, "/v1/conversations/CH1").await;
    assert_eq!(snapshot["participant_count"], 2);
}

#[tokio::test]
async fn sms_customer_joined_by_sid_is_one_participant() {
    let h = harness().await;
    let (_, ack) = post_webhook(
        &h.app,
        form(&[
            ("EventType", "onParticipantAdded"),
            ("ConversationSid", "CH1"),
            ("ParticipantSid", "MB7"),
        ]),
    )
    .await;
    assert_eq!(ack["outcome"], "recorded");

    let (_, ack) = post_webhook(
        &h.app,
        form(&[
            ("EventType", "onMessageAdd"),
            ("ConversationSid", "CH1"),
            ("MessageSid", "IM1"),
            ("ParticipantSid", "MB7"),
            ("Author", "+15551234567"),
            ("Body", "where is my order"),
        ]),
    )
    .await;
    assert_eq!(ack["outcome"], "replied");
    assert_eq!(h.responder.calls(), 1);

    let (_, snapshot) = get_json(&h.app, "/v1/conversations/CH1").await;
    assert_eq!(snapshot["participant_count"], 1);
}

#[tokio::test]
async fn human_agent_join_disables_automation() {
    let h = harness().await;
    let (status, ack) = post_signed(
        &h.app,
        "/v1/webhooks/participant-added",
        "application/x-www-form-urlencoded",
        form(&[("ConversationSid", "CH1"), ("Identity", "human_agent_bob")]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "recorded");

    let (_, ack) = post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    assert_eq!(ack["outcome"], "skipped");
    assert_eq!(h.responder.calls(), 0);
}

#[tokio::test]
async fn replayed_event_is_acknowledged_as_duplicate() {
    let h = harness().await;
    let body = message("CH1", "IM1", "customer_1", "check order 12345");
    post_webhook(&h.app, body.clone()).await;
    let (status, ack) = post_webhook(&h.app, body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "duplicate");
    assert_eq!(ack["reason_code"], "duplicate_event");
    assert_eq!(h.responder.calls(), 1);
    assert_eq!(h.gateway.sent().len(), 1);

    let (_, snapshot) = get_json(&h.app, "/v1/conversations/CH1").await;
    assert_eq!(snapshot["history_len"], 2);
}

#[tokio::test]
async fn slow_responder_times_out_into_unavailable_fallback() {
    let mut cfg = test_config();
    cfg.responder.timeout_ms = 50;
    let h = harness_with(
        cfg.clone(),
        StubResponder::slow(Duration::from_millis(500)),
        StubGateway::default(),
    )
    .await;

    let (_, ack) = post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    assert_eq!(ack["success"], true);
    assert_eq!(ack["outcome"], "fallback");
    assert_eq!(ack["reason_code"], "responder_unavailable");
    assert_eq!(ack["agent_responded"], false);
    assert_eq!(h.gateway.sent()[0].1, cfg.fallback.unavailable);

    let (_, snapshot) = get_json(&h.app, "/v1/conversations/CH1").await;
    assert_eq!(snapshot["history_len"], 2);
    assert_eq!(snapshot["history"][0]["text"], "hello");
    assert_eq!(snapshot["history"][1]["text"], cfg.fallback.unavailable.as_str());
    assert_eq!(snapshot["state"], "eligible");
}

#[tokio::test]
async fn responder_failures_pick_their_fallback_text() {
    let cases = [
        (
            ResponderError::RateLimited,
            "responder_rate_limited",
            test_config().fallback.rate_limited,
        ),
        (
            ResponderError::TokenLimitExceeded,
            "responder_token_limit_exceeded",
            test_config().fallback.token_limit_exceeded,
        ),
        (
            ResponderError::Unknown("boom".to_string()),
            "responder_unknown_error",
            test_config().fallback.unknown,
        ),
    ];
    for (err, reason, text) in cases {
        let h = harness_with(
            test_config(),
            StubResponder::failing(err),
            StubGateway::default(),
        )
        .await;
        let (_, ack) = post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
        assert_eq!(ack["outcome"], "fallback");
        assert_eq!(ack["reason_code"], reason);
        assert_eq!(h.gateway.sent()[0].1, text);
    }
}

#[tokio::test]
async fn delivery_retries_transient_failures() {
    let h = harness_with(
        test_config(),
        StubResponder::replying(),
        StubGateway::failing_first(2),
    )
    .await;
    let (_, ack) = post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    assert_eq!(ack["delivered"], true);
    assert_eq!(h.gateway.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(h.gateway.sent().len(), 1);
}

#[tokio::test]
async fn exhausted_delivery_is_recorded_as_undelivered() {
    let h = harness_with(
        test_config(),
        StubResponder::replying(),
        StubGateway::failing_first(100),
    )
    .await;
    let (status, ack) = post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["success"], true);
    assert_eq!(ack["delivered"], false);
    assert_eq!(ack["reason_code"], "delivery_failed");
    assert_eq!(h.gateway.attempts.load(Ordering::SeqCst), 3);

    let audit = std::fs::read_to_string(&h.audit_path).unwrap();
    assert!(audit.contains("\"undelivered\""));

    // The event is settled; a redelivery does not retry the send.
    let (_, ack) = post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    assert_eq!(ack["outcome"], "duplicate");
    assert_eq!(h.gateway.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_messages_for_one_conversation_never_overlap() {
    let h = harness_with(
        test_config(),
        StubResponder::slow(Duration::from_millis(30)),
        StubGateway::default(),
    )
    .await;

    let mut tasks = Vec::new();
    for i in 0..5 {
        let app = h.app.clone();
        tasks.push(tokio::spawn(async move {
            post_webhook(
                &app,
                message("CH1", &format!("IM{i}"), "customer_1", &format!("message {i}")),
            )
            .await
        }));
    }
    for task in tasks {
        let (_, ack) = task.await.unwrap();
        assert_eq!(ack["outcome"], "replied");
    }

    assert_eq!(h.responder.calls(), 5);
    assert_eq!(h.responder.max_in_flight.load(Ordering::SeqCst), 1);
    let (_, snapshot) = get_json(&h.app, "/v1/conversations/CH1").await;
    assert_eq!(snapshot["history_len"], 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_conversations_are_processed_in_parallel() {
    let h = harness_with(
        test_config(),
        StubResponder::slow(Duration::from_millis(100)),
        StubGateway::default(),
    )
    .await;

    let mut tasks = Vec::new();
    for i in 0..3 {
        let app = h.app.clone();
        tasks.push(tokio::spawn(async move {
            post_webhook(&app, message(&format!("CH{i}"), "IM1", "customer_1", "hi")).await
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert!(h.responder.max_in_flight.load(Ordering::SeqCst) > 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_are_coalesced() {
    let h = harness_with(
        test_config(),
        StubResponder::slow(Duration::from_millis(30)),
        StubGateway::default(),
    )
    .await;
    let body = message("CH1", "IM1", "customer_1", "hello");

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let app = h.app.clone();
        let body = body.clone();
        tasks.push(tokio::spawn(async move { post_webhook(&app, body).await }));
    }
    let mut outcomes = Vec::new();
    for task in tasks {
        let (_, ack) = task.await.unwrap();
        outcomes.push(ack["outcome"].as_str().unwrap().to_string());
    }
    outcomes.sort();

    assert_eq!(h.responder.calls(), 1);
    assert_eq!(h.gateway.sent().len(), 1);
    assert_eq!(outcomes, vec!["duplicate", "duplicate", "duplicate", "replied"]);
}

#[tokio::test]
async fn history_is_capped_oldest_first() {
    let mut cfg = test_config();
    cfg.sessions.max_history = 4;
    let h = harness_with(cfg, StubResponder::replying(), StubGateway::default()).await;

    for i in 0..5 {
        post_webhook(
            &h.app,
            message("CH1", &format!("IM{i}"), "customer_1", &format!("message {i}")),
        )
        .await;
    }
    let (_, snapshot) = get_json(&h.app, "/v1/conversations/CH1").await;
    assert_eq!(snapshot["history_len"], 4);
    assert_eq!(snapshot["history"][0]["text"], "message 3");
    assert_eq!(snapshot["history"][3]["text"], "reply to: message 4");
}

#[tokio::test]
async fn closed_conversation_waits_for_operator_reenable() {
    let h = harness().await;
    post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;

    let (_, ack) = post_signed(
        &h.app,
        "/v1/webhooks/conversation-state-updated",
        "application/x-www-form-urlencoded",
        form(&[("ConversationSid", "CH1"), ("State", "closed")]),
    )
    .await;
    assert_eq!(ack["outcome"], "recorded");

    let (_, ack) = post_webhook(&h.app, message("CH1", "IM2", "customer_1", "still there?")).await;
    assert_eq!(ack["outcome"], "skipped");
    assert_eq!(ack["reason_code"], "automation_disabled");

    let (status, snapshot) = put_automation(&h.app, "CH1", true).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["state"], "new");

    let (_, ack) = post_webhook(&h.app, message("CH1", "IM3", "customer_1", "hello again")).await;
    assert_eq!(ack["outcome"], "replied");
    assert_eq!(h.responder.calls(), 2);
}

#[tokio::test]
async fn operator_can_disable_automation() {
    let h = harness().await;
    let (status, snapshot) = put_automation(&h.app, "CH9", false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["state"], "ineligible");

    let (_, ack) = post_webhook(&h.app, message("CH9", "IM1", "customer_1", "hello")).await;
    assert_eq!(ack["outcome"], "skipped");
    assert_eq!(ack["reason_code"], "automation_disabled");
    assert_eq!(h.responder.calls(), 0);

    // Skipped messages are settled like any other.
    let (_, ack) = post_webhook(&h.app, message("CH9", "IM1", "customer_1", "hello")).await;
    assert_eq!(ack["outcome"], "duplicate");
    let audit = std::fs::read_to_string(&h.audit_path).unwrap();
    assert!(audit.contains("\"skipped\""));
}

#[tokio::test]
async fn json_payloads_are_accepted() {
    let h = harness().await;
    let body = json!({
        "EventType": "onMessageAdd",
        "ConversationSid": "CH1",
        "MessageSid": "IM1",
        "Author": "customer_1",
        "Body": "check order 12345",
        "Index": 0
    })
    .to_string();
    let (status, ack) =
        post_signed(&h.app, "/v1/webhooks/conversations", "application/json", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "replied");
}

#[tokio::test]
async fn malformed_payload_is_acknowledged_with_validation_error() {
    let h = harness().await;
    let (status, ack) = post_webhook(
        &h.app,
        form(&[("EventType", "onMessageAdd"), ("Body", "no conversation")]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["success"], false);
    assert_eq!(ack["error_code"], "validation_error");
    assert_eq!(h.responder.calls(), 0);
}

#[tokio::test]
async fn own_and_empty_messages_are_skipped() {
    let h = harness().await;
    let (_, ack) =
        post_webhook(&h.app, message("CH1", "IM1", "assistant", "reply to: hello")).await;
    assert_eq!(ack["outcome"], "skipped");
    assert_eq!(ack["reason_code"], "own_message");

    let (_, ack) = post_webhook(&h.app, message("CH1", "IM2", "customer_1", "   ")).await;
    assert_eq!(ack["outcome"], "skipped");
    assert_eq!(ack["reason_code"], "empty_body");
    assert_eq!(h.responder.calls(), 0);
}

#[tokio::test]
async fn deferred_mode_acknowledges_before_processing() {
    let mut cfg = test_config();
    cfg.server.ack_mode = "deferred".to_string();
    let h = harness_with(cfg, StubResponder::replying(), StubGateway::default()).await;

    let (status, ack) = post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(ack["outcome"], "accepted");

    for _ in 0..100 {
        if !h.gateway.sent().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.responder.calls(), 1);
    assert_eq!(h.gateway.sent().len(), 1);
}

#[tokio::test]
async fn sqlite_store_keeps_sessions() {
    let mut cfg = test_config();
    cfg.store.kind = "sqlite".to_string();
    cfg.store.sqlite_path = Some(temp_path("store", "db"));
    let h = harness_with(cfg, StubResponder::replying(), StubGateway::default()).await;

    post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    let (_, ack) = post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    assert_eq!(ack["outcome"], "duplicate");

    let (_, snapshot) = get_json(&h.app, "/v1/conversations/CH1").await;
    assert_eq!(snapshot["history_len"], 2);
    let (_, ready) = get_json(&h.app, "/v1/readyz").await;
    assert_eq!(ready["store"], "sqlite");
}

#[tokio::test]
async fn expired_session_starts_fresh() {
    let mut cfg = test_config();
    cfg.sessions.timeout_ms = 50;
    let h = harness_with(cfg, StubResponder::replying(), StubGateway::default()).await;

    post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    let (status, _) = get_json(&h.app, "/v1/conversations/CH1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, ack) = post_webhook(&h.app, message("CH1", "IM2", "customer_1", "back again")).await;
    assert_eq!(ack["outcome"], "replied");
    let (_, snapshot) = get_json(&h.app, "/v1/conversations/CH1").await;
    assert_eq!(snapshot["history_len"], 2);
}

#[tokio::test]
async fn audit_chain_verifies_after_traffic() {
    let h = harness().await;
    post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    post_webhook(&h.app, message("CH1", "IM2", "assistant", "echo")).await;

    let report = verify_audit_chain(&h.audit_path).unwrap();
    assert_eq!(report, "audit chain verified: 3 records");
}

#[tokio::test]
async fn typing_indicator_brackets_the_reply() {
    let h = harness().await;
    post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    assert_eq!(
        h.gateway.typing(),
        vec![
            ("CH1".to_string(), "MB1".to_string(), true),
            ("CH1".to_string(), "MB1".to_string(), false),
        ]
    );
}

#[tokio::test]
async fn typing_indicator_is_cleared_after_a_fallback() {
    let h = harness_with(
        test_config(),
        StubResponder::failing(ResponderError::RateLimited),
        StubGateway::default(),
    )
    .await;
    let (_, ack) = post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    assert_eq!(ack["outcome"], "fallback");
    assert_eq!(
        h.gateway.typing(),
        vec![
            ("CH1".to_string(), "MB1".to_string(), true),
            ("CH1".to_string(), "MB1".to_string(), false),
        ]
    );
}

#[tokio::test]
async fn typing_indicator_needs_config_and_participant() {
    let mut cfg = test_config();
    cfg.delivery.typing_indicator = false;
    let h = harness_with(cfg, StubResponder::replying(), StubGateway::default()).await;
    let (_, ack) = post_webhook(&h.app, message("CH1", "IM1", "customer_1", "hello")).await;
    assert_eq!(ack["outcome"], "replied");
    assert!(h.gateway.typing().is_empty());

    let h = harness().await;
    let (_, ack) = post_webhook(
        &h.app,
        form(&[
            ("EventType", "onMessageAdd"),
            ("ConversationSid", "CH2"),
            ("MessageSid", "IM1"),
            ("Author", "customer_1"),
            ("Body", "hello"),
        ]),
    )
    .await;
    assert_eq!(ack["outcome"], "replied");
    assert!(h.gateway.typing().is_empty());
}

