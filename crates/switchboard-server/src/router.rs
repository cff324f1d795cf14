use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use switchboard_config::Config;
use switchboard_contracts::{
    EventType, InboundEvent, Message, Outcome, Role, SessionSnapshot, WebhookAck,
};
use switchboard_kernel::{
    decide_message, ConversationSession, Decision, FallbackMessages, SessionPolicy,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditJsonl, AuditRecord};
use crate::delivery::{deliver_with_retry, DeliveryGateway, RetryPolicy};
use crate::responder::{Responder, ResponderError, ResponderRequest};
use crate::store::{ConversationLocks, StoreBackend, StoreError};

/// Routes verified inbound events through the session state machine, the
/// responder and the delivery gateway.
pub struct WebhookRouter {
    store: Mutex<StoreBackend>,
    locks: ConversationLocks,
    audit: AuditJsonl,
    responder: Arc<dyn Responder>,
    gateway: Arc<dyn DeliveryGateway>,
    policy: SessionPolicy,
    fallback: FallbackMessages,
    retry: RetryPolicy,
    responder_timeout: Duration,
    typing_indicator: bool,
}

/// Reply text chosen for a message event, before delivery.
struct Reply {
    text: String,
    outcome: Outcome,
    reason_code: &'static str,
}

impl WebhookRouter {
    pub async fn new(
        cfg: &Config,
        responder: Arc<dyn Responder>,
        gateway: Arc<dyn DeliveryGateway>,
    ) -> Result<Self, String> {
        let store = StoreBackend::open(&cfg.store).map_err(|e| e.to_string())?;
        let audit = AuditJsonl::new(
            &cfg.audit.jsonl_path,
            cfg.store.sqlite_path.as_deref(),
            cfg.audit.immutable_mirror_path.as_deref(),
        )
        .await?;

        Ok(Self {
            store: Mutex::new(store),
            locks: ConversationLocks::default(),
            audit,
            responder,
            gateway,
            policy: SessionPolicy {
                max_history: cfg.sessions.max_history,
                timeout_ms: cfg.sessions.timeout_ms,
                max_processed_ids: cfg.sessions.max_processed_ids,
                human_agent_prefix: cfg.sessions.human_agent_prefix.clone(),
                assistant_author: cfg.delivery.author.clone(),
            },
            fallback: FallbackMessages {
                rate_limited: cfg.fallback.rate_limited.clone(),
                unavailable: cfg.fallback.unavailable.clone(),
                token_limit_exceeded: cfg.fallback.token_limit_exceeded.clone(),
                unknown: cfg.fallback.unknown.clone(),
            },
            retry: RetryPolicy {
                max_attempts: cfg.delivery.retry_max_attempts,
                backoff: Duration::from_millis(cfg.delivery.retry_backoff_ms),
                attempt_timeout: Duration::from_millis(cfg.delivery.timeout_ms),
            },
            responder_timeout: Duration::from_millis(cfg.responder.timeout_ms),
            typing_indicator: cfg.delivery.typing_indicator,
        })
    }

    pub fn responder_kind(&self) -> &'static str {
        self.responder.kind()
    }

    pub async fn store_kind(&self) -> &'static str {
        self.store.lock().await.kind()
    }

    /// Processes one event end to end. Never fails: store errors become an
    /// `internal_error` acknowledgement.
    pub async fn handle(&self, event: InboundEvent) -> WebhookAck {
        let started = Instant::now();
        let lock = self.locks.acquire(&event.conversation_id);
        let _guard = lock.lock().await;

        let mut ack = match self.process(&event).await {
            Ok(ack) => ack,
            Err(e) => {
                error!(
                    event_name = "webhook.store_failed",
                    conversation_id = %event.conversation_id,
                    event_id = %event.event_id,
                    error = %e,
                    "session store failed while handling webhook"
                );
                self.audit
                    .append(AuditRecord::new(
                        &event.conversation_id,
                        &event.event_id,
                        event.event_type.as_str(),
                        "error",
                        "internal_error",
                    ))
                    .await;
                WebhookAck::failed("internal_error", "session store unavailable")
            }
        };
        ack.processing_time_ms = Some(started.elapsed().as_millis() as u64);
        ack
    }

    async fn process(&self, event: &InboundEvent) -> Result<WebhookAck, StoreError> {
        let now = Utc::now();
        let mut session = self.load_session(&event.conversation_id, now).await?;

        if session.has_processed(&event.event_id) {
            info!(
                event_name = "webhook.duplicate",
                conversation_id = %event.conversation_id,
                event_id = %event.event_id,
                "event already processed"
            );
            self.audit
                .append(AuditRecord::new(
                    &event.conversation_id,
                    &event.event_id,
                    event.event_type.as_str(),
                    "duplicate",
                    "duplicate_event",
                ))
                .await;
            return Ok(WebhookAck::outcome(Outcome::Duplicate, "event already processed")
                .with_reason("duplicate_event"));
        }

        match event.event_type {
            EventType::MessageAdded => self.on_message(session, event, now).await,
            EventType::ParticipantAdded => {
                if !session.note_participant_added(event, &self.policy) {
                    return Ok(WebhookAck::failed(
                        "validation_error",
                        "Identity or ParticipantSid is required",
                    ));
                }
                self.record(session, event, now, "participant_added").await
            }
            EventType::ParticipantRemoved => {
                if !session.note_participant_removed(event) {
                    return Ok(WebhookAck::failed(
                        "validation_error",
                        "Identity or ParticipantSid is required",
                    ));
                }
                self.record(session, event, now, "participant_removed").await
            }
            EventType::StateUpdated => {
                let Some(state) = event.state.as_deref() else {
                    return Ok(WebhookAck::failed("validation_error", "State is required"));
                };
                session.apply_conversation_state(state);
                self.record(session, event, now, "state_updated").await
            }
        }
    }

    /// Persists a non-message event and acknowledges it as recorded.
    async fn record(
        &self,
        mut session: ConversationSession,
        event: &InboundEvent,
        now: DateTime<Utc>,
        reason_code: &str,
    ) -> Result<WebhookAck, StoreError> {
        session.touch(now);
        session.mark_processed(&event.event_id, self.policy.max_processed_ids);
        self.save(&session).await?;

        info!(
            event_name = "webhook.recorded",
            conversation_id = %event.conversation_id,
            event_id = %event.event_id,
            event_type = event.event_type.as_str(),
            participant_count = session.participant_count(),
            eligible = session.is_eligible(),
            "conversation event recorded"
        );
        self.audit
            .append(AuditRecord::new(
                &event.conversation_id,
                &event.event_id,
                event.event_type.as_str(),
                "recorded",
                reason_code,
            ))
            .await;
        Ok(WebhookAck::outcome(Outcome::Recorded, "event recorded").with_reason(reason_code))
    }

    async fn on_message(
        &self,
        mut session: ConversationSession,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookAck, StoreError> {
        session.note_customer(event, &self.policy);
        session.touch(now);

        let decision = match decide_message(&session, event, &self.policy) {
            Decision::Respond if !session.begin_processing() => {
                Decision::Skip("automation_disabled")
            }
            decision => decision,
        };
        if let Decision::Skip(reason) = decision {
            session.mark_processed(&event.event_id, self.policy.max_processed_ids);
            self.save(&session).await?;
            info!(
                event_name = "webhook.skipped",
                conversation_id = %event.conversation_id,
                event_id = %event.event_id,
                reason_code = reason,
                "message not answered"
            );
            self.audit
                .append(AuditRecord::new(
                    &event.conversation_id,
                    &event.event_id,
                    event.event_type.as_str(),
                    "skipped",
                    reason,
                ))
                .await;
            return Ok(WebhookAck::outcome(Outcome::Skipped, "message not answered")
                .with_reason(reason));
        }

        self.save(&session).await?;

        let body = event.body.clone().unwrap_or_default();
        let typing = self.start_typing(event);
        let reply = self
            .invoke_responder(ResponderRequest {
                conversation_id: event.conversation_id.clone(),
                message: body.clone(),
                history: session.history_window(self.policy.max_history),
            })
            .await;
        self.stop_typing(event, typing).await;

        let replied_at = Utc::now();
        session.push_message(
            Message {
                role: Role::Customer,
                text: body,
                timestamp: event.received_at.clone(),
            },
            self.policy.max_history,
        );
        session.push_message(
            Message {
                role: Role::Assistant,
                text: reply.text.clone(),
                timestamp: replied_at.to_rfc3339(),
            },
            self.policy.max_history,
        );
        session.finish_processing();
        session.mark_processed(&event.event_id, self.policy.max_processed_ids);
        session.touch(replied_at);
        self.save(&session).await?;

        let report = deliver_with_retry(
            self.gateway.as_ref(),
            &self.retry,
            &event.conversation_id,
            &reply.text,
            &self.policy.assistant_author,
        )
        .await;

        let mut ack = WebhookAck::outcome(reply.outcome, "message processed");
        ack.agent_responded = reply.outcome == Outcome::Replied;
        match report.result {
            Ok(receipt) => {
                info!(
                    event_name = "webhook.delivered",
                    conversation_id = %event.conversation_id,
                    event_id = %event.event_id,
                    outcome = ?reply.outcome,
                    attempts = report.attempts,
                    provider_message_id = receipt.message_id.as_deref().unwrap_or(""),
                    "reply delivered"
                );
                self.audit
                    .append(AuditRecord::new(
                        &event.conversation_id,
                        &event.event_id,
                        event.event_type.as_str(),
                        outcome_label(reply.outcome),
                        reply.reason_code,
                    ))
                    .await;
                ack.delivered = Some(true);
                Ok(ack.with_reason(reply.reason_code))
            }
            Err(e) => {
                error!(
                    event_name = "webhook.undelivered",
                    conversation_id = %event.conversation_id,
                    event_id = %event.event_id,
                    attempts = report.attempts,
                    error = %e,
                    "reply could not be delivered"
                );
                self.audit
                    .append(AuditRecord::new(
                        &event.conversation_id,
                        &event.event_id,
                        event.event_type.as_str(),
                        "undelivered",
                        "delivery_failed",
                    ))
                    .await;
                ack.delivered = Some(false);
                Ok(ack.with_reason("delivery_failed"))
            }
        }
    }

    async fn invoke_responder(&self, request: ResponderRequest) -> Reply {
        let conversation_id = request.conversation_id.clone();
        let result = match timeout(self.responder_timeout, self.responder.respond(request)).await {
            Ok(result) => result,
            Err(_) => Err(ResponderError::Timeout(
                self.responder_timeout.as_millis() as u64
            )),
        };

        match result {
            Ok(reply) => {
                debug!(
                    event_name = "responder.replied",
                    conversation_id = %conversation_id,
                    responder = self.responder.kind(),
                    tool_invocations = reply.tool_invocations.len(),
                    "responder produced a reply"
                );
                Reply {
                    text: reply.text,
                    outcome: Outcome::Replied,
                    reason_code: "responded",
                }
            }
            Err(e) => {
                let kind = e.failure_kind();
                warn!(
                    event_name = "responder.failed",
                    conversation_id = %conversation_id,
                    responder = self.responder.kind(),
                    reason_code = kind.reason_code(),
                    error = %e,
                    "responder failed; sending fallback"
                );
                Reply {
                    text: self.fallback.text_for(kind).to_string(),
                    outcome: Outcome::Fallback,
                    reason_code: kind.reason_code(),
                }
            }
        }
    }

    fn start_typing(&self, event: &InboundEvent) -> Option<JoinHandle<()>> {
        let participant_id = event.participant_id.clone().filter(|_| self.typing_indicator)?;
        let gateway = Arc::clone(&self.gateway);
        let conversation_id = event.conversation_id.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = gateway
                .set_typing(&conversation_id, &participant_id, true)
                .await
            {
                debug!(
                    event_name = "typing.failed",
                    conversation_id = %conversation_id,
                    error = %e,
                    "typing indicator not set"
                );
            }
        }))
    }

    /// Waits for the typing-on call so the off call cannot overtake it.
    async fn stop_typing(&self, event: &InboundEvent, started: Option<JoinHandle<()>>) {
        let Some(handle) = started else {
            return;
        };
        let _ = handle.await;
        let Some(participant_id) = event.participant_id.as_deref() else {
            return;
        };
        if let Err(e) = self
            .gateway
            .set_typing(&event.conversation_id, participant_id, false)
            .await
        {
            debug!(
                event_name = "typing.failed",
                conversation_id = %event.conversation_id,
                error = %e,
                "typing indicator not cleared"
            );
        }
    }

    /// Loads the session, discarding it when idle past the timeout.
    async fn load_session(
        &self,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ConversationSession, StoreError> {
        let mut store = self.store.lock().await;
        match store.get_session(conversation_id)? {
            Some(session) if session.is_expired(now, self.policy.timeout_ms) => {
                store.remove_session(conversation_id)?;
                info!(
                    event_name = "session.expired",
                    conversation_id,
                    "idle session discarded"
                );
                Ok(ConversationSession::new(conversation_id, now))
            }
            Some(session) => Ok(session),
            None => Ok(ConversationSession::new(conversation_id, now)),
        }
    }

    async fn save(&self, session: &ConversationSession) -> Result<(), StoreError> {
        self.store.lock().await.save_session(session)
    }

    pub async fn snapshot(
        &self,
        conversation_id: &str,
    ) -> Result<Option<SessionSnapshot>, StoreError> {
        let now = Utc::now();
        let session = self.store.lock().await.get_session(conversation_id)?;
        Ok(session
            .filter(|s| !s.is_expired(now, self.policy.timeout_ms))
            .map(|s| s.snapshot()))
    }

    /// Operator override of automation for one conversation.
    pub async fn set_automation(
        &self,
        conversation_id: &str,
        enabled: bool,
    ) -> Result<SessionSnapshot, StoreError> {
        let lock = self.locks.acquire(conversation_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut session = self.load_session(conversation_id, now).await?;
        session.set_automation(enabled);
        session.touch(now);
        self.save(&session).await?;

        let result = if enabled { "enabled" } else { "disabled" };
        info!(
            event_name = "automation.changed",
            conversation_id,
            enabled,
            "operator changed automation"
        );
        self.audit
            .append(AuditRecord::new(
                conversation_id,
                "operator",
                "automation",
                result,
                "operator_override",
            ))
            .await;
        Ok(session.snapshot())
    }

    /// Purges sessions idle past the timeout. Returns how many were dropped.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let cutoff =
            Utc::now() - chrono::Duration::milliseconds(self.policy.timeout_ms as i64);
        self.store.lock().await.purge_idle_before(cutoff)
    }

    /// Records a webhook rejected before it reached the state machine.
    pub(crate) async fn record_rejection(&self, conversation_id: &str, reason_code: &str) {
        self.audit
            .append(AuditRecord::new(
                conversation_id,
                "unverified",
                "webhook",
                "rejected",
                reason_code,
            ))
            .await;
    }
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Accepted => "accepted",
        Outcome::Replied => "replied",
        Outcome::Fallback => "fallback",
        Outcome::Skipped => "skipped",
        Outcome::Duplicate => "duplicate",
        Outcome::Recorded => "recorded",
    }
}
