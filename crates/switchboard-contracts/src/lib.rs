use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "1.0.0";

/// Provider event kinds the router understands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MessageAdded,
    ParticipantAdded,
    ParticipantRemoved,
    StateUpdated,
}

impl EventType {
    /// Accepts both the provider's `onXxx` names and our own snake_case names.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "onMessageAdd" | "onMessageAdded" | "message_added" => Some(Self::MessageAdded),
            "onParticipantAdd" | "onParticipantAdded" | "participant_added" => {
                Some(Self::ParticipantAdded)
            }
            "onParticipantRemove" | "onParticipantRemoved" | "participant_removed" => {
                Some(Self::ParticipantRemoved)
            }
            "onConversationStateUpdate" | "onConversationStateUpdated" | "state_updated" => {
                Some(Self::StateUpdated)
            }
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageAdded => "message_added",
            Self::ParticipantAdded => "participant_added",
            Self::ParticipantRemoved => "participant_removed",
            Self::StateUpdated => "state_updated",
        }
    }
}

/// Webhook fields as the provider posts them (form or JSON, PascalCase keys).
/// Unknown keys are ignored; providers add fields without notice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "EventType", default)]
    pub event_type: Option<String>,
    #[serde(rename = "AccountSid", default)]
    pub account_id: Option<String>,
    #[serde(rename = "ServiceSid", default)]
    pub service_id: Option<String>,
    #[serde(rename = "ConversationSid", default)]
    pub conversation_id: Option<String>,
    #[serde(rename = "MessageSid", default)]
    pub message_id: Option<String>,
    #[serde(rename = "ParticipantSid", default)]
    pub participant_id: Option<String>,
    #[serde(rename = "Author", default)]
    pub author: Option<String>,
    #[serde(rename = "Body", default)]
    pub body: Option<String>,
    #[serde(rename = "Identity", default)]
    pub identity: Option<String>,
    #[serde(rename = "State", default)]
    pub state: Option<String>,
}

impl WebhookPayload {
    /// Converts the wire payload into an immutable [`InboundEvent`].
    ///
    /// `default_type` is used when the payload carries no `EventType` (the
    /// per-event webhook routes). `fallback_event_id` is used when the payload
    /// has no message id. `WebhookSid` names the webhook configuration, not the
    /// delivery, so it is never used as an event id.
    pub fn into_event(
        self,
        default_type: Option<EventType>,
        fallback_event_id: String,
        received_at: String,
    ) -> Result<InboundEvent, String> {
        let event_type = match self.event_type.as_deref() {
            Some(raw) => {
                EventType::from_wire(raw).ok_or_else(|| format!("unsupported EventType {raw}"))?
            }
            None => default_type.ok_or_else(|| "EventType is required".to_string())?,
        };
        let conversation_id = non_empty(self.conversation_id)
            .ok_or_else(|| "ConversationSid is required".to_string())?;
        let event_id = non_empty(self.message_id).unwrap_or(fallback_event_id);

        Ok(InboundEvent {
            event_id,
            event_type,
            conversation_id,
            author: non_empty(self.author),
            body: self.body,
            participant_id: non_empty(self.participant_id),
            identity: non_empty(self.identity),
            state: non_empty(self.state),
            received_at,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub conversation_id: String,
    pub author: Option<String>,
    pub body: Option<String>,
    pub participant_id: Option<String>,
    pub identity: Option<String>,
    pub state: Option<String>,
    pub received_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolInvocation {
    pub name: String,
    pub result: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentReply {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_invocations: Vec<ToolInvocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    New,
    Eligible,
    Processing,
    Ineligible,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Replied,
    Fallback,
    Skipped,
    Duplicate,
    Recorded,
}

/// Body returned to the provider for every webhook call that passed the
/// signature check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookAck {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub agent_responded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

impl WebhookAck {
    pub fn outcome(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            outcome: Some(outcome),
            agent_responded: false,
            delivered: None,
            reason_code: None,
            error_code: None,
            processing_time_ms: None,
        }
    }

    pub fn failed(error_code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            outcome: None,
            agent_responded: false,
            delivered: None,
            reason_code: None,
            error_code: Some(error_code.to_string()),
            processing_time_ms: None,
        }
    }

    pub fn with_reason(mut self, reason_code: &str) -> Self {
        self.reason_code = Some(reason_code.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub conversation_id: String,
    pub state: SessionState,
    pub eligible: bool,
    pub participant_count: usize,
    pub history_len: usize,
    pub created_at: String,
    pub last_activity_at: String,
    pub history: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutomationToggle {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}
