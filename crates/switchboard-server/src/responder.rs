use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use switchboard_contracts::{AgentReply, Message, Role, ToolInvocation};
use switchboard_kernel::FailureKind;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResponderError {
    #[error("responder rate limited")]
    RateLimited,
    #[error("responder unavailable: {0}")]
    Unavailable(String),
    #[error("responder timed out after {0}ms")]
    Timeout(u64),
    #[error("responder token limit exceeded")]
    TokenLimitExceeded,
    #[error("responder failed: {0}")]
    Unknown(String),
}

impl ResponderError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ResponderError::RateLimited => FailureKind::RateLimited,
            ResponderError::Unavailable(_) | ResponderError::Timeout(_) => {
                FailureKind::Unavailable
            }
            ResponderError::TokenLimitExceeded => FailureKind::TokenLimitExceeded,
            ResponderError::Unknown(_) => FailureKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponderRequest {
    pub conversation_id: String,
    pub message: String,
    pub history: Vec<Message>,
}

/// The language-model side of the relay.
#[async_trait]
pub trait Responder: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn respond(&self, request: ResponderRequest) -> Result<AgentReply, ResponderError>;
}

pub fn build_responder(
    cfg: &switchboard_config::Responder,
    api_key: Option<SecretString>,
) -> Result<Arc<dyn Responder>, String> {
    let client = Client::builder()
        .timeout(Duration::from_millis(cfg.timeout_ms))
        .build()
        .map_err(|e| e.to_string())?;
    let endpoint = cfg
        .endpoint
        .clone()
        .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

    match cfg.kind.as_str() {
        "openai" => {
            let api_key =
                api_key.ok_or_else(|| "responder.api_key_env did not resolve".to_string())?;
            let model = cfg
                .model
                .clone()
                .ok_or_else(|| "responder.model is required for openai".to_string())?;
            Ok(Arc::new(OpenAiResponder {
                client,
                base_url: endpoint.trim_end_matches('/').to_string(),
                api_key,
                model,
                max_tokens: cfg.max_tokens,
                temperature: cfg.temperature,
                instructions: cfg.instructions.clone(),
            }))
        }
        "agent_http" => Ok(Arc::new(AgentHttpResponder {
            client,
            endpoint,
            api_key,
        })),
        other => Err(format!("unsupported responder kind {other}")),
    }
}

/// OpenAI-compatible chat completions.
pub struct OpenAiResponder {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    temperature: f64,
    instructions: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    function: ChatFunction,
}

#[derive(Debug, Deserialize)]
struct ChatFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl OpenAiResponder {
    fn request_body(&self, request: &ResponderRequest) -> Value {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if !self.instructions.trim().is_empty() {
            messages.push(json!({"role": "system", "content": self.instructions}));
        }
        for entry in &request.history {
            let role = match entry.role {
                Role::Customer => "user",
                Role::Assistant => "assistant",
            };
            messages.push(json!({"role": role, "content": entry.text}));
        }
        messages.push(json!({"role": "user", "content": request.message}));

        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        })
    }
}

#[async_trait]
impl Responder for OpenAiResponder {
    fn kind(&self) -> &'static str {
        "openai"
    }

    async fn respond(&self, request: ResponderRequest) -> Result<AgentReply, ResponderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&self.request_body(&request))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| ResponderError::Unknown(format!("completion decode failed: {e}")))?;
        interpret_completion(completion)
    }
}

fn interpret_completion(completion: ChatCompletion) -> Result<AgentReply, ResponderError> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ResponderError::Unknown("completion had no choices".to_string()))?;

    if choice.finish_reason.as_deref() == Some("length") {
        return Err(ResponderError::TokenLimitExceeded);
    }
    let text = choice.message.content.unwrap_or_default();
    let tool_invocations: Vec<ToolInvocation> = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| ToolInvocation {
            name: call.function.name,
            result: call.function.arguments,
        })
        .collect();
    if text.trim().is_empty() {
        if !tool_invocations.is_empty() {
            return Err(ResponderError::Unknown(
                "model requested tool calls without a reply".to_string(),
            ));
        }
        return Err(ResponderError::Unknown("completion was empty".to_string()));
    }
    Ok(AgentReply {
        text,
        tool_invocations,
        error: None,
    })
}

/// A separately deployed agent framework that speaks plain JSON:
/// `ResponderRequest` in, `AgentReply` out.
pub struct AgentHttpResponder {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

#[async_trait]
impl Responder for AgentHttpResponder {
    fn kind(&self) -> &'static str {
        "agent_http"
    }

    async fn respond(&self, request: ResponderRequest) -> Result<AgentReply, ResponderError> {
        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }
        let response = builder.send().await.map_err(classify_transport)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let reply: AgentReply = response
            .json()
            .await
            .map_err(|e| ResponderError::Unknown(format!("agent reply decode failed: {e}")))?;
        interpret_agent_reply(reply)
    }
}

/// An `error` field wins over any text the agent also sent.
fn interpret_agent_reply(reply: AgentReply) -> Result<AgentReply, ResponderError> {
    match reply.error.as_deref() {
        Some(code) => Err(classify_agent_error(code)),
        None if reply.text.trim().is_empty() => {
            Err(ResponderError::Unknown("agent reply was empty".to_string()))
        }
        None => Ok(reply),
    }
}

fn classify_transport(err: reqwest::Error) -> ResponderError {
    if err.is_timeout() {
        ResponderError::Unavailable("request timed out".to_string())
    } else {
        ResponderError::Unavailable(err.to_string())
    }
}

pub(crate) fn classify_status(status: u16, body: &str) -> ResponderError {
    let lowered = body.to_ascii_lowercase();
    if lowered.contains("context_length_exceeded") || lowered.contains("maximum context length")
    {
        return ResponderError::TokenLimitExceeded;
    }
    match status {
        429 => ResponderError::RateLimited,
        408 | 500..=599 => ResponderError::Unavailable(format!("status {status}")),
        _ => ResponderError::Unknown(format!("status {status}")),
    }
}

fn classify_agent_error(code: &str) -> ResponderError {
    match code {
        "rate_limited" => ResponderError::RateLimited,
        "unavailable" => ResponderError::Unavailable("agent reported unavailable".to_string()),
        "token_limit_exceeded" => ResponderError::TokenLimitExceeded,
        other => ResponderError::Unknown(other.to_string()),
    }
}
