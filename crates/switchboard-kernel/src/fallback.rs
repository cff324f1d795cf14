/// Class of responder failure, used to pick the customer-facing fallback text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Unavailable,
    TokenLimitExceeded,
    Unknown,
}

impl FailureKind {
    pub fn reason_code(self) -> &'static str {
        match self {
            FailureKind::RateLimited => "responder_rate_limited",
            FailureKind::Unavailable => "responder_unavailable",
            FailureKind::TokenLimitExceeded => "responder_token_limit_exceeded",
            FailureKind::Unknown => "responder_unknown_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackMessages {
    pub rate_limited: String,
    pub unavailable: String,
    pub token_limit_exceeded: String,
    pub unknown: String,
}

impl FallbackMessages {
    pub fn text_for(&self, kind: FailureKind) -> &str {
        match kind {
            FailureKind::RateLimited => &self.rate_limited,
            FailureKind::Unavailable => &self.unavailable,
            FailureKind::TokenLimitExceeded => &self.token_limit_exceeded,
            FailureKind::Unknown => &self.unknown,
        }
    }
}
