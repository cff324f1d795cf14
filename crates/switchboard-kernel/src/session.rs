use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchboard_contracts::{InboundEvent, Message, SessionSnapshot, SessionState};

/// Placeholder identity for customers whose messages carry no author.
const ANONYMOUS_CUSTOMER: &str = "customer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPolicy {
    pub max_history: usize,
    pub timeout_ms: u64,
    pub max_processed_ids: usize,
    pub human_agent_prefix: String,
    /// Author label the automation posts under. Never counted as a participant.
    pub assistant_author: String,
}

/// Per-conversation automation state.
///
/// Eligible for automation only while exactly one participant is known and
/// the eligibility flag is set. `Ineligible` is terminal until an operator
/// calls [`ConversationSession::set_automation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub conversation_id: String,
    pub state: SessionState,
    pub eligibility_flag: bool,
    pub participants: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub history: VecDeque<Message>,
    pub processed_event_ids: VecDeque<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Respond,
    Skip(&'static str),
}

impl ConversationSession {
    pub fn new(conversation_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            state: SessionState::New,
            eligibility_flag: true,
            participants: BTreeSet::new(),
            created_at: now,
            last_activity_at: now,
            history: VecDeque::new(),
            processed_event_ids: VecDeque::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, timeout_ms: u64) -> bool {
        let idle = now.signed_duration_since(self.last_activity_at);
        idle.num_milliseconds() > timeout_ms as i64
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_eligible(&self) -> bool {
        self.state != SessionState::Ineligible
            && self.eligibility_flag
            && self.participant_count() == 1
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
        if self.state == SessionState::New && self.is_eligible() {
            self.state = SessionState::Eligible;
        }
    }

    /// Records the author of a customer message as a participant.
    ///
    /// Participants are keyed by `ParticipantSid` when the provider sends one,
    /// so a join event and the messages that follow agree on who is who.
    pub fn note_customer(&mut self, event: &InboundEvent, policy: &SessionPolicy) {
        let Some(key) = event.participant_id.as_deref().or(event.author.as_deref()) else {
            self.add_participant(ANONYMOUS_CUSTOMER, None, policy);
            return;
        };
        // The placeholder stood for this customer's earlier unattributed messages.
        if self.participants.len() == 1 && self.participants.contains(ANONYMOUS_CUSTOMER) {
            self.participants.clear();
        }
        self.add_participant(key, event.author.as_deref(), policy);
    }

    /// Applies a participant-added event. Returns false when it names nobody.
    pub fn note_participant_added(&mut self, event: &InboundEvent, policy: &SessionPolicy) -> bool {
        match event.participant_id.as_deref().or(event.identity.as_deref()) {
            Some(key) => {
                self.add_participant(key, event.identity.as_deref(), policy);
                true
            }
            None => false,
        }
    }

    /// Applies a participant-removed event. Returns false when it names nobody.
    pub fn note_participant_removed(&mut self, event: &InboundEvent) -> bool {
        match event.participant_id.as_deref().or(event.identity.as_deref()) {
            Some(key) => {
                self.remove_participant(key);
                true
            }
            None => false,
        }
    }

    /// Adds a participant under `key`. `identity` is the human-readable name
    /// checked against the assistant author and the human agent prefix; the
    /// key itself is checked when no identity is known.
    pub fn add_participant(&mut self, key: &str, identity: Option<&str>, policy: &SessionPolicy) {
        let name = identity.unwrap_or(key);
        if name == policy.assistant_author {
            return;
        }
        if !policy.human_agent_prefix.is_empty() && name.starts_with(&policy.human_agent_prefix) {
            self.eligibility_flag = false;
        }
        self.participants.insert(key.to_string());
        self.refresh_eligibility();
    }

    /// Removing a participant never restores automation on its own.
    pub fn remove_participant(&mut self, key: &str) {
        self.participants.remove(key);
    }

    /// Applies a provider conversation state; anything but `active` disables automation.
    pub fn apply_conversation_state(&mut self, state: &str) {
        if !state.eq_ignore_ascii_case("active") {
            self.eligibility_flag = false;
            self.refresh_eligibility();
        }
    }

    /// Operator override. Re-enabling forgets the known participants so the
    /// next customer message re-establishes the single-participant rule.
    pub fn set_automation(&mut self, enabled: bool) {
        if enabled {
            self.eligibility_flag = true;
            self.participants.clear();
            self.state = SessionState::New;
        } else {
            self.eligibility_flag = false;
            self.state = SessionState::Ineligible;
        }
    }

    /// `ELIGIBLE -> PROCESSING`. Returns false when the session cannot be processed.
    pub fn begin_processing(&mut self) -> bool {
        if !self.is_eligible() {
            return false;
        }
        self.state = SessionState::Processing;
        true
    }

    /// `PROCESSING -> ELIGIBLE`.
    pub fn finish_processing(&mut self) {
        if self.state == SessionState::Processing {
            self.state = SessionState::Eligible;
        }
        self.refresh_eligibility();
    }

    /// Appends to history, evicting the oldest entries beyond `max_history`.
    pub fn push_message(&mut self, message: Message, max_history: usize) {
        self.history.push_back(message);
        while self.history.len() > max_history {
            self.history.pop_front();
        }
    }

    /// The most recent `max` history entries, oldest first.
    pub fn history_window(&self, max: usize) -> Vec<Message> {
        let skip = self.history.len().saturating_sub(max);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn has_processed(&self, event_id: &str) -> bool {
        self.processed_event_ids.iter().any(|id| id == event_id)
    }

    pub fn mark_processed(&mut self, event_id: &str, max_ids: usize) {
        if self.has_processed(event_id) {
            return;
        }
        self.processed_event_ids.push_back(event_id.to_string());
        while self.processed_event_ids.len() > max_ids {
            self.processed_event_ids.pop_front();
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            conversation_id: self.conversation_id.clone(),
            state: self.state,
            eligible: self.is_eligible(),
            participant_count: self.participant_count(),
            history_len: self.history.len(),
            created_at: self.created_at.to_rfc3339(),
            last_activity_at: self.last_activity_at.to_rfc3339(),
            history: self.history.iter().cloned().collect(),
        }
    }

    fn refresh_eligibility(&mut self) {
        if !self.eligibility_flag || self.participant_count() > 1 {
            self.state = SessionState::Ineligible;
        }
    }
}

/// Decides whether a message-added event should reach the responder.
/// Call after [`ConversationSession::note_customer`].
pub fn decide_message(
    session: &ConversationSession,
    event: &InboundEvent,
    policy: &SessionPolicy,
) -> Decision {
    if event.author.as_deref() == Some(policy.assistant_author.as_str()) {
        return Decision::Skip("own_message");
    }
    if event
        .body
        .as_deref()
        .map(|b| b.trim().is_empty())
        .unwrap_or(true)
    {
        return Decision::Skip("empty_body");
    }
    if session.participant_count() > 1 {
        return Decision::Skip("multiple_participants");
    }
    if !session.eligibility_flag || session.state == SessionState::Ineligible {
        return Decision::Skip("automation_disabled");
    }
    Decision::Respond
}
