use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::offer::OfferStatus;

pub const MAX_CONTENT_LENGTH: usize = 2_000;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
    Blocked,
}

impl ConversationStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Blocked => "blocked",
        }
    }
}

/// Type-specific part of a message. Serialized inline with the message under
/// a `type` tag, so an offer looks like
/// `{"type":"offer","offer_price":80.0,"offer_status":"pending",...}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Text,
    Image {
        image_url: String,
    },
    Offer {
        offer_price: f64,
        offer_status: OfferStatus,
        /// Offer this one answers, set on counter-offers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        counter_of: Option<String>,
    },
    System,
}

impl MessagePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image { .. } => "image",
            Self::Offer { .. } => "offer",
            Self::System => "system",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReceipt {
    pub user_id: String,
    pub read_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(flatten)]
    pub payload: MessagePayload,
    pub read_by: Vec<ReadReceipt>,
    pub created_at_ms: i64,
}

impl Message {
    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.iter().any(|receipt| receipt.user_id == user_id)
    }

    fn is_unread_for(&self, user_id: &str) -> bool {
        self.sender_id != user_id && !self.is_read_by(user_id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastMessage {
    pub content: String,
    pub sender_id: String,
    pub created_at_ms: i64,
}

/// Per-participant unread counters. Serialized as a plain JSON object keyed
/// by user id.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct UnreadCounts(BTreeMap<String, u64>);

impl UnreadCounts {
    pub fn zeroed<'a>(participants: impl IntoIterator<Item = &'a String>) -> Self {
        Self(
            participants
                .into_iter()
                .map(|user_id| (user_id.clone(), 0))
                .collect(),
        )
    }

    pub fn get(&self, user_id: &str) -> u64 {
        self.0.get(user_id).copied().unwrap_or(0)
    }

    fn increment(&mut self, user_id: &str) {
        *self.0.entry(user_id.to_string()).or_insert(0) += 1;
    }

    fn reset(&mut self, user_id: &str) {
        self.0.insert(user_id.to_string(), 0);
    }
}

/// Lookup key enforcing one conversation per listing and unordered pair.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ConversationKey {
    pub listing_id: String,
    pub first: String,
    pub second: String,
}

impl ConversationKey {
    pub fn new(listing_id: &str, a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self {
            listing_id: listing_id.to_string(),
            first: first.to_string(),
            second: second.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub conversation_id: String,
    pub listing_id: String,
    /// `[buyer, seller]`.
    pub participants: [String; 2],
    pub messages: Vec<Message>,
    pub last_message: Option<LastMessage>,
    pub status: ConversationStatus,
    /// Participant who blocked the conversation. Only they can lift it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    pub unread_count: UnreadCounts,
    pub version: u64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Conversation {
    pub fn open(listing_id: &str, buyer_id: &str, seller_id: &str, now_ms: i64) -> Self {
        let participants = [buyer_id.to_string(), seller_id.to_string()];
        Self {
            conversation_id: crate::util::uuid_v7_without_dashes(),
            listing_id: listing_id.to_string(),
            unread_count: UnreadCounts::zeroed(&participants),
            participants,
            messages: Vec::new(),
            last_message: None,
            status: ConversationStatus::Active,
            blocked_by: None,
            version: 0,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(
            &self.listing_id,
            &self.participants[0],
            &self.participants[1],
        )
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|participant| participant == user_id)
    }

    pub fn counterpart(&self, user_id: &str) -> Option<&str> {
        match self.participants.iter().position(|p| p == user_id)? {
            0 => Some(self.participants[1].as_str()),
            _ => Some(self.participants[0].as_str()),
        }
    }

    pub fn ensure_participant(&self, user_id: &str) -> DomainResult<()> {
        if self.is_participant(user_id) {
            Ok(())
        } else {
            Err(DomainError::Forbidden(
                "user is not a participant of this conversation".into(),
            ))
        }
    }

    pub fn ensure_writable(&self) -> DomainResult<()> {
        if self.status == ConversationStatus::Blocked {
            return Err(DomainError::Forbidden("conversation is blocked".into()));
        }
        Ok(())
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| message.message_id == message_id)
    }

    pub(crate) fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| message.message_id == message_id)
    }

    pub fn unread_for(&self, user_id: &str) -> u64 {
        self.unread_count.get(user_id)
    }

    /// Unread count recomputed from the log rather than the stored counter.
    pub fn derived_unread_for(&self, user_id: &str) -> u64 {
        self.messages
            .iter()
            .filter(|message| message.is_unread_for(user_id))
            .count() as u64
    }

    pub fn has_unread_for(&self, user_id: &str) -> bool {
        self.unread_for(user_id) > 0
            || self
                .messages
                .iter()
                .any(|message| message.is_unread_for(user_id))
    }

    /// Sort key for list views: time of the latest message, or creation time
    /// for conversations that never saw one.
    pub fn activity_at_ms(&self) -> i64 {
        self.last_message
            .as_ref()
            .map_or(self.created_at_ms, |last| last.created_at_ms)
    }

    /// Appends a message, moves `last_message` and bumps the counterpart's
    /// unread counter. Content validation is the caller's job.
    pub fn append_message(
        &mut self,
        sender_id: &str,
        content: String,
        payload: MessagePayload,
        now_ms: i64,
    ) -> DomainResult<Message> {
        self.ensure_participant(sender_id)?;
        let recipient = self
            .counterpart(sender_id)
            .map(str::to_string)
            .ok_or_else(|| DomainError::Forbidden("sender has no counterpart".into()))?;

        let message = Message {
            message_id: crate::util::uuid_v7_without_dashes(),
            sender_id: sender_id.to_string(),
            content,
            payload,
            read_by: vec![ReadReceipt {
                user_id: sender_id.to_string(),
                read_at_ms: now_ms,
            }],
            created_at_ms: now_ms,
        };

        self.last_message = Some(LastMessage {
            content: message.content.clone(),
            sender_id: message.sender_id.clone(),
            created_at_ms: message.created_at_ms,
        });
        self.unread_count.increment(&recipient);
        self.updated_at_ms = now_ms;
        self.messages.push(message.clone());
        Ok(message)
    }

    /// Adds the reader's receipt to every message from the other side that
    /// lacks one and zeroes their counter. Returns whether anything changed.
    pub fn mark_read(&mut self, reader_id: &str, now_ms: i64) -> DomainResult<bool> {
        self.ensure_participant(reader_id)?;
        let mut changed = self.unread_count.get(reader_id) != 0;
        for message in self
            .messages
            .iter_mut()
            .filter(|message| message.is_unread_for(reader_id))
        {
            message.read_by.push(ReadReceipt {
                user_id: reader_id.to_string(),
                read_at_ms: now_ms,
            });
            changed = true;
        }
        self.unread_count.reset(reader_id);
        if changed {
            self.updated_at_ms = now_ms;
        }
        Ok(changed)
    }

    /// Moves the conversation to `status` on behalf of `actor_id`. Returns
    /// whether anything changed.
    pub fn set_status(
        &mut self,
        actor_id: &str,
        status: ConversationStatus,
        now_ms: i64,
    ) -> DomainResult<bool> {
        self.ensure_participant(actor_id)?;
        if self.status == status {
            return Ok(false);
        }
        if self.status == ConversationStatus::Blocked
            && self.blocked_by.as_deref() != Some(actor_id)
        {
            return Err(DomainError::Forbidden(
                "only the participant who blocked this conversation can unblock it".into(),
            ));
        }
        self.blocked_by = (status == ConversationStatus::Blocked).then(|| actor_id.to_string());
        self.status = status;
        self.updated_at_ms = now_ms;
        Ok(true)
    }
}

pub fn validate_content(content: &str) -> DomainResult<String> {
    let content = content.trim();
    if content.is_empty() {
        return Err(DomainError::Validation("content is required".into()));
    }
    if content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(DomainError::Validation(format!(
            "content exceeds max length of {MAX_CONTENT_LENGTH}"
        )));
    }
    Ok(content.to_string())
}
