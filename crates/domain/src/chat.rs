use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::DomainResult;
use crate::conversation::{
    Conversation, ConversationStatus, LastMessage, Message, MessagePayload, validate_content,
};
use crate::error::DomainError;
use crate::events::ChatEvent;
use crate::identity::ActorIdentity;
use crate::offer::{self, OfferResolution, OfferResponse};
use crate::ports::conversations::{ConversationRepository, VersionedWrite};
use crate::ports::listings::ListingDirectory;
use crate::ports::realtime::ChatEventPublisher;
use crate::util::now_ms;

/// Upper bound on reload-and-reapply rounds when a write loses the version
/// race. Writers in one process take turns per conversation, so only writers
/// outside it can cause those rounds.
pub const MAX_MUTATION_ATTEMPTS: usize = 16;

/// One async mutex per conversation with a writer in flight. Entries go away
/// when the last writer for a conversation finishes.
#[derive(Clone, Default)]
struct WriteLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl WriteLocks {
    async fn acquire(&self, conversation_id: &str) -> WriteTurn {
        let lock = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id.to_string())
            .or_default()
            .clone();
        let guard = lock.clone().lock_owned().await;
        WriteTurn {
            locks: self.clone(),
            conversation_id: conversation_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct WriteTurn {
    locks: WriteLocks,
    conversation_id: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for WriteTurn {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self
            .locks
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The map and this turn hold the only references: nobody is queued.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.conversation_id);
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CreatedConversation {
    pub conversation: Conversation,
    pub created: bool,
}

/// List view of a conversation as seen by one participant.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub listing_id: String,
    pub participants: [String; 2],
    pub counterpart_id: String,
    pub last_message: Option<LastMessage>,
    pub status: ConversationStatus,
    pub unread_count: u64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl ConversationSummary {
    fn for_user(conversation: Conversation, user_id: &str) -> Self {
        let unread_count = conversation.unread_for(user_id);
        let counterpart_id = conversation
            .counterpart(user_id)
            .unwrap_or_default()
            .to_string();
        Self {
            conversation_id: conversation.conversation_id,
            listing_id: conversation.listing_id,
            participants: conversation.participants,
            counterpart_id,
            last_message: conversation.last_message,
            status: conversation.status,
            unread_count,
            created_at_ms: conversation.created_at_ms,
            updated_at_ms: conversation.updated_at_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MessageKind {
    Text,
    Image { image_url: String },
}

impl MessageKind {
    pub fn parse(kind: Option<&str>, image_url: Option<String>) -> DomainResult<Self> {
        match kind.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            None | Some("text") => Ok(Self::Text),
            Some("image") => {
                let image_url = image_url
                    .map(|url| url.trim().to_string())
                    .filter(|url| !url.is_empty())
                    .ok_or_else(|| {
                        DomainError::Validation("image_url is required for image messages".into())
                    })?;
                Ok(Self::Image { image_url })
            }
            Some(_) => Err(DomainError::Validation(
                "type must be text or image".into(),
            )),
        }
    }

    fn into_payload(self) -> MessagePayload {
        match self {
            Self::Text => MessagePayload::Text,
            Self::Image { image_url } => MessagePayload::Image { image_url },
        }
    }
}

#[derive(Clone, Debug)]
pub struct SendMessageInput {
    pub conversation_id: String,
    /// Lets the first message open the conversation when it does not exist
    /// yet.
    pub listing_id: Option<String>,
    pub content: String,
    pub kind: MessageKind,
}

#[derive(Clone, Debug)]
pub struct SendOfferInput {
    pub offer_price: f64,
    pub note: Option<String>,
}

#[derive(Clone)]
pub struct ChatService {
    conversations: Arc<dyn ConversationRepository>,
    listings: Arc<dyn ListingDirectory>,
    publisher: Arc<dyn ChatEventPublisher>,
    write_locks: WriteLocks,
}

impl ChatService {
    pub fn new(
        conversations: Arc<dyn ConversationRepository>,
        listings: Arc<dyn ListingDirectory>,
        publisher: Arc<dyn ChatEventPublisher>,
    ) -> Self {
        Self {
            conversations,
            listings,
            publisher,
            write_locks: WriteLocks::default(),
        }
    }

    pub async fn create_or_get_conversation(
        &self,
        actor: &ActorIdentity,
        listing_id: &str,
    ) -> DomainResult<CreatedConversation> {
        let listing_id = listing_id.trim();
        if listing_id.is_empty() {
            return Err(DomainError::Validation("listing_id is required".into()));
        }

        let listing = self
            .listings
            .get_listing(listing_id)
            .await?
            .ok_or_else(|| DomainError::NotFound("listing not found".into()))?;
        if listing.owner_id == actor.user_id {
            return Err(DomainError::Validation(
                "cannot start a conversation on your own listing".into(),
            ));
        }

        if let Some(existing) = self
            .conversations
            .find_by_pair(listing_id, &actor.user_id, &listing.owner_id)
            .await?
        {
            return Ok(CreatedConversation {
                conversation: existing,
                created: false,
            });
        }

        if !listing.status.is_contactable() {
            return Err(DomainError::Validation(
                "listing is not available for chat".into(),
            ));
        }

        let candidate = Conversation::open(listing_id, &actor.user_id, &listing.owner_id, now_ms());
        let stored = self.conversations.insert_if_absent(&candidate).await?;
        let created = stored.conversation_id == candidate.conversation_id;
        Ok(CreatedConversation {
            conversation: stored,
            created,
        })
    }

    /// Total unread across every conversation the actor is in, blocked ones
    /// included.
    pub async fn get_unread_count(&self, actor: &ActorIdentity) -> DomainResult<u64> {
        let conversations = self
            .conversations
            .list_by_participant(&actor.user_id)
            .await?;
        Ok(conversations
            .iter()
            .map(|conversation| conversation.unread_for(&actor.user_id))
            .sum())
    }

    pub async fn get_my_chats(
        &self,
        actor: &ActorIdentity,
    ) -> DomainResult<Vec<ConversationSummary>> {
        let mut conversations: Vec<Conversation> = self
            .conversations
            .list_by_participant(&actor.user_id)
            .await?
            .into_iter()
            .filter(|conversation| conversation.status != ConversationStatus::Blocked)
            .collect();
        conversations.sort_by(|left, right| {
            right
                .activity_at_ms()
                .cmp(&left.activity_at_ms())
                .then_with(|| right.conversation_id.cmp(&left.conversation_id))
        });
        Ok(conversations
            .into_iter()
            .map(|conversation| ConversationSummary::for_user(conversation, &actor.user_id))
            .collect())
    }

    /// Opening a conversation counts as reading it.
    pub async fn get_chat_by_id(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
    ) -> DomainResult<Conversation> {
        self.mark_read(actor, conversation_id).await
    }

    pub async fn mark_read(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
    ) -> DomainResult<Conversation> {
        let current = self.assert_participant(actor, conversation_id).await?;
        if !current.has_unread_for(&actor.user_id) {
            return Ok(current);
        }

        let (conversation, changed) = self
            .mutate(conversation_id, |conversation| {
                conversation.mark_read(&actor.user_id, now_ms())
            })
            .await?;
        if changed {
            self.publish(
                &conversation,
                ChatEvent::MessagesRead {
                    conversation_id: conversation.conversation_id.clone(),
                    reader_id: actor.user_id.clone(),
                },
            )
            .await;
        }
        Ok(conversation)
    }

    pub async fn send_message(
        &self,
        actor: &ActorIdentity,
        input: SendMessageInput,
    ) -> DomainResult<Message> {
        let content = validate_content(&input.content)?;
        let payload = input.kind.into_payload();
        let conversation_id = self
            .resolve_for_send(actor, &input.conversation_id, input.listing_id.as_deref())
            .await?;

        let (conversation, message) = self
            .mutate(&conversation_id, |conversation| {
                conversation.ensure_participant(&actor.user_id)?;
                conversation.ensure_writable()?;
                conversation.append_message(
                    &actor.user_id,
                    content.clone(),
                    payload.clone(),
                    now_ms(),
                )
            })
            .await?;

        self.publish_new_message(&conversation, &message).await;
        Ok(message)
    }

    pub async fn send_offer(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
        input: SendOfferInput,
    ) -> DomainResult<Message> {
        let price = offer::validate_price(input.offer_price, "offer_price")?;
        let content = offer::offer_content(price, offer::validate_note(input.note)?);
        self.assert_participant(actor, conversation_id).await?;

        let (conversation, message) = self
            .mutate(conversation_id, |conversation| {
                conversation.ensure_writable()?;
                conversation.append_message(
                    &actor.user_id,
                    content.clone(),
                    offer::pending_offer(price),
                    now_ms(),
                )
            })
            .await?;

        self.publish_new_message(&conversation, &message).await;
        Ok(message)
    }

    pub async fn respond_to_offer(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
        offer_message_id: &str,
        response: OfferResponse,
    ) -> DomainResult<OfferResolution> {
        self.assert_participant(actor, conversation_id).await?;

        let (conversation, resolution) = self
            .mutate(conversation_id, |conversation| {
                offer::respond(
                    conversation,
                    &actor.user_id,
                    offer_message_id,
                    &response,
                    now_ms(),
                )
            })
            .await?;

        self.publish_new_message(&conversation, &resolution.message)
            .await;
        self.publish(
            &conversation,
            ChatEvent::OfferResponse {
                conversation_id: conversation.conversation_id.clone(),
                offer_message_id: resolution.offer.message_id.clone(),
                status: response.resulting_status(),
                counter_price: response.counter_price(),
            },
        )
        .await;
        Ok(resolution)
    }

    pub async fn set_status(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> DomainResult<Conversation> {
        let current = self.assert_participant(actor, conversation_id).await?;
        if current.status == status {
            return Ok(current);
        }

        let (conversation, changed) = self
            .mutate(conversation_id, |conversation| {
                conversation.set_status(&actor.user_id, status, now_ms())
            })
            .await?;
        if changed {
            self.publish(
                &conversation,
                ChatEvent::ConversationStatus {
                    conversation_id: conversation.conversation_id.clone(),
                    status,
                },
            )
            .await;
        }
        Ok(conversation)
    }

    pub async fn assert_participant(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
    ) -> DomainResult<Conversation> {
        let conversation = self.load(conversation_id).await?;
        conversation.ensure_participant(&actor.user_id)?;
        Ok(conversation)
    }

    async fn load(&self, conversation_id: &str) -> DomainResult<Conversation> {
        self.conversations
            .get(conversation_id)
            .await?
            .ok_or_else(|| DomainError::NotFound("conversation not found".into()))
    }

    async fn resolve_for_send(
        &self,
        actor: &ActorIdentity,
        conversation_id: &str,
        listing_id: Option<&str>,
    ) -> DomainResult<String> {
        if let Some(existing) = self.conversations.get(conversation_id).await? {
            existing.ensure_participant(&actor.user_id)?;
            return Ok(existing.conversation_id);
        }
        let Some(listing_id) = listing_id.filter(|id| !id.trim().is_empty()) else {
            return Err(DomainError::NotFound("conversation not found".into()));
        };
        let created = self.create_or_get_conversation(actor, listing_id).await?;
        Ok(created.conversation.conversation_id)
    }

    /// Read-modify-write under this conversation's writer turn, committed with
    /// a version check. `apply` runs against a fresh copy on every attempt, so
    /// rule checks see the state that is actually written.
    async fn mutate<T, F>(
        &self,
        conversation_id: &str,
        mut apply: F,
    ) -> DomainResult<(Conversation, T)>
    where
        F: FnMut(&mut Conversation) -> DomainResult<T> + Send,
        T: Send,
    {
        let _turn = self.write_locks.acquire(conversation_id).await;
        for _ in 0..MAX_MUTATION_ATTEMPTS {
            let mut conversation = self.load(conversation_id).await?;
            let expected_version = conversation.version;
            let outcome = apply(&mut conversation)?;
            match self
                .conversations
                .compare_and_swap(&conversation, expected_version)
                .await?
            {
                VersionedWrite::Committed(committed) => return Ok((committed, outcome)),
                VersionedWrite::Stale => continue,
            }
        }
        Err(DomainError::Conflict(
            "conversation is being modified concurrently, retry".into(),
        ))
    }

    async fn publish_new_message(&self, conversation: &Conversation, message: &Message) {
        self.publish(
            conversation,
            ChatEvent::NewMessage {
                conversation_id: conversation.conversation_id.clone(),
                message: message.clone(),
            },
        )
        .await;
    }

    async fn publish(&self, conversation: &Conversation, event: ChatEvent) {
        self.publisher
            .publish(&conversation.participants, event)
            .await;
    }
}
