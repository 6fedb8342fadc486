use std::collections::HashMap;
use std::sync::Arc;

use haggle_domain::DomainResult;
use haggle_domain::conversation::{Conversation, ConversationKey};
use haggle_domain::error::DomainError;
use haggle_domain::ports::conversations::{ConversationRepository, VersionedWrite};
use tokio::sync::RwLock;

#[derive(Default)]
struct Store {
    conversations: HashMap<String, Conversation>,
    by_pair: HashMap<ConversationKey, String>,
}

/// Process-local conversation store. Both indexes sit behind one lock so the
/// pair lookup and the insert it guards are a single critical section.
#[derive(Clone, Default)]
pub struct InMemoryConversationRepository {
    store: Arc<RwLock<Store>>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.conversations.len()
    }
}

impl ConversationRepository for InMemoryConversationRepository {
    fn insert_if_absent(
        &self,
        conversation: &Conversation,
    ) -> haggle_domain::ports::BoxFuture<'_, DomainResult<Conversation>> {
        let conversation = conversation.clone();
        let store = self.store.clone();
        Box::pin(async move {
            let mut store = store.write().await;
            let key = conversation.key();
            if let Some(existing) = store
                .by_pair
                .get(&key)
                .and_then(|id| store.conversations.get(id))
            {
                return Ok(existing.clone());
            }
            store
                .by_pair
                .insert(key, conversation.conversation_id.clone());
            store
                .conversations
                .insert(conversation.conversation_id.clone(), conversation.clone());
            Ok(conversation)
        })
    }

    fn get(
        &self,
        conversation_id: &str,
    ) -> haggle_domain::ports::BoxFuture<'_, DomainResult<Option<Conversation>>> {
        let conversation_id = conversation_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            let store = store.read().await;
            Ok(store.conversations.get(&conversation_id).cloned())
        })
    }

    fn find_by_pair(
        &self,
        listing_id: &str,
        first_user_id: &str,
        second_user_id: &str,
    ) -> haggle_domain::ports::BoxFuture<'_, DomainResult<Option<Conversation>>> {
        let key = ConversationKey::new(listing_id, first_user_id, second_user_id);
        let store = self.store.clone();
        Box::pin(async move {
            let store = store.read().await;
            Ok(store
                .by_pair
                .get(&key)
                .and_then(|id| store.conversations.get(id))
                .cloned())
        })
    }

    fn list_by_participant(
        &self,
        user_id: &str,
    ) -> haggle_domain::ports::BoxFuture<'_, DomainResult<Vec<Conversation>>> {
        let user_id = user_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            let store = store.read().await;
            let mut output: Vec<_> = store
                .conversations
                .values()
                .filter(|conversation| conversation.is_participant(&user_id))
                .cloned()
                .collect();
            output.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
            Ok(output)
        })
    }

    fn compare_and_swap(
        &self,
        conversation: &Conversation,
        expected_version: u64,
    ) -> haggle_domain::ports::BoxFuture<'_, DomainResult<VersionedWrite>> {
        let mut conversation = conversation.clone();
        let store = self.store.clone();
        Box::pin(async move {
            let mut store = store.write().await;
            let stored = store
                .conversations
                .get_mut(&conversation.conversation_id)
                .ok_or_else(|| DomainError::NotFound("conversation not found".into()))?;
            if stored.version != expected_version {
                return Ok(VersionedWrite::Stale);
            }
            conversation.version = expected_version + 1;
            *stored = conversation.clone();
            Ok(VersionedWrite::Committed(conversation))
        })
    }
}
