use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationStatus, Message};
use crate::offer::OfferStatus;

/// Live event pushed to connected clients once the change behind it has been
/// committed. Wire shape: `{"event":"new-message","data":{...}}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ChatEvent {
    NewMessage {
        conversation_id: String,
        message: Message,
    },
    MessagesRead {
        conversation_id: String,
        reader_id: String,
    },
    OfferResponse {
        conversation_id: String,
        offer_message_id: String,
        status: OfferStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        counter_price: Option<f64>,
    },
    ConversationStatus {
        conversation_id: String,
        status: ConversationStatus,
    },
    UserTyping {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },
}

impl ChatEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            ChatEvent::NewMessage {
                conversation_id, ..
            }
            | ChatEvent::MessagesRead {
                conversation_id, ..
            }
            | ChatEvent::OfferResponse {
                conversation_id, ..
            }
            | ChatEvent::ConversationStatus {
                conversation_id, ..
            }
            | ChatEvent::UserTyping {
                conversation_id, ..
            } => conversation_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::NewMessage { .. } => "new-message",
            ChatEvent::MessagesRead { .. } => "messages-read",
            ChatEvent::OfferResponse { .. } => "offer-response",
            ChatEvent::ConversationStatus { .. } => "conversation-status",
            ChatEvent::UserTyping { .. } => "user-typing",
        }
    }
}
