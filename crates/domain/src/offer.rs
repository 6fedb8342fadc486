use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::conversation::{Conversation, Message, MessagePayload};
use crate::error::DomainError;

pub const MAX_OFFER_NOTE_LENGTH: usize = 200;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
    Countered,
}

impl OfferStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OfferStatus::Pending)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OfferResponse {
    Accept,
    Reject,
    Counter { price: f64 },
}

impl OfferResponse {
    pub fn parse(status: &str, counter_price: Option<f64>) -> DomainResult<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "accepted" => Ok(Self::Accept),
            "rejected" => Ok(Self::Reject),
            "countered" => {
                let price = counter_price.ok_or_else(|| {
                    DomainError::Validation("counter offer price is required".into())
                })?;
                Ok(Self::Counter {
                    price: validate_price(price, "counter offer price")?,
                })
            }
            _ => Err(DomainError::Validation(
                "status must be accepted, rejected or countered".into(),
            )),
        }
    }

    pub fn resulting_status(&self) -> OfferStatus {
        match self {
            Self::Accept => OfferStatus::Accepted,
            Self::Reject => OfferStatus::Rejected,
            Self::Counter { .. } => OfferStatus::Countered,
        }
    }

    pub fn counter_price(&self) -> Option<f64> {
        match self {
            Self::Counter { price } => Some(*price),
            _ => None,
        }
    }
}

pub fn validate_price(price: f64, field: &str) -> DomainResult<f64> {
    if !price.is_finite() || price <= 0.0 {
        return Err(DomainError::Validation(format!(
            "{field} must be a positive number"
        )));
    }
    Ok(price)
}

pub fn validate_note(note: Option<String>) -> DomainResult<Option<String>> {
    let Some(note) = note else {
        return Ok(None);
    };
    let note = note.trim();
    if note.is_empty() {
        return Ok(None);
    }
    if note.chars().count() > MAX_OFFER_NOTE_LENGTH {
        return Err(DomainError::Validation(format!(
            "offer message exceeds max length of {MAX_OFFER_NOTE_LENGTH}"
        )));
    }
    Ok(Some(note.to_string()))
}

pub fn pending_offer(price: f64) -> MessagePayload {
    MessagePayload::Offer {
        offer_price: price,
        offer_status: OfferStatus::Pending,
        counter_of: None,
    }
}

pub fn offer_content(price: f64, note: Option<String>) -> String {
    note.unwrap_or_else(|| format!("Offer: {price}"))
}

/// Result of a committed offer response: the offer after its transition and
/// the message the response appended (system narration or counter-offer).
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct OfferResolution {
    pub offer: Message,
    pub message: Message,
}

/// Moves a pending offer to its terminal state and appends the follow-up
/// message. Everything happens on the in-memory aggregate; the caller commits
/// it as one write.
pub fn respond(
    conversation: &mut Conversation,
    responder_id: &str,
    offer_message_id: &str,
    response: &OfferResponse,
    now_ms: i64,
) -> DomainResult<OfferResolution> {
    conversation.ensure_participant(responder_id)?;
    conversation.ensure_writable()?;

    let offer = conversation
        .message_mut(offer_message_id)
        .ok_or_else(|| DomainError::NotFound("offer message not found".into()))?;
    let offer_sender = offer.sender_id.clone();
    let MessagePayload::Offer {
        offer_price,
        offer_status,
        ..
    } = &mut offer.payload
    else {
        return Err(DomainError::Validation("message is not an offer".into()));
    };

    if offer_sender == responder_id {
        return Err(DomainError::Forbidden(
            "cannot respond to your own offer".into(),
        ));
    }
    if offer_status.is_terminal() {
        return Err(DomainError::Conflict(
            "offer has already been responded to".into(),
        ));
    }

    let price = *offer_price;
    *offer_status = response.resulting_status();
    let offer = offer.clone();

    let message = match response {
        OfferResponse::Accept => conversation.append_message(
            responder_id,
            format!("Accepted offer of {price}"),
            MessagePayload::System,
            now_ms,
        )?,
        OfferResponse::Reject => conversation.append_message(
            responder_id,
            format!("Rejected offer of {price}"),
            MessagePayload::System,
            now_ms,
        )?,
        OfferResponse::Counter { price: counter } => conversation.append_message(
            responder_id,
            format!("Counter offer: {counter}"),
            MessagePayload::Offer {
                offer_price: *counter,
                offer_status: OfferStatus::Pending,
                counter_of: Some(offer.message_id.clone()),
            },
            now_ms,
        )?,
    };

    Ok(OfferResolution { offer, message })
}
