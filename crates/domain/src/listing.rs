use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Draft,
    Active,
    Sold,
    Removed,
    Expired,
}

impl ListingStatus {
    /// Only live listings accept new buyer contact.
    pub fn is_contactable(self) -> bool {
        matches!(self, ListingStatus::Active)
    }
}

/// The slice of a listing the chat subsystem needs: who owns it and whether
/// it can be contacted right now.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ListingSummary {
    pub listing_id: String,
    pub owner_id: String,
    pub status: ListingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

impl ListingSummary {
    pub fn active(listing_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            listing_id: listing_id.into(),
            owner_id: owner_id.into(),
            status: ListingStatus::Active,
            title: None,
            price: None,
        }
    }
}
