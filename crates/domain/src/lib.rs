pub mod chat;
pub mod conversation;
pub mod error;
pub mod events;
pub mod identity;
pub mod listing;
pub mod offer;
pub mod ports;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
