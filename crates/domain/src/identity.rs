use serde::{Deserialize, Serialize};

/// Caller identity as established by the authentication layer. Everything
/// downstream treats `user_id` as trusted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActorIdentity {
    pub user_id: String,
}

impl ActorIdentity {
    pub fn with_user_id(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}
