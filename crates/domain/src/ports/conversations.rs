use crate::DomainResult;
use crate::conversation::Conversation;

/// Outcome of an optimistic write.
#[derive(Clone, Debug, PartialEq)]
pub enum VersionedWrite {
    Committed(Conversation),
    /// Someone else committed first; reload and re-apply.
    Stale,
}

pub trait ConversationRepository: Send + Sync {
    /// Stores `conversation` unless one already exists for the same listing
    /// and participant pair, in which case the stored one is returned.
    fn insert_if_absent(
        &self,
        conversation: &Conversation,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Conversation>>;

    fn get(
        &self,
        conversation_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<Conversation>>>;

    fn find_by_pair(
        &self,
        listing_id: &str,
        first_user_id: &str,
        second_user_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<Conversation>>>;

    fn list_by_participant(
        &self,
        user_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Vec<Conversation>>>;

    /// Replaces the stored aggregate if its version still equals
    /// `expected_version`. The committed copy carries `expected_version + 1`.
    fn compare_and_swap(
        &self,
        conversation: &Conversation,
        expected_version: u64,
    ) -> crate::ports::BoxFuture<'_, DomainResult<VersionedWrite>>;
}
