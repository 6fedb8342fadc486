use crate::DomainResult;
use crate::listing::ListingSummary;

pub trait ListingDirectory: Send + Sync {
    /// `Ok(None)` when the listing does not exist; transport or upstream
    /// failures surface as `DomainError::Dependency`.
    fn get_listing(
        &self,
        listing_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<ListingSummary>>>;
}
