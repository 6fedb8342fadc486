use crate::error::ApiError;
use validator::Validate;

/// Runs derive-based checks and reports the offending fields in a stable
/// order.
pub fn validate<T: Validate>(value: &T) -> Result<(), ApiError> {
    value.validate().map_err(|errors| {
        let mut fields: Vec<String> = errors.errors().keys().map(|key| key.to_string()).collect();
        fields.sort();
        ApiError::Validation(format!("invalid {}", fields.join(", ")))
    })
}
