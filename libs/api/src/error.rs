/// Errors raised by the shared types.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid topic name {name:?}: {reason}")]
    InvalidTopicName { name: String, reason: &'static str },

    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}
