use herald_api::ApiError;
use herald_channel::ChannelError;

/// A frame that does not decode into a known control record.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("decode control frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("encode control frame: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("channel: {0}")]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("already subscribed to topic '{0}'")]
    AlreadySubscribed(String),

    #[error("client destroyed")]
    Destroyed,
}
