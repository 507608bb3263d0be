use std::path::PathBuf;

use herald_api::ApiError;
use herald_channel::ChannelError;
use herald_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("listen: {0}")]
    Listen(#[from] ChannelError),

    #[error("listener address: {0}")]
    LocalAddr(#[source] std::io::Error),

    #[error("storage root {}: {source}", path.display())]
    StorageRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    InvalidTopic(#[from] ApiError),

    #[error("topic '{topic}': {source}")]
    Store {
        topic: String,
        #[source]
        source: StoreError,
    },

    #[error("storage task: {0}")]
    Task(#[from] tokio::task::JoinError),
}
