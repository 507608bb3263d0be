#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept: {0}")]
    Accept(#[source] std::io::Error),

    #[error("channel closed")]
    Closed,

    #[error("frame receiver already taken")]
    ReceiverTaken,
}
