#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("broker: {0}")]
    Broker(#[from] herald_broker::BrokerError),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
