use relay_api::RelayError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("{0}")]
    Relay(#[from] RelayError),

    #[error("task {name}: {detail}")]
    Task { name: &'static str, detail: String },

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
