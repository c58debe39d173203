//! Crate-wide error type.

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid SNI {sni:?}: {reason}")]
    InvalidSni { sni: String, reason: String },

    /// The SNI parsed but no running task shard answers for it.
    #[error("no task matches SNI {sni:?}: {reason}")]
    NoMatchingTask { sni: String, reason: String },

    #[error("failed to dial shard for {sni:?}: {source}")]
    ShardDial {
        sni: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("config: {0}")]
    Config(String),

    #[error("listener closed")]
    ListenerClosed,

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    /// Status line and body for the best-effort HTTP/1.1 diagnostic that the
    /// frontend writes when the client negotiated `http/1.1` because of an
    /// error during the handshake callback.
    pub fn http_disposition(&self) -> (u16, &'static str) {
        match self {
            ProxyError::InvalidSni { .. } | ProxyError::NoMatchingTask { .. } => {
                (404, "Not Found")
            }
            ProxyError::ShardDial { .. } => (503, "Service Unavailable"),
            _ => (500, "Internal Server Error"),
        }
    }
}
