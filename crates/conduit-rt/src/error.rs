use thiserror::Error;

use crate::ids::ConnId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection {0:?} disconnected")]
    Disconnected(ConnId),

    #[error("communication error on {0:?}")]
    Communication(ConnId, #[source] std::io::Error),

    #[error("decode error on {0:?}: {1}")]
    Decode(ConnId, #[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("reply '{reply}' not allowed for request '{request}' on {conn:?}")]
    DisallowedReply { conn: ConnId, request: String, reply: String },

    #[error("session construction failed for {0:?}")]
    SessionCreation(ConnId, #[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid session for connection {0:?}")]
    InvalidSession(ConnId),

    #[error("connection {0:?} not found")]
    SessionNotFound(ConnId),

    #[cfg(feature = "tls")]
    #[error("TLS handshake failed on {0:?}")]
    Handshake(ConnId, #[source] std::io::Error),

    #[error("no session factory configured")]
    InvalidSessionFactory,
}

/// Handlers permitted to throw (`connected`, `arrived`, `sent`, `timeout`,
/// `after_processed`) signal failure this way. `Disconnect` maps to the
/// spec's sentinel disconnected-error; `Other` is routed to the `error`
/// event.
#[derive(Debug)]
pub enum HandlerError {
    Disconnect,
    Other(Box<dyn std::error::Error + Send + Sync>),
}

pub type HandlerResult = Result<(), HandlerError>;
