use soe_shared::CodecError;
use std::net::SocketAddr;
use thiserror::Error;

/// Failures that stop a server from starting
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Why a connection could not be registered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("session {0:#010x} is already connected")]
    DuplicateSession(u32),
    #[error("endpoint {0} is already connected")]
    DuplicateEndpoint(SocketAddr),
}
