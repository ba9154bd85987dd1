//! Error types for the hypervisor driver layer.

use thiserror::Error;

/// Errors that can occur while dialing or talking to a hypervisor.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The connection URI uses a scheme the driver does not support.
    #[error("Unsupported hypervisor URI scheme: {0}")]
    UnsupportedScheme(String),

    /// The connection URI could not be parsed.
    #[error("Invalid hypervisor URI: {0}")]
    InvalidUri(String),

    /// Failed to reach the hypervisor endpoint.
    #[error("Failed to dial hypervisor: {0}")]
    Dial(String),

    /// The transport came up but the protocol handshake failed.
    #[error("Hypervisor handshake failed: {0}")]
    Handshake(String),

    /// The named domain does not exist on this hypervisor.
    #[error("Domain not found: {0}")]
    NotFound(String),

    /// An RPC on an established connection failed.
    #[error("Hypervisor RPC failed: {0}")]
    Rpc(String),

    /// The domain XML definition could not be parsed.
    #[error("Domain XML error: {0}")]
    Xml(String),
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
