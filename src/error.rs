//! Error types for jobrpc.

use thiserror::Error;

/// Main error type for all client, server, and codec operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while reading or writing the connection preamble.
    #[error("handshake error: {0}")]
    HandshakeJson(#[from] serde_json::Error),

    /// MessagePack serialization error ("job" codec).
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack deserialization error ("job" codec).
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON body serialization error ("json" codec).
    #[error("json encode error: {0}")]
    JsonEncode(serde_json::Error),

    /// JSON body deserialization error ("json" codec).
    #[error("json decode error: {0}")]
    JsonDecode(serde_json::Error),

    /// Peer sent a preamble whose magic does not match [`MAGIC_NUMBER`].
    ///
    /// [`MAGIC_NUMBER`]: crate::handshake::MAGIC_NUMBER
    #[error("invalid magic number {0:#x}")]
    InvalidMagic(u32),

    /// Preamble named a codec that is not in the factory.
    #[error("unknown codec type {0:?}")]
    UnknownCodec(String),

    /// A frame section exceeded the wire size cap.
    #[error("frame section of {0} bytes exceeds maximum")]
    FrameTooLarge(u32),

    /// Request named a method without a `Service.Method` dot.
    #[error("invalid service method {0:?}")]
    InvalidServiceMethod(String),

    /// Request named a service this server does not host.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Request named a method the resolved service does not expose.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Service name does not start with an uppercase letter.
    #[error("service name {0:?} is not exported")]
    NotExported(String),

    /// A service with the same name is already registered on this server.
    #[error("service {0:?} already registered")]
    AlreadyRegistered(String),

    /// Error string carried back in a response header.
    #[error("{0}")]
    Remote(String),

    /// The client is closing or has shut down.
    #[error("client shutdown")]
    Shutdown,

    /// The connection died with calls still pending.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Error returned by a service method handler.
///
/// Whatever the handler returns is rendered with `Display` and carried
/// verbatim in the response header's error field.
pub type MethodError = Box<dyn std::error::Error + Send + Sync>;
