//! Error types for the engine RPC layer.
//!
//! `RpcError` is what callers of [`crate::ipc::RpcClient::send`] see.
//! `TransportError` and `FrameError` stay closer to the I/O and are folded
//! into `RpcError` before they reach a caller.

use std::net::SocketAddr;

use thiserror::Error;

/// Coarse error category, stable for UI diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Engine,
    TransportLost,
    DuplicateRequestId,
    ConnectionFailed,
    Encode,
    ClientClosed,
}

/// Errors surfaced by the RPC client.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Bytes from the engine could not be parsed into a message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The engine answered with `status = Fail`.
    ///
    /// Displays the engine's error text verbatim.
    #[error("{message}")]
    Engine { message: String },

    /// The engine process exited or the socket closed before a reply arrived.
    #[error("Transport lost: {0}")]
    TransportLost(String),

    /// A call with the same id is already pending.
    #[error("Duplicate request id: {0}")]
    DuplicateRequestId(String),

    /// The engine could not be spawned or connected to.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The request could not be serialized.
    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    /// The client was shut down.
    #[error("Client closed")]
    ClientClosed,
}

impl RpcError {
    pub fn engine(message: impl Into<String>) -> Self {
        RpcError::Engine {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Protocol(_) => ErrorKind::Protocol,
            RpcError::Engine { .. } => ErrorKind::Engine,
            RpcError::TransportLost(_) => ErrorKind::TransportLost,
            RpcError::DuplicateRequestId(_) => ErrorKind::DuplicateRequestId,
            RpcError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            RpcError::Encode(_) => ErrorKind::Encode,
            RpcError::ClientClosed => ErrorKind::ClientClosed,
        }
    }

    /// Duplicate a pending-call error for fan-out in `drop_all`.
    ///
    /// `Encode` carries a non-clonable source and is never fanned out, so it
    /// degrades to `Protocol` with the same text.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            RpcError::Protocol(m) => RpcError::Protocol(m.clone()),
            RpcError::Engine { message } => RpcError::engine(message.clone()),
            RpcError::TransportLost(m) => RpcError::TransportLost(m.clone()),
            RpcError::DuplicateRequestId(m) => RpcError::DuplicateRequestId(m.clone()),
            RpcError::ConnectionFailed(m) => RpcError::ConnectionFailed(m.clone()),
            RpcError::Encode(e) => RpcError::Protocol(e.to_string()),
            RpcError::ClientClosed => RpcError::ClientClosed,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Spawn { .. } | TransportError::Connect { .. } => {
                RpcError::ConnectionFailed(err.to_string())
            }
            TransportError::Closed | TransportError::Io(_) => {
                RpcError::TransportLost(err.to_string())
            }
        }
    }
}

/// Errors raised by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is closed; writes are refused.
    #[error("Transport closed")]
    Closed,

    /// I/O failure on an open channel.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine binary could not be launched.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine socket could not be reached.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Unrecoverable framing errors.
///
/// Once one of these is seen the stream position can no longer be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Unknown frame tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("Frame length {length} exceeds maximum {max} bytes")]
    Oversized { length: u64, max: usize },
}

impl From<FrameError> for RpcError {
    fn from(err: FrameError) -> Self {
        RpcError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_displays_message_verbatim() {
        let err = RpcError::engine("not found");
        assert_eq!(err.to_string(), "not found");
        assert_eq!(err.kind(), ErrorKind::Engine);
    }

    #[test]
    fn test_rpc_error_display() {
        assert_eq!(
            RpcError::TransportLost("engine exited with code 3".to_string()).to_string(),
            "Transport lost: engine exited with code 3"
        );
        assert_eq!(
            RpcError::DuplicateRequestId("abc".to_string()).to_string(),
            "Duplicate request id: abc"
        );
        assert_eq!(RpcError::ClientClosed.to_string(), "Client closed");
    }

    #[test]
    fn test_transport_error_mapping() {
        let lost: RpcError = TransportError::Closed.into();
        assert_eq!(lost.kind(), ErrorKind::TransportLost);

        let refused = TransportError::Connect {
            addr: "127.0.0.1:7842".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        let err: RpcError = refused.into();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(err.to_string().contains("127.0.0.1:7842"));
    }

    #[test]
    fn test_frame_error_display() {
        assert_eq!(FrameError::UnknownTag(0xff).to_string(), "Unknown frame tag 0xff");
        let err: RpcError = FrameError::Oversized { length: 10, max: 5 }.into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_duplicate_preserves_kind_and_text() {
        let original = RpcError::TransportLost("socket closed".to_string());
        let copy = original.duplicate();
        assert_eq!(copy.kind(), ErrorKind::TransportLost);
        assert_eq!(copy.to_string(), original.to_string());
    }
}
