//! Typed error taxonomy shared by every layer of the engine.
//!
//! Each domain gets its own small enum rather than one grab-bag error type.
//! Socket errors are mapped up into the appropriate DoIP/diagnostic error at
//! the channel boundary; they never reach a caller raw.

use std::fmt;
use std::io;

/// Errors raised while bringing the engine up or down
/// (`Initialize`/`DeInitialize`).
#[derive(Debug)]
pub enum DmError {
    /// Conversation manager or a conversation failed to start
    InitializationFailed(String),
    /// Conversation manager or a conversation failed to shut down cleanly
    DeInitializationFailed(String),
}

impl fmt::Display for DmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmError::InitializationFailed(s) => write!(f, "initialization failed: {}", s),
            DmError::DeInitializationFailed(s) => write!(f, "de-initialization failed: {}", s),
        }
    }
}

impl std::error::Error for DmError {}

/// Errors surfaced by the DoIP protocol engine itself (not the socket layer).
#[derive(Debug)]
pub enum DoipError {
    /// Engine failed to initialize (e.g. could not bind a socket)
    InitializationFailed(String),
    /// Engine failed to deinitialize cleanly
    DeInitializationFailed(String),
    /// Underlying socket error
    SocketError(SocketError),
    /// Catch-all for conditions that don't fit another variant
    GenericError(String),
}

impl fmt::Display for DoipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoipError::InitializationFailed(s) => write!(f, "DoIP initialization failed: {}", s),
            DoipError::DeInitializationFailed(s) => {
                write!(f, "DoIP de-initialization failed: {}", s)
            }
            DoipError::SocketError(e) => write!(f, "socket error: {}", e),
            DoipError::GenericError(s) => write!(f, "DoIP error: {}", s),
        }
    }
}

impl std::error::Error for DoipError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DoipError::SocketError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SocketError> for DoipError {
    fn from(e: SocketError) -> Self {
        DoipError::SocketError(e)
    }
}

/// Error produced by the socket transport layer (TCP/UDP/TLS).
#[derive(Debug)]
pub enum SocketError {
    /// Socket setup (bind/listen) failed
    InitializationFailed(String),
    /// Socket teardown failed
    DeInitializationFailed(String),
    /// Wraps a raw [std::io::Error]
    Io(io::Error),
    /// Catch-all for conditions that don't fit another variant
    GenericError(String),
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketError::InitializationFailed(s) => write!(f, "socket init failed: {}", s),
            SocketError::DeInitializationFailed(s) => write!(f, "socket deinit failed: {}", s),
            SocketError::Io(e) => write!(f, "IO error: {}", e),
            SocketError::GenericError(s) => write!(f, "socket error: {}", s),
        }
    }
}

impl std::error::Error for SocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SocketError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::Io(e)
    }
}

/// Outcome of [crate::conversation::DmConversation::send_diagnostic_request].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiagError {
    /// Positive response received and delivered
    DiagSuccess,
    /// Unclassified failure
    DiagGenericFailure,
    /// The request could not be written to the socket
    DiagRequestSendFailed,
    /// No `DiagnosticMessagePosAck`/`NegAck` arrived before the ack timeout
    DiagAckTimeout,
    /// `DiagnosticMessageNegAck` was received
    DiagNegAckReceived,
    /// No final response arrived before P2/P2* expired
    DiagResponseTimeout,
    /// A parameter given to the call was invalid
    DiagInvalidParameter,
    /// Another request is already in flight on this channel
    DiagBusyProcessing,
}

impl fmt::Display for DiagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagError::DiagSuccess => "success",
            DiagError::DiagGenericFailure => "generic failure",
            DiagError::DiagRequestSendFailed => "request send failed",
            DiagError::DiagAckTimeout => "no ack received",
            DiagError::DiagNegAckReceived => "negative ack received",
            DiagError::DiagResponseTimeout => "response timeout",
            DiagError::DiagInvalidParameter => "invalid parameter",
            DiagError::DiagBusyProcessing => "channel busy processing another request",
        };
        write!(f, "{}", s)
    }
}

impl std::error::Error for DiagError {}

/// Outcome of [crate::conversation::DmConversation::connect_to_diag_server].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectResult {
    /// Routing activation succeeded (or code 0x11 was accepted, see DESIGN.md)
    ConnectSuccess,
    /// Routing activation was rejected or the socket could not connect
    ConnectFailed,
    /// No routing activation response arrived within the timeout
    ConnectTimeout,
}

/// Outcome of [crate::conversation::DmConversation::disconnect_from_diag_server].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisconnectResult {
    /// Socket and routing activation state were torn down
    DisconnectSuccess,
    /// Teardown failed
    DisconnectFailed,
    /// The conversation was already disconnected
    AlreadyDisconnected,
}

/// Error produced while loading or parsing a [crate::config::ClientConfig].
#[derive(Debug)]
pub enum ConfigError {
    /// The JSON could not be parsed or was missing a required field
    Parse(serde_json::Error),
    /// The JSON could be read structurally but values are semantically invalid
    /// (e.g. a duplicate `ConversationName`)
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "failed to parse client configuration: {}", e),
            ConfigError::Invalid(s) => write!(f, "invalid client configuration: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Error produced by [crate::conversation::VdConversation::send_vehicle_identification_request].
#[derive(Debug)]
pub enum VehicleInfoError {
    /// The requested discovery mode/selector combination was invalid
    InvalidParameter,
    /// Underlying socket error
    SocketError(SocketError),
}

impl fmt::Display for VehicleInfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VehicleInfoError::InvalidParameter => write!(f, "invalid vehicle identification parameter"),
            VehicleInfoError::SocketError(e) => write!(f, "socket error: {}", e),
        }
    }
}

impl std::error::Error for VehicleInfoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VehicleInfoError::SocketError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SocketError> for VehicleInfoError {
    fn from(e: SocketError) -> Self {
        VehicleInfoError::SocketError(e)
    }
}
