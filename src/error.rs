use std::io;

use thiserror::Error;

/// Unified error type for the Waypoint routing core
#[derive(Error, Debug)]
pub enum WaypointError {
    // Resolution errors
    #[error("Resolution failed: {0}")]
    Resolution(String),

    #[error("No addresses to dial for {host}")]
    NoAddresses { host: String },

    // Dial errors
    #[error("Connection to {target} failed: {source}")]
    DialFailed {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("No endpoints available")]
    NoEndpointsAvailable,

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Protocol violations
    #[error("DNS decode error: {0}")]
    DnsDecode(String),

    #[error("CONNECT failed: {0}")]
    ConnectFailed(String),

    #[error("HTTP error: {0}")]
    Http(String),

    // Configuration errors
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for Waypoint operations
pub type Result<T> = std::result::Result<T, WaypointError>;

impl WaypointError {
    /// Whether the error came from malformed data on the wire
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            WaypointError::DnsDecode(_) | WaypointError::ConnectFailed(_) | WaypointError::Http(_)
        )
    }

    /// Whether the error is a configuration or API misuse problem
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            WaypointError::InvalidEndpoint(_)
                | WaypointError::InvalidUsage(_)
                | WaypointError::InvalidConfig(_)
        )
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for WaypointError {
    fn from(err: url::ParseError) -> Self {
        WaypointError::InvalidEndpoint(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for WaypointError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        WaypointError::Timeout
    }
}

impl From<hickory_proto::error::ProtoError> for WaypointError {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        WaypointError::DnsDecode(err.to_string())
    }
}
