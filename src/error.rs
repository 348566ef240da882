//! # Rotary Modbus Error Handling
//!
//! Every failure in the communication core is expressed as a [`RotaryError`].
//! The variants fall into three families that callers react to differently:
//!
//! ## Link failures
//! - **I/O**, **Connection**, **Timeout**: the serial handle or the exchange failed
//! - **Frame**, **CRC**, **Protocol**, **Exception**: a reply arrived but was unusable
//!
//! A link failure observed by the device facade never reaches the poll loop as
//! an error. It is converted into a disconnected connection state with the
//! error text retained (see [`crate::device`]).
//!
//! ## Precondition failures
//! - **Precondition**: the request is not meaningful in the controller's
//!   current mode, e.g. changing the current position while the axis moves.
//!   These are returned to the caller synchronously.
//!
//! ## Configuration failures
//! - **Configuration**: invalid serial parameters. Fatal to the connection
//!   attempt, never to the process; the connection manager keeps retrying.
//!
//! ```rust
//! use rotary_modbus::{RotaryError, RotaryResult};
//!
//! fn react(result: RotaryResult<()>) {
//!     match result {
//!         Ok(()) => {}
//!         Err(e) if e.is_precondition() => println!("refused: {}", e),
//!         Err(e) if e.is_link_failure() => println!("link down: {}", e),
//!         Err(e) => println!("other: {}", e),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias used throughout the crate
pub type RotaryResult<T> = Result<T, RotaryError>;

/// Errors raised by the controller communication core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RotaryError {
    /// Low-level serial I/O failure
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Serial handle could not be opened or was lost
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// An exchange exceeded its per-call timeout
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Reply violated the protocol (wrong slave, wrong function, bad length)
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// RTU frame could not be parsed
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// CRC-16 check failed on a received frame
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// The controller answered with a Modbus exception
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// A value could not be interpreted (unknown mode code, odd byte count)
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Register range not addressable on this controller
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Request refused client-side because of the current mode
    #[error("Precondition failed: {message}")]
    Precondition { message: String },

    /// Invalid connection or polling parameters
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal invariant broken
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RotaryError {
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a Modbus exception error, mapping the standard exception codes
    /// to readable text
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception {
            function,
            code,
            message,
        }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    pub fn precondition<S: Into<String>>(message: S) -> Self {
        Self::Precondition { message: message.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error means the link to the controller is not usable
    ///
    /// These are the failures the device facade converts into a disconnected
    /// state. Value-interpretation errors, precondition and configuration
    /// errors are not link failures.
    ///
    /// ```rust
    /// use rotary_modbus::RotaryError;
    ///
    /// assert!(RotaryError::timeout("read response", 1000).is_link_failure());
    /// assert!(RotaryError::crc_mismatch(0x1234, 0x4321).is_link_failure());
    /// assert!(!RotaryError::precondition("moving").is_link_failure());
    /// ```
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::Protocol { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
                | Self::Exception { .. }
        )
    }

    /// Check if the error is a transport (handle/timeout) issue rather than
    /// a malformed reply
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Check if retrying the same exchange later might succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. }
            | Self::Connection { .. }
            | Self::Timeout { .. }
            | Self::Frame { .. }
            | Self::CrcMismatch { .. } => true,
            // Acknowledge, Busy
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            // The connection manager retries configuration failures on its schedule
            Self::Configuration { .. } => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for RotaryError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Tokio's elapsed error carries no context; call sites that know the
/// operation build `RotaryError::timeout` themselves.
impl From<tokio::time::error::Elapsed> for RotaryError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<tokio_serial::Error> for RotaryError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind() {
            tokio_serial::ErrorKind::InvalidInput => Self::configuration(err.to_string()),
            _ => Self::connection(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RotaryError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}
