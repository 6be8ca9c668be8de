use thiserror::Error;

/// Failures raised by the serial transport layer.
///
/// Only OS-level problems surface here. A device that answers with garbage
/// is not a transport error; the codec reports that as a rejected frame.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Port {port} unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },
    #[error("Port {0} is already open")]
    PortBusy(String),
    #[error("Timed out during {op} on {port}")]
    CommunicationTimeout { port: String, op: &'static str },
    #[error("I/O error on {port}: {source}")]
    Io {
        port: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Port {0} closed")]
    Closed(String),
}

impl TransportError {
    pub fn io(port: impl Into<String>, source: std::io::Error) -> Self {
        TransportError::Io {
            port: port.into(),
            source,
        }
    }

    /// Port this error refers to.
    pub fn port(&self) -> &str {
        match self {
            TransportError::PortUnavailable { port, .. }
            | TransportError::CommunicationTimeout { port, .. }
            | TransportError::Io { port, .. } => port,
            TransportError::PortBusy(port) | TransportError::Closed(port) => port,
        }
    }
}

/// Reasons a received Modbus RTU frame is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),
    #[error("Protocol mismatch: expected unit {expected_unit} fc 0x03, got unit {unit} fc {function_code:#04x}")]
    ProtocolMismatch {
        expected_unit: u8,
        unit: u8,
        function_code: u8,
    },
    #[error("CRC validation failed: expected {expected:#06x}, got {actual:#06x}")]
    CrcValidationFailure { expected: u16, actual: u16 },
    #[error("Byte count mismatch: expected {expected}, got {actual}")]
    ByteCountMismatch { expected: usize, actual: usize },
}

/// Invalid device or gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Unsupported function code {0:#04x}")]
    UnsupportedFunction(u8),
}

/// Why one register read against a device produced no data.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Rejected response: {0}")]
    Frame(#[from] FrameError),
    #[error("No response from {0}")]
    NoResponse(String),
    #[error("Device not registered: {0}")]
    UnknownDevice(String),
    #[error("No transport available for {0}")]
    Unsupported(String),
    #[error("Modbus-TCP request to {addr} failed: {message}")]
    Tcp {
        addr: std::net::SocketAddr,
        message: String,
    },
}

impl PollError {
    /// OS-level failure, as opposed to a silent or misbehaving device
    pub fn is_transport(&self) -> bool {
        matches!(self, PollError::Transport(_))
    }
}

impl From<validator::ValidationErrors> for ConfigurationError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ConfigurationError::Invalid(errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_port() {
        let err = TransportError::PortBusy("/dev/ttyUSB0".to_string());
        assert_eq!(err.port(), "/dev/ttyUSB0");

        let err = TransportError::io(
            "/dev/ttyUSB1",
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"),
        );
        assert_eq!(err.port(), "/dev/ttyUSB1");
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_frame_error_display() {
        let err = FrameError::CrcValidationFailure {
            expected: 0x0A84,
            actual: 0x840A,
        };
        assert_eq!(
            err.to_string(),
            "CRC validation failed: expected 0x0a84, got 0x840a"
        );
    }

    #[test]
    fn test_poll_error_sources() {
        let err: PollError = TransportError::PortBusy("SIM0".to_string()).into();
        assert!(err.is_transport());

        let err: PollError = FrameError::TooShort(2).into();
        assert!(!err.is_transport());
        assert_eq!(err.to_string(), "Rejected response: Frame too short: 2 bytes");
    }
}
