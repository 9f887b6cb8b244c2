// src/error.rs
//
// Error type for the adapter driver.

use std::fmt;

/// All driver errors.
#[derive(Debug)]
pub enum IoError {
    /// No adapter matching the configuration was found.
    DeviceNotFound,
    /// Failed to open, claim, or talk to the USB device.
    Connection { device: String, message: String },
    /// The device rejected or garbled a protocol operation.
    Protocol { device: String, message: String },
    /// Invalid configuration value.
    Configuration { message: String },
    /// The operation conflicts with the current stream state.
    InvalidState { message: String },
}

impl IoError {
    pub fn connection(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Connection {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn protocol(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Protocol {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        IoError::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        IoError::InvalidState {
            message: message.into(),
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::DeviceNotFound => write!(f, "No matching CP210x CAN adapter found"),
            IoError::Connection { device, message } => {
                write!(f, "{}: connection error: {}", device, message)
            }
            IoError::Protocol { device, message } => {
                write!(f, "{}: protocol error: {}", device, message)
            }
            IoError::Configuration { message } => write!(f, "Invalid configuration: {}", message),
            IoError::InvalidState { message } => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for IoError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_device() {
        let err = IoError::protocol("cp210x(1:4)", "short control response");
        assert_eq!(
            err.to_string(),
            "cp210x(1:4): protocol error: short control response"
        );
    }

    #[test]
    fn test_configuration_display() {
        let err = IoError::configuration("serial rate must be nonzero");
        assert!(err.to_string().contains("serial rate"));
    }
}
