use std::time::Duration;

use tokio_modbus::ExceptionCode;

/// Errors raised by hubs, transports and the register codec.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Integrator mistake: invalid connection settings, data type / word count
    /// combination, or a value that cannot be represented.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] tokio_modbus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("modbus exception: {0:?}")]
    Exception(ExceptionCode),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("hub {hub}: no response within {timeout:?}")]
    Timeout { hub: String, timeout: Duration },

    /// The hub cannot serve the request right now: the virtual slave has not
    /// been started or has no attached master, or the client is not connected.
    #[error("hub {hub} is not connected")]
    NotConnected { hub: String },
}

impl HubError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_connected(hub: impl Into<String>) -> Self {
        Self::NotConnected { hub: hub.into() }
    }

    /// `true` for availability errors, as opposed to genuine transport failures.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }
}

impl From<ExceptionCode> for HubError {
    fn from(code: ExceptionCode) -> Self {
        Self::Exception(code)
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
