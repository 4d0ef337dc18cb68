use thiserror::Error;

/// Errors returned by the motor control core. Whatever the variant, any move
/// that was in progress has already left its motor disabled by the time the
/// caller sees it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The caller passed a bad volume, step count, speed, pin map or index
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Driver pins were never configured successfully
    #[error("driver pins are not configured")]
    NotReady,
    /// Direction or calibration was requested while the driver is unpowered
    #[error("driver is not enabled")]
    NotEnabled,
    /// A move was attempted before calibration
    #[error("not calibrated")]
    NotCalibrated,
    /// The pump is not the active one on a shared motor resource
    #[error("pump '{0}' is not the active pump")]
    NotActive(String),
    /// The pin or pulse backend failed
    #[error("hardware error: {0}")]
    Hardware(String),
    /// The configuration file could not be read or written
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub fn hardware(message: impl Into<String>) -> Self {
        Error::Hardware(message.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
