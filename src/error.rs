use thiserror::Error;

/// Errors that may occur in this library.
#[derive(Debug, Error)]
pub enum Error {
    /// A command was issued while the device connection is down.
    #[error("Not connected to the device")]
    NotConnected,

    /// The connection went down before a queued or in-flight command
    /// received its terminal reply. The command is not retried.
    #[error("Connection lost before the command completed")]
    ConnectionLost,

    /// The controller task is gone, e.g. during process shutdown.
    #[error("The controller has shut down")]
    Shutdown,

    /// The user's configuration is no good.
    #[error("Bad config: {0}")]
    BadConfig(String),

    /// Transport-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Unwrap the bad config message, else return the error as-is.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(message) = self {
            Ok(message)
        } else {
            Err(self)
        }
    }
}
