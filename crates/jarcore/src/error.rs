use thiserror::Error;

/// A remote call the backend rejected or could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{call} failed: {message}")]
pub struct GatewayError {
    /// Logical name of the call (`start_instance`, `delete_instance`, ...).
    pub call: &'static str,
    pub message: String,
}

impl GatewayError {
    pub fn new(call: &'static str, message: impl Into<String>) -> Self {
        Self {
            call,
            message: message.into(),
        }
    }
}

/// An event subscription that could not be registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot subscribe to {event}: {message}")]
pub struct BusError {
    pub event: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("instance engine has been disposed")]
    Disposed,
    #[error("instance engine is not initialized")]
    NotInitialized,
    #[error("another install is already in progress")]
    InstallInProgress,
}
