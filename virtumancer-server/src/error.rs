//! Error type for control-plane operations.

use thiserror::Error;
use virtumancer_driver::DriverError;
use virtumancer_store::StoreError;

/// Errors surfaced by the control-plane facade and its collaborators.
#[derive(Error, Debug)]
pub enum ControlError {
    /// A driver already exists in the pool for this host id.
    #[error("Host {0} is already connected")]
    AlreadyConnected(String),

    /// No driver exists in the pool for this host id.
    #[error("Host {0} is not connected")]
    NotConnected(String),

    /// The request itself is malformed (bad verb, empty id, ...).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ControlError {
    /// Caller error rather than a backend failure.
    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            ControlError::InvalidRequest(_)
                | ControlError::Driver(DriverError::UnsupportedScheme(_))
                | ControlError::Driver(DriverError::InvalidUri(_))
        )
    }

    /// The referenced VM does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ControlError::Driver(DriverError::NotFound(_))
                | ControlError::Store(StoreError::NotFound(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
