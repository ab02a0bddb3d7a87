use super::registry::PoolId;

/// Error returned when a channel cannot be leased.
///
/// Neither is retried internally: it is up to the caller to back off and try again.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseError {
    #[error("All the channels on the selected connection are leased")]
    OutOfChannels,
    #[error("The selected connection is not available (not connected or restarting)")]
    ConnectionUnavailable,
}

impl From<deadpool::managed::PoolError<LeaseError>> for LeaseError {
    fn from(err: deadpool::managed::PoolError<LeaseError>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            _ => LeaseError::ConnectionUnavailable,
        }
    }
}

/// Error returned when starting, provisioning or looking up a pool.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Failed to connect to the broker")]
    Connect(#[source] anyhow::Error),
    #[error("Failed to provision queue `{queue}`")]
    ProvisioningFailure {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error("There is no running pool named `{0}`")]
    UnknownPool(PoolId),
    #[error("A pool named `{0}` is already running")]
    AlreadyRegistered(PoolId),
}
