use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("Watch stream closed: {0}")]
    WatchClosed(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("No resolver registered for scheme: {0}")]
    UnknownScheme(String),

    #[error("Failed to build connection: {0}")]
    ConnectionBuild(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No addresses resolved for {0}")]
    NoAddresses(String),
}
