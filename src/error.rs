use thiserror::Error;

/// Failures that prevent the transfer service from reaching the Active state.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("No root directory path set")]
    MissingRootDirectory,
    #[error("Failed to start hotspot: {0}")]
    Hotspot(String),
    #[error("Failed to read hotspot credentials: {0}")]
    Credentials(String),
    #[error("Failed to bind transfer server on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to prepare save directory: {0}")]
    SaveDirectory(String),
    #[error("No local IP address found")]
    NoLocalIp,
}
