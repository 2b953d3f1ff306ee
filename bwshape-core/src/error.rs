use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShaperError {
    #[error("Invalid CIDR: {0:?}")]
    InvalidCidr(String),
    #[error("Download and upload limits must be greater than 0 (download: {download}, upload: {upload})")]
    InvalidLimit { download: u64, upload: u64 },
    #[error("Failed to resolve peer address: {0}")]
    AddressResolutionFailed(#[source] io::Error),
}

/// Error returned when a [`ShaperOptions`](crate::ShaperOptions) entry is rejected.
#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("Failed to add server limit: {0}")]
    ServerLimit(#[source] ShaperError),
    #[error("Failed to add subnet limit for {cidr}: {source}")]
    SubnetLimit {
        cidr: String,
        #[source]
        source: ShaperError,
    },
}

impl From<ShaperError> for io::Error {
    fn from(err: ShaperError) -> Self {
        match err {
            ShaperError::AddressResolutionFailed(e) => e,
            e => Self::new(io::ErrorKind::InvalidInput, e),
        }
    }
}
