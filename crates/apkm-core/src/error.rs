use std::{io, path::PathBuf};

use apkm_device::{ControlError, DeviceError};
use apkm_source::AcquireError;
use serde::Serialize;
use thiserror::Error;

/// Coarse classification of every failure apkm reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ConfigurationError,
    DeviceUnavailable,
    AcquisitionFailure,
    DownloadTimeout,
    ArtifactParseError,
}

#[derive(Debug, Error)]
pub enum ApkmError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error("{package}: {operation} on {device} failed: {source}")]
    Control {
        package: String,
        device: String,
        operation: &'static str,
        #[source]
        source: ControlError,
    },

    #[error("failed to build http client: {0}")]
    HttpClient(String),

    #[error("state file {}: {source}", path.display())]
    StateIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {}: {source}", path.display())]
    StateParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ApkmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApkmError::Device(DeviceError::NoIdentifierProvided) => ErrorKind::ConfigurationError,
            ApkmError::Device(_) => ErrorKind::DeviceUnavailable,
            ApkmError::Acquire(err) => acquire_kind(err),
            ApkmError::Control { source, .. } if source.is_channel_failure() => {
                ErrorKind::DeviceUnavailable
            }
            ApkmError::Control { .. } => ErrorKind::AcquisitionFailure,
            ApkmError::HttpClient(_) | ApkmError::StateIo { .. } | ApkmError::StateParse { .. } => {
                ErrorKind::ConfigurationError
            }
        }
    }

    /// True when the device's control channel broke and its handle should be
    /// re-probed.
    pub fn is_channel_failure(&self) -> bool {
        match self {
            ApkmError::Device(DeviceError::Control { source, .. }) => source.is_channel_failure(),
            ApkmError::Acquire(err) => err
                .control_failure()
                .is_some_and(ControlError::is_channel_failure),
            ApkmError::Control { source, .. } => source.is_channel_failure(),
            _ => false,
        }
    }
}

fn acquire_kind(err: &AcquireError) -> ErrorKind {
    match err {
        AcquireError::UnknownMethod(_) | AcquireError::DeviceRequired { .. } => {
            ErrorKind::ConfigurationError
        }
        AcquireError::DownloadTimeout { .. } => ErrorKind::DownloadTimeout,
        AcquireError::MarkerParse { .. }
        | AcquireError::BadArtifact { .. }
        | AcquireError::ArtifactParse { .. }
        | AcquireError::IndexParse { .. } => ErrorKind::ArtifactParseError,
        AcquireError::Control { source, .. } if source.is_channel_failure() => {
            ErrorKind::DeviceUnavailable
        }
        _ => ErrorKind::AcquisitionFailure,
    }
}

pub type ApkmResult<T> = Result<T, ApkmError>;
