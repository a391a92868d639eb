use std::{path::PathBuf, time::Duration};

use apkm_device::ControlError;
use thiserror::Error;

use crate::package::Method;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("unknown acquisition method '{0}' (expected fdroid, gplaycli or aurora)")]
    UnknownMethod(String),

    #[error("{package}: method '{method}' needs a device to acquire from")]
    DeviceRequired { package: String, method: Method },

    #[error("{package}: not listed by {method}")]
    NoSuchPackage { package: String, method: Method },

    #[error("{package}: no {method} artifact matches the device ({device})")]
    NoMatchingArtifact {
        package: String,
        method: Method,
        device: String,
    },

    #[error("{package}: sha256 mismatch for {url} (expected {expected}, got {actual})")]
    HashMismatch {
        package: String,
        url: String,
        expected: String,
        actual: String,
    },

    #[error("{package}: {tool} is not available: {detail}")]
    ToolUnavailable {
        package: String,
        tool: String,
        detail: String,
    },

    #[error("{package}: {method} acquisition failed\n{output}")]
    AcquisitionFailed {
        package: String,
        method: Method,
        output: String,
    },

    #[error("{package}: download did not complete within {elapsed:?} ({triggers} triggers)")]
    DownloadTimeout {
        package: String,
        elapsed: Duration,
        triggers: u32,
    },

    #[error("{package}: download wait cancelled")]
    Cancelled { package: String },

    #[error("{package}: unrecognised download marker '{marker}'")]
    MarkerParse { package: String, marker: String },

    #[error("{}: artifact rejected by inspector\n{output}", path.display())]
    BadArtifact { path: PathBuf, output: String },

    #[error("{}: {detail}", path.display())]
    ArtifactParse { path: PathBuf, detail: String },

    #[error("{}: malformed index: {detail}", path.display())]
    IndexParse { path: PathBuf, detail: String },

    #[error("{package}: request to {url} failed: {detail}")]
    Http {
        package: String,
        url: String,
        detail: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{package}: device {device} {operation} failed: {source}")]
    Control {
        package: String,
        device: String,
        operation: &'static str,
        #[source]
        source: ControlError,
    },
}

impl AcquireError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        AcquireError::Io {
            context: context.into(),
            source,
        }
    }

    /// The device-control failure behind this error, if any.
    pub fn control_failure(&self) -> Option<&ControlError> {
        match self {
            AcquireError::Control { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type AcquireResult<T> = Result<T, AcquireError>;
