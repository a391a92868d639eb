use thiserror::Error;

/// Failure of a single control-channel call.
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    #[error("{tool} not found ({hint})")]
    ToolNotFound { tool: String, hint: String },

    #[error("{0}")]
    Io(String),

    #[error("{command} failed: {output}")]
    Failed { command: String, output: String },
}

impl ControlError {
    /// Raw tool output, when the tool ran and reported a failure.
    pub fn output(&self) -> Option<&str> {
        match self {
            ControlError::Failed { output, .. } => Some(output),
            _ => None,
        }
    }

    /// True when the channel itself broke rather than the tool refusing a request.
    pub fn is_channel_failure(&self) -> bool {
        match self {
            ControlError::ToolNotFound { .. } | ControlError::Io(_) => true,
            ControlError::Failed { output, .. } => {
                let lower = output.to_ascii_lowercase();
                lower.contains("device offline")
                    || lower.contains("not found")
                    || lower.contains("no devices/emulators")
                    || lower.contains("closed")
            }
        }
    }

    /// State named by a failed `get-state`; adb exits non-zero for attached
    /// devices that are offline, unauthorized or still coming up.
    pub fn unready_state(&self) -> Option<&'static str> {
        let ControlError::Failed { output, .. } = self else {
            return None;
        };
        let lower = output.to_ascii_lowercase();
        if !lower.contains("error: device") && !lower.contains("no permissions") {
            return None;
        }
        [
            ("unauthorized", "unauthorized"),
            ("offline", "offline"),
            ("still authorizing", "authorizing"),
            ("still connecting", "connecting"),
            ("no permissions", "no permissions"),
        ]
        .into_iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, state)| state)
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("either a serial or a network endpoint is required to locate a device")]
    NoIdentifierProvided,

    #[error("device {wanted} not found; visible devices: [{}]", visible.join(", "))]
    DeviceNotFound { wanted: String, visible: Vec<String> },

    #[error("device at {endpoint} reports serial {observed}, expected {declared}")]
    IdentityMismatch {
        endpoint: String,
        declared: String,
        observed: String,
    },

    #[error("device {device} is not ready, in state: {state}")]
    DeviceNotReady { device: String, state: String },

    #[error("control channel to {device} failed during {operation}: {source}")]
    Control {
        device: String,
        operation: &'static str,
        #[source]
        source: ControlError,
    },
}

pub type DeviceResult<T> = Result<T, DeviceError>;
