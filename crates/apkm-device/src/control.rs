use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ControlError;

/// adb reports a usable device with this state string.
pub const READY_STATE: &str = "device";

pub const PROP_SERIAL: &str = "ro.serialno";
pub const PROP_ABI_LIST: &str = "ro.product.cpu.abilist";
pub const PROP_ABI: &str = "ro.product.cpu.abi";
pub const PROP_SDK: &str = "ro.build.version.sdk";
pub const PROP_CODENAME: &str = "ro.product.device";

/// One line of `adb devices -l`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceEntry {
    pub id: String,
    pub state: String,
    pub model: Option<String>,
}

impl DeviceEntry {
    pub fn is_ready(&self) -> bool {
        self.state == READY_STATE
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstalledPackage {
    pub id: String,
    pub version_code: i64,
    pub version_name: String,
}

/// Device-control capability. `device` arguments are transport ids as listed
/// by `list_devices` (the value passed to `adb -s`).
#[async_trait]
pub trait DeviceControlClient: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<(), ControlError>;

    async fn list_devices(&self) -> Result<Vec<DeviceEntry>, ControlError>;

    async fn read_property(&self, device: &str, key: &str) -> Result<String, ControlError>;

    async fn get_state(&self, device: &str) -> Result<String, ControlError>;

    async fn install(&self, device: &str, artifact: &Path) -> Result<(), ControlError>;

    /// Installs every split of one package atomically.
    async fn install_multiple(&self, device: &str, artifacts: &[PathBuf])
        -> Result<(), ControlError>;

    async fn uninstall(&self, device: &str, package: &str) -> Result<(), ControlError>;

    async fn list_installed_packages(
        &self,
        device: &str,
    ) -> Result<Vec<InstalledPackage>, ControlError>;

    async fn push_file(&self, device: &str, local: &Path, remote: &str)
        -> Result<(), ControlError>;

    /// Copies `remote` into `local`, creating `local/<basename(remote)>`.
    async fn pull_directory(&self, device: &str, remote: &str, local: &Path)
        -> Result<(), ControlError>;

    /// Lists paths matching a shell glob, newest first. A glob with no match
    /// yields an empty list, not an error.
    async fn list_remote_files(&self, device: &str, pattern: &str)
        -> Result<Vec<String>, ControlError>;

    async fn send_intent(
        &self,
        device: &str,
        component: &str,
        data_uri: &str,
    ) -> Result<(), ControlError>;
}
