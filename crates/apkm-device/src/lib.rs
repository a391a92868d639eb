//! Device resolution and control for apkm: the `adb`-backed control client,
//! the per-run session registry and the installed-package cache.

mod adb;
mod control;
mod error;
mod ids;
mod packages;
mod session;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

pub use adb::{adb_path, AdbClient};
pub use control::{
    DeviceControlClient, DeviceEntry, InstalledPackage, PROP_ABI, PROP_ABI_LIST, PROP_CODENAME,
    PROP_SDK, PROP_SERIAL, READY_STATE,
};
pub use error::{ControlError, DeviceError, DeviceResult};
pub use ids::{canonicalize_adb_serial, normalize_device_id, session_key, USB_KEY_PREFIX};
pub use packages::{InstalledPackageIndex, InstalledState, InstalledVersion};
pub use session::{DeviceHandle, DeviceProfile, DeviceSessionRegistry};
