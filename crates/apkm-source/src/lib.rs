//! Package acquisition for apkm: the three `PackageSource` variants, the
//! on-device download waiter, cached HTTP downloads and artifact inspection.

mod aurora;
mod cache;
mod cancel;
mod config;
mod download;
mod error;
mod fdroid;
mod gplay;
mod hashing;
mod inspect;
mod package;
mod source;
mod waiter;

pub use aurora::{downloads_dir, market_uri, AuroraSource, AURORA_DETAILS_ACTIVITY, AURORA_PACKAGE};
pub use config::{SourceConfig, WaiterConfig, DEFAULT_FDROID_INDEX_URL};
pub use error::{AcquireError, AcquireResult};
pub use fdroid::FdroidSource;
pub use gplay::GplayCliSource;
pub use inspect::{aapt2_path, parse_badging, Aapt2Inspector, PackageInspector};
pub use package::{ArtifactVersion, Method, Package};
pub use source::{DeviceTarget, PackageSource, RefreshContext};
pub use waiter::{
    backoff_delay, DownloadWaitState, DownloadWaiter, MarkerSource, WaitOutcome, WaitPhase,
};
