use std::{path::PathBuf, sync::Arc};

use apkm_device::{DeviceControlClient, DeviceHandle, DeviceProfile};
use apkm_util::{Clock, TokioClock};
use reqwest::Client;
use tokio::sync::watch;
use tracing::info;

use crate::aurora::AuroraSource;
use crate::config::SourceConfig;
use crate::error::AcquireResult;
use crate::fdroid::FdroidSource;
use crate::gplay::GplayCliSource;
use crate::package::{Method, Package};

/// A resolved device a source may read its profile from or drive directly.
#[derive(Clone)]
pub struct DeviceTarget {
    pub client: Arc<dyn DeviceControlClient>,
    pub handle: Arc<DeviceHandle>,
}

/// Everything a refresh may consult besides the package itself.
#[derive(Clone)]
pub struct RefreshContext {
    pub device: Option<DeviceTarget>,
    /// Version code the caller already knows it wants; lets cached bundles
    /// satisfy the refresh without a device round-trip.
    pub wanted_version: Option<i64>,
    pub clock: Arc<dyn Clock>,
    pub cancel: Option<watch::Receiver<bool>>,
}

impl RefreshContext {
    pub fn offline() -> Self {
        Self {
            device: None,
            wanted_version: None,
            clock: Arc::new(TokioClock::new()),
            cancel: None,
        }
    }

    pub fn with_device(mut self, client: Arc<dyn DeviceControlClient>, handle: Arc<DeviceHandle>) -> Self {
        self.device = Some(DeviceTarget { client, handle });
        self
    }

    pub fn with_wanted_version(mut self, version: Option<i64>) -> Self {
        self.wanted_version = version;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn profile(&self) -> Option<&DeviceProfile> {
        self.device.as_ref().map(|device| device.handle.profile())
    }

    pub(crate) fn device_label(&self) -> String {
        match &self.device {
            Some(device) => {
                let profile = device.handle.profile();
                format!(
                    "{} abis={} sdk={}",
                    device.handle,
                    profile.abis.join(","),
                    profile.sdk.map_or_else(|| "?".to_string(), |sdk| sdk.to_string())
                )
            }
            None => "no device".to_string(),
        }
    }
}

#[derive(Clone)]
enum SourceKind {
    Fdroid(FdroidSource),
    GplayCli(GplayCliSource),
    Aurora(AuroraSource),
}

/// Acquirer for one package through one method.
#[derive(Clone)]
pub struct PackageSource {
    package: Package,
    kind: SourceKind,
}

impl PackageSource {
    /// Binds `package_id` to the named method; fails with `UnknownMethod`.
    pub fn resolve(
        method: &str,
        package_id: &str,
        config: &SourceConfig,
        http: &Client,
    ) -> AcquireResult<Self> {
        let method: Method = method.parse()?;
        Ok(Self::for_method(method, package_id, config, http))
    }

    pub fn for_method(method: Method, package_id: &str, config: &SourceConfig, http: &Client) -> Self {
        let kind = match method {
            Method::Fdroid => SourceKind::Fdroid(FdroidSource::new(config, http.clone())),
            Method::GplayCli => SourceKind::GplayCli(GplayCliSource::new(config)),
            Method::Aurora => SourceKind::Aurora(AuroraSource::new(config)),
        };
        Self {
            package: Package::new(package_id, method),
            kind,
        }
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn package_mut(&mut self) -> &mut Package {
        &mut self.package
    }

    pub fn method(&self) -> Method {
        self.package.method()
    }

    /// Acquires or updates the cached artifacts and returns their paths.
    pub async fn refresh_cache(&mut self, ctx: &RefreshContext) -> AcquireResult<Vec<PathBuf>> {
        info!(
            "Refreshing {} from {}",
            self.package.id(),
            self.method().describe()
        );
        match &self.kind {
            SourceKind::Fdroid(source) => source.refresh(&mut self.package, ctx).await,
            SourceKind::GplayCli(source) => source.refresh(&mut self.package, ctx).await,
            SourceKind::Aurora(source) => source.refresh(&mut self.package, ctx).await,
        }
    }
}
