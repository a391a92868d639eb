use std::{path::PathBuf, sync::Arc};

use apkm_device::{DeviceControlClient, DeviceHandle, DeviceSessionRegistry, InstalledState};
use apkm_source::{
    AcquireError, ArtifactVersion, Package, PackageInspector, PackageSource, RefreshContext,
    SourceConfig,
};
use apkm_util::{state_file_path, Clock, TokioClock};
use reqwest::Client;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{ApkmError, ApkmResult};

const STATE_FILE_NAME: &str = "resources.json";

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub sources: SourceConfig,
    pub state_file: PathBuf,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            sources: SourceConfig::from_env(),
            state_file: state_file_path(STATE_FILE_NAME),
        }
    }
}

/// Composes device sessions, package sources and the inspector into the
/// query/install/uninstall operations of one run.
pub struct AcquisitionOrchestrator {
    registry: DeviceSessionRegistry,
    inspector: Arc<dyn PackageInspector>,
    sources: SourceConfig,
    http: Client,
    clock: Arc<dyn Clock>,
    cancel_rx: Option<watch::Receiver<bool>>,
}

impl AcquisitionOrchestrator {
    pub fn new(
        client: Arc<dyn DeviceControlClient>,
        inspector: Arc<dyn PackageInspector>,
        sources: SourceConfig,
    ) -> ApkmResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("apkm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApkmError::HttpClient(e.to_string()))?;
        Ok(Self {
            registry: DeviceSessionRegistry::new(client),
            inspector,
            sources,
            http,
            clock: Arc::new(TokioClock::new()),
            cancel_rx: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    pub fn registry(&self) -> &DeviceSessionRegistry {
        &self.registry
    }

    fn client(&self) -> &dyn DeviceControlClient {
        self.registry.client().as_ref()
    }

    pub async fn resolve_device(
        &self,
        serial: Option<&str>,
        endpoint: Option<&str>,
    ) -> ApkmResult<Arc<DeviceHandle>> {
        Ok(self.registry.resolve(serial, endpoint).await?)
    }

    /// Drops the handle's registry entry when `result` reports a broken
    /// control channel, so the next resolution probes again.
    async fn observe<T>(&self, handle: &DeviceHandle, result: ApkmResult<T>) -> ApkmResult<T> {
        if let Err(err) = &result {
            if err.is_channel_failure() {
                warn!("control channel to {handle} failed; dropping cached session");
                self.registry.invalidate(handle.key()).await;
            }
        }
        result
    }

    fn refresh_context(
        &self,
        device: Option<&Arc<DeviceHandle>>,
        wanted_version: Option<i64>,
    ) -> RefreshContext {
        let mut ctx = RefreshContext::offline()
            .with_clock(Arc::clone(&self.clock))
            .with_wanted_version(wanted_version);
        if let Some(cancel_rx) = &self.cancel_rx {
            ctx = ctx.with_cancel(cancel_rx.clone());
        }
        if let Some(handle) = device {
            ctx = ctx.with_device(Arc::clone(self.registry.client()), Arc::clone(handle));
        }
        ctx
    }

    /// Acquires `package_id` through `method` and inspects the result.
    pub async fn acquire(
        &self,
        method: &str,
        package_id: &str,
        device: Option<&Arc<DeviceHandle>>,
        wanted_version: Option<i64>,
    ) -> ApkmResult<Package> {
        let mut source = PackageSource::resolve(method, package_id, &self.sources, &self.http)?;
        let ctx = self.refresh_context(device, wanted_version);
        let refreshed = source.refresh_cache(&ctx).await.map_err(ApkmError::from);
        let refreshed = match device {
            Some(handle) => self.observe(handle, refreshed).await?,
            None => refreshed?,
        };
        info!("{package_id}: {} artifact(s) cached", refreshed.len());

        let mut package = source.package().clone();
        if let Some(base) = package.base_artifact().cloned() {
            let version = self.inspector.inspect(&base).await?;
            info!(
                "{package_id}: cached version {} ({})",
                version.version_code, version.version_name
            );
            package.set_version(version);
        }
        Ok(package)
    }

    /// Version the named method currently offers, without installing it.
    pub async fn query_latest(
        &self,
        method: &str,
        package_id: &str,
        device: Option<&Arc<DeviceHandle>>,
    ) -> ApkmResult<ArtifactVersion> {
        let package = self.acquire(method, package_id, device, None).await?;
        package
            .version()
            .cloned()
            .ok_or_else(|| nothing_acquired(&package))
    }

    pub async fn query_installed(
        &self,
        handle: &Arc<DeviceHandle>,
        package_id: &str,
    ) -> ApkmResult<InstalledState> {
        let result = handle
            .installed(self.client(), package_id)
            .await
            .map_err(ApkmError::from);
        self.observe(handle, result).await
    }

    async fn ensure_ready(&self, handle: &DeviceHandle) -> ApkmResult<()> {
        let result = handle.ensure_ready(self.client()).await.map_err(ApkmError::from);
        self.observe(handle, result).await
    }

    /// Acquires and installs (or updates) `package_id`, returning the version
    /// the device reports afterwards.
    pub async fn install(
        &self,
        handle: &Arc<DeviceHandle>,
        method: &str,
        package_id: &str,
    ) -> ApkmResult<InstalledState> {
        self.install_version(handle, method, package_id, None).await
    }

    /// `install`, letting a source reuse cached artifacts of `wanted_version`.
    pub async fn install_version(
        &self,
        handle: &Arc<DeviceHandle>,
        method: &str,
        package_id: &str,
        wanted_version: Option<i64>,
    ) -> ApkmResult<InstalledState> {
        self.ensure_ready(handle).await?;
        let package = self
            .acquire(method, package_id, Some(handle), wanted_version)
            .await?;
        let Some(first) = package.artifacts().first() else {
            return Err(nothing_acquired(&package));
        };

        let transport = handle.transport_id();
        info!("Installing {package_id} on {handle}");
        let result = if package.is_bundle() {
            self.client()
                .install_multiple(transport, package.artifacts())
                .await
        } else {
            self.client().install(transport, first).await
        };
        handle.packages().invalidate().await;
        let result = result.map_err(|source| ApkmError::Control {
            package: package_id.to_string(),
            device: handle.to_string(),
            operation: "install",
            source,
        });
        self.observe(handle, result).await?;

        self.query_installed(handle, package_id).await
    }

    pub async fn uninstall(&self, handle: &Arc<DeviceHandle>, package_id: &str) -> ApkmResult<()> {
        self.ensure_ready(handle).await?;
        info!("Uninstalling {package_id} from {handle}");
        let result = self.client().uninstall(handle.transport_id(), package_id).await;
        handle.packages().invalidate().await;
        let result = result.map_err(|source| ApkmError::Control {
            package: package_id.to_string(),
            device: handle.to_string(),
            operation: "uninstall",
            source,
        });
        self.observe(handle, result).await
    }
}

fn nothing_acquired(package: &Package) -> ApkmError {
    ApkmError::from(AcquireError::AcquisitionFailed {
        package: package.id().to_string(),
        method: package.method(),
        output: "no artifact was produced".into(),
    })
}
