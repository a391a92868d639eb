use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use apkm_device::{ControlError, DeviceControlClient};
use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{collect_apks, CacheLock};
use crate::config::{SourceConfig, WaiterConfig};
use crate::error::{AcquireError, AcquireResult};
use crate::package::{Method, Package};
use crate::source::{DeviceTarget, RefreshContext};
use crate::waiter::{DownloadWaiter, MarkerSource};

/// Package id of the on-device store; acquiring it bootstraps from a bundled artifact.
pub const AURORA_PACKAGE: &str = "com.aurora.store.debug";
pub const AURORA_DETAILS_ACTIVITY: &str =
    "com.aurora.store.debug/com.aurora.store.view.ui.details.AppDetailsActivity";
const DOWNLOADS_ROOT: &str = "sdcard/Aurora/Store/Downloads";

pub fn downloads_dir(package: &str) -> String {
    format!("{DOWNLOADS_ROOT}/{package}")
}

pub fn market_uri(package: &str) -> String {
    format!("market://?id={package}&download")
}

/// Trigger and marker listing against one device's store.
struct DeviceMarkers {
    client: Arc<dyn DeviceControlClient>,
    device: String,
    package: String,
}

impl DeviceMarkers {
    fn control_error(&self, operation: &'static str, source: ControlError) -> AcquireError {
        AcquireError::Control {
            package: self.package.clone(),
            device: self.device.clone(),
            operation,
            source,
        }
    }
}

#[async_trait]
impl MarkerSource for DeviceMarkers {
    async fn trigger(&self) -> AcquireResult<()> {
        debug!("{}: asking {AURORA_PACKAGE} to download", self.package);
        match self
            .client
            .send_intent(&self.device, AURORA_DETAILS_ACTIVITY, &market_uri(&self.package))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.output().is_some_and(|out| out.contains("does not exist")) => {
                Err(AcquireError::ToolUnavailable {
                    package: self.package.clone(),
                    tool: AURORA_PACKAGE.into(),
                    detail: format!("store activity missing on {}; is it installed?", self.device),
                })
            }
            Err(err) => Err(self.control_error("start store activity", err)),
        }
    }

    async fn list_markers(&self) -> AcquireResult<Vec<String>> {
        let pattern = format!("{}/.*.download-*", downloads_dir(&self.package));
        self.client
            .list_remote_files(&self.device, &pattern)
            .await
            .map_err(|err| self.control_error("list download markers", err))
    }
}

/// In-device market proxy variant: the store on the device downloads, the
/// result is pulled into `{cache}/aurora/{pkg}/{version}`.
#[derive(Clone, Debug)]
pub struct AuroraSource {
    dir: PathBuf,
    bootstrap_apk: Option<PathBuf>,
    waiter: WaiterConfig,
}

impl AuroraSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            dir: config.method_dir(Method::Aurora),
            bootstrap_apk: config.aurora_bootstrap_apk.clone(),
            waiter: config.waiter.clone(),
        }
    }

    pub(crate) async fn refresh(
        &self,
        package: &mut Package,
        ctx: &RefreshContext,
    ) -> AcquireResult<Vec<PathBuf>> {
        let _lock = CacheLock::acquire(&self.dir).await?;
        let id = package.id().to_string();

        if id == AURORA_PACKAGE {
            let artifact = self.bootstrap(&id)?;
            package.set_artifacts(vec![artifact.clone()]);
            return Ok(vec![artifact]);
        }

        if let Some(version) = ctx.wanted_version {
            let cached = collect_apks(&self.version_dir(&id, version));
            if !cached.is_empty() {
                info!("Using cached {id} bundle for version {version}");
                package.set_artifacts(cached.clone());
                return Ok(cached);
            }
        }

        let device = ctx.device.as_ref().ok_or_else(|| AcquireError::DeviceRequired {
            package: id.clone(),
            method: Method::Aurora,
        })?;
        let markers = Arc::new(DeviceMarkers {
            client: Arc::clone(&device.client),
            device: device.handle.transport_id().to_string(),
            package: id.clone(),
        });

        let outcome = DownloadWaiter::new(
            &id,
            markers,
            Arc::clone(&ctx.clock),
            self.waiter.clone(),
            ctx.cancel.clone(),
        )
        .spawn()
        .await
        .map_err(|e| AcquireError::io(format!("{id}: download waiter"), e.into()))??;
        info!("Downloaded {id} @ {}", outcome.version_code);

        let version_dir = self.commit_pull(&id, device, outcome.version_code).await?;
        let artifacts = collect_apks(&version_dir);
        if artifacts.is_empty() {
            return Err(AcquireError::AcquisitionFailed {
                package: id,
                method: Method::Aurora,
                output: format!("no artifacts in {}", version_dir.display()),
            });
        }
        package.set_artifacts(artifacts.clone());
        Ok(artifacts)
    }

    fn version_dir(&self, package: &str, version: i64) -> PathBuf {
        self.dir.join(package).join(version.to_string())
    }

    fn bootstrap(&self, package: &str) -> AcquireResult<PathBuf> {
        let bundled = self
            .bootstrap_apk
            .as_ref()
            .ok_or_else(|| AcquireError::ToolUnavailable {
                package: package.to_string(),
                tool: AURORA_PACKAGE.into(),
                detail: "no bundled artifact configured (set APKM_AURORA_BOOTSTRAP_APK)".into(),
            })?;
        let dest = self.dir.join(format!("{AURORA_PACKAGE}.apk"));
        info!("Bootstrapping {AURORA_PACKAGE} from {}", bundled.display());
        fs::copy(bundled, &dest).map_err(|e| {
            AcquireError::io(
                format!("copying {} to {}", bundled.display(), dest.display()),
                e,
            )
        })?;
        Ok(dest)
    }

    /// Pulls the device download directory into a staging directory and moves
    /// the completed version into place. Nothing under the cache's version
    /// directories changes unless the pull succeeds.
    async fn commit_pull(
        &self,
        package: &str,
        device: &DeviceTarget,
        version: i64,
    ) -> AcquireResult<PathBuf> {
        let staging = self.dir.join(format!(".staging-{}", Uuid::new_v4()));
        fs::create_dir_all(&staging)
            .map_err(|e| AcquireError::io(format!("creating {}", staging.display()), e))?;

        let result = self.move_pulled(package, device, version, &staging).await;
        if let Err(err) = fs::remove_dir_all(&staging) {
            warn!("Failed to clean {}: {err}", staging.display());
        }
        result
    }

    async fn move_pulled(
        &self,
        package: &str,
        device: &DeviceTarget,
        version: i64,
        staging: &Path,
    ) -> AcquireResult<PathBuf> {
        let transport = device.handle.transport_id();
        device
            .client
            .pull_directory(transport, &downloads_dir(package), staging)
            .await
            .map_err(|source| AcquireError::Control {
                package: package.to_string(),
                device: transport.to_string(),
                operation: "pull downloads",
                source,
            })?;

        let pulled = staging.join(package);
        let versioned = pulled.join(version.to_string());
        let src = if versioned.is_dir() { versioned } else { pulled };
        if !src.is_dir() {
            return Err(AcquireError::AcquisitionFailed {
                package: package.to_string(),
                method: Method::Aurora,
                output: format!("{} was not pulled from {transport}", downloads_dir(package)),
            });
        }

        let dest = self.version_dir(package, version);
        if dest.exists() {
            fs::remove_dir_all(&dest)
                .map_err(|e| AcquireError::io(format!("replacing {}", dest.display()), e))?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AcquireError::io(format!("creating {}", parent.display()), e))?;
        }
        fs::rename(&src, &dest)
            .map_err(|e| AcquireError::io(format!("committing {}", dest.display()), e))?;
        debug!("Committed {} to {}", src.display(), dest.display());
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use apkm_device::fake::{FakeDevice, FakeDeviceClient};
    use apkm_device::DeviceSessionRegistry;
    use apkm_util::ManualClock;

    use super::*;

    async fn device_context(client: Arc<FakeDeviceClient>) -> RefreshContext {
        let registry = DeviceSessionRegistry::new(client.clone());
        let handle = registry.resolve(Some("R58"), None).await.unwrap();
        RefreshContext::offline()
            .with_device(client, handle)
            .with_clock(Arc::new(ManualClock::new()))
    }

    fn fake_client() -> Arc<FakeDeviceClient> {
        let client = Arc::new(FakeDeviceClient::new());
        client.add_device(FakeDevice::new("R58", "R58"));
        client
    }

    fn marker(name: &str) -> String {
        format!("{}/{name}", downloads_dir("org.example"))
    }

    #[tokio::test]
    async fn waits_pulls_and_commits_the_completed_bundle() {
        let client = fake_client();
        client.script_markers(vec![
            vec![],
            vec![marker(".42.download-in-progress")],
            vec![marker(".42.download-complete")],
        ]);
        client.set_pull_tree(vec![
            (PathBuf::from("42/org.example.apk"), b"base".to_vec()),
            (PathBuf::from("42/split_config.arm64_v8a.apk"), b"split".to_vec()),
            (PathBuf::from(".42.download-complete"), Vec::new()),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let source = AuroraSource::new(&SourceConfig::new(dir.path().to_path_buf()));
        let mut package = Package::new("org.example", Method::Aurora);

        let ctx = device_context(client.clone()).await;
        let paths = source.refresh(&mut package, &ctx).await.unwrap();

        let version_dir = dir.path().join("aurora/org.example/42");
        assert_eq!(
            paths,
            vec![
                version_dir.join("org.example.apk"),
                version_dir.join("split_config.arm64_v8a.apk"),
            ]
        );
        assert_eq!(package.base_artifact(), Some(&version_dir.join("org.example.apk")));
        assert_eq!(
            client.intents(),
            vec![(
                "R58".to_string(),
                AURORA_DETAILS_ACTIVITY.to_string(),
                "market://?id=org.example&download".to_string(),
            )]
        );
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("aurora"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".staging"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn missing_store_activity_is_tool_unavailable() {
        let client = fake_client();
        client.fail_intents(
            "Error: Activity class {com.aurora.store.debug/com.aurora.store.view.ui.details.AppDetailsActivity} does not exist.",
        );
        let dir = tempfile::tempdir().unwrap();
        let source = AuroraSource::new(&SourceConfig::new(dir.path().to_path_buf()));
        let mut package = Package::new("org.example", Method::Aurora);

        let ctx = device_context(client.clone()).await;
        let err = source.refresh(&mut package, &ctx).await.unwrap_err();
        assert!(matches!(err, AcquireError::ToolUnavailable { .. }));
        assert_eq!(client.calls("pull_directory"), 0);
    }

    #[tokio::test]
    async fn cached_version_needs_no_device() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("aurora/org.example/42");
        fs::create_dir_all(&version_dir).unwrap();
        fs::write(version_dir.join("org.example.apk"), b"base").unwrap();
        let source = AuroraSource::new(&SourceConfig::new(dir.path().to_path_buf()));

        let mut package = Package::new("org.example", Method::Aurora);
        let ctx = RefreshContext::offline().with_wanted_version(Some(42));
        let paths = source.refresh(&mut package, &ctx).await.unwrap();
        assert_eq!(paths, vec![version_dir.join("org.example.apk")]);

        let mut package = Package::new("org.example", Method::Aurora);
        let ctx = RefreshContext::offline().with_wanted_version(Some(43));
        let err = source.refresh(&mut package, &ctx).await.unwrap_err();
        assert!(matches!(err, AcquireError::DeviceRequired { .. }));
    }

    #[tokio::test]
    async fn store_itself_is_bootstrapped_from_bundled_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let bundled = dir.path().join("aurora-debug.apk");
        fs::write(&bundled, b"store").unwrap();

        let mut config = SourceConfig::new(dir.path().join("cache"));
        let source = AuroraSource::new(&config);
        let mut package = Package::new(AURORA_PACKAGE, Method::Aurora);
        let err = source
            .refresh(&mut package, &RefreshContext::offline())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::ToolUnavailable { .. }));

        config.aurora_bootstrap_apk = Some(bundled);
        let source = AuroraSource::new(&config);
        let paths = source
            .refresh(&mut package, &RefreshContext::offline())
            .await
            .unwrap();
        let expected = dir.path().join("cache/aurora/com.aurora.store.debug.apk");
        assert_eq!(paths, vec![expected.clone()]);
        assert_eq!(fs::read(expected).unwrap(), b"store");
    }
}
