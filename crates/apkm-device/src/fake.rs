//! In-memory `DeviceControlClient` with call counters, for tests.

use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::control::{DeviceControlClient, DeviceEntry, InstalledPackage, PROP_SERIAL, READY_STATE};
use crate::error::ControlError;

#[derive(Clone, Debug)]
pub struct FakeDevice {
    pub id: String,
    pub state: String,
    pub props: HashMap<String, String>,
    pub packages: Vec<InstalledPackage>,
}

impl FakeDevice {
    pub fn new(id: &str, serial: &str) -> Self {
        let mut props = HashMap::new();
        props.insert(PROP_SERIAL.to_string(), serial.to_string());
        Self {
            id: id.to_string(),
            state: READY_STATE.to_string(),
            props,
            packages: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: &str) -> Self {
        self.state = state.to_string();
        self
    }

    pub fn with_prop(mut self, key: &str, value: &str) -> Self {
        self.props.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_package(mut self, package: InstalledPackage) -> Self {
        self.packages.push(package);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedInstall {
    pub device: String,
    pub artifacts: Vec<PathBuf>,
    pub multiple: bool,
}

#[derive(Default)]
struct Inner {
    devices: Vec<FakeDevice>,
    on_connect: HashMap<String, FakeDevice>,
    calls: HashMap<&'static str, usize>,
    installs: Vec<RecordedInstall>,
    uninstalls: Vec<(String, String)>,
    intents: Vec<(String, String, String)>,
    staged: HashMap<String, InstalledPackage>,
    install_failure: Option<String>,
    state_failures: HashMap<String, String>,
    intent_failure: Option<String>,
    marker_script: VecDeque<Vec<String>>,
    last_markers: Vec<String>,
    pull_tree: Vec<(PathBuf, Vec<u8>)>,
}

#[derive(Default)]
pub struct FakeDeviceClient {
    inner: Mutex<Inner>,
}

impl FakeDeviceClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn record(&self, op: &'static str) {
        self.with_inner(|inner| *inner.calls.entry(op).or_default() += 1);
    }

    pub fn add_device(&self, device: FakeDevice) {
        self.with_inner(|inner| inner.devices.push(device));
    }

    /// Makes `device` visible only after `connect(endpoint)`.
    pub fn on_connect(&self, endpoint: &str, device: FakeDevice) {
        self.with_inner(|inner| {
            inner.on_connect.insert(endpoint.to_string(), device);
        });
    }

    pub fn set_state(&self, id: &str, state: &str) {
        self.with_inner(|inner| {
            if let Some(device) = inner.devices.iter_mut().find(|device| device.id == id) {
                device.state = state.to_string();
            }
        });
    }

    /// Package that appears on the device at the next install call.
    pub fn stage_install(&self, id: &str, package: InstalledPackage) {
        self.with_inner(|inner| {
            inner.staged.insert(id.to_string(), package);
        });
    }

    /// Makes `get_state` on `id` fail with `output`, as adb does for offline devices.
    pub fn fail_state_query(&self, id: &str, output: &str) {
        self.with_inner(|inner| {
            inner.state_failures.insert(id.to_string(), output.to_string());
        });
    }

    pub fn fail_installs(&self, output: &str) {
        self.with_inner(|inner| inner.install_failure = Some(output.to_string()));
    }

    pub fn fail_intents(&self, output: &str) {
        self.with_inner(|inner| inner.intent_failure = Some(output.to_string()));
    }

    /// Successive `list_remote_files` results; the last one repeats.
    pub fn script_markers(&self, script: Vec<Vec<String>>) {
        self.with_inner(|inner| inner.marker_script = script.into());
    }

    /// Files created under `local/<basename(remote)>` by `pull_directory`.
    pub fn set_pull_tree(&self, files: Vec<(PathBuf, Vec<u8>)>) {
        self.with_inner(|inner| inner.pull_tree = files);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.with_inner(|inner| inner.calls.get(op).copied().unwrap_or(0))
    }

    pub fn total_calls(&self) -> usize {
        self.with_inner(|inner| inner.calls.values().sum())
    }

    pub fn installs(&self) -> Vec<RecordedInstall> {
        self.with_inner(|inner| inner.installs.clone())
    }

    pub fn uninstalls(&self) -> Vec<(String, String)> {
        self.with_inner(|inner| inner.uninstalls.clone())
    }

    pub fn intents(&self) -> Vec<(String, String, String)> {
        self.with_inner(|inner| inner.intents.clone())
    }

    fn device<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FakeDevice) -> T,
    ) -> Result<T, ControlError> {
        self.with_inner(|inner| {
            inner
                .devices
                .iter_mut()
                .find(|device| device.id == id)
                .map(f)
                .ok_or_else(|| ControlError::Failed {
                    command: "adb -s".into(),
                    output: format!("error: device '{id}' not found"),
                })
        })
    }

    fn apply_install(&self, device: &str, artifacts: Vec<PathBuf>, multiple: bool)
        -> Result<(), ControlError> {
        let failure = self.with_inner(|inner| inner.install_failure.clone());
        if let Some(output) = failure {
            return Err(ControlError::Failed {
                command: "adb install".into(),
                output,
            });
        }
        let staged = self.with_inner(|inner| {
            inner.installs.push(RecordedInstall {
                device: device.to_string(),
                artifacts,
                multiple,
            });
            inner.staged.remove(device)
        });
        self.device(device, |fake| {
            if let Some(package) = staged {
                fake.packages.retain(|existing| existing.id != package.id);
                fake.packages.push(package);
            }
        })
    }
}

#[async_trait]
impl DeviceControlClient for FakeDeviceClient {
    async fn connect(&self, endpoint: &str) -> Result<(), ControlError> {
        self.record("connect");
        self.with_inner(|inner| {
            if let Some(device) = inner.on_connect.remove(endpoint) {
                inner.devices.push(device);
                return Ok(());
            }
            if inner.devices.iter().any(|device| device.id == endpoint) {
                return Ok(());
            }
            Err(ControlError::Failed {
                command: "adb connect".into(),
                output: format!("failed to connect to {endpoint}"),
            })
        })
    }

    async fn list_devices(&self) -> Result<Vec<DeviceEntry>, ControlError> {
        self.record("list_devices");
        Ok(self.with_inner(|inner| {
            inner
                .devices
                .iter()
                .map(|device| DeviceEntry {
                    id: device.id.clone(),
                    state: device.state.clone(),
                    model: None,
                })
                .collect()
        }))
    }

    async fn read_property(&self, device: &str, key: &str) -> Result<String, ControlError> {
        self.record("read_property");
        self.device(device, |fake| fake.props.get(key).cloned().unwrap_or_default())
    }

    async fn get_state(&self, device: &str) -> Result<String, ControlError> {
        self.record("get_state");
        if let Some(output) = self.with_inner(|inner| inner.state_failures.get(device).cloned()) {
            return Err(ControlError::Failed {
                command: "adb get-state".into(),
                output,
            });
        }
        self.device(device, |fake| fake.state.clone())
    }

    async fn install(&self, device: &str, artifact: &Path) -> Result<(), ControlError> {
        self.record("install");
        self.apply_install(device, vec![artifact.to_path_buf()], false)
    }

    async fn install_multiple(
        &self,
        device: &str,
        artifacts: &[PathBuf],
    ) -> Result<(), ControlError> {
        self.record("install_multiple");
        self.apply_install(device, artifacts.to_vec(), true)
    }

    async fn uninstall(&self, device: &str, package: &str) -> Result<(), ControlError> {
        self.record("uninstall");
        let removed = self.device(device, |fake| {
            let before = fake.packages.len();
            fake.packages.retain(|existing| existing.id != package);
            before != fake.packages.len()
        })?;
        if !removed {
            return Err(ControlError::Failed {
                command: "adb uninstall".into(),
                output: "Failure [DELETE_FAILED_INTERNAL_ERROR]".into(),
            });
        }
        self.with_inner(|inner| {
            inner
                .uninstalls
                .push((device.to_string(), package.to_string()))
        });
        Ok(())
    }

    async fn list_installed_packages(
        &self,
        device: &str,
    ) -> Result<Vec<InstalledPackage>, ControlError> {
        self.record("list_installed_packages");
        self.device(device, |fake| fake.packages.clone())
    }

    async fn push_file(&self, device: &str, _local: &Path, _remote: &str) -> Result<(), ControlError> {
        self.record("push_file");
        self.device(device, |_| ())
    }

    async fn pull_directory(
        &self,
        device: &str,
        remote: &str,
        local: &Path,
    ) -> Result<(), ControlError> {
        self.record("pull_directory");
        self.device(device, |_| ())?;
        let base = remote.trim_end_matches('/').rsplit('/').next().unwrap_or(remote);
        let root = local.join(base);
        let files = self.with_inner(|inner| inner.pull_tree.clone());
        for (rel, bytes) in files {
            let path = root.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| ControlError::Io(e.to_string()))?;
            }
            fs::write(&path, bytes).map_err(|e| ControlError::Io(e.to_string()))?;
        }
        Ok(())
    }

    async fn list_remote_files(
        &self,
        device: &str,
        _pattern: &str,
    ) -> Result<Vec<String>, ControlError> {
        self.record("list_remote_files");
        self.device(device, |_| ())?;
        Ok(self.with_inner(|inner| {
            if let Some(next) = inner.marker_script.pop_front() {
                inner.last_markers = next;
            }
            inner.last_markers.clone()
        }))
    }

    async fn send_intent(
        &self,
        device: &str,
        component: &str,
        data_uri: &str,
    ) -> Result<(), ControlError> {
        self.record("send_intent");
        self.device(device, |_| ())?;
        if let Some(output) = self.with_inner(|inner| inner.intent_failure.clone()) {
            return Err(ControlError::Failed {
                command: "adb shell".into(),
                output,
            });
        }
        self.with_inner(|inner| {
            inner.intents.push((
                device.to_string(),
                component.to_string(),
                data_uri.to_string(),
            ))
        });
        Ok(())
    }
}
