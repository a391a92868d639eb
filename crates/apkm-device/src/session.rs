use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::control::{
    DeviceControlClient, DeviceEntry, PROP_ABI, PROP_ABI_LIST, PROP_CODENAME, PROP_SDK,
    PROP_SERIAL,
};
use crate::error::{DeviceError, DeviceResult};
use crate::ids::{canonicalize_adb_serial, normalize_device_id_for_compare, session_key};
use crate::packages::{InstalledPackageIndex, InstalledState};

/// Hardware facts used to pick compatible artifacts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeviceProfile {
    pub abis: Vec<String>,
    pub sdk: Option<u32>,
    pub codename: Option<String>,
}

/// A resolved device. The serial is the one read live from the device.
pub struct DeviceHandle {
    key: String,
    serial: String,
    transport_id: String,
    endpoint: Option<String>,
    profile: DeviceProfile,
    packages: InstalledPackageIndex,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("key", &self.key)
            .field("serial", &self.serial)
            .field("transport_id", &self.transport_id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.endpoint {
            Some(endpoint) => write!(f, "{} ({endpoint})", self.serial),
            None => write!(f, "{}", self.serial),
        }
    }
}

impl DeviceHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Identifier passed to the control channel (`adb -s`).
    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn packages(&self) -> &InstalledPackageIndex {
        &self.packages
    }

    pub async fn installed(
        &self,
        client: &dyn DeviceControlClient,
        package: &str,
    ) -> DeviceResult<InstalledState> {
        self.packages
            .lookup(client, &self.transport_id, package)
            .await
            .map_err(|source| DeviceError::Control {
                device: self.to_string(),
                operation: "list installed packages",
                source,
            })
    }

    /// Fails with `DeviceNotReady` unless the control channel reports `device`.
    pub async fn ensure_ready(&self, client: &dyn DeviceControlClient) -> DeviceResult<()> {
        let state = match client.get_state(&self.transport_id).await {
            Ok(state) => state,
            Err(source) => {
                return Err(match source.unready_state() {
                    Some(state) => DeviceError::DeviceNotReady {
                        device: self.to_string(),
                        state: state.to_string(),
                    },
                    None => DeviceError::Control {
                        device: self.to_string(),
                        operation: "get-state",
                        source,
                    },
                });
            }
        };
        if state == crate::control::READY_STATE {
            Ok(())
        } else {
            Err(DeviceError::DeviceNotReady {
                device: self.to_string(),
                state,
            })
        }
    }
}

type Slot = Arc<Mutex<Option<Arc<DeviceHandle>>>>;

/// Resolved devices of one reconciliation run, keyed by endpoint or `usb:{serial}`.
pub struct DeviceSessionRegistry {
    client: Arc<dyn DeviceControlClient>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl DeviceSessionRegistry {
    pub fn new(client: Arc<dyn DeviceControlClient>) -> Self {
        Self {
            client,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<dyn DeviceControlClient> {
        &self.client
    }

    pub async fn resolve(
        &self,
        serial: Option<&str>,
        endpoint: Option<&str>,
    ) -> DeviceResult<Arc<DeviceHandle>> {
        let key = session_key(serial, endpoint).ok_or(DeviceError::NoIdentifierProvided)?;
        let serial = serial.map(str::trim).filter(|value| !value.is_empty());
        let endpoint = endpoint.map(str::trim).filter(|value| !value.is_empty());

        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        // Held across the probe: concurrent resolutions of one key wait here.
        let mut guard = slot.lock().await;
        if let Some(handle) = guard.as_ref() {
            if let Some(declared) = serial {
                if declared != handle.serial() {
                    return Err(DeviceError::IdentityMismatch {
                        endpoint: handle.endpoint().unwrap_or(&key).to_string(),
                        declared: declared.to_string(),
                        observed: handle.serial().to_string(),
                    });
                }
            }
            debug!("reusing device session {key}");
            return Ok(Arc::clone(handle));
        }

        let handle = match endpoint {
            Some(endpoint) => self.probe_endpoint(&key, endpoint, serial).await?,
            None => {
                let serial = serial.ok_or(DeviceError::NoIdentifierProvided)?;
                self.probe_serial(&key, serial).await?
            }
        };
        info!("resolved device {handle} as {}", handle.transport_id);

        let handle = Arc::new(handle);
        *guard = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Drops a cached handle; the next `resolve` for its key probes again.
    pub async fn invalidate(&self, key: &str) {
        let slot = self.slots.lock().await.remove(key);
        if slot.is_some() {
            debug!("invalidated device session {key}");
        }
    }

    pub async fn cached(&self, key: &str) -> Option<Arc<DeviceHandle>> {
        let slot = self.slots.lock().await.get(key).cloned()?;
        let guard = slot.lock().await;
        guard.as_ref().map(Arc::clone)
    }

    async fn list_devices(&self, wanted: &str) -> DeviceResult<Vec<DeviceEntry>> {
        self.client
            .list_devices()
            .await
            .map_err(|source| DeviceError::Control {
                device: wanted.to_string(),
                operation: "list devices",
                source,
            })
    }

    async fn probe_endpoint(
        &self,
        key: &str,
        endpoint: &str,
        declared: Option<&str>,
    ) -> DeviceResult<DeviceHandle> {
        let transport = canonicalize_adb_serial(endpoint);
        if let Err(err) = self.client.connect(&transport).await {
            // The device may already be attached; the listing decides.
            warn!("connect {transport}: {err}");
        }

        let devices = self.list_devices(endpoint).await?;
        let wanted = normalize_device_id_for_compare(endpoint);
        let Some(entry) = devices
            .iter()
            .find(|entry| normalize_device_id_for_compare(&entry.id) == wanted)
        else {
            return Err(DeviceError::DeviceNotFound {
                wanted: endpoint.to_string(),
                visible: devices.iter().map(|entry| entry.id.clone()).collect(),
            });
        };

        let observed = self
            .client
            .read_property(&entry.id, PROP_SERIAL)
            .await
            .map_err(|source| DeviceError::Control {
                device: endpoint.to_string(),
                operation: "read serial",
                source,
            })?;
        let observed = observed.trim().to_string();

        if let Some(declared) = declared {
            if observed != declared {
                return Err(DeviceError::IdentityMismatch {
                    endpoint: endpoint.to_string(),
                    declared: declared.to_string(),
                    observed,
                });
            }
        }

        let serial = if observed.is_empty() {
            entry.id.clone()
        } else {
            observed
        };
        let profile = self.read_profile(entry).await;
        Ok(DeviceHandle {
            key: key.to_string(),
            serial,
            transport_id: entry.id.clone(),
            endpoint: Some(endpoint.to_string()),
            profile,
            packages: InstalledPackageIndex::default(),
        })
    }

    async fn probe_serial(&self, key: &str, serial: &str) -> DeviceResult<DeviceHandle> {
        let devices = self.list_devices(serial).await?;

        let mut matched: Option<&DeviceEntry> = None;
        for entry in devices.iter().filter(|entry| entry.is_ready()) {
            match self.client.read_property(&entry.id, PROP_SERIAL).await {
                Ok(value) if value.trim() == serial => {
                    matched = Some(entry);
                    break;
                }
                Ok(_) => {}
                Err(err) => debug!("skipping {}: {err}", entry.id),
            }
        }
        // A listed but unready device has no readable serial; it is still
        // returned so callers report its state instead of "not found".
        let matched = matched.or_else(|| {
            devices
                .iter()
                .find(|entry| !entry.is_ready() && entry.id == serial)
        });

        let Some(entry) = matched else {
            return Err(DeviceError::DeviceNotFound {
                wanted: serial.to_string(),
                visible: devices.iter().map(|entry| entry.id.clone()).collect(),
            });
        };

        let profile = self.read_profile(entry).await;
        Ok(DeviceHandle {
            key: key.to_string(),
            serial: serial.to_string(),
            transport_id: entry.id.clone(),
            endpoint: None,
            profile,
            packages: InstalledPackageIndex::default(),
        })
    }

    async fn read_profile(&self, entry: &DeviceEntry) -> DeviceProfile {
        if !entry.is_ready() {
            return DeviceProfile::default();
        }
        let read = |key: &'static str| async move {
            self.client
                .read_property(&entry.id, key)
                .await
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let abi_list = match read(PROP_ABI_LIST).await {
            Some(list) => Some(list),
            None => read(PROP_ABI).await,
        };
        let abis = abi_list
            .map(|list| {
                list.split(',')
                    .map(|abi| abi.trim().to_string())
                    .filter(|abi| !abi.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        DeviceProfile {
            abis,
            sdk: read(PROP_SDK).await.and_then(|sdk| sdk.parse().ok()),
            codename: read(PROP_CODENAME).await,
        }
    }
}
