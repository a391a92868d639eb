use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::control::DeviceControlClient;
use crate::error::ControlError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstalledVersion {
    pub version_code: i64,
    pub version_name: String,
}

/// Result of an installed-package query. Absence is a normal outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstalledState {
    Installed(InstalledVersion),
    NotInstalled,
}

impl InstalledState {
    pub fn version(&self) -> Option<&InstalledVersion> {
        match self {
            InstalledState::Installed(version) => Some(version),
            InstalledState::NotInstalled => None,
        }
    }
}

/// Installed packages of one device, enumerated once and served from memory
/// until invalidated.
#[derive(Default)]
pub struct InstalledPackageIndex {
    entries: Mutex<Option<Arc<HashMap<String, InstalledVersion>>>>,
}

impl InstalledPackageIndex {
    pub async fn lookup(
        &self,
        client: &dyn DeviceControlClient,
        device: &str,
        package: &str,
    ) -> Result<InstalledState, ControlError> {
        let entries = self.snapshot(client, device).await?;
        Ok(match entries.get(package) {
            Some(version) => InstalledState::Installed(version.clone()),
            None => InstalledState::NotInstalled,
        })
    }

    /// Returns the cached enumeration, performing it first if needed. The lock
    /// is held across the enumeration so concurrent callers share one call.
    pub async fn snapshot(
        &self,
        client: &dyn DeviceControlClient,
        device: &str,
    ) -> Result<Arc<HashMap<String, InstalledVersion>>, ControlError> {
        let mut guard = self.entries.lock().await;
        if let Some(entries) = guard.as_ref() {
            return Ok(Arc::clone(entries));
        }

        let listed = client.list_installed_packages(device).await?;
        debug!("{device}: enumerated {} installed packages", listed.len());
        let entries: HashMap<String, InstalledVersion> = listed
            .into_iter()
            .map(|pkg| {
                (
                    pkg.id,
                    InstalledVersion {
                        version_code: pkg.version_code,
                        version_name: pkg.version_name,
                    },
                )
            })
            .collect();
        let entries = Arc::new(entries);
        *guard = Some(Arc::clone(&entries));
        Ok(entries)
    }

    pub async fn invalidate(&self) {
        *self.entries.lock().await = None;
    }

    pub async fn is_populated(&self) -> bool {
        self.entries.lock().await.is_some()
    }
}
