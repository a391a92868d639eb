//! Declarative package resource: desired `{name, method, device}` in,
//! recorded `ResourceState` out, with plan/apply/read/destroy over the
//! orchestrator.

use std::sync::Arc;

use apkm_device::{DeviceHandle, InstalledState};
use apkm_source::{ArtifactVersion, Method};
use apkm_util::now_millis;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApkmResult;
use crate::orchestrator::AcquisitionOrchestrator;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    pub method: Method,
    pub serial: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: String,
    pub name: String,
    pub method: Method,
    pub serial: String,
    pub endpoint: Option<String>,
    pub version: i64,
    pub version_name: String,
    #[serde(default)]
    pub updated_at_unix_millis: i64,
}

pub fn resource_id(serial: &str, name: &str) -> String {
    format!("{serial}-{name}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Update,
    /// Uninstall then install.
    Replace { reasons: Vec<String> },
    NoOp,
}

#[derive(Clone, Debug, Serialize)]
pub struct Plan {
    pub id: String,
    pub action: PlanAction,
    pub desired: ArtifactVersion,
    /// Recorded state refreshed from the device; `None` when nothing is installed.
    pub current: Option<ResourceState>,
}

/// Compares the desired resource with what the device currently holds.
pub fn diff(
    spec: &ResourceSpec,
    serial: &str,
    desired: &ArtifactVersion,
    current: Option<&ResourceState>,
) -> PlanAction {
    let Some(current) = current else {
        return PlanAction::Create;
    };

    let mut reasons = Vec::new();
    if current.name != spec.name {
        reasons.push(format!("name changed from {} to {}", current.name, spec.name));
    }
    if current.method != spec.method {
        reasons.push(format!("method changed from {} to {}", current.method, spec.method));
    }
    if current.serial != serial {
        reasons.push(format!("serial changed from {} to {serial}", current.serial));
    }
    if desired.version_code < current.version {
        reasons.push(format!(
            "version decreases from {} to {}",
            current.version, desired.version_code
        ));
    }

    if !reasons.is_empty() {
        PlanAction::Replace { reasons }
    } else if desired.version_code != current.version
        || desired.version_name != current.version_name
    {
        PlanAction::Update
    } else {
        PlanAction::NoOp
    }
}

impl AcquisitionOrchestrator {
    async fn spec_device(&self, spec: &ResourceSpec) -> ApkmResult<Arc<DeviceHandle>> {
        self.resolve_device(spec.serial.as_deref(), spec.endpoint.as_deref())
            .await
    }

    async fn plan_on(
        &self,
        spec: &ResourceSpec,
        handle: &Arc<DeviceHandle>,
        prior: Option<&ResourceState>,
    ) -> ApkmResult<Plan> {
        let current = match prior {
            Some(prior) => self.read(prior).await?,
            None => None,
        };
        let desired = self
            .query_latest(spec.method.as_str(), &spec.name, Some(handle))
            .await?;
        let action = diff(spec, handle.serial(), &desired, current.as_ref());
        Ok(Plan {
            id: resource_id(handle.serial(), &spec.name),
            action,
            desired,
            current,
        })
    }

    pub async fn plan(
        &self,
        spec: &ResourceSpec,
        prior: Option<&ResourceState>,
    ) -> ApkmResult<Plan> {
        let handle = self.spec_device(spec).await?;
        self.plan_on(spec, &handle, prior).await
    }

    /// Brings the device in line with `spec` and returns the state to record.
    pub async fn apply(
        &self,
        spec: &ResourceSpec,
        prior: Option<&ResourceState>,
    ) -> ApkmResult<ResourceState> {
        let handle = self.spec_device(spec).await?;
        let plan = self.plan_on(spec, &handle, prior).await?;
        info!("{}: {:?}", plan.id, plan.action);

        match (&plan.action, &plan.current) {
            (PlanAction::NoOp, Some(current)) => return Ok(current.clone()),
            (PlanAction::Replace { .. }, Some(current)) => self.destroy(current).await?,
            _ => {}
        }

        let installed = self
            .install_version(
                &handle,
                spec.method.as_str(),
                &spec.name,
                Some(plan.desired.version_code),
            )
            .await?;
        let (version, version_name) = match installed {
            InstalledState::Installed(version) => (version.version_code, version.version_name),
            InstalledState::NotInstalled => (
                plan.desired.version_code,
                plan.desired.version_name.clone(),
            ),
        };
        Ok(ResourceState {
            id: plan.id,
            name: spec.name.clone(),
            method: spec.method,
            serial: handle.serial().to_string(),
            endpoint: spec.endpoint.clone(),
            version,
            version_name,
            updated_at_unix_millis: now_millis(),
        })
    }

    /// Refreshes recorded state from the device; `None` when the package is gone.
    pub async fn read(&self, prior: &ResourceState) -> ApkmResult<Option<ResourceState>> {
        let handle = self
            .resolve_device(Some(&prior.serial), prior.endpoint.as_deref())
            .await?;
        Ok(match self.query_installed(&handle, &prior.name).await? {
            InstalledState::NotInstalled => {
                info!("{}: {} is no longer installed", prior.id, prior.name);
                None
            }
            InstalledState::Installed(version) => Some(ResourceState {
                id: resource_id(handle.serial(), &prior.name),
                serial: handle.serial().to_string(),
                version: version.version_code,
                version_name: version.version_name,
                updated_at_unix_millis: now_millis(),
                ..prior.clone()
            }),
        })
    }

    pub async fn destroy(&self, prior: &ResourceState) -> ApkmResult<()> {
        let handle = self
            .resolve_device(Some(&prior.serial), prior.endpoint.as_deref())
            .await?;
        match self.query_installed(&handle, &prior.name).await? {
            InstalledState::NotInstalled => {
                info!("{}: already absent", prior.id);
                Ok(())
            }
            InstalledState::Installed(_) => self.uninstall(&handle, &prior.name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ResourceSpec {
        ResourceSpec {
            name: "org.example".into(),
            method: Method::Fdroid,
            serial: Some("R58".into()),
            endpoint: None,
        }
    }

    fn state(version: i64, version_name: &str) -> ResourceState {
        ResourceState {
            id: "R58-org.example".into(),
            name: "org.example".into(),
            method: Method::Fdroid,
            serial: "R58".into(),
            endpoint: None,
            version,
            version_name: version_name.into(),
            updated_at_unix_millis: 0,
        }
    }

    fn desired(version_code: i64, version_name: &str) -> ArtifactVersion {
        ArtifactVersion {
            version_code,
            version_name: version_name.into(),
        }
    }

    #[test]
    fn missing_state_creates() {
        assert_eq!(diff(&spec(), "R58", &desired(42, "1.2.0"), None), PlanAction::Create);
    }

    #[test]
    fn same_version_is_a_no_op_and_newer_updates() {
        let current = state(42, "1.2.0");
        assert_eq!(
            diff(&spec(), "R58", &desired(42, "1.2.0"), Some(&current)),
            PlanAction::NoOp
        );
        assert_eq!(
            diff(&spec(), "R58", &desired(43, "1.3.0"), Some(&current)),
            PlanAction::Update
        );
    }

    #[test]
    fn version_decrease_forces_replacement() {
        let current = state(50, "2.0.0");
        match diff(&spec(), "R58", &desired(42, "1.2.0"), Some(&current)) {
            PlanAction::Replace { reasons } => {
                assert_eq!(reasons, vec!["version decreases from 50 to 42".to_string()]);
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn identity_changes_force_replacement() {
        let current = state(42, "1.2.0");
        let mut moved = spec();
        moved.method = Method::GplayCli;
        match diff(&moved, "R59", &desired(42, "1.2.0"), Some(&current)) {
            PlanAction::Replace { reasons } => assert_eq!(reasons.len(), 2),
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn resource_id_joins_serial_and_name() {
        assert_eq!(resource_id("R58", "org.example"), "R58-org.example");
    }
}
