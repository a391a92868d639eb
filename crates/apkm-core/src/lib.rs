//! Orchestration layer of apkm: acquisition plus device install/uninstall,
//! the error taxonomy, and the declarative resource contract.

mod error;
mod orchestrator;
mod resource;
mod state;

pub use error::{ApkmError, ApkmResult, ErrorKind};
pub use orchestrator::{AcquisitionOrchestrator, OrchestratorConfig};
pub use resource::{diff, resource_id, Plan, PlanAction, ResourceSpec, ResourceState};
pub use state::StateFile;
