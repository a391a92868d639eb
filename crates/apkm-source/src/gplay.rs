use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use apkm_util::format_tool_output;
use tokio::process::Command;
use tracing::{debug, info};

use crate::cache::{is_fresh, CacheLock};
use crate::config::SourceConfig;
use crate::error::{AcquireError, AcquireResult};
use crate::package::{Method, Package};
use crate::source::RefreshContext;

const TOOL: &str = "gplaycli";
const MISSING_MODULE: &str = "No module named gplaycli";
const ERROR_MARKER: &str = "[ERROR]";

/// Local-store relay variant: drives `python -m gplaycli` into the cache folder.
#[derive(Clone, Debug)]
pub struct GplayCliSource {
    dir: PathBuf,
    python: String,
    artifact_ttl: Duration,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RelayOutcome {
    Ok,
    ToolMissing,
    Failed,
}

pub(crate) fn classify_relay_output(success: bool, output: &str) -> RelayOutcome {
    if output.contains(MISSING_MODULE) {
        RelayOutcome::ToolMissing
    } else if !success || output.contains(ERROR_MARKER) {
        RelayOutcome::Failed
    } else {
        RelayOutcome::Ok
    }
}

pub(crate) fn relay_args(
    package: &str,
    dir: &Path,
    codename: Option<&str>,
    cached: bool,
) -> Vec<String> {
    let mut args = vec!["-m".to_string(), TOOL.to_string()];
    if let Some(codename) = codename.filter(|value| !value.trim().is_empty()) {
        args.push(format!("--device-codename={codename}"));
    }
    if cached {
        args.push(format!("--update={}", dir.display()));
        args.push("--yes".to_string());
    } else {
        args.push(format!("--folder={}", dir.display()));
        args.push(format!("--download={package}"));
    }
    args
}

impl GplayCliSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            dir: config.method_dir(Method::GplayCli),
            python: config.python.clone(),
            artifact_ttl: config.artifact_ttl,
        }
    }

    pub(crate) async fn refresh(
        &self,
        package: &mut Package,
        ctx: &RefreshContext,
    ) -> AcquireResult<Vec<PathBuf>> {
        let _lock = CacheLock::acquire(&self.dir).await?;
        let id = package.id().to_string();
        let apk = self.dir.join(format!("{id}.apk"));

        if is_fresh(&apk, self.artifact_ttl) {
            info!("Using cached artifact {}", apk.display());
            package.set_artifacts(vec![apk.clone()]);
            return Ok(vec![apk]);
        }

        let cached = apk.exists();
        let codename = ctx.profile().and_then(|profile| profile.codename.as_deref());
        let args = relay_args(&id, &self.dir, codename, cached);
        if cached {
            info!("Updating cached gplaycli packages");
        } else {
            info!("Downloading {id} with gplaycli");
        }

        let output = Command::new(&self.python)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => AcquireError::ToolUnavailable {
                    package: id.clone(),
                    tool: self.python.clone(),
                    detail: "interpreter not found on PATH (set APKM_PYTHON)".into(),
                },
                _ => AcquireError::io(format!("running {} -m {TOOL}", self.python), err),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let merged = format_tool_output(&stdout, &stderr);
        debug!("{TOOL} output:\n{merged}");

        match classify_relay_output(output.status.success(), &merged) {
            RelayOutcome::ToolMissing => {
                return Err(AcquireError::ToolUnavailable {
                    package: id,
                    tool: TOOL.into(),
                    detail: format!("not installed for `{}`", self.python),
                })
            }
            RelayOutcome::Failed => {
                return Err(AcquireError::AcquisitionFailed {
                    package: id,
                    method: Method::GplayCli,
                    output: format!("{} ({})", merged, output.status),
                })
            }
            RelayOutcome::Ok => {}
        }

        if !apk.exists() {
            return Err(AcquireError::AcquisitionFailed {
                package: id,
                method: Method::GplayCli,
                output: format!("{TOOL} finished without producing {}\n{merged}", apk.display()),
            });
        }

        info!("{id} cached");
        package.set_artifacts(vec![apk.clone()]);
        Ok(vec![apk])
    }
}
