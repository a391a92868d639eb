use std::{
    io,
    path::{Path, PathBuf},
    process::Output,
};

use apkm_util::format_tool_output;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::control::{DeviceControlClient, DeviceEntry, InstalledPackage};
use crate::error::ControlError;

const ADB_HINT: &str = "set APKM_ADB_PATH or ANDROID_SDK_ROOT";

#[derive(Debug)]
pub(crate) enum AdbFailure {
    NotFound,
    Io(String),
    Exit {
        status: i32,
        stdout: String,
        stderr: String,
    },
}

pub fn adb_path() -> PathBuf {
    if let Some(path) = apkm_util::env_var("APKM_ADB_PATH") {
        return PathBuf::from(path);
    }
    if let Some(path) = apkm_util::env_var("ADB_PATH") {
        return PathBuf::from(path);
    }
    if let Some(sdk_root) =
        apkm_util::env_var("ANDROID_SDK_ROOT").or_else(|| apkm_util::env_var("ANDROID_HOME"))
    {
        let tools = PathBuf::from(&sdk_root).join("platform-tools");
        for name in ["adb", "adb.exe"] {
            let candidate = tools.join(name);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from("adb")
}

fn format_adb_failure_message(status: i32, stdout: &str, stderr: &str) -> String {
    let detail = format_tool_output(stdout, stderr);
    if detail.trim().is_empty() {
        format!("exit {status}")
    } else {
        format!("exit {status}: {}", detail.trim())
    }
}

fn into_control_error(args: &[&str], err: AdbFailure) -> ControlError {
    match err {
        AdbFailure::NotFound => ControlError::ToolNotFound {
            tool: "adb".into(),
            hint: ADB_HINT.into(),
        },
        AdbFailure::Io(msg) => ControlError::Io(format!("adb failed: {msg}")),
        AdbFailure::Exit {
            status,
            stdout,
            stderr,
        } => ControlError::Failed {
            command: adb_command_label(args),
            output: format_adb_failure_message(status, &stdout, &stderr),
        },
    }
}

fn adb_command_label(args: &[&str]) -> String {
    // Skip `-s <id>` so the label names the operation.
    let rest: Vec<&str> = match args {
        ["-s", _, rest @ ..] => rest.iter().take(2).copied().collect(),
        _ => args.iter().take(2).copied().collect(),
    };
    format!("adb {}", rest.join(" "))
}

fn merged_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format_tool_output(&stdout, &stderr)
}

/// `DeviceControlClient` over the `adb` executable.
#[derive(Clone, Debug)]
pub struct AdbClient {
    adb: PathBuf,
}

impl Default for AdbClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AdbClient {
    pub fn new() -> Self {
        Self::with_path(adb_path())
    }

    pub fn with_path(adb: PathBuf) -> Self {
        Self { adb }
    }

    async fn adb_output(&self, args: &[&str]) -> Result<Output, AdbFailure> {
        debug!("running {} {}", self.adb.display(), args.join(" "));
        let mut cmd = Command::new(&self.adb);
        cmd.args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                AdbFailure::NotFound
            } else {
                AdbFailure::Io(e.to_string())
            }
        })?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(AdbFailure::Exit {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output, ControlError> {
        self.adb_output(args)
            .await
            .map_err(|err| into_control_error(args, err))
    }

    async fn run_stdout(&self, args: &[&str]) -> Result<String, ControlError> {
        let output = self.run(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Runs a package-manager style command whose success is only visible as
    /// `Success` in its output; older adb versions exit 0 on failure.
    async fn run_expect_success(&self, args: &[&str]) -> Result<(), ControlError> {
        let output = self.run(args).await?;
        let merged = merged_output(&output);
        debug!("{}", merged.trim());
        if merged.contains("Success") {
            Ok(())
        } else {
            Err(ControlError::Failed {
                command: adb_command_label(args),
                output: merged.trim().to_string(),
            })
        }
    }

    /// Starts the adb server if it is not already running.
    pub async fn ensure_server(&self) -> Result<(), ControlError> {
        self.run(&["start-server"]).await.map(|_| ())
    }
}

#[async_trait]
impl DeviceControlClient for AdbClient {
    async fn connect(&self, endpoint: &str) -> Result<(), ControlError> {
        let args = ["connect", endpoint];
        let output = self.run(&args).await?;
        let merged = merged_output(&output);
        let lower = merged.to_ascii_lowercase();
        if lower.contains("connected to") && !lower.contains("cannot") {
            Ok(())
        } else {
            Err(ControlError::Failed {
                command: adb_command_label(&args),
                output: merged.trim().to_string(),
            })
        }
    }

    async fn list_devices(&self) -> Result<Vec<DeviceEntry>, ControlError> {
        let stdout = self.run_stdout(&["devices", "-l"]).await?;
        Ok(parse_adb_devices(&stdout))
    }

    async fn read_property(&self, device: &str, key: &str) -> Result<String, ControlError> {
        let stdout = self
            .run_stdout(&["-s", device, "shell", "getprop", key])
            .await?;
        Ok(stdout.trim().to_string())
    }

    async fn get_state(&self, device: &str) -> Result<String, ControlError> {
        let stdout = self.run_stdout(&["-s", device, "get-state"]).await?;
        Ok(stdout.trim().to_string())
    }

    async fn install(&self, device: &str, artifact: &Path) -> Result<(), ControlError> {
        let path = artifact.to_string_lossy();
        self.run_expect_success(&["-s", device, "install", "-r", &*path])
            .await
    }

    async fn install_multiple(
        &self,
        device: &str,
        artifacts: &[PathBuf],
    ) -> Result<(), ControlError> {
        let paths: Vec<String> = artifacts
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        let mut args = vec!["-s", device, "install-multiple", "-r"];
        args.extend(paths.iter().map(String::as_str));
        self.run_expect_success(&args).await
    }

    async fn uninstall(&self, device: &str, package: &str) -> Result<(), ControlError> {
        self.run_expect_success(&["-s", device, "uninstall", package])
            .await
    }

    async fn list_installed_packages(
        &self,
        device: &str,
    ) -> Result<Vec<InstalledPackage>, ControlError> {
        let stdout = self
            .run_stdout(&["-s", device, "shell", "dumpsys", "package", "packages"])
            .await?;
        Ok(parse_dumpsys_packages(&stdout))
    }

    async fn push_file(&self, device: &str, local: &Path, remote: &str) -> Result<(), ControlError> {
        let local = local.to_string_lossy();
        self.run(&["-s", device, "push", &*local, remote])
            .await
            .map(|_| ())
    }

    async fn pull_directory(
        &self,
        device: &str,
        remote: &str,
        local: &Path,
    ) -> Result<(), ControlError> {
        // Trailing separator makes adb create `local/<basename(remote)>`.
        let local = format!("{}/", local.to_string_lossy().trim_end_matches('/'));
        let output = self.run(&["-s", device, "pull", remote, local.as_str()]).await?;
        debug!("{}", merged_output(&output).trim());
        Ok(())
    }

    async fn list_remote_files(
        &self,
        device: &str,
        pattern: &str,
    ) -> Result<Vec<String>, ControlError> {
        // `|| true`: a missing directory or an unmatched glob is not an error.
        let script = format!("ls -A1t {pattern} 2>/dev/null || true");
        let stdout = self.run_stdout(&["-s", device, "shell", script.as_str()]).await?;
        Ok(parse_remote_listing(&stdout))
    }

    async fn send_intent(
        &self,
        device: &str,
        component: &str,
        data_uri: &str,
    ) -> Result<(), ControlError> {
        let quoted = format!("'{data_uri}'");
        let args = [
            "-s",
            device,
            "shell",
            "am",
            "start",
            "-n",
            component,
            "-d",
            quoted.as_str(),
        ];
        let output = self.run(&args).await?;
        let merged = merged_output(&output);
        debug!("{}", merged.trim());
        if merged.contains("does not exist") || merged.contains("Error:") {
            return Err(ControlError::Failed {
                command: adb_command_label(&args),
                output: merged.trim().to_string(),
            });
        }
        Ok(())
    }
}

pub(crate) fn parse_adb_devices(output: &str) -> Vec<DeviceEntry> {
    let mut devices = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices attached") || line.starts_with('*')
        {
            continue;
        }

        let mut parts = line.split_whitespace();
        let Some(id) = parts.next() else {
            continue;
        };
        let Some(state) = parts.next() else {
            continue;
        };

        let model = parts
            .filter_map(|part| part.split_once(':'))
            .find(|(key, _)| *key == "model")
            .map(|(_, value)| value.to_string());

        devices.push(DeviceEntry {
            id: id.to_string(),
            state: state.to_string(),
            model,
        });
    }

    devices
}

pub(crate) fn parse_remote_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains("No such file or directory"))
        .map(str::to_string)
        .collect()
}

/// Parses `dumpsys package packages`. Only the first record per package is
/// kept; the trailing "Hidden system packages" section is ignored.
pub(crate) fn parse_dumpsys_packages(output: &str) -> Vec<InstalledPackage> {
    struct Partial {
        id: String,
        version_code: Option<i64>,
        version_name: String,
    }

    fn flush(current: Option<Partial>, out: &mut Vec<InstalledPackage>) {
        let Some(partial) = current else {
            return;
        };
        let Some(version_code) = partial.version_code else {
            return;
        };
        if out.iter().any(|pkg| pkg.id == partial.id) {
            return;
        }
        out.push(InstalledPackage {
            id: partial.id,
            version_code,
            version_name: partial.version_name,
        });
    }

    let mut packages = Vec::new();
    let mut current: Option<Partial> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("Hidden system packages:") {
            break;
        }
        if let Some(rest) = line.strip_prefix("Package [") {
            if let Some(end) = rest.find(']') {
                flush(current.take(), &mut packages);
                current = Some(Partial {
                    id: rest[..end].to_string(),
                    version_code: None,
                    version_name: String::new(),
                });
            }
            continue;
        }
        let Some(partial) = current.as_mut() else {
            continue;
        };
        if let Some(name) = line.strip_prefix("versionName=") {
            partial.version_name = name.trim().to_string();
            continue;
        }
        for token in line.split_whitespace() {
            if let Some(code) = token.strip_prefix("versionCode=") {
                if partial.version_code.is_none() {
                    partial.version_code = code.parse::<i64>().ok();
                }
            }
        }
    }
    flush(current, &mut packages);

    packages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_listing_with_states() {
        let output = "\
* daemon not running; starting now at tcp:5037
List of devices attached
R58M123ABC             device usb:1-1 product:beyond1 model:SM_G973F transport_id:3
127.0.0.1:5555         offline transport_id:4
192.168.1.20:5555      unauthorized
";
        let devices = parse_adb_devices(output);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].id, "R58M123ABC");
        assert!(devices[0].is_ready());
        assert_eq!(devices[0].model.as_deref(), Some("SM_G973F"));
        assert_eq!(devices[1].id, "127.0.0.1:5555");
        assert_eq!(devices[1].state, "offline");
        assert_eq!(devices[2].state, "unauthorized");
    }

    #[test]
    fn parses_dumpsys_packages_first_record_wins() {
        let output = "\
Packages:
  Package [com.example.app] (3f2a1b):
    userId=10123
    versionCode=42 minSdk=21 targetSdk=33
    versionName=1.2.0
    splits=[base]
  Package [org.fdroid.fdroid] (99aa):
    versionCode=1019050 minSdk=22 targetSdk=28
    versionName=1.19.1
  Package [com.broken] (1):
    userId=1

Hidden system packages:
  Package [com.example.app] (0000):
    versionCode=1 minSdk=21 targetSdk=33
    versionName=0.1
";
        let packages = parse_dumpsys_packages(output);
        assert_eq!(
            packages,
            vec![
                InstalledPackage {
                    id: "com.example.app".into(),
                    version_code: 42,
                    version_name: "1.2.0".into(),
                },
                InstalledPackage {
                    id: "org.fdroid.fdroid".into(),
                    version_code: 1019050,
                    version_name: "1.19.1".into(),
                },
            ]
        );
    }

    #[test]
    fn remote_listing_drops_missing_directory_noise() {
        let output = "sdcard/Aurora/x/.12.download-complete\n\nls: sdcard/y: No such file or directory\n";
        assert_eq!(
            parse_remote_listing(output),
            vec!["sdcard/Aurora/x/.12.download-complete".to_string()]
        );
    }

    #[test]
    fn command_label_skips_transport_selector() {
        assert_eq!(
            adb_command_label(&["-s", "R58", "install", "-r", "/tmp/a.apk"]),
            "adb install -r"
        );
        assert_eq!(adb_command_label(&["devices", "-l"]), "adb devices -l");
    }

    #[test]
    fn exit_failure_keeps_tool_output() {
        let err = into_control_error(
            &["-s", "R58", "uninstall", "com.example.app"],
            AdbFailure::Exit {
                status: 1,
                stdout: "Failure [DELETE_FAILED_INTERNAL_ERROR]".into(),
                stderr: String::new(),
            },
        );
        assert_eq!(
            err.output(),
            Some("exit 1: stdout:\nFailure [DELETE_FAILED_INTERNAL_ERROR]")
        );
        assert!(matches!(
            into_control_error(&["devices"], AdbFailure::NotFound),
            ControlError::ToolNotFound { .. }
        ));
    }
}
