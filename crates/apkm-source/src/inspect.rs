use std::{
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use apkm_util::{env_var, format_tool_output};
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use crate::error::{AcquireError, AcquireResult};
use crate::package::ArtifactVersion;

/// Reads version metadata out of an artifact.
#[async_trait]
pub trait PackageInspector: Send + Sync {
    async fn inspect(&self, artifact: &Path) -> AcquireResult<ArtifactVersion>;
}

fn badging_patterns() -> &'static (Regex, Regex) {
    static PATTERNS: OnceLock<(Regex, Regex)> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        (
            Regex::new(r"versionCode='(\d+)'").expect("valid versionCode pattern"),
            Regex::new(r"versionName='([^']+)'").expect("valid versionName pattern"),
        )
    })
}

/// Extracts the version from `aapt2 dump badging` output.
pub fn parse_badging(output: &str) -> Result<ArtifactVersion, String> {
    let (code_re, name_re) = badging_patterns();

    let version_code = code_re
        .captures(output)
        .and_then(|caps| caps[1].parse::<i64>().ok())
        .ok_or_else(|| "no versionCode='…' in badging output".to_string())?;
    let version_name = name_re
        .captures(output)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| "no versionName='…' in badging output".to_string())?;
    Ok(ArtifactVersion {
        version_code,
        version_name,
    })
}

pub fn aapt2_path() -> PathBuf {
    PathBuf::from(env_var("APKM_AAPT2_PATH").unwrap_or_else(|| "aapt2".to_string()))
}

#[derive(Clone, Debug)]
pub struct Aapt2Inspector {
    tool: PathBuf,
}

impl Aapt2Inspector {
    pub fn new() -> Self {
        Self::with_path(aapt2_path())
    }

    pub fn with_path(tool: PathBuf) -> Self {
        Self { tool }
    }
}

impl Default for Aapt2Inspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PackageInspector for Aapt2Inspector {
    async fn inspect(&self, artifact: &Path) -> AcquireResult<ArtifactVersion> {
        let output = Command::new(&self.tool)
            .arg("dump")
            .arg("badging")
            .arg(artifact)
            .output()
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => AcquireError::ToolUnavailable {
                    package: artifact.display().to_string(),
                    tool: self.tool.display().to_string(),
                    detail: "not found on PATH (set APKM_AAPT2_PATH)".into(),
                },
                _ => AcquireError::io(format!("running {}", self.tool.display()), err),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let merged = format_tool_output(&stdout, &stderr);
        debug!("{} dump badging {}:\n{merged}", self.tool.display(), artifact.display());

        if !output.status.success() {
            return Err(AcquireError::BadArtifact {
                path: artifact.to_path_buf(),
                output: merged,
            });
        }
        parse_badging(&stdout).map_err(|detail| AcquireError::ArtifactParse {
            path: artifact.to_path_buf(),
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BADGING: &str = "package: name='org.example' versionCode='42' versionName='1.2.0' \
        platformBuildVersionName='14' compileSdkVersion='34'\nsdkVersion:'21'\n";

    #[test]
    fn parses_version_from_badging() {
        assert_eq!(
            parse_badging(BADGING).unwrap(),
            ArtifactVersion {
                version_code: 42,
                version_name: "1.2.0".into(),
            }
        );
    }

    #[test]
    fn missing_fields_are_reported() {
        assert!(parse_badging("package: name='org.example'").is_err());
        assert!(parse_badging("package: versionCode='3'").is_err());
    }

    #[tokio::test]
    async fn missing_tool_is_unavailable() {
        let inspector = Aapt2Inspector::with_path(PathBuf::from("/nonexistent/aapt2"));
        let err = inspector.inspect(Path::new("/tmp/x.apk")).await.unwrap_err();
        assert!(matches!(err, AcquireError::ToolUnavailable { .. }));
    }
}
