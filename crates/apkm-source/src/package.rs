use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::AcquireError;

/// Acquisition method, one per `PackageSource` variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Fdroid,
    GplayCli,
    Aurora,
}

impl Method {
    pub const ALL: [Method; 3] = [Method::Fdroid, Method::GplayCli, Method::Aurora];

    /// Name used on the command line, in state files and as the cache subdirectory.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Fdroid => "fdroid",
            Method::GplayCli => "gplaycli",
            Method::Aurora => "aurora",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Method::Fdroid => "F-Droid repository index",
            Method::GplayCli => "Google Play via gplaycli",
            Method::Aurora => "Aurora Store on the device",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = AcquireError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim();
        Method::ALL
            .into_iter()
            .find(|method| method.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| AcquireError::UnknownMethod(value.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArtifactVersion {
    pub version_code: i64,
    pub version_name: String,
}

/// A package being acquired. Only the owning source writes the artifact
/// fields; callers read them once `refresh_cache` returns.
#[derive(Clone, Debug)]
pub struct Package {
    id: String,
    method: Method,
    artifacts: Vec<PathBuf>,
    base: Option<PathBuf>,
    version: Option<ArtifactVersion>,
}

impl Package {
    pub fn new(id: &str, method: Method) -> Self {
        Self {
            id: id.trim().to_string(),
            method,
            artifacts: Vec::new(),
            base: None,
            version: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    pub fn is_bundle(&self) -> bool {
        self.artifacts.len() > 1
    }

    /// Artifact carrying the package's version metadata: the bundle's
    /// `{id}.apk` when present, otherwise the first artifact.
    pub fn base_artifact(&self) -> Option<&PathBuf> {
        self.base.as_ref().or_else(|| self.artifacts.first())
    }

    pub fn version(&self) -> Option<&ArtifactVersion> {
        self.version.as_ref()
    }

    pub fn set_version(&mut self, version: ArtifactVersion) {
        self.version = Some(version);
    }

    pub(crate) fn set_artifacts(&mut self, artifacts: Vec<PathBuf>) {
        let base_name = format!("{}.apk", self.id);
        self.base = artifacts
            .iter()
            .find(|path| path.file_name().is_some_and(|name| name == base_name.as_str()))
            .cloned();
        self.artifacts = artifacts;
        self.version = None;
    }
}
