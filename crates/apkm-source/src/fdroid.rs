use std::{
    collections::HashMap,
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use apkm_device::DeviceProfile;
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{is_fresh, touch, CacheLock};
use crate::config::SourceConfig;
use crate::download::{Download, Fetched};
use crate::error::{AcquireError, AcquireResult};
use crate::hashing::{digest_matches, sha256_file};
use crate::package::{Method, Package};
use crate::source::RefreshContext;

const INDEX_JAR: &str = "index-v1.jar";
const INDEX_ENTRY: &str = "index-v1.json";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct FdroidIndex {
    pub repo: FdroidRepo,
    pub apps: Vec<FdroidApp>,
    pub packages: HashMap<String, Vec<FdroidApk>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct FdroidRepo {
    pub address: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct FdroidApp {
    pub package_name: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub suggested_version_code: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct FdroidApk {
    pub apk_name: String,
    pub hash: String,
    pub hash_type: String,
    pub version_code: i64,
    pub version_name: String,
    pub nativecode: Vec<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub min_sdk_version: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub max_sdk_version: Option<i64>,
}

/// Index numbers appear both as JSON numbers and as decimal strings.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

impl FdroidApk {
    fn abi_compatible(&self, abis: &[String]) -> bool {
        abis.is_empty()
            || self.nativecode.is_empty()
            || self.nativecode.iter().any(|code| abis.contains(code))
    }

    fn sdk_compatible(&self, sdk: Option<u32>) -> bool {
        let Some(sdk) = sdk.map(i64::from) else {
            return true;
        };
        let above_min = self.min_sdk_version.map_or(true, |min| sdk >= min);
        let below_max = self
            .max_sdk_version
            .filter(|max| *max > 0)
            .map_or(true, |max| sdk <= max);
        above_min && below_max
    }

    fn compatible_with(&self, profile: Option<&DeviceProfile>) -> bool {
        match profile {
            Some(profile) => {
                self.abi_compatible(&profile.abis) && self.sdk_compatible(profile.sdk)
            }
            None => true,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Selection<'a> {
    Found(&'a FdroidApk),
    NoSuchPackage,
    NoMatchingArtifact,
}

impl FdroidIndex {
    /// Highest compatible artifact at or below the suggested version code,
    /// falling back to the highest compatible artifact.
    pub(crate) fn select(&self, package: &str, profile: Option<&DeviceProfile>) -> Selection<'_> {
        let listed = self.apps.iter().any(|app| app.package_name == package);
        let apks = match self.packages.get(package) {
            Some(apks) if !apks.is_empty() => apks,
            _ if listed => return Selection::NoMatchingArtifact,
            _ => return Selection::NoSuchPackage,
        };
        let suggested = self
            .apps
            .iter()
            .find(|app| app.package_name == package)
            .and_then(|app| app.suggested_version_code);

        let mut compatible: Vec<&FdroidApk> =
            apks.iter().filter(|apk| apk.compatible_with(profile)).collect();
        compatible.sort_by(|a, b| b.version_code.cmp(&a.version_code));

        let preferred = compatible
            .iter()
            .find(|apk| suggested.map_or(true, |code| apk.version_code <= code))
            .or_else(|| compatible.first());
        match preferred {
            Some(apk) => Selection::Found(apk),
            None => Selection::NoMatchingArtifact,
        }
    }

    fn artifact_url(&self, index_url: &str, apk: &FdroidApk) -> String {
        let base = if self.repo.address.trim().is_empty() {
            index_url.rsplit_once('/').map_or(index_url, |(dir, _)| dir)
        } else {
            self.repo.address.trim()
        };
        format!("{}/{}", base.trim_end_matches('/'), apk.apk_name)
    }
}

pub(crate) fn load_index_jar(path: &Path) -> AcquireResult<FdroidIndex> {
    let parse_err = |detail: String| AcquireError::IndexParse {
        path: path.to_path_buf(),
        detail,
    };
    let file =
        fs::File::open(path).map_err(|e| AcquireError::io(format!("opening {}", path.display()), e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| parse_err(e.to_string()))?;
    let mut entry = archive
        .by_name(INDEX_ENTRY)
        .map_err(|e| parse_err(format!("{INDEX_ENTRY}: {e}")))?;
    let mut json = String::new();
    entry
        .read_to_string(&mut json)
        .map_err(|e| parse_err(format!("{INDEX_ENTRY}: {e}")))?;
    serde_json::from_str(&json).map_err(|e| parse_err(format!("{INDEX_ENTRY}: {e}")))
}

/// Direct-index variant: F-Droid style `index-v1.jar` plus per-package downloads.
#[derive(Clone)]
pub struct FdroidSource {
    dir: PathBuf,
    index_url: String,
    index_ttl: std::time::Duration,
    http: Client,
}

impl FdroidSource {
    pub fn new(config: &SourceConfig, http: Client) -> Self {
        Self {
            dir: config.method_dir(Method::Fdroid),
            index_url: config.fdroid_index_url.clone(),
            index_ttl: config.index_ttl,
            http,
        }
    }

    async fn refresh_index(&self, package: &str, ctx: &RefreshContext) -> AcquireResult<PathBuf> {
        let jar = self.dir.join(INDEX_JAR);
        if is_fresh(&jar, self.index_ttl) {
            debug!("Index {} is fresh", jar.display());
            return Ok(jar);
        }
        info!("Downloading F-Droid index {}", self.index_url);
        let fetched = Download {
            package,
            url: &self.index_url,
            dest: &jar,
            expected_sha256: None,
            conditional: true,
        }
        .run(&self.http, ctx.cancel.as_ref())
        .await?;
        if fetched == Fetched::NotModified {
            touch(&jar)?;
        }
        Ok(jar)
    }

    pub(crate) async fn refresh(
        &self,
        package: &mut Package,
        ctx: &RefreshContext,
    ) -> AcquireResult<Vec<PathBuf>> {
        let _lock = CacheLock::acquire(&self.dir).await?;
        let id = package.id().to_string();
        let jar = self.refresh_index(&id, ctx).await?;

        info!("Loading F-Droid index");
        let index = tokio::task::spawn_blocking(move || load_index_jar(&jar))
            .await
            .map_err(|e| AcquireError::io("loading F-Droid index", e.into()))??;

        let profile = ctx.profile();
        let apk = match index.select(&id, profile) {
            Selection::Found(apk) => apk,
            Selection::NoSuchPackage => {
                return Err(AcquireError::NoSuchPackage {
                    package: id,
                    method: Method::Fdroid,
                })
            }
            Selection::NoMatchingArtifact => {
                return Err(AcquireError::NoMatchingArtifact {
                    package: id,
                    method: Method::Fdroid,
                    device: ctx.device_label(),
                })
            }
        };
        debug!(
            "{id}: selected {} (versionCode {}, {})",
            apk.apk_name, apk.version_code, apk.version_name
        );

        let dest = self.dir.join(format!("{id}.apk"));
        let expected = (!apk.hash.trim().is_empty()
            && (apk.hash_type.is_empty() || apk.hash_type.eq_ignore_ascii_case("sha256")))
        .then_some(apk.hash.as_str());

        let cached = match expected {
            Some(expected) if dest.exists() => sha256_file(&dest)
                .map(|actual| digest_matches(expected, &actual))
                .unwrap_or(false),
            _ => false,
        };
        if cached {
            info!("Using cached artifact {}", dest.display());
        } else {
            let url = index.artifact_url(&self.index_url, apk);
            info!("Downloading {url}");
            Download {
                package: &id,
                url: &url,
                dest: &dest,
                expected_sha256: expected,
                conditional: false,
            }
            .run(&self.http, ctx.cancel.as_ref())
            .await?;
        }

        let artifacts = vec![dest];
        package.set_artifacts(artifacts.clone());
        Ok(artifacts)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::{Cursor, Write};

    use super::*;

    pub(crate) fn index_jar(json: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(INDEX_ENTRY, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(json.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn parse_index(json: &str) -> FdroidIndex {
        serde_json::from_str(json).unwrap()
    }

    const SAMPLE: &str = r#"{
        "repo": {"address": "https://f-droid.org/repo", "name": "F-Droid", "timestamp": 1},
        "apps": [{"packageName": "org.example", "suggestedVersionCode": "41"}],
        "packages": {"org.example": [
            {"apkName": "org.example_42.apk", "hash": "aa", "hashType": "sha256",
             "versionCode": 42, "versionName": "1.2.0", "minSdkVersion": "21"},
            {"apkName": "org.example_41_arm.apk", "hash": "bb", "hashType": "sha256",
             "versionCode": 41, "versionName": "1.1.0", "nativecode": ["armeabi-v7a"]},
            {"apkName": "org.example_40.apk", "hash": "cc", "hashType": "sha256",
             "versionCode": 40, "versionName": "1.0.0", "minSdkVersion": 19}
        ]}
    }"#;

    fn profile(abis: &[&str], sdk: u32) -> DeviceProfile {
        DeviceProfile {
            abis: abis.iter().map(|abi| abi.to_string()).collect(),
            sdk: Some(sdk),
            codename: None,
        }
    }

    fn selected<'a>(selection: Selection<'a>) -> &'a FdroidApk {
        match selection {
            Selection::Found(apk) => apk,
            other => panic!("unexpected selection {other:?}"),
        }
    }

    #[test]
    fn prefers_suggested_version_for_device() {
        let index = parse_index(SAMPLE);
        let apk = selected(index.select("org.example", Some(&profile(&["arm64-v8a"], 30))));
        assert_eq!(apk.version_code, 40);

        let apk = selected(index.select("org.example", Some(&profile(&["armeabi-v7a"], 30))));
        assert_eq!(apk.version_code, 41);
    }

    #[test]
    fn falls_back_to_highest_compatible_above_suggestion() {
        let index = parse_index(SAMPLE);
        let apk = selected(index.select("org.example", Some(&profile(&["x86_64"], 30))));
        assert_eq!(apk.version_code, 40);

        let index = parse_index(&SAMPLE.replace("\"41\"", "\"1\""));
        let apk = selected(index.select("org.example", None));
        assert_eq!(apk.version_code, 42);
    }

    #[test]
    fn sdk_bounds_exclude_artifacts() {
        let index = parse_index(SAMPLE);
        assert_eq!(
            index.select("org.example", Some(&profile(&["arm64-v8a"], 18))),
            Selection::NoMatchingArtifact
        );
        assert_eq!(index.select("org.missing", None), Selection::NoSuchPackage);
    }

    #[test]
    fn artifact_url_uses_repo_address() {
        let index = parse_index(SAMPLE);
        let apk = selected(index.select("org.example", None));
        assert_eq!(
            index.artifact_url("https://mirror.example/repo/index-v1.jar", apk),
            "https://f-droid.org/repo/org.example_41_arm.apk"
        );
    }

    #[test]
    fn jar_without_index_entry_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_JAR);
        fs::write(&path, index_jar(SAMPLE)).unwrap();
        assert_eq!(load_index_jar(&path).unwrap().apps.len(), 1);

        fs::write(&path, b"not a zip").unwrap();
        assert!(matches!(
            load_index_jar(&path),
            Err(AcquireError::IndexParse { .. })
        ));
    }
}
