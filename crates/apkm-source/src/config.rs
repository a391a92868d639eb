use std::{path::PathBuf, time::Duration};

use apkm_util::{cache_dir, env_or, env_secs, env_u32, env_var, expand_user};

use crate::package::Method;

pub const DEFAULT_FDROID_INDEX_URL: &str = "https://f-droid.org/repo/index-v1.jar";
const DEFAULT_INDEX_TTL_SECS: u64 = 3600;
const DEFAULT_WAIT_BUDGET_SECS: u64 = 1800;
const DEFAULT_STALL_POLLS: u32 = 6;
const MAX_BACKOFF_EXPONENT: u32 = 6;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaiterConfig {
    pub min_exponent: u32,
    pub max_exponent: u32,
    /// Consecutive incomplete polls before the download is re-triggered.
    pub stall_threshold: u32,
    pub budget: Duration,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            min_exponent: 0,
            max_exponent: MAX_BACKOFF_EXPONENT,
            stall_threshold: DEFAULT_STALL_POLLS,
            budget: Duration::from_secs(DEFAULT_WAIT_BUDGET_SECS),
        }
    }
}

impl WaiterConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stall_threshold: env_u32("APKM_WAIT_STALL_POLLS", DEFAULT_STALL_POLLS).max(1),
            budget: env_secs("APKM_WAIT_BUDGET_SECS", DEFAULT_WAIT_BUDGET_SECS),
            ..defaults
        }
    }
}

#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub cache_root: PathBuf,
    pub fdroid_index_url: String,
    pub index_ttl: Duration,
    /// Zero disables reuse of relay artifacts without running the tool.
    pub artifact_ttl: Duration,
    pub python: String,
    pub aurora_bootstrap_apk: Option<PathBuf>,
    pub waiter: WaiterConfig,
}

impl SourceConfig {
    pub fn new(cache_root: PathBuf) -> Self {
        Self {
            cache_root,
            fdroid_index_url: DEFAULT_FDROID_INDEX_URL.to_string(),
            index_ttl: Duration::from_secs(DEFAULT_INDEX_TTL_SECS),
            artifact_ttl: Duration::ZERO,
            python: "python".to_string(),
            aurora_bootstrap_apk: None,
            waiter: WaiterConfig::default(),
        }
    }

    pub fn from_env() -> Self {
        Self {
            cache_root: cache_dir(),
            fdroid_index_url: env_or("APKM_FDROID_INDEX_URL", DEFAULT_FDROID_INDEX_URL),
            index_ttl: env_secs("APKM_INDEX_TTL_SECS", DEFAULT_INDEX_TTL_SECS),
            artifact_ttl: env_secs("APKM_ARTIFACT_TTL_SECS", 0),
            python: env_or("APKM_PYTHON", "python"),
            aurora_bootstrap_apk: env_var("APKM_AURORA_BOOTSTRAP_APK")
                .map(|path| expand_user(&path)),
            waiter: WaiterConfig::from_env(),
        }
    }

    pub fn method_dir(&self, method: Method) -> PathBuf {
        self.cache_root.join(method.as_str())
    }
}
