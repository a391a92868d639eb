use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use fs2::FileExt;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{AcquireError, AcquireResult};

const LOCK_FILE: &str = ".lock";

/// Exclusive advisory lock on a method cache directory, released on drop.
pub(crate) struct CacheLock {
    file: fs::File,
    path: PathBuf,
}

impl CacheLock {
    pub(crate) async fn acquire(dir: &Path) -> AcquireResult<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| AcquireError::io(format!("creating {}", dir.display()), e))?;
        let path = dir.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| AcquireError::io(format!("opening {}", path.display()), e))?;

        let lock_path = path.clone();
        let file = tokio::task::spawn_blocking(move || {
            file.lock_exclusive().map(|_| file)
        })
        .await
        .map_err(|e| AcquireError::io(format!("locking {}", lock_path.display()), e.into()))?
        .map_err(|e| AcquireError::io(format!("locking {}", lock_path.display()), e))?;

        debug!("Locked {}", path.display());
        Ok(Self { file, path })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Unlocked {}", self.path.display());
    }
}

/// True when `path` exists and was modified less than `ttl` ago.
pub(crate) fn is_fresh(path: &Path, ttl: Duration) -> bool {
    if ttl.is_zero() {
        return false;
    }
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age < ttl)
}

pub(crate) fn touch(path: &Path) -> AcquireResult<()> {
    fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()))
        .map_err(|e| AcquireError::io(format!("touching {}", path.display()), e))
}

/// `*.apk` files below `dir`, sorted by path.
pub(crate) fn collect_apks(dir: &Path) -> Vec<PathBuf> {
    let mut apks: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "apk"))
        .collect();
    apks.sort();
    apks
}

pub(crate) fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_nested_apks_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("splits")).unwrap();
        fs::write(dir.path().join("org.example.apk"), b"base").unwrap();
        fs::write(dir.path().join("splits/config.en.apk"), b"split").unwrap();
        fs::write(dir.path().join(".12.download-complete"), b"").unwrap();

        let apks = collect_apks(dir.path());
        assert_eq!(
            apks,
            vec![
                dir.path().join("org.example.apk"),
                dir.path().join("splits/config.en.apk"),
            ]
        );
    }

    #[test]
    fn freshness_honours_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index-v1.jar");
        assert!(!is_fresh(&path, Duration::from_secs(60)));
        fs::write(&path, b"jar").unwrap();
        assert!(is_fresh(&path, Duration::from_secs(60)));
        assert!(!is_fresh(&path, Duration::ZERO));
    }

    #[test]
    fn sidecar_appends_suffix() {
        assert_eq!(
            sidecar_path(Path::new("/c/fdroid/index-v1.jar"), "-etag"),
            PathBuf::from("/c/fdroid/index-v1.jar-etag")
        );
    }

    #[tokio::test]
    async fn lock_can_be_reacquired_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = CacheLock::acquire(&dir.path().join("fdroid")).await.unwrap();
        drop(lock);
        let _again = CacheLock::acquire(&dir.path().join("fdroid")).await.unwrap();
        assert!(dir.path().join("fdroid/.lock").exists());
    }
}
