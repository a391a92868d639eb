#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::{Cursor, Write},
    path::Path,
    sync::{Arc, Mutex},
};

use apkm_core::AcquisitionOrchestrator;
use apkm_device::fake::{FakeDevice, FakeDeviceClient};
use apkm_device::{InstalledPackage, PROP_ABI_LIST, PROP_SDK};
use apkm_source::{AcquireResult, ArtifactVersion, PackageInspector, SourceConfig};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

pub const PACKAGE: &str = "org.example";
pub const SERIAL: &str = "R58M123ABC";

/// Inspector that reports one fixed version and remembers what it inspected.
pub struct FixedInspector {
    version: ArtifactVersion,
    seen: Mutex<Vec<String>>,
}

impl FixedInspector {
    pub fn new(version_code: i64, version_name: &str) -> Self {
        Self {
            version: ArtifactVersion {
                version_code,
                version_name: version_name.to_string(),
            },
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl PackageInspector for FixedInspector {
    async fn inspect(&self, artifact: &Path) -> AcquireResult<ArtifactVersion> {
        self.seen
            .lock()
            .unwrap()
            .push(artifact.display().to_string());
        Ok(self.version.clone())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn index_jar(json: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("index-v1.json", zip::write::FileOptions::default())
        .unwrap();
    writer.write_all(json.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

/// Serves an F-Droid style repository with one artifact of `PACKAGE`;
/// returns the index URL.
pub async fn serve_repo(version_code: i64, version_name: &str) -> String {
    let apk = format!("apk {version_code}").into_bytes();
    let index = format!(
        r#"{{"repo": {{"address": ""}},
            "apps": [{{"packageName": "{PACKAGE}", "suggestedVersionCode": "{version_code}"}}],
            "packages": {{"{PACKAGE}": [
                {{"apkName": "{PACKAGE}_{version_code}.apk", "hash": "{}", "hashType": "sha256",
                  "versionCode": {version_code}, "versionName": "{version_name}"}}]}}}}"#,
        hex(&Sha256::digest(&apk))
    );
    let mut routes: HashMap<String, Vec<u8>> = HashMap::new();
    routes.insert("/repo/index-v1.jar".into(), index_jar(&index));
    routes.insert(format!("/repo/{PACKAGE}_{version_code}.apk"), apk);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let routes = Arc::new(routes);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&buf).to_string();
                let path = head
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("/")
                    .to_string();
                let response = match routes.get(&path) {
                    Some(body) => {
                        let mut out = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        )
                        .into_bytes();
                        out.extend_from_slice(body);
                        out
                    }
                    None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_vec(),
                };
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("{base}/repo/index-v1.jar")
}

pub fn installed(version_code: i64, version_name: &str) -> InstalledPackage {
    InstalledPackage {
        id: PACKAGE.to_string(),
        version_code,
        version_name: version_name.to_string(),
    }
}

pub fn device_client(device: FakeDevice) -> Arc<FakeDeviceClient> {
    let client = Arc::new(FakeDeviceClient::new());
    client.add_device(device);
    client
}

pub fn ready_device() -> FakeDevice {
    FakeDevice::new(SERIAL, SERIAL)
        .with_prop(PROP_ABI_LIST, "arm64-v8a,armeabi-v7a")
        .with_prop(PROP_SDK, "34")
}

pub struct Harness {
    pub client: Arc<FakeDeviceClient>,
    pub inspector: Arc<FixedInspector>,
    pub orchestrator: AcquisitionOrchestrator,
    pub cache: tempfile::TempDir,
}

pub async fn harness(device: FakeDevice, offered: (i64, &str)) -> Harness {
    let index_url = serve_repo(offered.0, offered.1).await;
    let cache = tempfile::tempdir().unwrap();
    let mut sources = SourceConfig::new(cache.path().to_path_buf());
    sources.fdroid_index_url = index_url;

    let client = device_client(device);
    let inspector = Arc::new(FixedInspector::new(offered.0, offered.1));
    let orchestrator =
        AcquisitionOrchestrator::new(client.clone(), inspector.clone(), sources).unwrap();
    Harness {
        client,
        inspector,
        orchestrator,
        cache,
    }
}
