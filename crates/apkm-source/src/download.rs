use std::{fs, path::Path};

use futures_util::StreamExt;
use reqwest::{header, Client, StatusCode};
use sha2::{Digest, Sha256};
use tokio::{io::AsyncWriteExt, sync::watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::sidecar_path;
use crate::cancel::cancel_requested;
use crate::error::{AcquireError, AcquireResult};
use crate::hashing::{digest_matches, hex_encode};

const ETAG_SUFFIX: &str = "-etag";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Fetched {
    Downloaded,
    NotModified,
}

/// One download into the cache: `dest` is only replaced by a complete body
/// that matched `expected_sha256`, and its ETag lands in `{dest}-etag`.
pub(crate) struct Download<'a> {
    pub package: &'a str,
    pub url: &'a str,
    pub dest: &'a Path,
    pub expected_sha256: Option<&'a str>,
    /// Send `If-None-Match` from the sidecar when `dest` is present.
    pub conditional: bool,
}

impl Download<'_> {
    fn http_error(&self, detail: impl std::fmt::Display) -> AcquireError {
        AcquireError::Http {
            package: self.package.to_string(),
            url: self.url.to_string(),
            detail: detail.to_string(),
        }
    }

    fn stored_etag(&self) -> Option<String> {
        if !self.conditional || !self.dest.exists() {
            return None;
        }
        let sidecar = sidecar_path(self.dest, ETAG_SUFFIX);
        match fs::read_to_string(&sidecar) {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            Ok(_) => None,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!("Ignoring unreadable {}: {err}", sidecar.display());
                None
            }
        }
    }

    pub(crate) async fn run(
        &self,
        client: &Client,
        cancel_rx: Option<&watch::Receiver<bool>>,
    ) -> AcquireResult<Fetched> {
        let mut request = client.get(self.url);
        if let Some(etag) = self.stored_etag() {
            debug!("{}: If-None-Match {etag}", self.url);
            request = request.header(header::IF_NONE_MATCH, etag);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| self.http_error(format!("download failed: {e}")))?;

        if resp.status() == StatusCode::NOT_MODIFIED {
            info!("{} not modified", self.url);
            return Ok(Fetched::NotModified);
        }
        if !resp.status().is_success() {
            return Err(self.http_error(format!("download failed with status {}", resp.status())));
        }

        let etag = resp
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        if let Some(parent) = self.dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AcquireError::io(format!("creating {}", parent.display()), e))?;
        }
        let tmp = self.dest.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let saved = self.save_verified(resp, &tmp, cancel_rx).await;
        if saved.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        let actual = saved?;

        let sidecar = sidecar_path(self.dest, ETAG_SUFFIX);
        let sidecar_result = match etag {
            Some(etag) => fs::write(&sidecar, etag),
            None => match fs::remove_file(&sidecar) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(err) = sidecar_result {
            warn!("Failed to update {}: {err}", sidecar.display());
        }

        info!("Saved {} ({actual})", self.dest.display());
        Ok(Fetched::Downloaded)
    }

    /// Streams the body into `tmp`, checks its digest and renames it over
    /// `dest`. `tmp` is left for the caller to remove on error.
    async fn save_verified(
        &self,
        resp: reqwest::Response,
        tmp: &Path,
        cancel_rx: Option<&watch::Receiver<bool>>,
    ) -> AcquireResult<String> {
        let mut file = tokio::fs::File::create(tmp)
            .await
            .map_err(|e| AcquireError::io(format!("creating {}", tmp.display()), e))?;

        let mut hasher = Sha256::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancel_requested(cancel_rx) {
                return Err(AcquireError::Cancelled {
                    package: self.package.to_string(),
                });
            }
            let chunk = chunk.map_err(|e| self.http_error(format!("download read failed: {e}")))?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| AcquireError::io(format!("writing {}", tmp.display()), e))?;
        }
        file.flush()
            .await
            .map_err(|e| AcquireError::io(format!("flushing {}", tmp.display()), e))?;
        drop(file);

        let actual = hex_encode(&hasher.finalize());
        if let Some(expected) = self.expected_sha256 {
            if !digest_matches(expected, &actual) {
                return Err(AcquireError::HashMismatch {
                    package: self.package.to_string(),
                    url: self.url.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        fs::rename(tmp, self.dest)
            .map_err(|e| AcquireError::io(format!("finalizing {}", self.dest.display()), e))?;
        Ok(actual)
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Minimal HTTP/1.1 responder for download tests.

    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    #[derive(Clone)]
    pub(crate) struct Route {
        pub body: Vec<u8>,
        pub etag: Option<String>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct Requests(Arc<Mutex<Vec<(String, Option<String>)>>>);

    impl Requests {
        /// `(path, if-none-match)` pairs in arrival order.
        pub(crate) fn all(&self) -> Vec<(String, Option<String>)> {
            self.0.lock().unwrap().clone()
        }
    }

    pub(crate) async fn serve(routes: HashMap<String, Route>) -> (String, Requests) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let requests = Requests::default();
        let seen = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let routes = routes.clone();
                let seen = seen.clone();
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
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("/")
                        .to_string();
                    let if_none_match = head.lines().find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("if-none-match")
                            .then(|| value.trim().to_string())
                    });
                    seen.0.lock().unwrap().push((path.clone(), if_none_match.clone()));

                    let response = match routes.get(&path) {
                        Some(route)
                            if route.etag.is_some() && route.etag == if_none_match =>
                        {
                            b"HTTP/1.1 304 Not Modified\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                                .to_vec()
                        }
                        Some(route) => {
                            let mut head = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n",
                                route.body.len()
                            );
                            if let Some(etag) = &route.etag {
                                head.push_str(&format!("ETag: {etag}\r\n"));
                            }
                            head.push_str("\r\n");
                            let mut out = head.into_bytes();
                            out.extend_from_slice(&route.body);
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
        (base, requests)
    }
}
