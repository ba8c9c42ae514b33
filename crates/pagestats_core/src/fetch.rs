use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::StatsConfig;
use crate::runtime::ResolvedPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchOutcome {
    AlreadyPresent { bytes: u64 },
    Downloaded { bytes: u64 },
}

impl FetchOutcome {
    pub fn bytes(self) -> u64 {
        match self {
            Self::AlreadyPresent { bytes } | Self::Downloaded { bytes } => bytes,
        }
    }
}

/// Download the snapshot unless a cached copy already exists. The cache is
/// never revalidated.
pub fn ensure_snapshot(paths: &ResolvedPaths, config: &StatsConfig) -> Result<FetchOutcome> {
    if paths.snapshot_path.exists() {
        let bytes = fs::metadata(&paths.snapshot_path)
            .with_context(|| format!("failed to inspect {}", paths.snapshot_path.display()))?
            .len();
        debug!(path = %paths.snapshot_path.display(), bytes, "snapshot already cached");
        return Ok(FetchOutcome::AlreadyPresent { bytes });
    }

    let url = config.snapshot_url();
    let bytes = download_to(&url, &paths.snapshot_path, config)?;
    Ok(FetchOutcome::Downloaded { bytes })
}

/// Download the snapshot again. The cached copy is only replaced once the new
/// body is complete.
pub fn refetch_snapshot(paths: &ResolvedPaths, config: &StatsConfig) -> Result<FetchOutcome> {
    let url = config.snapshot_url();
    let bytes = download_to(&url, &paths.snapshot_path, config)?;
    Ok(FetchOutcome::Downloaded { bytes })
}

fn download_to(url: &str, destination: &Path, config: &StatsConfig) -> Result<u64> {
    let parent = destination
        .parent()
        .ok_or_else(|| anyhow::anyhow!("snapshot path has no parent: {}", destination.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let partial = partial_path(destination);
    let result = stream_to_file(url, &partial, config).and_then(|bytes| {
        fs::rename(&partial, destination).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                partial.display(),
                destination.display()
            )
        })?;
        Ok(bytes)
    });
    if result.is_err() && partial.exists() {
        let _ = fs::remove_file(&partial);
    }
    result
}

fn stream_to_file(url: &str, partial: &Path, config: &StatsConfig) -> Result<u64> {
    info!(url, "downloading snapshot");
    let client = Client::builder()
        .timeout(Duration::from_millis(config.timeout_ms()?))
        .user_agent(config.user_agent())
        .build()
        .context("failed to build snapshot HTTP client")?;
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("failed to fetch {url}"))?;
    let status = response.status();
    if !status.is_success() {
        bail!("HTTP {} while fetching {}", status.as_u16(), url);
    }

    let mut file =
        File::create(partial).with_context(|| format!("failed to create {}", partial.display()))?;
    let bytes = response
        .copy_to(&mut file)
        .with_context(|| format!("failed to write snapshot body to {}", partial.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to flush {}", partial.display()))?;
    info!(url, bytes, "snapshot downloaded");
    Ok(bytes)
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::path::Path;
    use std::thread::{self, JoinHandle};

    use tempfile::tempdir;

    use super::{FetchOutcome, ensure_snapshot, partial_path, refetch_snapshot};
    use crate::config::{SnapshotSection, StatsConfig};
    use crate::runtime::ResolvedPaths;

    fn config_for(url: &str) -> StatsConfig {
        StatsConfig {
            snapshot: SnapshotSection {
                url: Some(url.to_string()),
                user_agent: None,
                timeout_ms: Some(2_000),
            },
            ..StatsConfig::default()
        }
    }

    /// Answer a single HTTP request with `status` and `body`, then close.
    fn serve_once(status: &'static str, body: &'static [u8]) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let address = listener.local_addr().expect("local addr");
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut request = Vec::new();
            let mut buffer = [0_u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = stream.read(&mut buffer).expect("read request");
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
            }
            let header = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(header.as_bytes()).expect("write header");
            stream.write_all(body).expect("write body");
            stream.flush().expect("flush");
        });
        (format!("http://{address}/pages.parquet"), handle)
    }

    #[test]
    fn ensure_snapshot_keeps_cached_file_untouched() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::under_root(temp.path());
        fs::create_dir_all(&paths.data_dir).expect("create data dir");
        fs::write(&paths.snapshot_path, b"cached bytes").expect("write cached snapshot");

        let outcome = ensure_snapshot(&paths, &config_for("http://127.0.0.1:9/pages"))
            .expect("cached snapshot");
        assert_eq!(outcome, FetchOutcome::AlreadyPresent { bytes: 12 });
        assert_eq!(
            fs::read(&paths.snapshot_path).expect("read snapshot"),
            b"cached bytes"
        );
    }

    #[test]
    fn ensure_snapshot_downloads_body_into_place() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::under_root(temp.path());
        let body: &'static [u8] = b"PAR1\x00\x01snapshot body\xffPAR1";
        let (url, server) = serve_once("200 OK", body);

        let outcome = ensure_snapshot(&paths, &config_for(&url)).expect("download");
        server.join().expect("server thread");

        assert_eq!(
            outcome,
            FetchOutcome::Downloaded {
                bytes: body.len() as u64
            }
        );
        assert_eq!(fs::read(&paths.snapshot_path).expect("read snapshot"), body);
        assert!(!partial_path(&paths.snapshot_path).exists());
    }

    #[test]
    fn refetch_snapshot_replaces_cached_file() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::under_root(temp.path());
        fs::create_dir_all(&paths.data_dir).expect("create data dir");
        fs::write(&paths.snapshot_path, b"stale snapshot").expect("write cached snapshot");
        let (url, server) = serve_once("200 OK", b"fresh snapshot body");

        let outcome = refetch_snapshot(&paths, &config_for(&url)).expect("refetch");
        server.join().expect("server thread");

        assert_eq!(outcome, FetchOutcome::Downloaded { bytes: 19 });
        assert_eq!(
            fs::read(&paths.snapshot_path).expect("read snapshot"),
            b"fresh snapshot body"
        );
        assert!(!partial_path(&paths.snapshot_path).exists());
    }

    #[test]
    fn failed_refetch_keeps_cached_file() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::under_root(temp.path());
        fs::create_dir_all(&paths.data_dir).expect("create data dir");
        fs::write(&paths.snapshot_path, b"good cached snapshot").expect("write cached snapshot");

        refetch_snapshot(&paths, &config_for("http://127.0.0.1:9/pages")).expect_err("must fail");

        assert_eq!(
            fs::read(&paths.snapshot_path).expect("read snapshot"),
            b"good cached snapshot"
        );
        assert!(!partial_path(&paths.snapshot_path).exists());
    }

    #[test]
    fn ensure_snapshot_rejects_non_success_status() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::under_root(temp.path());
        let (url, server) = serve_once("404 Not Found", b"missing");

        let error = ensure_snapshot(&paths, &config_for(&url)).expect_err("must fail");
        server.join().expect("server thread");

        assert!(error.to_string().contains("HTTP 404"));
        assert!(!paths.snapshot_path.exists());
        assert!(!partial_path(&paths.snapshot_path).exists());
    }

    #[test]
    fn ensure_snapshot_propagates_connection_failure() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::under_root(temp.path());

        let error = ensure_snapshot(&paths, &config_for("http://127.0.0.1:9/pages"))
            .expect_err("must fail");
        assert!(error.to_string().contains("127.0.0.1:9"));
        assert!(!paths.snapshot_path.exists());
        assert!(!partial_path(&paths.snapshot_path).exists());
    }

    #[test]
    fn ensure_snapshot_rejects_invalid_url() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::under_root(temp.path());

        ensure_snapshot(&paths, &config_for("not a url")).expect_err("must fail");
        assert!(!paths.snapshot_path.exists());
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/data/pages.parquet")),
            Path::new("/data/pages.parquet.part")
        );
    }
}
