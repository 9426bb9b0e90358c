//! Atomic LDB bootstrap from a snapshot store.
//!
//! A new host starts with no LDB. When a bootstrap URL is configured, the
//! reflector downloads the latest snapshot before opening the LDB for
//! replication. The download is atomic: bytes land in `<ldb-path>.tmp` and
//! only a fully materialized snapshot is renamed into place, so a crashed
//! bootstrap leaves nothing behind.
//!
//! Supported URL schemes:
//!
//! - `s3://bucket/key` — the object store; a `.gz` key decompresses on the
//!   way down.
//! - `file://path` — a local snapshot, `.gz` honored the same way.
//! - `data:<base64>` — an inline snapshot, mostly for tests.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use base64::Engine;
use snafu::{ResultExt, Snafu};
use tokio::sync::OnceCell;
use url::Url;

use crate::internal_events::{BootstrapAttemptFailed, emit};

/// Attempts made against temporary download failures.
pub const MAX_DOWNLOAD_ATTEMPTS: u32 = 5;

/// Delay between download attempts.
pub const DOWNLOAD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Error raised while fetching a snapshot.
#[derive(Debug, Snafu)]
pub enum DownloadError {
    /// The URL did not parse or used an unsupported scheme.
    #[snafu(display("invalid bootstrap url {url:?}: {reason}"))]
    BadUrl { url: String, reason: String },

    /// The snapshot object does not exist.
    ///
    /// Permanent: retrying will not make it appear. In supervisor mode this
    /// means "start with a fresh LDB".
    #[snafu(display("snapshot not found at {url}"))]
    NotFound { url: String },

    /// The store failed in a way worth retrying (5xx, connect failures).
    #[snafu(display("temporary snapshot store failure: {message}"))]
    Temporary { message: String },

    /// Local filesystem trouble while materializing the snapshot.
    #[snafu(display("snapshot I/O error on {}: {source}", path.display()))]
    Io { path: PathBuf, source: io::Error },

    /// Every attempt failed with a temporary error.
    #[snafu(display("download of ldb snapshot failed after max attempts reached"))]
    MaxAttempts,
}

impl DownloadError {
    /// Whether the bootstrap retry loop should try again.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary { .. })
    }
}

/// Materializes snapshot bytes (decompressed) at a destination path.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, url: &Url, dest: &Path) -> Result<(), DownloadError>;
}

/// How a bootstrap run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// A snapshot was downloaded and renamed into place.
    Downloaded,
    /// An LDB already existed; nothing was fetched.
    AlreadyPresent,
    /// The snapshot was absent and supervisor mode turned that into
    /// "start fresh": no file was written.
    StartedFresh,
}

/// Downloads a snapshot to `ldb_path`, atomically, with retries.
pub async fn bootstrap_ldb(
    fetcher: &dyn SnapshotFetcher,
    url: &str,
    ldb_path: &Path,
    supervisor_mode: bool,
) -> Result<BootstrapOutcome, DownloadError> {
    if ldb_path.exists() {
        tracing::info!(
            message = "LDB already present; skipping bootstrap.",
            path = %ldb_path.display(),
        );
        return Ok(BootstrapOutcome::AlreadyPresent);
    }
    let parsed = Url::parse(url).map_err(|err| DownloadError::BadUrl {
        url: url.to_string(),
        reason: err.to_string(),
    })?;
    let tmp_path = tmp_download_path(ldb_path);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match fetcher.fetch(&parsed, &tmp_path).await {
            Ok(()) => {
                tokio::fs::rename(&tmp_path, ldb_path)
                    .await
                    .context(IoSnafu {
                        path: ldb_path.to_path_buf(),
                    })?;
                tracing::info!(
                    message = "Bootstrapped LDB from snapshot.",
                    url,
                    path = %ldb_path.display(),
                    attempt,
                );
                return Ok(BootstrapOutcome::Downloaded);
            }
            Err(error) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                emit(BootstrapAttemptFailed {
                    attempt,
                    temporary: error.is_temporary(),
                });
                match error {
                    DownloadError::NotFound { url } if supervisor_mode => {
                        tracing::info!(
                            message = "Snapshot absent; starting with a fresh LDB.",
                            url = %url,
                        );
                        return Ok(BootstrapOutcome::StartedFresh);
                    }
                    error if error.is_temporary() => {
                        if attempt >= MAX_DOWNLOAD_ATTEMPTS {
                            return Err(DownloadError::MaxAttempts);
                        }
                        tracing::warn!(
                            message = "Snapshot download failed; retrying.",
                            error = %error,
                            attempt,
                        );
                        tokio::time::sleep(DOWNLOAD_RETRY_DELAY).await;
                    }
                    error => return Err(error),
                }
            }
        }
    }
}

/// The temp path snapshots download into before the atomic rename.
pub fn tmp_download_path(ldb_path: &Path) -> PathBuf {
    let mut name = ldb_path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// The production fetcher: dispatches on URL scheme.
#[derive(Default)]
pub struct Downloader {
    s3: OnceCell<aws_sdk_s3::Client>,
}

impl Downloader {
    pub fn new() -> Self {
        Self::default()
    }

    async fn s3_client(&self) -> &aws_sdk_s3::Client {
        self.s3
            .get_or_init(|| async {
                let config = aws_config::load_defaults(
                    aws_config::BehaviorVersion::latest(),
                )
                .await;
                aws_sdk_s3::Client::new(&config)
            })
            .await
    }

    async fn fetch_s3(&self, url: &Url, dest: &Path) -> Result<(), DownloadError> {
        let bucket = url.host_str().ok_or_else(|| DownloadError::BadUrl {
            url: url.to_string(),
            reason: "missing bucket".to_string(),
        })?;
        let key = url.path().trim_start_matches('/');
        let response = self
            .s3_client()
            .await
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify_s3_error(url, err))?;

        let mut body = response.body.into_async_read();
        let mut file = tokio::fs::File::create(dest).await.context(IoSnafu {
            path: dest.to_path_buf(),
        })?;
        tokio::io::copy(&mut body, &mut file)
            .await
            .context(IoSnafu {
                path: dest.to_path_buf(),
            })?;
        drop(file);

        if key.ends_with(".gz") {
            gunzip_in_place(dest).await?;
        }
        Ok(())
    }

    async fn fetch_file(&self, url: &Url, dest: &Path) -> Result<(), DownloadError> {
        let src = PathBuf::from(url.path());
        if !src.exists() {
            return Err(DownloadError::NotFound {
                url: url.to_string(),
            });
        }
        tokio::fs::copy(&src, dest).await.context(IoSnafu {
            path: dest.to_path_buf(),
        })?;
        if url.path().ends_with(".gz") {
            gunzip_in_place(dest).await?;
        }
        Ok(())
    }

    async fn fetch_data(&self, url: &Url, dest: &Path) -> Result<(), DownloadError> {
        // data:<base64>, with an optional media-type prefix up to a comma.
        let raw = url.path();
        let encoded = raw.rsplit_once(',').map_or(raw, |(_, data)| data);
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|err| DownloadError::BadUrl {
                url: url.to_string(),
                reason: format!("bad base64 payload: {err}"),
            })?;
        tokio::fs::write(dest, bytes).await.context(IoSnafu {
            path: dest.to_path_buf(),
        })
    }
}

#[async_trait]
impl SnapshotFetcher for Downloader {
    async fn fetch(&self, url: &Url, dest: &Path) -> Result<(), DownloadError> {
        match url.scheme() {
            "s3" => self.fetch_s3(url, dest).await,
            "file" => self.fetch_file(url, dest).await,
            "data" => self.fetch_data(url, dest).await,
            other => Err(DownloadError::BadUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {other:?}"),
            }),
        }
    }
}

fn classify_s3_error<E, R>(url: &Url, err: SdkError<E, R>) -> DownloadError
where
    E: aws_sdk_s3::error::ProvideErrorMetadata,
{
    use aws_sdk_s3::error::ProvideErrorMetadata;
    if let SdkError::ServiceError(context) = &err {
        let code = context.err().code().unwrap_or_default();
        if code == "NoSuchKey" || code == "NotFound" {
            return DownloadError::NotFound {
                url: url.to_string(),
            };
        }
    }
    DownloadError::Temporary {
        message: err.to_string(),
    }
}

/// Replaces a gzip-compressed file with its decompressed contents.
async fn gunzip_in_place(path: &Path) -> Result<(), DownloadError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), DownloadError> {
        let mut plain = path.as_os_str().to_os_string();
        plain.push(".plain");
        let plain = PathBuf::from(plain);

        let input = std::fs::File::open(&path).context(IoSnafu { path: path.clone() })?;
        let mut decoder = flate2::read::GzDecoder::new(io::BufReader::new(input));
        let mut output =
            std::fs::File::create(&plain).context(IoSnafu { path: plain.clone() })?;
        io::copy(&mut decoder, &mut output).context(IoSnafu { path: path.clone() })?;
        drop(output);
        std::fs::rename(&plain, &path).context(IoSnafu { path })?;
        Ok(())
    })
    .await
    .expect("gunzip task panicked")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::*;

    /// Fails with temporary errors a fixed number of times, then succeeds.
    struct FlakyFetcher {
        failures: u32,
        calls: AtomicU32,
        payload: Vec<u8>,
    }

    #[async_trait]
    impl SnapshotFetcher for FlakyFetcher {
        async fn fetch(&self, _url: &Url, dest: &Path) -> Result<(), DownloadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(DownloadError::Temporary {
                    message: format!("flake {call}"),
                });
            }
            tokio::fs::write(dest, &self.payload).await.unwrap();
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_temporary_failures_then_succeeds() {
        let dir = tempdir().unwrap();
        let ldb = dir.path().join("ldb.db");
        let fetcher = FlakyFetcher {
            failures: 4,
            calls: AtomicU32::new(0),
            payload: b"snapshot-bytes".to_vec(),
        };

        let outcome = bootstrap_ldb(&fetcher, "file:///unused", &ldb, false)
            .await
            .unwrap();
        assert_eq!(outcome, BootstrapOutcome::Downloaded);
        assert_eq!(std::fs::read(&ldb).unwrap(), b"snapshot-bytes");
        assert!(!tmp_download_path(&ldb).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let dir = tempdir().unwrap();
        let ldb = dir.path().join("ldb.db");
        let fetcher = FlakyFetcher {
            failures: 5,
            calls: AtomicU32::new(0),
            payload: b"snapshot-bytes".to_vec(),
        };

        let err = bootstrap_ldb(&fetcher, "file:///unused", &ldb, false)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "download of ldb snapshot failed after max attempts reached"
        );
        assert!(!ldb.exists());
        assert!(!tmp_download_path(&ldb).exists());
    }

    #[tokio::test]
    async fn absent_snapshot_in_supervisor_mode_starts_fresh() {
        let dir = tempdir().unwrap();
        let ldb = dir.path().join("ldb.db");
        let fetcher = Downloader::new();

        let missing = format!("file://{}/missing.db", dir.path().display());
        let outcome = bootstrap_ldb(&fetcher, &missing, &ldb, true).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::StartedFresh);
        assert!(!ldb.exists());

        // Without supervisor mode the absence is an error.
        let err = bootstrap_ldb(&fetcher, &missing, &ldb, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotFound { .. }));
    }

    #[tokio::test]
    async fn existing_ldb_short_circuits() {
        let dir = tempdir().unwrap();
        let ldb = dir.path().join("ldb.db");
        std::fs::write(&ldb, b"existing").unwrap();
        let fetcher = FlakyFetcher {
            failures: 99,
            calls: AtomicU32::new(0),
            payload: Vec::new(),
        };

        let outcome = bootstrap_ldb(&fetcher, "file:///unused", &ldb, false)
            .await
            .unwrap();
        assert_eq!(outcome, BootstrapOutcome::AlreadyPresent);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn file_scheme_downloads_and_decompresses() {
        use std::io::Write;

        let dir = tempdir().unwrap();
        let payload = b"the snapshot payload";

        let plain_src = dir.path().join("snapshot.db");
        std::fs::write(&plain_src, payload).unwrap();
        let gz_src = dir.path().join("snapshot.db.gz");
        let mut encoder = flate2::write::GzEncoder::new(
            std::fs::File::create(&gz_src).unwrap(),
            flate2::Compression::default(),
        );
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap();

        let fetcher = Downloader::new();
        let plain_dest = dir.path().join("plain-ldb.db");
        let url = format!("file://{}", plain_src.display());
        bootstrap_ldb(&fetcher, &url, &plain_dest, false).await.unwrap();
        assert_eq!(std::fs::read(&plain_dest).unwrap(), payload);

        let gz_dest = dir.path().join("gz-ldb.db");
        let url = format!("file://{}", gz_src.display());
        bootstrap_ldb(&fetcher, &url, &gz_dest, false).await.unwrap();
        assert_eq!(std::fs::read(&gz_dest).unwrap(), payload);
    }

    #[tokio::test]
    async fn data_scheme_decodes_inline_payloads() {
        let dir = tempdir().unwrap();
        let ldb = dir.path().join("ldb.db");
        let payload = b"inline snapshot";
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);

        let fetcher = Downloader::new();
        let url = format!("data:{encoded}");
        bootstrap_ldb(&fetcher, &url, &ldb, false).await.unwrap();
        assert_eq!(std::fs::read(&ldb).unwrap(), payload);
    }
}
