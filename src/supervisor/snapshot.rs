//! Snapshot upload destinations.
//!
//! A snapshot is byte-identical to a checkpointed and vacuumed LDB file.
//! Destinations are URLs; a `.gz` suffix gzip-compresses on the way up, and
//! destinations that support metadata carry a SHA-256 content hash so a
//! bootstrap can verify what it fetched.

use std::{
    io::{self, Read},
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use tokio::sync::OnceCell;
use url::Url;

use crate::internal_events::{SnapshotUploaded, emit};

/// Metadata key carrying the snapshot's content hash.
pub const CHECKSUM_METADATA_KEY: &str = "checksum-sha256";

/// Error raised while uploading a snapshot.
#[derive(Debug, Snafu)]
pub enum SnapshotError {
    /// The destination URL did not parse or used an unsupported scheme.
    #[snafu(display("invalid snapshot destination {url:?}: {reason}"))]
    BadDestination { url: String, reason: String },

    /// Local filesystem trouble while staging the snapshot.
    #[snafu(display("snapshot I/O error on {}: {source}", path.display()))]
    Io { path: PathBuf, source: io::Error },

    /// The object store rejected or failed the upload.
    #[snafu(display("snapshot upload to {url} failed: {message}"))]
    Store { url: String, message: String },
}

/// Uploads LDB snapshots to configured destinations.
#[derive(Default)]
pub struct SnapshotUploader {
    s3: OnceCell<aws_sdk_s3::Client>,
}

impl SnapshotUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams the LDB at `ldb_path` to `url`.
    pub async fn upload(&self, ldb_path: &Path, url: &str) -> Result<(), SnapshotError> {
        let parsed = Url::parse(url).map_err(|err| SnapshotError::BadDestination {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        let gzip = parsed.path().ends_with(".gz");
        let staged = stage_snapshot(ldb_path, gzip).await?;

        let result = match parsed.scheme() {
            "file" => self.upload_file(&staged, &parsed).await,
            "s3" => self.upload_s3(&staged, &parsed).await,
            other => Err(SnapshotError::BadDestination {
                url: url.to_string(),
                reason: format!("unsupported scheme {other:?}"),
            }),
        };
        let _ = tokio::fs::remove_file(&staged.path).await;
        result?;

        emit(SnapshotUploaded {
            destination: url.to_string(),
            bytes: staged.bytes,
        });
        Ok(())
    }

    async fn upload_file(&self, staged: &StagedSnapshot, url: &Url) -> Result<(), SnapshotError> {
        let dest = PathBuf::from(url.path());
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.context(IoSnafu {
                path: parent.to_path_buf(),
            })?;
        }
        // Copy to a sibling temp file first so a concurrent bootstrap never
        // observes a half-written snapshot.
        let mut tmp = dest.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::copy(&staged.path, &tmp).await.context(IoSnafu {
            path: tmp.to_path_buf(),
        })?;
        tokio::fs::rename(&tmp, &dest).await.context(IoSnafu { path: dest })
    }

    async fn upload_s3(&self, staged: &StagedSnapshot, url: &Url) -> Result<(), SnapshotError> {
        let bucket = url.host_str().ok_or_else(|| SnapshotError::BadDestination {
            url: url.to_string(),
            reason: "missing bucket".to_string(),
        })?;
        let key = url.path().trim_start_matches('/');
        let body = aws_sdk_s3::primitives::ByteStream::from_path(&staged.path)
            .await
            .map_err(|err| SnapshotError::Store {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        self.s3_client()
            .await
            .put_object()
            .bucket(bucket)
            .key(key)
            .metadata(CHECKSUM_METADATA_KEY, &staged.checksum)
            .body(body)
            .send()
            .await
            .map_err(|err| SnapshotError::Store {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        Ok(())
    }

    async fn s3_client(&self) -> &aws_sdk_s3::Client {
        self.s3
            .get_or_init(|| async {
                let config =
                    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                aws_sdk_s3::Client::new(&config)
            })
            .await
    }
}

struct StagedSnapshot {
    path: PathBuf,
    checksum: String,
    bytes: u64,
}

/// Copies (and optionally compresses) the LDB into a staging file next to
/// it, hashing the staged bytes along the way.
async fn stage_snapshot(ldb_path: &Path, gzip: bool) -> Result<StagedSnapshot, SnapshotError> {
    let ldb_path = ldb_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<StagedSnapshot, SnapshotError> {
        let mut staged = ldb_path.as_os_str().to_os_string();
        staged.push(if gzip { ".snapshot.gz" } else { ".snapshot" });
        let staged = PathBuf::from(staged);

        let input = std::fs::File::open(&ldb_path).context(IoSnafu {
            path: ldb_path.clone(),
        })?;
        let output = std::fs::File::create(&staged).context(IoSnafu {
            path: staged.clone(),
        })?;

        let mut reader = HashingReader {
            inner: io::BufReader::new(input),
            hasher: Sha256::new(),
        };
        let bytes = if gzip {
            let mut encoder =
                flate2::write::GzEncoder::new(output, flate2::Compression::default());
            let copied = io::copy(&mut reader, &mut encoder).context(IoSnafu {
                path: staged.clone(),
            })?;
            encoder.finish().context(IoSnafu {
                path: staged.clone(),
            })?;
            copied
        } else {
            let mut output = output;
            io::copy(&mut reader, &mut output).context(IoSnafu {
                path: staged.clone(),
            })?
        };

        let digest = reader.hasher.finalize();
        let checksum = digest.iter().map(|b| format!("{b:02x}")).collect();
        Ok(StagedSnapshot {
            path: staged,
            checksum,
            bytes,
        })
    })
    .await
    .expect("snapshot staging task panicked")
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        Ok(read)
    }
}
