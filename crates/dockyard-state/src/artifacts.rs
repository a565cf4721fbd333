//! Filesystem store for pushed image artifacts.
//!
//! Artifacts are too large for redb values, so they live beside the
//! database at `<root>/<application>/<version>/source`. Writes go to a
//! `.partial` sibling first and are renamed into place only once the whole
//! stream has been hashed and synced, so a reader never observes a
//! truncated artifact.

use std::fmt::Display;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};

const SOURCE: &str = "source";
const PARTIAL: &str = "source.partial";

/// Size and digest of a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub size: u64,
    /// Hex SHA-256.
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Use `root` as the artifact directory, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> StateResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "artifact store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, app: &str, version: &str) -> PathBuf {
        self.root.join(app).join(version)
    }

    /// Final location of an artifact.
    pub fn path(&self, app: &str, version: &str) -> PathBuf {
        self.dir(app, version).join(SOURCE)
    }

    pub async fn exists(&self, app: &str, version: &str) -> bool {
        fs::try_exists(self.path(app, version)).await.unwrap_or(false)
    }

    /// Stream `body` into the artifact for `(app, version)`.
    ///
    /// On any failure the partial file is deleted and nothing is left at
    /// the final path.
    pub async fn write_stream<S, E>(
        &self,
        app: &str,
        version: &str,
        mut body: S,
    ) -> StateResult<ArtifactInfo>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let dir = self.dir(app, version);
        fs::create_dir_all(&dir).await?;
        let partial = dir.join(PARTIAL);

        let result = async {
            let info = copy_hashed(&partial, &mut body).await?;
            fs::rename(&partial, dir.join(SOURCE)).await?;
            Ok::<_, StateError>(info)
        }
        .await;

        match result {
            Ok(info) => {
                debug!(%app, %version, size = info.size, sha256 = %info.sha256, "artifact stored");
                Ok(info)
            }
            Err(e) => {
                warn!(%app, %version, error = %e, "artifact write failed, discarding partial file");
                match fs::remove_dir_all(&dir).await {
                    Err(cleanup) if cleanup.kind() != ErrorKind::NotFound => {
                        warn!(
                            %app,
                            %version,
                            error = %cleanup,
                            "failed to remove partial artifact"
                        );
                    }
                    _ => {}
                }
                Err(e)
            }
        }
    }

    /// Open an artifact for reading. Returns the file and its length.
    pub async fn open_reader(&self, app: &str, version: &str) -> StateResult<(File, u64)> {
        let path = self.path(app, version);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StateError::NotFound(format!("artifact {app}:{version}")));
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Delete an artifact and its directory. Missing artifacts are ignored.
    pub async fn remove(&self, app: &str, version: &str) -> StateResult<()> {
        match fs::remove_dir_all(self.dir(app, version)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

async fn copy_hashed<S, E>(path: &Path, body: &mut S) -> StateResult<ArtifactInfo>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let mut file = File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| StateError::Stream(e.to_string()))?;
        hasher.update(&chunk);
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok(ArtifactInfo {
        size,
        sha256: hex::encode(hasher.finalize()),
    })
}
