//! 転送先の配置と受領証 - 各 executor で共通
//!
//! 転送先は常に `<device>/[<time_dir>/]files/<stored_name>`。ルートだけが
//! executor ごとに違う（ローカルのディレクトリ / デバイス上のディレクトリ）。

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::domain::{Artifact, ExecuteError, Receipt, Task};

pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Task attribute keys understood by the executors.
pub mod attrs {
    pub const ORIGINAL_NAME: &str = "original_name";
    pub const STORED_NAME: &str = "stored_name";
    pub const TIME_DIR: &str = "time_dir";
}

/// Path segments of the destination, relative to an executor's root.
pub fn destination_segments(task: &Task) -> Vec<String> {
    let stored_name = task
        .attribute(attrs::STORED_NAME)
        .map(str::to_string)
        .or_else(|| {
            Path::new(task.payload_ref().as_str())
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| task.id().to_string());

    let mut segments = vec![task.device_id().as_str().to_string()];
    if let Some(time_dir) = task.attribute(attrs::TIME_DIR) {
        segments.push(time_dir.to_string());
    }
    segments.push("files".to_string());
    segments.push(stored_name);
    segments
}

pub fn relative_destination(task: &Task) -> PathBuf {
    destination_segments(task).iter().collect()
}

/// Size and hex SHA-256 of a local file, checking `cancel` between chunks.
pub(crate) async fn digest(path: &Path, cancel: &CancellationToken) -> Result<(u64, String), ExecuteError> {
    let mut reader = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(ExecuteError::Cancelled);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finalize())))
}

pub(crate) fn receipt(task: &Task, stored_path: String, digest: Option<(u64, String)>) -> Receipt {
    let mut receipt = Receipt::new().with_artifact(Artifact::StoredPath(stored_path));
    if let Some((size, sha256)) = digest {
        receipt = receipt
            .with_artifact(Artifact::Size(size))
            .with_artifact(Artifact::Sha256(sha256));
    }
    if let Some(name) = task.attribute(attrs::ORIGINAL_NAME) {
        receipt = receipt.with_artifact(Artifact::Json(serde_json::json!({
            "original_name": name,
        })));
    }
    receipt
}

/// Removes the staged source once it has been transferred.
pub(crate) async fn discard_staged(task: &Task, source: &Path) {
    if let Err(e) = fs::remove_file(source).await {
        tracing::debug!(task_id = %task.id(), path = %source.display(), error = %e, "staged file not removed");
    }
}
