//! LocalFileExecutor - ステージ済みファイルをデバイスのアップロード先へ転送
//!
//! # 転送先
//! `<upload_root>/<device>/<time_dir>/files/<stored_name>`
//!
//! - 64 KiB ずつ読み書きし、各チャンクの前にキャンセルを確認
//! - SHA-256 を転送しながら計算
//! - `.part` に書いてから rename（途中のファイルが完成品に見えない）
//! - キャンセル・エラー時は `.part` を削除
//! - 成功後にステージ済みファイルを削除。転送済みの再試行は転送先を再ハッシュするだけ
//!
//! 転送先の組み立てと受領証は [`super::layout`] と共通。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::layout::{self, CHUNK_SIZE};
use crate::domain::{ExecuteError, Receipt, Task};
use crate::ports::UploadExecutor;

pub struct LocalFileExecutor {
    upload_root: PathBuf,
}

impl LocalFileExecutor {
    pub fn new(upload_root: impl Into<PathBuf>) -> Self {
        Self {
            upload_root: upload_root.into(),
        }
    }

    pub fn upload_root(&self) -> &Path {
        &self.upload_root
    }

    async fn copy(
        source: &Path,
        part: &Path,
        cancel: &CancellationToken,
    ) -> Result<(u64, String), ExecuteError> {
        let mut reader = fs::File::open(source).await?;
        let mut writer = fs::File::create(part).await?;
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
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        writer.flush().await?;
        writer.sync_all().await?;

        Ok((total, hex::encode(hasher.finalize())))
    }
}

#[async_trait]
impl UploadExecutor for LocalFileExecutor {
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<Receipt, ExecuteError> {
        let source = PathBuf::from(task.payload_ref().as_str());
        let relative = layout::relative_destination(task);
        let stored_path = relative.to_string_lossy().into_owned();
        let dest = self.upload_root.join(&relative);
        let part = dest.with_extension(match dest.extension() {
            Some(ext) => format!("{}.part", ext.to_string_lossy()),
            None => "part".to_string(),
        });

        if !fs::try_exists(&source).await? && fs::try_exists(&dest).await? {
            // 前回の試行が rename まで済ませていた
            tracing::debug!(task_id = %task.id(), dest = %dest.display(), "already transferred");
            let digest = layout::digest(&dest, &cancel).await?;
            return Ok(layout::receipt(task, stored_path, Some(digest)));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let (size, sha256) = match Self::copy(&source, &part, &cancel).await {
            Ok(done) => done,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&part).await
                    && rm.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(task_id = %task.id(), path = %part.display(), error = %rm, "failed to remove partial file");
                }
                return Err(e);
            }
        };
        fs::rename(&part, &dest).await?;
        layout::discard_staged(task, &source).await;

        tracing::debug!(task_id = %task.id(), dest = %dest.display(), size, "file transferred");
        Ok(layout::receipt(task, stored_path, Some((size, sha256))))
    }
}
