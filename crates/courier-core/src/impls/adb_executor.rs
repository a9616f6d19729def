//! AdbExecutor - ステージ済みファイルを `adb push` でデバイスへ転送
//!
//! # 転送先
//! `<remote_root>/<device>/<time_dir>/files/<stored_name>`（デバイス上）
//!
//! - デバイス名は [`DeviceRegistry`] で ADB シリアルに引き直す
//! - `adb` は子プロセスとして起動し、キャンセルされたら kill する
//! - push に失敗したら接続状態を確認し、ネットワーク接続のデバイスは再接続を試みる。
//!   再試行そのものはスケジューラのバックオフに任せる
//! - 成功後にステージ済みファイルを削除。転送済みの再試行はデバイス側の存在確認だけ

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::layout;
use crate::domain::{DeviceRegistry, ExecuteError, Receipt, Task};
use crate::ports::UploadExecutor;

/// Upper bound for best-effort cleanup commands run after a failed push.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdbConfig {
    /// `adb` binary; looked up on `PATH` when relative.
    pub adb_path: PathBuf,

    /// Directory on the device that receives uploads.
    pub remote_root: String,

    /// Run `adb connect` for network devices that dropped off.
    pub reconnect: bool,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            remote_root: "/sdcard/courier".to_string(),
            reconnect: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdbError {
    #[error("failed to run adb: {0}")]
    Io(#[from] std::io::Error),

    #[error("`adb {command}` failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("adb command cancelled")]
    Cancelled,
}

impl From<AdbError> for ExecuteError {
    fn from(e: AdbError) -> Self {
        match e {
            AdbError::Cancelled => ExecuteError::Cancelled,
            other => ExecuteError::transfer(other.to_string()),
        }
    }
}

/// Thin async wrapper around the `adb` command line.
#[derive(Debug, Clone)]
pub struct AdbClient {
    adb_path: PathBuf,
}

impl AdbClient {
    pub fn new(adb_path: impl Into<PathBuf>) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }

    /// Runs `adb <args>` and returns trimmed stdout. The child is killed when
    /// `cancel` fires.
    pub async fn run(&self, args: &[&str], cancel: &CancellationToken) -> Result<String, AdbError> {
        tracing::debug!(adb = %self.adb_path.display(), args = ?args, "running adb");
        let mut child = Command::new(&self.adb_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, stdout, stderr) = tokio::select! {
            finished = async { tokio::try_join!(child.wait(), read_all(stdout), read_all(stderr)) } => finished?,
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill adb");
                }
                return Err(AdbError::Cancelled);
            }
        };

        if !status.success() {
            return Err(AdbError::Failed {
                command: args.join(" "),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout.trim().to_string())
    }

    pub async fn shell(
        &self,
        serial: &str,
        command: &[&str],
        cancel: &CancellationToken,
    ) -> Result<String, AdbError> {
        let mut args = vec!["-s", serial, "shell"];
        args.extend_from_slice(command);
        self.run(&args, cancel).await
    }

    pub async fn push(
        &self,
        serial: &str,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AdbError> {
        let local = local.to_string_lossy();
        self.run(&["-s", serial, "push", &local, remote], cancel).await
    }

    /// Serials `adb devices` reports as ready.
    pub async fn connected(&self, cancel: &CancellationToken) -> Result<Vec<String>, AdbError> {
        let output = self.run(&["devices"], cancel).await?;
        Ok(parse_devices(&output))
    }

    pub async fn is_connected(&self, serial: &str, cancel: &CancellationToken) -> bool {
        match self.connected(cancel).await {
            Ok(serials) => serials.iter().any(|s| s == serial),
            Err(e) => {
                tracing::warn!(error = %e, "could not list adb devices");
                false
            }
        }
    }

    /// `adb connect <serial>`, then checks the device shows up.
    pub async fn connect(&self, serial: &str, cancel: &CancellationToken) -> Result<bool, AdbError> {
        tracing::info!(serial, "connecting device");
        self.run(&["connect", serial], cancel).await?;
        let connected = self.is_connected(serial, cancel).await;
        if connected {
            tracing::info!(serial, "device connected");
        } else {
            tracing::warn!(serial, "device still not connected");
        }
        Ok(connected)
    }
}

async fn read_all(pipe: Option<impl AsyncRead + Unpin>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Parses `adb devices` output into the serials whose state is `device`.
/// Offline and unauthorized entries are left out.
pub fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (serial, state) = line.split_once('\t')?;
            (state.trim() == "device").then(|| serial.trim().to_string())
        })
        .collect()
}

pub struct AdbExecutor {
    client: AdbClient,
    devices: Arc<DeviceRegistry>,
    remote_root: String,
    reconnect: bool,
}

impl AdbExecutor {
    pub fn new(config: AdbConfig, devices: Arc<DeviceRegistry>) -> Self {
        Self {
            client: AdbClient::new(config.adb_path),
            devices,
            remote_root: config.remote_root,
            reconnect: config.reconnect,
        }
    }

    pub fn client(&self) -> &AdbClient {
        &self.client
    }

    /// Destination of `task` on the device.
    pub fn remote_path(&self, task: &Task) -> String {
        format!(
            "{}/{}",
            self.remote_root.trim_end_matches('/'),
            layout::destination_segments(task).join("/")
        )
    }

    async fn transfer(
        &self,
        serial: &str,
        source: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        if let Some((dir, _)) = remote.rsplit_once('/') {
            self.client.shell(serial, &["mkdir", "-p", dir], cancel).await?;
        }
        if let Err(e) = self.client.push(serial, source, remote, cancel).await {
            self.remove_partial(serial, remote).await;
            return Err(e);
        }
        Ok(())
    }

    async fn remove_partial(&self, serial: &str, remote: &str) {
        // 元のトークンは既にキャンセル済みのことがある
        let rm_args = ["rm", "-f", remote];
        let cleanup_cancel = CancellationToken::new();
        let cleanup = self.client.shell(serial, &rm_args, &cleanup_cancel);
        match tokio::time::timeout(CLEANUP_TIMEOUT, cleanup).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!(serial, remote, error = %e, "partial file not removed"),
            Err(_) => tracing::debug!(serial, remote, "partial file cleanup timed out"),
        }
    }

    /// After a failed push: report a dropped device and reconnect network ones.
    async fn recover(&self, device: &str, serial: &str, cancel: &CancellationToken) {
        if self.client.is_connected(serial, cancel).await {
            return;
        }
        tracing::warn!(device, serial, "device not connected");
        // USB シリアルには connect できない
        if self.reconnect
            && serial.contains(':')
            && let Err(e) = self.client.connect(serial, cancel).await
        {
            tracing::warn!(device, serial, error = %e, "reconnect failed");
        }
    }
}

#[async_trait]
impl UploadExecutor for AdbExecutor {
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<Receipt, ExecuteError> {
        let device = task.device_id().as_str();
        let serial = self.devices.serial(device).ok_or_else(|| {
            ExecuteError::transfer(format!("device {device} has no adb serial configured"))
        })?;
        let source = PathBuf::from(task.payload_ref().as_str());
        let remote = self.remote_path(task);

        if !fs::try_exists(&source).await? {
            // 前回の試行が push まで済ませていれば、デバイス側に残っている
            let listed = self.client.shell(serial, &["ls", &remote], &cancel).await;
            return match listed {
                Ok(_) => {
                    tracing::debug!(task_id = %task.id(), remote, "already transferred");
                    Ok(layout::receipt(task, remote, None))
                }
                Err(AdbError::Cancelled) => Err(ExecuteError::Cancelled),
                Err(_) => Err(ExecuteError::transfer(format!(
                    "staged file {} is missing",
                    source.display()
                ))),
            };
        }

        let digest = layout::digest(&source, &cancel).await?;
        if let Err(e) = self.transfer(serial, &source, &remote, &cancel).await {
            if !matches!(e, AdbError::Cancelled) {
                self.recover(device, serial, &cancel).await;
            }
            return Err(e.into());
        }
        layout::discard_staged(task, &source).await;

        tracing::debug!(task_id = %task.id(), serial, remote, size = digest.0, "file pushed");
        Ok(layout::receipt(task, remote, Some(digest)))
    }
}
