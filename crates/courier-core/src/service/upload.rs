//! UploadService - リクエスト検証 → ステージング → タスク投入
//!
//! # フロー
//! 1. `UploadRequest::validate` で全項目を検証し、ファイルをデコード
//! 2. `<upload_root>/<device>/<time_dir>/content.txt` にタイトルと本文を書く
//! 3. 各ファイルを `<staging_dir>/<task-id>` に置き、1 ファイル 1 タスクで投入
//!
//! 投入の途中で失敗した場合は、同じアップロードで投入済みのタスクをキャンセルする。

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::files::{stored_name, time_dir};
use super::request::{UploadRequest, ValidationError};
use crate::app::Scheduler;
use crate::domain::{DeviceId, DeviceRegistry, SchedulerError, Task, TaskId, UploadId};
use crate::impls::attrs;
use crate::ports::{IdGenerator, TaskFilter};
use crate::store::TaskSnapshot;

/// Where uploads land and how big they may be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root of the per-device directories.
    pub upload_root: PathBuf,

    /// Decoded payloads wait here until transferred.
    pub staging_dir: PathBuf,

    /// Per-file limit on decoded bytes.
    pub max_file_size: u64,

    /// Offset used to name time directories.
    pub utc_offset_secs: i32,

    /// Overrides the scheduler's default for upload tasks.
    pub max_attempts: Option<u32>,

    /// Device name -> ADB serial. When set, only these devices are accepted.
    pub devices: DeviceRegistry,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            upload_root: PathBuf::from("uploads"),
            staging_dir: PathBuf::from("uploads/.staging"),
            max_file_size: 100 * 1024 * 1024,
            utc_offset_secs: 0,
            max_attempts: None,
            devices: DeviceRegistry::default(),
        }
    }
}

impl ServiceConfig {
    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs).unwrap_or_else(|| {
            tracing::warn!(utc_offset_secs = self.utc_offset_secs, "offset out of range, using UTC");
            Utc.fix()
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid upload request: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Invalid(Vec<ValidationError>),

    #[error("staging failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// What the caller gets back for an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadAccepted {
    pub upload_id: UploadId,
    pub device_name: String,
    pub timestamp: i64,
    pub files_count: usize,
    pub task_ids: Vec<TaskId>,
}

pub struct UploadService {
    scheduler: Arc<Scheduler>,
    ids: Arc<dyn IdGenerator>,
    config: ServiceConfig,
}

impl UploadService {
    pub fn new(scheduler: Arc<Scheduler>, ids: Arc<dyn IdGenerator>, config: ServiceConfig) -> Self {
        Self {
            scheduler,
            ids,
            config,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub async fn submit(&self, request: UploadRequest) -> Result<UploadAccepted, UploadError> {
        let valid = request
            .validate(self.config.max_file_size, &self.config.devices)
            .map_err(UploadError::Invalid)?;
        let time_dir = time_dir(request.timestamp, self.config.offset())
            .ok_or_else(|| UploadError::Invalid(vec![ValidationError::Timestamp]))?;

        let device_dir = self
            .config
            .upload_root
            .join(&request.device_name)
            .join(&time_dir);
        fs::create_dir_all(device_dir.join("files")).await?;
        fs::create_dir_all(&self.config.staging_dir).await?;
        fs::write(
            device_dir.join("content.txt"),
            format!(
                "Title: {}\nContent: {}",
                request.title.as_deref().unwrap_or(""),
                request.content.as_deref().unwrap_or("")
            ),
        )
        .await?;

        let upload_id = self.ids.generate_upload_id();
        let mut task_ids = Vec::with_capacity(valid.files.len());

        for file in valid.files {
            let task_id = self.ids.generate_task_id();
            let staged = self.config.staging_dir.join(task_id.to_string());
            let stored = stored_name(self.ids.generate_ulid(), &file.filename);

            let result = async {
                fs::write(&staged, &file.bytes).await?;

                let mut attributes = serde_json::Map::new();
                attributes.insert(attrs::ORIGINAL_NAME.into(), file.filename.clone().into());
                attributes.insert(attrs::STORED_NAME.into(), stored.clone().into());
                attributes.insert(attrs::TIME_DIR.into(), time_dir.clone().into());

                let mut builder = Task::builder(&request.device_name, staged.to_string_lossy())
                    .id(task_id)
                    .upload_id(upload_id)
                    .attributes(attributes.into());
                if let Some(at) = valid.run_at {
                    builder = builder.not_before(at);
                }
                if let Some(n) = self.config.max_attempts {
                    builder = builder.max_attempts(n);
                }
                Ok::<_, UploadError>(self.scheduler.submit(builder.build())?)
            }
            .await;

            match result {
                Ok(id) => task_ids.push(id),
                Err(e) => {
                    tracing::warn!(upload_id = %upload_id, error = %e, "upload rejected mid-batch");
                    if let Err(rm) = fs::remove_file(&staged).await
                        && rm.kind() != std::io::ErrorKind::NotFound
                    {
                        tracing::debug!(path = %staged.display(), error = %rm, "staged file not removed");
                    }
                    self.rollback(&task_ids);
                    return Err(e);
                }
            }
        }

        tracing::info!(
            upload_id = %upload_id,
            device = %request.device_name,
            files = task_ids.len(),
            "upload accepted"
        );

        Ok(UploadAccepted {
            upload_id,
            device_name: request.device_name,
            timestamp: request.timestamp,
            files_count: task_ids.len(),
            task_ids,
        })
    }

    fn rollback(&self, submitted: &[TaskId]) {
        for id in submitted {
            if let Err(e) = self.scheduler.cancel(*id) {
                tracing::debug!(task_id = %id, error = %e, "rollback cancel skipped");
            }
        }
    }

    pub fn status(&self, id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        self.scheduler.status(id)
    }

    pub fn cancel(&self, id: TaskId) -> Result<(), SchedulerError> {
        self.scheduler.cancel(id)
    }

    pub fn tasks_for_device(&self, device: &str) -> Vec<TaskSnapshot> {
        self.scheduler.list(TaskFilter::all().device(device))
    }

    pub fn tasks_for_upload(&self, upload: UploadId) -> Vec<TaskSnapshot> {
        self.scheduler.list(TaskFilter::all().upload(upload))
    }

    /// Configured device names, sorted. Empty when any device is accepted.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.config.devices.names()
    }

    /// Distinct devices that have tasks in the store, sorted.
    pub fn active_devices(&self) -> Vec<DeviceId> {
        self.scheduler
            .store()
            .list(TaskFilter::all())
            .map(|s| s.task.device_id().clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
