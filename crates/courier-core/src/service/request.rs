//! Upload request model and validation.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::DeviceRegistry;

pub const DEVICE_NAME_MIN: usize = 2;
pub const DEVICE_NAME_MAX: usize = 50;
pub const TITLE_MAX: usize = 100;
pub const CONTENT_MAX: usize = 1000;

/// One file of an upload, base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBase64 {
    pub filename: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub device_name: String,

    /// Unix seconds; names the device's time directory.
    pub timestamp: i64,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub content: Option<String>,

    pub files: Vec<FileBase64>,

    /// Unix seconds before which no transfer starts.
    #[serde(default)]
    pub run_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("device_name must be 2..=50 characters, got {0}")]
    DeviceNameLength(usize),

    #[error("device_name must not contain '/', '\\' or '..'")]
    DeviceNamePath,

    #[error("device {0} is not configured")]
    UnknownDevice(String),

    #[error("timestamp must be greater than 0")]
    Timestamp,

    #[error("title must be at most 100 characters")]
    TitleTooLong,

    #[error("content must be at most 1000 characters")]
    ContentTooLong,

    #[error("at least one file is required")]
    NoFiles,

    #[error("files[{index}]: filename is empty")]
    EmptyFilename { index: usize },

    #[error("files[{index}]: invalid base64 data")]
    InvalidBase64 { index: usize },

    #[error("files[{index}]: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { index: usize, size: u64, limit: u64 },

    #[error("run_at {0} is not a valid unix timestamp")]
    RunAt(i64),
}

/// A file that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// The decoded form of a valid [`UploadRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidUpload {
    pub files: Vec<DecodedFile>,
    pub run_at: Option<DateTime<Utc>>,
}

impl UploadRequest {
    /// Checks every field and decodes the files.
    ///
    /// All violations are reported together rather than stopping at the first.
    /// A non-empty `devices` registry also restricts which names are accepted.
    pub fn validate(
        &self,
        max_file_size: u64,
        devices: &DeviceRegistry,
    ) -> Result<ValidUpload, Vec<ValidationError>> {
        let mut errors = Vec::new();

        let name_len = self.device_name.chars().count();
        if !(DEVICE_NAME_MIN..=DEVICE_NAME_MAX).contains(&name_len) {
            errors.push(ValidationError::DeviceNameLength(name_len));
        }
        // デバイス名はそのままディレクトリ名になる
        if self.device_name.contains(['/', '\\']) || self.device_name.contains("..") {
            errors.push(ValidationError::DeviceNamePath);
        } else if !devices.admits(&self.device_name) {
            errors.push(ValidationError::UnknownDevice(self.device_name.clone()));
        }
        if self.timestamp <= 0 {
            errors.push(ValidationError::Timestamp);
        }
        if self.title.as_ref().is_some_and(|t| t.chars().count() > TITLE_MAX) {
            errors.push(ValidationError::TitleTooLong);
        }
        if self
            .content
            .as_ref()
            .is_some_and(|c| c.chars().count() > CONTENT_MAX)
        {
            errors.push(ValidationError::ContentTooLong);
        }
        if self.files.is_empty() {
            errors.push(ValidationError::NoFiles);
        }

        let mut files = Vec::with_capacity(self.files.len());
        for (index, file) in self.files.iter().enumerate() {
            if file.filename.trim().is_empty() {
                errors.push(ValidationError::EmptyFilename { index });
            }
            match STANDARD.decode(file.data.as_bytes()) {
                Ok(bytes) if bytes.len() as u64 > max_file_size => {
                    errors.push(ValidationError::FileTooLarge {
                        index,
                        size: bytes.len() as u64,
                        limit: max_file_size,
                    });
                }
                Ok(bytes) => files.push(DecodedFile {
                    filename: file.filename.clone(),
                    bytes,
                }),
                Err(_) => errors.push(ValidationError::InvalidBase64 { index }),
            }
        }

        let run_at = match self.run_at {
            Some(ts) => match DateTime::from_timestamp(ts, 0) {
                Some(at) => Some(at),
                None => {
                    errors.push(ValidationError::RunAt(ts));
                    None
                }
            },
            None => None,
        };

        if errors.is_empty() {
            Ok(ValidUpload { files, run_at })
        } else {
            Err(errors)
        }
    }
}
