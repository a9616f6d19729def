//! Service - アップロード要求の受付
//!
//! 検証・ステージング・タスク投入を行う薄い層。状態管理は Scheduler に任せる。

pub mod files;
pub mod request;
pub mod upload;

pub use self::request::{DecodedFile, FileBase64, UploadRequest, ValidUpload, ValidationError};
pub use self::upload::{ServiceConfig, UploadAccepted, UploadError, UploadService};
