use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use clap::{Parser, Subcommand};
use courier_core::service::{FileBase64, UploadRequest};

#[derive(Debug, Parser)]
#[command(
    name = "courier",
    version,
    about = "Device file-upload scheduler",
    long_about = "Validates device uploads, stages their files and transfers them with retries."
)]
pub struct Cli {
    /// Optional TOML configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides `service.upload_root`.
    #[arg(long, global = true)]
    pub upload_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upload local files for one device and wait for the transfers.
    Upload {
        #[arg(short, long)]
        device: String,

        /// Unix seconds naming the upload directory. Defaults to now.
        #[arg(long)]
        timestamp: Option<i64>,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        content: Option<String>,

        /// Unix seconds before which no transfer starts.
        #[arg(long)]
        run_at: Option<i64>,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Submit upload requests from JSON files (same shape as the HTTP body).
    Request {
        #[arg(required = true)]
        requests: Vec<PathBuf>,
    },

    /// List the configured devices and whether adb sees them.
    Devices {
        /// Run `adb connect` for every configured device first.
        #[arg(long)]
        connect: bool,
    },

    /// Print the effective configuration as JSON.
    ShowConfig,
}

/// Reads `path` and wraps it as a base64 upload file.
pub async fn encode_file(path: &Path) -> std::io::Result<FileBase64> {
    let bytes = tokio::fs::read(path).await?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(FileBase64 {
        filename,
        data: STANDARD.encode(bytes),
    })
}

pub async fn read_request(path: &Path) -> Result<UploadRequest, crate::CliError> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}
