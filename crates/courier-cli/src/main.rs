mod cli;
mod config;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use courier_core::app::{BuildError, SchedulerBuilder};
use courier_core::domain::TaskId;
use courier_core::impls::{AdbClient, AdbExecutor, LocalFileExecutor};
use courier_core::ports::{SystemClock, UlidGenerator, UploadExecutor};
use courier_core::service::{UploadError, UploadRequest, UploadService};
use courier_core::store::TaskSnapshot;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::config::{Config, ExecutorKind};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("config: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).map_err(Box::new)?;
    if let Some(root) = cli.upload_root {
        config.service.staging_dir = root.join(".staging");
        config.service.upload_root = root;
    }

    let requests = match cli.command {
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        Command::Devices { connect } => return list_devices(&config, connect).await,
        Command::Upload {
            device,
            timestamp,
            title,
            content,
            run_at,
            files,
        } => {
            let mut encoded = Vec::with_capacity(files.len());
            for path in &files {
                encoded.push(cli::encode_file(path).await?);
            }
            vec![UploadRequest {
                device_name: device,
                timestamp: timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp()),
                title,
                content,
                files: encoded,
                run_at,
            }]
        }
        Command::Request { requests } => {
            let mut parsed = Vec::with_capacity(requests.len());
            for path in &requests {
                parsed.push(cli::read_request(path).await?);
            }
            parsed
        }
    };

    run(config, requests).await
}

async fn run(config: Config, requests: Vec<UploadRequest>) -> Result<(), CliError> {
    let clock = Arc::new(SystemClock);
    let executor: Arc<dyn UploadExecutor> = match config.executor {
        ExecutorKind::Local => Arc::new(LocalFileExecutor::new(&config.service.upload_root)),
        ExecutorKind::Adb => Arc::new(AdbExecutor::new(
            config.adb.clone(),
            Arc::new(config.service.devices.clone()),
        )),
    };
    tracing::info!(executor = ?config.executor, "starting scheduler");
    let scheduler = SchedulerBuilder::new()
        .config(config.scheduler.clone())
        .shared_executor(executor)
        .clock(clock.clone())
        .build()?;
    let service = UploadService::new(
        Arc::new(scheduler),
        Arc::new(UlidGenerator::new(clock)),
        config.service.clone(),
    );

    let mut task_ids = Vec::new();
    for request in requests {
        match service.submit(request).await {
            Ok(accepted) => {
                println!("{}", serde_json::to_string(&accepted)?);
                task_ids.extend(accepted.task_ids);
            }
            Err(UploadError::Invalid(errors)) => {
                for e in &errors {
                    tracing::error!(error = %e, "request rejected");
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    tokio::select! {
        _ = wait_all(&service, &task_ids) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
    }

    let report = service.scheduler().shutdown(config.drain_timeout()).await;
    if !report.cancelled.is_empty() {
        tracing::warn!(cancelled = report.cancelled.len(), "tasks cancelled at shutdown");
    }

    let snapshots: Vec<TaskSnapshot> = task_ids
        .iter()
        .filter_map(|id| service.status(*id).ok())
        .collect();
    println!("{}", serde_json::to_string_pretty(&snapshots)?);
    Ok(())
}

#[derive(Debug, Serialize)]
struct DeviceStatus<'a> {
    name: &'a str,
    serial: &'a str,
    connected: bool,
}

async fn list_devices(config: &Config, connect: bool) -> Result<(), CliError> {
    let client = AdbClient::new(&config.adb.adb_path);
    let cancel = CancellationToken::new();
    if connect {
        for (name, serial) in config.service.devices.iter() {
            if let Err(e) = client.connect(serial, &cancel).await {
                tracing::warn!(device = name, serial, error = %e, "connect failed");
            }
        }
    }
    let connected = client.connected(&cancel).await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not list adb devices");
        Vec::new()
    });

    let statuses: Vec<DeviceStatus<'_>> = config
        .service
        .devices
        .iter()
        .map(|(name, serial)| DeviceStatus {
            name,
            serial,
            connected: connected.iter().any(|s| s == serial),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

async fn wait_all(service: &UploadService, ids: &[TaskId]) {
    loop {
        let pending = ids
            .iter()
            .filter(|id| service.status(**id).is_ok_and(|s| !s.is_terminal()))
            .count();
        if pending == 0 {
            return;
        }
        tracing::debug!(pending, "waiting for transfers");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
