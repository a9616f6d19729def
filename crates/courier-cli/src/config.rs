//! 設定の読み込み: デフォルト → TOML ファイル（任意）→ `COURIER_` 環境変数
//!
//! ネストしたキーは `__` で区切る（例: `COURIER_SCHEDULER__WORKERS=8`）。

use std::path::Path;
use std::time::Duration;

use courier_core::app::SchedulerConfig;
use courier_core::impls::AdbConfig;
use courier_core::service::ServiceConfig;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "COURIER_";

/// Where transfers go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Copy into `service.upload_root` on this machine.
    #[default]
    Local,

    /// `adb push` to the device mapped in `service.devices`.
    Adb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub service: ServiceConfig,
    pub executor: ExecutorKind,
    pub adb: AdbConfig,

    /// How long `shutdown` lets admitted work finish.
    pub drain_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            service: ServiceConfig::default(),
            executor: ExecutorKind::default(),
            adb: AdbConfig::default(),
            drain_timeout_ms: 30_000,
        }
    }
}

impl Config {
    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(file: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(file).extract()
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_without_sources() {
        Jail::expect_with(|_| {
            assert_eq!(Config::load(None)?, Config::default());
            Ok(())
        });
    }

    #[test]
    fn file_then_env_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "courier.toml",
                r#"
                drain_timeout_ms = 5000
                executor = "adb"

                [scheduler]
                workers = 2
                per_device_limit = 3

                [service]
                upload_root = "/srv/uploads"

                [service.devices]
                lobby = "192.168.1.20:5555"
                gate = "R58M123ABC"

                [adb]
                remote_root = "/sdcard/DCIM/courier"
                "#,
            )?;
            jail.set_env("COURIER_SCHEDULER__WORKERS", "8");

            let config = Config::load(Some(Path::new("courier.toml")))?;
            assert_eq!(config.scheduler.workers, 8);
            assert_eq!(config.scheduler.per_device_limit, 3);
            assert_eq!(config.scheduler.default_max_attempts, 3);
            assert_eq!(config.service.upload_root, Path::new("/srv/uploads"));
            assert_eq!(config.drain_timeout(), Duration::from_secs(5));
            assert_eq!(config.executor, ExecutorKind::Adb);
            assert_eq!(config.service.devices.serial("gate"), Some("R58M123ABC"));
            assert_eq!(config.adb.remote_root, "/sdcard/DCIM/courier");
            assert!(config.adb.reconnect);
            Ok(())
        });
    }

    #[test]
    fn devices_can_come_from_the_environment() {
        Jail::expect_with(|jail| {
            jail.set_env("COURIER_SERVICE__DEVICES", "{gate=\"R58M123ABC\"}");
            jail.set_env("COURIER_EXECUTOR", "adb");

            let config = Config::load(None)?;
            assert_eq!(config.executor, ExecutorKind::Adb);
            assert_eq!(config.service.devices.serial("gate"), Some("R58M123ABC"));
            Ok(())
        });
    }
}
