//! DeviceRegistry - デバイス名と ADB シリアルの対応表
//!
//! デバイス名は人が読む識別子、シリアルは `adb -s` に渡す実際の識別子。
//! 表が空のときは制限なし（ローカル転送のみの構成）として扱う。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::task::DeviceId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRegistry {
    serials: BTreeMap<String, String>,
}

impl DeviceRegistry {
    pub fn new<N, S>(entries: impl IntoIterator<Item = (N, S)>) -> Self
    where
        N: Into<String>,
        S: Into<String>,
    {
        Self {
            serials: entries
                .into_iter()
                .map(|(name, serial)| (name.into(), serial.into()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }

    /// Whether `name` may receive uploads. Always true for an empty registry.
    pub fn admits(&self, name: &str) -> bool {
        self.is_empty() || self.serials.contains_key(name)
    }

    pub fn serial(&self, name: &str) -> Option<&str> {
        self.serials.get(name).map(String::as_str)
    }

    pub fn name_for_serial(&self, serial: &str) -> Option<&str> {
        self.serials
            .iter()
            .find(|(_, s)| s.as_str() == serial)
            .map(|(name, _)| name.as_str())
    }

    /// Configured device names, sorted.
    pub fn names(&self) -> Vec<DeviceId> {
        self.serials.keys().map(DeviceId::new).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.serials.iter().map(|(n, s)| (n.as_str(), s.as_str()))
    }
}
