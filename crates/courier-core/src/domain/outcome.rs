//! Outcome model: what an executor hands back for one attempt.
//!
//! Executors only return data. Turning an outcome into a state transition is
//! the scheduler's job.

use serde::{Deserialize, Serialize};

/// A reference to something produced during a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Artifact {
    /// Where the transferred file ended up.
    StoredPath(String),

    /// Hex-encoded SHA-256 of the transferred bytes.
    Sha256(String),

    /// Number of bytes transferred.
    Size(u64),

    /// Arbitrary structured output.
    Json(serde_json::Value),
}

/// Successful result of an attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl Receipt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn stored_path(&self) -> Option<&str> {
        self.artifacts.iter().find_map(|a| match a {
            Artifact::StoredPath(p) => Some(p.as_str()),
            _ => None,
        })
    }

    pub fn sha256(&self) -> Option<&str> {
        self.artifacts.iter().find_map(|a| match a {
            Artifact::Sha256(h) => Some(h.as_str()),
            _ => None,
        })
    }

    pub fn size(&self) -> Option<u64> {
        self.artifacts.iter().find_map(|a| match a {
            Artifact::Size(n) => Some(*n),
            _ => None,
        })
    }
}

/// Failed result of an attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecuteError {
    /// The cancellation signal was observed.
    #[error("cancelled")]
    Cancelled,

    /// Transient transfer failure; retried per policy.
    #[error("transfer failed: {0}")]
    Transfer(String),
}

impl ExecuteError {
    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::Transfer(msg.into())
    }
}

impl From<std::io::Error> for ExecuteError {
    fn from(e: std::io::Error) -> Self {
        Self::Transfer(e.to_string())
    }
}
