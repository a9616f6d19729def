use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, UploadId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Reference to the blob an attempt transfers. Opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadRef(String);

impl PayloadRef {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Immutable description of one upload.
///
/// Execution state (attempts, errors, timestamps) lives in the store's
/// `TaskRecord`, never here, so a `Task` can be handed to an executor
/// without giving it a way to change the task's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    device_id: DeviceId,
    payload_ref: PayloadRef,

    /// `None` until the scheduler applies its configured default.
    max_attempts: Option<u32>,

    /// `None` until the scheduler applies its configured default.
    #[serde(default, with = "duration_ms")]
    attempt_timeout: Option<Duration>,

    /// Earliest start of the first attempt.
    not_before: Option<DateTime<Utc>>,

    upload_id: Option<UploadId>,

    /// Executor-specific metadata (original name, stored name, ...).
    #[serde(default)]
    attributes: serde_json::Value,
}

impl Task {
    pub fn builder(device_id: impl Into<String>, payload_ref: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(device_id, payload_ref)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn payload_ref(&self) -> &PayloadRef {
        &self.payload_ref
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    pub fn upload_id(&self) -> Option<UploadId> {
        self.upload_id
    }

    pub fn attributes(&self) -> &serde_json::Value {
        &self.attributes
    }

    /// Looks up a string attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// Fill in scheduler defaults for fields the submitter left open.
    pub(crate) fn with_defaults(mut self, max_attempts: u32, timeout: Option<Duration>) -> Self {
        self.max_attempts.get_or_insert(max_attempts);
        if self.attempt_timeout.is_none() {
            self.attempt_timeout = timeout;
        }
        self
    }
}

/// Builder for [`Task`]. Generates a fresh `TaskId` unless one is given.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(device_id: impl Into<String>, payload_ref: impl Into<String>) -> Self {
        Self {
            task: Task {
                id: TaskId::generate(),
                device_id: DeviceId::new(device_id),
                payload_ref: PayloadRef::new(payload_ref),
                max_attempts: None,
                attempt_timeout: None,
                not_before: None,
                upload_id: None,
                attributes: serde_json::Value::Null,
            },
        }
    }

    pub fn id(mut self, id: TaskId) -> Self {
        self.task.id = id;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.task.max_attempts = Some(max_attempts);
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.task.attempt_timeout = Some(timeout);
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.task.not_before = Some(at);
        self
    }

    pub fn upload_id(mut self, upload_id: UploadId) -> Self {
        self.task.upload_id = Some(upload_id);
        self
    }

    pub fn attributes(mut self, attributes: serde_json::Value) -> Self {
        self.task.attributes = attributes;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_generates_distinct_ids() {
        let a = Task::builder("cam-1", "/tmp/a").build();
        let b = Task::builder("cam-1", "/tmp/a").build();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.device_id().as_str(), "cam-1");
    }

    #[test]
    fn defaults_do_not_override_explicit_values() {
        let task = Task::builder("cam-1", "/tmp/a")
            .max_attempts(7)
            .build()
            .with_defaults(3, Some(Duration::from_secs(5)));
        assert_eq!(task.max_attempts(), Some(7));
        assert_eq!(task.attempt_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn blank_device_counts_as_empty() {
        assert!(DeviceId::new("   ").is_empty());
        assert!(!PayloadRef::new("x").is_empty());
    }

    #[test]
    fn task_json_keeps_timeout_in_millis() {
        let task = Task::builder("cam-1", "/tmp/a")
            .attempt_timeout(Duration::from_millis(1500))
            .attributes(serde_json::json!({"original_name": "a.jpg"}))
            .build();

        let v = serde_json::to_value(&task).unwrap();
        assert_eq!(v["attempt_timeout"], 1500);

        let back: Task = serde_json::from_value(v).unwrap();
        assert_eq!(back, task);
        assert_eq!(back.attribute("original_name"), Some("a.jpg"));
    }
}
