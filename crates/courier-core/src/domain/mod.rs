//! Domain model (ids, task descriptor, states, outcomes, attempt history, devices).

pub mod attempt;
pub mod device;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;

pub use attempt::{AttemptOutcome, AttemptRecord};
pub use device::DeviceRegistry;
pub use errors::SchedulerError;
pub use ids::{ParseIdError, TaskId, UploadId};
pub use outcome::{Artifact, ExecuteError, Receipt};
pub use state::{CancelReason, FailureReason, TaskState};
pub use task::{DeviceId, PayloadRef, Task, TaskBuilder};
