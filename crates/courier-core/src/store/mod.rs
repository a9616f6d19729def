//! Task store: records and the in-memory implementation of the `TaskStore` port.

mod memory;
mod record;

pub use memory::InMemoryTaskStore;
pub use record::{TaskRecord, TaskSnapshot};
