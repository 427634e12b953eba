//! Service layer
//!
//! Services contain the business logic of the builder. They drive workers
//! through the [`WorkerAdapter`](crate::adapter::WorkerAdapter) seam so they
//! can be exercised without any cloud resources.

mod orchestration;

pub use orchestration::Orchestrator;
