pub mod drain_worker;

pub use drain_worker::{DrainWorker, WorkerHandle};
