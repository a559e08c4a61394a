use crate::affinity::WorkerMask;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler has been shut down")]
    ShutDown,

    #[error("Workers already initialized ({0} running)")]
    AlreadyInitialized(usize),

    #[error("Workers not initialized")]
    NotInitialized,

    #[error("No running worker matches {0:?}")]
    NoMatchingWorker(WorkerMask),

    #[error("Failed to allocate fiber stack: {0}")]
    FiberCreation(#[source] std::io::Error),

    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
