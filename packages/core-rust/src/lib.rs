//! `taskwire` core: restartable services, jobs, workers and the worker pool.

pub mod error;
pub mod job;
pub mod pool;
pub mod service;
pub mod worker;

pub use error::CoreError;
pub use job::Job;
pub use pool::{WorkerPool, MIN_POOL_SIZE};
pub use service::{
    Routine, Service, ServiceState, StopSignal, DEFAULT_LOOP_RATE, MIN_LOOP_RATE,
};
pub use worker::Worker;
