//! Request dispatch: job construction and the request manager service.

pub mod job;
pub mod request_manager;

pub use job::{JobError, JobFactory, ProcessorFactory, RequestProcessor, RequestProcessorJob};
pub use request_manager::RequestManager;
