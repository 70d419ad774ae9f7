//! Test doubles for tubebroker: an in-memory beanstalkd, a recording
//! executor and job body helpers.

mod job;
mod mock;
mod queue;

pub use job::{eventually, job_body, job_body_with};
pub use mock::{ExecutionRecord, MockExecutor};
pub use queue::{FakeConnection, FakeConnector, FakeJob, FakeJobState, FakeQueue};
