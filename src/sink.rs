//! Execution sink port: where finished results are handed off.

use async_trait::async_trait;
use snafu::prelude::*;

use crate::execution::ExecutionResult;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Sink error: {message}"))]
    Sink { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Called exactly once per run, after the result is sealed. Sink failures
/// are logged by the engine and never fail the run.
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    async fn on_result(&self, result: &ExecutionResult) -> Result<()>;
}
