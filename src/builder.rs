//! Builder for configuring and creating an [`Engine`](crate::engine::Engine).

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::executor::TaskExecutor;
use crate::ids::{IdGenerator, UuidGenerator};
use crate::providers::executors::DispatchExecutor;
use crate::sink::ExecutionSink;

/// Fluent configuration for an [`Engine`].
///
/// Defaults: the standard dispatching executor (`http` + `transform`), no
/// sink, the system clock, random UUID execution ids, and
/// [`EngineConfig::default`].
///
/// # Examples
///
/// ```
/// use starling::EngineBuilder;
/// use starling::providers::executors::MockExecutor;
/// use std::sync::Arc;
///
/// let engine = EngineBuilder::new()
///     .with_executor(Arc::new(MockExecutor::new()))
///     .build();
/// ```
pub struct EngineBuilder {
    executor: Option<Arc<dyn TaskExecutor>>,
    sink: Option<Arc<dyn ExecutionSink>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    config: EngineConfig,
}

impl EngineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            executor: None,
            sink: None,
            clock: None,
            ids: None,
            config: EngineConfig::default(),
        }
    }

    /// Set the task executor. Defaults to
    /// [`DispatchExecutor::standard`](crate::providers::executors::DispatchExecutor::standard).
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set a sink to receive every sealed result.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ExecutionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Override the clock, usually with a manual clock in tests.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override execution id generation, e.g. with a prefixed sequence.
    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Cap on concurrently running tasks across the whole run.
    #[must_use]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.config.concurrency_limit = limit;
        self
    }

    /// Keep starting independent branches after a failure instead of
    /// stopping at the wave boundary.
    #[must_use]
    pub fn continue_on_failure(mut self) -> Self {
        self.config.fail_fast = false;
        self
    }

    #[must_use]
    pub fn build(self) -> Engine {
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(DispatchExecutor::standard()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let ids = self.ids.unwrap_or_else(|| Arc::new(UuidGenerator));
        Engine::from_parts(executor, self.sink, clock, ids, self.config)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
