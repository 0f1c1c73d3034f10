//! Service descriptors: delivery semantics, execution mode and the
//! configuration a service is attached with.

use crate::errors::ConfigurationError;

/// How many consumers of an address receive a given message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryType {
    /// One of many competing consumers.
    #[default]
    Balanced,
    /// Every subscriber gets a copy.
    Fanout,
    /// At most one consumer system-wide.
    Singleton,
}

/// Whether a service handles messages one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    /// One message end-to-end (including acknowledgment) before the next.
    Serial,
    /// Up to `max_concurrency` handlers in flight.
    #[default]
    Parallel,
}

/// Default handler concurrency for parallel services.
pub const DEFAULT_MAX_CONCURRENCY: usize = 64;

/// Configuration a service is attached with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfiguration {
    pub delivery: DeliveryType,
    pub execution: ExecutionMode,
    pub max_concurrency: usize,
    /// Acknowledge on receipt at the broker instead of after handling.
    pub auto_ack: bool,
}

impl Default for ServiceConfiguration {
    fn default() -> Self {
        Self {
            delivery: DeliveryType::default(),
            execution: ExecutionMode::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            auto_ack: false,
        }
    }
}

impl ServiceConfiguration {
    pub fn builder() -> ServiceConfigurationBuilder {
        ServiceConfigurationBuilder::default()
    }

    /// Effective number of concurrent handler slots.
    pub fn effective_concurrency(&self) -> usize {
        match self.execution {
            ExecutionMode::Serial => 1,
            ExecutionMode::Parallel => self.max_concurrency,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrency == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`ServiceConfiguration`].
#[derive(Debug, Default)]
pub struct ServiceConfigurationBuilder {
    config: ServiceConfiguration,
}

impl ServiceConfigurationBuilder {
    pub fn delivery(mut self, delivery: DeliveryType) -> Self {
        self.config.delivery = delivery;
        self
    }

    pub fn execution(mut self, execution: ExecutionMode) -> Self {
        self.config.execution = execution;
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.config.auto_ack = auto_ack;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ServiceConfiguration, ConfigurationError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
